//! Rewrite programs: ordered rule-driven transformations of algebra trees.
//!
//! A [`Program`] maps a tree to an equivalent tree, optionally targeting a
//! required trait set. [`Programs::standard`] is the pipeline the processor
//! runs on every routed plan: sub-query removal, optional decorrelation,
//! field trimming, heuristic join ordering for wide joins, cost-based
//! implementation in the enumerable convention, and calc fusion.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::alg::metadata::{count_joins, NoStatistics, Statistics};
use crate::alg::node::AlgNode;
use crate::alg::traits::TraitSet;
use crate::config::{JoinOrderConfig, ProcessorConfig, VolcanoConfig};
use crate::types::Result;

pub mod cost;
pub mod decorrelate;
pub mod hep;
pub mod rules;
pub mod trim;
pub mod volcano;

pub use cost::{Cost, CostModel, DefaultCostModel, FnCostModel};
pub use decorrelate::DecorrelateProgram;
pub use hep::{HepProgram, MatchOrder};
pub use rules::{Rule, RuleRef};
pub use trim::TrimProgram;
pub use volcano::VolcanoProgram;

use rules::{
    CalcMerge, FilterMerge, FilterToCalc, JoinToMultiJoin, MultiJoinOptimize, ProjectMerge,
    ProjectRemove, ProjectToCalc, SubQueryRemove,
};

/// Everything a program may consult besides the tree itself.
#[derive(Clone)]
pub struct RewriteContext {
    /// Table statistics for estimates.
    pub stats: Arc<dyn Statistics + Send + Sync>,
    /// Plan scoring.
    pub cost_model: Arc<dyn CostModel>,
    /// Rule firings per deterministic pass.
    pub hep_match_limit: Option<usize>,
    /// Heuristic join ordering.
    pub join_order: JoinOrderConfig,
    /// Cost-based search budget.
    pub volcano: VolcanoConfig,
    /// Run decorrelation.
    pub force_decorrelate: bool,
}

impl RewriteContext {
    /// Context with default knobs.
    pub fn new(stats: Arc<dyn Statistics + Send + Sync>, cost_model: Arc<dyn CostModel>) -> Self {
        Self {
            stats,
            cost_model,
            hep_match_limit: None,
            join_order: JoinOrderConfig::default(),
            volcano: VolcanoConfig::default(),
            force_decorrelate: false,
        }
    }

    /// Context whose knobs come from the processor configuration.
    pub fn from_config(
        config: &ProcessorConfig,
        stats: Arc<dyn Statistics + Send + Sync>,
        cost_model: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            hep_match_limit: config.hep_match_limit,
            join_order: config.join_order.clone(),
            volcano: config.volcano.clone(),
            force_decorrelate: config.force_decorrelate,
            ..Self::new(stats, cost_model)
        }
    }

    /// Statistics as a plain trait object.
    pub fn stats(&self) -> &dyn Statistics {
        self.stats.as_ref()
    }

    /// Cumulative cost of `node` under the context's model.
    pub fn cumulative_cost(&self, node: &AlgNode) -> Cost {
        self.cost_model.cumulative_cost(node, self.stats())
    }
}

impl Default for RewriteContext {
    fn default() -> Self {
        Self::new(Arc::new(NoStatistics), Arc::new(DefaultCostModel))
    }
}

/// A tree-to-tree transformation.
pub trait Program: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Rewrites `node`; `required` is the trait set the caller needs at the root.
    fn run(&self, ctx: &RewriteContext, node: AlgNode, required: &TraitSet) -> Result<AlgNode>;
}

/// Programs applied in order.
pub struct SequenceProgram {
    programs: Vec<Box<dyn Program>>,
}

impl Program for SequenceProgram {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn run(&self, ctx: &RewriteContext, node: AlgNode, required: &TraitSet) -> Result<AlgNode> {
        let mut current = node;
        for program in &self.programs {
            let started = Instant::now();
            current = program.run(ctx, current, required)?;
            debug!(
                program = program.name(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "rewrite.stage"
            );
        }
        Ok(current)
    }
}

/// Gathers inner joins into a multi-join and re-expands them heuristically
/// once the tree has at least `min_join_count` joins.
pub struct JoinOrderProgram;

impl Program for JoinOrderProgram {
    fn name(&self) -> &'static str {
        "join_order"
    }

    fn run(&self, ctx: &RewriteContext, node: AlgNode, required: &TraitSet) -> Result<AlgNode> {
        let joins = count_joins(&node);
        if joins < ctx.join_order.min_join_count {
            return Ok(node);
        }
        debug!(joins, bushy = ctx.join_order.bushy, "join_order.heuristic");
        let gathered = HepProgram::new("join_to_multi_join", vec![Arc::new(JoinToMultiJoin)])
            .run(ctx, node, required)?;
        HepProgram::new(
            "multi_join_optimize",
            vec![Arc::new(MultiJoinOptimize {
                bushy: ctx.join_order.bushy,
            })],
        )
        .with_order(MatchOrder::TopDown)
        .run(ctx, gathered, required)
    }
}

/// Factory for the built-in programs.
pub struct Programs;

impl Programs {
    /// Runs `programs` in order.
    pub fn sequence(programs: Vec<Box<dyn Program>>) -> SequenceProgram {
        SequenceProgram { programs }
    }

    /// Deterministic program over `rules`.
    pub fn hep(name: &'static str, rules: Vec<RuleRef>) -> HepProgram {
        HepProgram::new(name, rules)
    }

    /// Replaces sub-query expressions by joins and correlates; also merges
    /// the filters and projections that the replacement leaves behind.
    pub fn subquery_removal() -> HepProgram {
        HepProgram::new(
            "subquery_removal",
            vec![
                Arc::new(SubQueryRemove),
                Arc::new(FilterMerge),
                Arc::new(ProjectMerge),
                Arc::new(ProjectRemove),
            ],
        )
    }

    /// Fuses enumerable filters and projections into calcs.
    pub fn calc() -> HepProgram {
        HepProgram::new(
            "calc",
            vec![Arc::new(FilterToCalc), Arc::new(ProjectToCalc), Arc::new(CalcMerge)],
        )
    }

    /// The full pipeline used by the processor.
    pub fn standard() -> SequenceProgram {
        Self::sequence(vec![
            Box::new(Self::subquery_removal()),
            Box::new(DecorrelateProgram),
            Box::new(TrimProgram),
            Box::new(JoinOrderProgram),
            Box::new(VolcanoProgram::standard()),
            Box::new(Self::calc()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::{AlgOp, EntityRef, JoinKind};
    use crate::alg::rex::{Rex, SubQueryKind};
    use crate::alg::traits::Convention;
    use crate::alg::types::{DataType, TupleType};
    use crate::types::EntityId;

    fn table(id: u64) -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(id), format!("t{id}")),
            TupleType::of(&[("k", DataType::BigInt, false), ("v", DataType::BigInt, true)]),
        )
    }

    #[test]
    fn standard_pipeline_yields_enumerable_calc_plan() {
        let t = table(1);
        let f = t.row_type().fields().to_vec();
        let exists = Rex::SubQuery {
            kind: SubQueryKind::Exists,
            operands: vec![],
            rel: table(2),
            ty: DataType::Boolean,
        };
        let filter = AlgNode::filter(t, Rex::and_all(vec![exists, Rex::call(crate::alg::rex::Op::Gt, vec![Rex::input(1, &f[1]), Rex::lit(5i64)])]));
        let project = AlgNode::project(filter, vec![Rex::input(0, &f[0])], vec!["k".into()]);

        let out = Programs::standard()
            .run(&RewriteContext::default(), project.clone(), &TraitSet::enumerable())
            .unwrap();
        assert_eq!(out.row_type().names(), project.row_type().names());
        let mut saw_semi = false;
        out.walk(&mut |n| {
            assert_eq!(n.convention(), Convention::Enumerable, "{}", n.op().name());
            assert!(!matches!(n.op(), AlgOp::Filter { .. } | AlgOp::Project { .. }));
            saw_semi |= matches!(n.op(), AlgOp::Join { kind: JoinKind::Semi, .. });
        });
        assert!(saw_semi);
    }

    #[test]
    fn wide_joins_are_reordered_before_implementation() {
        let ctx = RewriteContext {
            join_order: JoinOrderConfig {
                min_join_count: 2,
                bushy: true,
            },
            ..RewriteContext::default()
        };
        let ab = AlgNode::join(JoinKind::Inner, table(1), table(2), Rex::true_lit());
        let abc = AlgNode::join(JoinKind::Inner, ab, table(3), Rex::true_lit());
        let out = JoinOrderProgram.run(&ctx, abc.clone(), &TraitSet::logical()).unwrap();
        assert_eq!(out.field_count(), abc.field_count());
        assert_eq!(count_joins(&out), 2);
        let mut multi = 0;
        out.walk(&mut |n| multi += matches!(n.op(), AlgOp::MultiJoin { .. }) as usize);
        assert_eq!(multi, 0);
    }
}
