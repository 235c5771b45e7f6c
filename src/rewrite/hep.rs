//! Deterministic rule driver: applies a fixed rule list to a fixpoint.

use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::alg::node::AlgNode;
use crate::alg::traits::TraitSet;
use crate::rewrite::rules::RuleRef;
use crate::rewrite::{Program, RewriteContext};
use crate::types::Result;

/// Order in which tree positions are offered to the rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOrder {
    /// Parents before children.
    TopDown,
    /// Children before parents.
    BottomUp,
}

/// A rule list run to a fixpoint.
///
/// In DAG mode structurally equal subtrees are rewritten once per pass and
/// the result is shared between every parent that referenced them.
pub struct HepProgram {
    name: &'static str,
    rules: Vec<RuleRef>,
    order: MatchOrder,
    match_limit: Option<usize>,
    dag: bool,
}

impl HepProgram {
    /// Bottom-up, unlimited, DAG mode.
    pub fn new(name: &'static str, rules: Vec<RuleRef>) -> Self {
        Self {
            name,
            rules,
            order: MatchOrder::BottomUp,
            match_limit: None,
            dag: true,
        }
    }

    /// Sets the match order.
    pub fn with_order(mut self, order: MatchOrder) -> Self {
        self.order = order;
        self
    }

    /// Bounds rule firings; overrides the context-wide limit.
    pub fn with_match_limit(mut self, limit: Option<usize>) -> Self {
        self.match_limit = limit;
        self
    }

    /// Enables or disables sharing of equal subtrees.
    pub fn with_dag(mut self, dag: bool) -> Self {
        self.dag = dag;
        self
    }
}

impl Program for HepProgram {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, ctx: &RewriteContext, node: AlgNode, _required: &TraitSet) -> Result<AlgNode> {
        let started = Instant::now();
        let mut planner = HepPlanner {
            program: self,
            ctx,
            limit: self.match_limit.or(ctx.hep_match_limit),
            fired: 0,
        };
        let result = planner.optimize(node)?;
        debug!(
            program = self.name,
            fired = planner.fired,
            elapsed_us = started.elapsed().as_micros() as u64,
            "hep.done"
        );
        Ok(result)
    }
}

struct HepPlanner<'a> {
    program: &'a HepProgram,
    ctx: &'a RewriteContext,
    limit: Option<usize>,
    fired: usize,
}

impl HepPlanner<'_> {
    fn optimize(&mut self, root: AlgNode) -> Result<AlgNode> {
        let mut current = root;
        loop {
            let mut memo = FxHashMap::default();
            let next = self.visit(&current, &mut memo)?;
            if AlgNode::ptr_eq(&next, &current) || self.exhausted() {
                return Ok(next);
            }
            current = next;
        }
    }

    fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.fired >= limit)
    }

    fn visit(&mut self, node: &AlgNode, memo: &mut FxHashMap<String, AlgNode>) -> Result<AlgNode> {
        let key = self.program.dag.then(|| node.digest());
        if let Some(done) = key.as_ref().and_then(|k| memo.get(k)) {
            return Ok(done.clone());
        }
        let result = match self.program.order {
            MatchOrder::BottomUp => {
                let rebuilt = self.visit_inputs(node, memo)?;
                self.fire(rebuilt)?
            }
            MatchOrder::TopDown => {
                let fired = self.fire(node.clone())?;
                self.visit_inputs(&fired, memo)?
            }
        };
        if let Some(key) = key {
            memo.insert(key, result.clone());
        }
        Ok(result)
    }

    fn visit_inputs(&mut self, node: &AlgNode, memo: &mut FxHashMap<String, AlgNode>) -> Result<AlgNode> {
        let inputs = node
            .inputs()
            .iter()
            .map(|input| self.visit(input, memo))
            .collect::<Result<Vec<_>>>()?;
        Ok(node.with_inputs(inputs))
    }

    /// Applies rules at one position until none matches.
    fn fire(&mut self, mut node: AlgNode) -> Result<AlgNode> {
        let program = self.program;
        'rules: loop {
            for rule in &program.rules {
                if self.exhausted() {
                    return Ok(node);
                }
                let Some(next) = rule.apply(&node, self.ctx)? else {
                    continue;
                };
                if next.digest() == node.digest() {
                    continue;
                }
                self.fired += 1;
                trace!(rule = rule.name(), op = node.op().name(), "hep.rule.fired");
                node = next;
                continue 'rules;
            }
            return Ok(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::{AlgOp, EntityRef};
    use crate::alg::rex::{Op, Rex};
    use crate::alg::types::{DataType, TupleType};
    use crate::rewrite::rules::{FilterMerge, ProjectMerge, ProjectRemove};
    use crate::types::EntityId;
    use std::sync::Arc;

    fn scan() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(1), "t"),
            TupleType::of(&[("a", DataType::BigInt, false)]),
        )
    }

    fn gt(n: i64) -> Rex {
        Rex::call(
            Op::Gt,
            vec![
                Rex::InputRef { index: 0, ty: DataType::BigInt, nullable: false },
                Rex::lit(n),
            ],
        )
    }

    #[test]
    fn stacked_filters_merge_to_fixpoint() {
        let tree = AlgNode::filter(AlgNode::filter(AlgNode::filter(scan(), gt(1)), gt(2)), gt(3));
        let program = HepProgram::new("merge", vec![Arc::new(FilterMerge)]);
        let out = program
            .run(&RewriteContext::default(), tree, &TraitSet::logical())
            .unwrap();
        assert!(matches!(out.op(), AlgOp::Filter { .. }));
        assert!(matches!(out.input(0).unwrap().op(), AlgOp::Scan { .. }));
    }

    #[test]
    fn match_limit_stops_early() {
        let tree = AlgNode::filter(AlgNode::filter(AlgNode::filter(scan(), gt(1)), gt(2)), gt(3));
        let program = HepProgram::new("merge", vec![Arc::new(FilterMerge)]).with_match_limit(Some(1));
        let out = program
            .run(&RewriteContext::default(), tree, &TraitSet::logical())
            .unwrap();
        assert!(matches!(out.input(0).unwrap().op(), AlgOp::Filter { .. }));
    }

    #[test]
    fn dag_mode_shares_equal_subtrees() {
        let f = || {
            let s = scan();
            let fields = s.row_type().fields().to_vec();
            let inner = AlgNode::project(s, vec![Rex::input(0, &fields[0])], vec!["a".into()]);
            AlgNode::project(inner, vec![Rex::input(0, &fields[0])], vec!["a".into()])
        };
        let union = AlgNode::set_op(crate::alg::node::SetOpKind::Union, true, vec![f(), f()]);
        let program = HepProgram::new(
            "projects",
            vec![Arc::new(ProjectMerge), Arc::new(ProjectRemove)],
        );
        let out = program
            .run(&RewriteContext::default(), union, &TraitSet::logical())
            .unwrap();
        let (a, b) = (out.input(0).unwrap(), out.input(1).unwrap());
        assert!(matches!(a.op(), AlgOp::Scan { .. }));
        assert!(AlgNode::ptr_eq(a, b));
    }
}
