//! Cost-based search over a memo of equivalent expressions.
//!
//! Registration hashes each expression by its operator digest plus the groups
//! of its inputs, so rewrites that reproduce a known expression land in the
//! existing group. Exploration fires the logical rules until nothing new is
//! registered or the budget runs out; implementation then picks the cheapest
//! enumerable tree per `(group, collation)`.

use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::alg::explain::op_digest;
use crate::alg::node::AlgNode;
use crate::alg::traits::{Collation, Convention, TraitSet};
use crate::rewrite::cost::Cost;
use crate::rewrite::rules::enumerable::{alternatives, implement, sort_enforcer};
use crate::rewrite::rules::{FilterIntoJoin, JoinCommute, RuleRef};
use crate::rewrite::{Program, RewriteContext};
use crate::types::{QuarryError, Result};

type GroupId = usize;

struct MemoExpr {
    node: AlgNode,
    inputs: Vec<GroupId>,
}

#[derive(Default)]
struct Group {
    exprs: Vec<MemoExpr>,
    explored: usize,
}

#[derive(Clone)]
struct Winner {
    cost: Cost,
    node: AlgNode,
}

/// Exploration plus implementation with the given logical rules.
pub struct VolcanoProgram {
    rules: Vec<RuleRef>,
}

impl VolcanoProgram {
    /// Custom rule set.
    pub fn new(rules: Vec<RuleRef>) -> Self {
        Self { rules }
    }

    /// Join push-down and commutation.
    pub fn standard() -> Self {
        Self::new(vec![
            std::sync::Arc::new(FilterIntoJoin),
            std::sync::Arc::new(JoinCommute),
        ])
    }
}

impl Program for VolcanoProgram {
    fn name(&self) -> &'static str {
        "volcano"
    }

    fn run(&self, ctx: &RewriteContext, node: AlgNode, required: &TraitSet) -> Result<AlgNode> {
        if required.convention == Convention::Logical {
            return Ok(node);
        }
        let started = Instant::now();
        let mut planner = VolcanoPlanner {
            ctx,
            rules: &self.rules,
            groups: Vec::new(),
            index: FxHashMap::default(),
            winners: FxHashMap::default(),
            in_progress: FxHashSet::default(),
            fired: 0,
        };
        let root = planner.register(&node, None);
        planner.explore(started)?;
        let winner = planner.best(root, &required.collation)?;
        debug!(
            groups = planner.groups.len(),
            exprs = planner.groups.iter().map(|g| g.exprs.len()).sum::<usize>(),
            fired = planner.fired,
            elapsed_us = started.elapsed().as_micros() as u64,
            "volcano.done"
        );
        match winner {
            Some(winner) => Ok(winner.node),
            None => Err(QuarryError::CouldNotImplement(format!(
                "no {:?} plan for {} with collation {}",
                required.convention,
                op_digest(&node),
                required.collation
            ))),
        }
    }
}

struct VolcanoPlanner<'a> {
    ctx: &'a RewriteContext,
    rules: &'a [RuleRef],
    groups: Vec<Group>,
    index: FxHashMap<String, GroupId>,
    winners: FxHashMap<(GroupId, Collation), Option<Winner>>,
    in_progress: FxHashSet<(GroupId, Collation)>,
    fired: usize,
}

impl VolcanoPlanner<'_> {
    /// Registers `node` and its inputs; returns the group of `node`.
    fn register(&mut self, node: &AlgNode, target: Option<GroupId>) -> GroupId {
        let inputs: Vec<GroupId> = node
            .inputs()
            .iter()
            .map(|input| self.register(input, None))
            .collect();
        let key = format!("{}{:?}", op_digest(node), inputs);
        if let Some(&group) = self.index.get(&key) {
            return group;
        }
        let representatives = inputs.iter().map(|&g| self.representative(g)).collect();
        let concrete = node.with_inputs(representatives);
        let group = match target {
            Some(group) => group,
            None => {
                self.groups.push(Group::default());
                self.groups.len() - 1
            }
        };
        self.groups[group].exprs.push(MemoExpr {
            node: concrete,
            inputs,
        });
        self.index.insert(key, group);
        group
    }

    fn representative(&self, group: GroupId) -> AlgNode {
        self.groups[group].exprs[0].node.clone()
    }

    fn out_of_budget(&self, started: Instant) -> bool {
        let volcano = &self.ctx.volcano;
        volcano.max_iterations.is_some_and(|max| self.fired >= max)
            || volcano
                .deadline_ms
                .is_some_and(|ms| started.elapsed() >= Duration::from_millis(ms))
    }

    fn explore(&mut self, started: Instant) -> Result<()> {
        let rules = self.rules;
        loop {
            let mut progressed = false;
            for group in 0..self.groups.len() {
                while self.groups[group].explored < self.groups[group].exprs.len() {
                    let position = self.groups[group].explored;
                    self.groups[group].explored += 1;
                    let node = self.groups[group].exprs[position].node.clone();
                    for rule in rules {
                        if self.out_of_budget(started) {
                            debug!(fired = self.fired, "volcano.budget_exhausted");
                            return Ok(());
                        }
                        let Some(alternative) = rule.apply(&node, self.ctx)? else {
                            continue;
                        };
                        self.fired += 1;
                        if alternative.field_count() != node.field_count() {
                            warn!(rule = rule.name(), "volcano.rule.changed_arity");
                            continue;
                        }
                        let before = self.groups[group].exprs.len();
                        self.register(&alternative, Some(group));
                        progressed |= self.groups[group].exprs.len() > before;
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn best(&mut self, group: GroupId, required: &Collation) -> Result<Option<Winner>> {
        let key = (group, required.clone());
        if let Some(winner) = self.winners.get(&key) {
            return Ok(winner.clone());
        }
        if !self.in_progress.insert(key.clone()) {
            return Ok(None);
        }
        let candidates: Vec<(AlgNode, Vec<GroupId>)> = self.groups[group]
            .exprs
            .iter()
            .map(|e| (e.node.clone(), e.inputs.clone()))
            .collect();
        let mut winner: Option<Winner> = None;
        for (node, inputs) in candidates {
            'alternatives: for alternative in alternatives(&node) {
                let mut implemented = Vec::with_capacity(inputs.len());
                for (input, collation) in inputs.iter().zip(&alternative.input_collations) {
                    match self.best(*input, collation)? {
                        Some(w) => implemented.push(w.node),
                        None => continue 'alternatives,
                    }
                }
                let physical = implement(&node, &alternative, implemented);
                if physical.traits().collation.satisfies(required) {
                    self.consider(&mut winner, physical);
                }
            }
        }
        if !required.is_empty() {
            if let Some(unordered) = self.best(group, &Collation::empty())? {
                self.consider(&mut winner, sort_enforcer(unordered.node, required.clone()));
            }
        }
        self.in_progress.remove(&key);
        self.winners.insert(key, winner.clone());
        Ok(winner)
    }

    fn consider(&self, winner: &mut Option<Winner>, node: AlgNode) {
        let cost = self.ctx.cumulative_cost(&node);
        if cost.is_infinite() {
            return;
        }
        if winner.as_ref().map_or(true, |w| cost.is_lt(&w.cost)) {
            *winner = Some(Winner { cost, node });
        }
    }
}
