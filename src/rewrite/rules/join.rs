//! Join rules: predicate push-down, commutation and heuristic n-way ordering.

use std::collections::BTreeSet;

use tracing::debug;

use crate::alg::metadata::row_count;
use crate::alg::node::{AlgNode, AlgOp, JoinAlgorithm, JoinKind};
use crate::alg::rex::Rex;
use crate::builder::simplify::simplify;
use crate::rewrite::rules::Rule;
use crate::rewrite::RewriteContext;
use crate::types::Result;

fn is_logical_join(node: &AlgNode, wanted: JoinKind) -> bool {
    matches!(
        node.op(),
        AlgOp::Join { kind, algorithm: JoinAlgorithm::Logical, .. } if *kind == wanted
    )
}

/// Identity projection over `node` with `names`.
fn reorder(node: AlgNode, order: &[usize], names: Vec<String>) -> AlgNode {
    let fields = node.row_type().fields().to_vec();
    let exprs = order
        .iter()
        .map(|&i| Rex::input(i, &fields[i]))
        .collect();
    AlgNode::project(node, exprs, names)
}

/// Splits conjuncts by the side of an inner join they reference.
fn split(conjuncts: Vec<Rex>, left_count: usize) -> (Vec<Rex>, Vec<Rex>, Vec<Rex>) {
    let (mut left, mut right, mut rest) = (Vec::new(), Vec::new(), Vec::new());
    for conjunct in conjuncts {
        let refs = conjunct.input_refs();
        let movable = !conjunct.contains_subquery() && !refs.is_empty();
        if movable && refs.iter().all(|&i| i < left_count) {
            left.push(conjunct);
        } else if movable && refs.iter().all(|&i| i >= left_count) {
            right.push(conjunct.shift(left_count, -(left_count as isize)));
        } else {
            rest.push(conjunct);
        }
    }
    (left, right, rest)
}

fn filtered(input: &AlgNode, conjuncts: Vec<Rex>) -> AlgNode {
    if conjuncts.is_empty() {
        input.clone()
    } else {
        AlgNode::filter(input.clone(), Rex::and_all(conjuncts))
    }
}

/// Pushes filter conjuncts into an inner join and single-side conjuncts into its inputs.
pub struct FilterIntoJoin;

impl Rule for FilterIntoJoin {
    fn name(&self) -> &'static str {
        "FilterIntoJoin"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let (join, above) = match node.op() {
            AlgOp::Filter { condition } => (node.input(0)?, Some(condition)),
            AlgOp::Join { .. } => (node, None),
            _ => return Ok(None),
        };
        let AlgOp::Join { kind, condition, .. } = join.op() else {
            return Ok(None);
        };
        let (left, right) = (join.input(0)?, join.input(1)?);
        let left_count = left.field_count();

        match kind {
            JoinKind::Inner => {
                let mut conjuncts = condition.conjunctions();
                if let Some(above) = above {
                    conjuncts.extend(above.conjunctions());
                }
                let (to_left, to_right, rest) = split(conjuncts, left_count);
                if above.is_none() && to_left.is_empty() && to_right.is_empty() {
                    return Ok(None);
                }
                let joined = AlgNode::join(
                    JoinKind::Inner,
                    filtered(left, to_left),
                    filtered(right, to_right),
                    simplify(&Rex::and_all(rest)),
                );
                Ok(Some(joined.with_row_type(node.row_type().clone())))
            }
            JoinKind::Left => {
                // Only conditions above the join on the preserved side may move.
                let Some(above) = above else {
                    return Ok(None);
                };
                let (to_left, _, _) = split(above.conjunctions(), left_count);
                if to_left.is_empty() {
                    return Ok(None);
                }
                let kept: Vec<Rex> = above
                    .conjunctions()
                    .into_iter()
                    .filter(|c| !to_left.contains(c))
                    .collect();
                let joined = AlgNode::join(JoinKind::Left, filtered(left, to_left), right.clone(), condition.clone())
                    .with_row_type(join.row_type().clone());
                Ok(Some(filtered(&joined, kept)))
            }
            _ => Ok(None),
        }
    }
}

/// `A ⋈ B` becomes `project(B ⋈ A)` restoring the field order.
pub struct JoinCommute;

impl Rule for JoinCommute {
    fn name(&self) -> &'static str {
        "JoinCommute"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        if !is_logical_join(node, JoinKind::Inner) {
            return Ok(None);
        }
        let AlgOp::Join { condition, .. } = node.op() else {
            return Ok(None);
        };
        let (left, right) = (node.input(0)?, node.input(1)?);
        let (left_count, right_count) = (left.field_count(), right.field_count());
        let swapped_condition = condition.remap(&|i| {
            if i < left_count {
                i + right_count
            } else {
                i - left_count
            }
        });
        let swapped = AlgNode::join(JoinKind::Inner, right.clone(), left.clone(), swapped_condition);
        let order: Vec<usize> = (right_count..right_count + left_count)
            .chain(0..right_count)
            .collect();
        Ok(Some(reorder(swapped, &order, node.row_type().names())))
    }
}

/// Gathers a tree of inner joins into one multi-join.
pub struct JoinToMultiJoin;

impl JoinToMultiJoin {
    fn flatten(node: &AlgNode) -> (Vec<AlgNode>, Rex) {
        match node.op() {
            AlgOp::MultiJoin { condition } => (node.inputs().to_vec(), condition.clone()),
            _ => (vec![node.clone()], Rex::true_lit()),
        }
    }
}

impl Rule for JoinToMultiJoin {
    fn name(&self) -> &'static str {
        "JoinToMultiJoin"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        if !is_logical_join(node, JoinKind::Inner) {
            return Ok(None);
        }
        let AlgOp::Join { condition, .. } = node.op() else {
            return Ok(None);
        };
        if condition.contains_subquery() {
            return Ok(None);
        }
        let (left, right) = (node.input(0)?, node.input(1)?);
        let (mut inputs, left_condition) = Self::flatten(left);
        let (right_inputs, right_condition) = Self::flatten(right);
        inputs.extend(right_inputs);
        let condition = simplify(&Rex::and_all(vec![
            left_condition,
            right_condition.shift(0, left.field_count() as isize),
            condition.clone(),
        ]));
        Ok(Some(
            AlgNode::multi_join(inputs, condition).with_row_type(node.row_type().clone()),
        ))
    }
}

struct Component {
    node: AlgNode,
    members: BTreeSet<usize>,
    columns: Vec<usize>,
    rows: f64,
}

struct Conjunct {
    rex: Rex,
    members: BTreeSet<usize>,
}

/// Expands a multi-join into a tree of binary joins, greedily joining the
/// smallest connected components first.
pub struct MultiJoinOptimize {
    /// Combine components pairwise instead of growing one left-deep chain.
    pub bushy: bool,
}

impl MultiJoinOptimize {
    fn connected(pending: &[Conjunct], a: &BTreeSet<usize>, b: &BTreeSet<usize>) -> bool {
        pending.iter().any(|c| {
            !c.members.is_disjoint(a)
                && !c.members.is_disjoint(b)
                && c.members.iter().all(|m| a.contains(m) || b.contains(m))
        })
    }

    fn combine(
        a: Component,
        b: Component,
        pending: &mut Vec<Conjunct>,
        total: usize,
        ctx: &RewriteContext,
    ) -> Component {
        let members: BTreeSet<usize> = a.members.union(&b.members).copied().collect();
        let mut columns = a.columns;
        columns.extend(b.columns);
        let mut position = vec![usize::MAX; total];
        for (pos, &global) in columns.iter().enumerate() {
            position[global] = pos;
        }
        let (applicable, rest): (Vec<Conjunct>, Vec<Conjunct>) = pending
            .drain(..)
            .partition(|c| c.members.is_subset(&members));
        *pending = rest;
        let condition = Rex::and_all(
            applicable
                .into_iter()
                .map(|c| c.rex.remap(&|i| position[i]))
                .collect(),
        );
        let node = AlgNode::join(JoinKind::Inner, a.node, b.node, condition);
        let rows = row_count(&node, ctx.stats());
        Component {
            node,
            members,
            columns,
            rows,
        }
    }
}

impl Rule for MultiJoinOptimize {
    fn name(&self) -> &'static str {
        "MultiJoinOptimize"
    }

    fn apply(&self, node: &AlgNode, ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let AlgOp::MultiJoin { condition } = node.op() else {
            return Ok(None);
        };
        let mut offsets = Vec::with_capacity(node.inputs().len());
        let mut total = 0;
        for input in node.inputs() {
            offsets.push(total);
            total += input.field_count();
        }
        let owner = |global: usize| offsets.iter().rposition(|&o| o <= global).unwrap_or(0);
        let mut pending: Vec<Conjunct> = condition
            .conjunctions()
            .into_iter()
            .map(|rex| Conjunct {
                members: rex.input_refs().into_iter().map(owner).collect(),
                rex,
            })
            .collect();
        let mut components: Vec<Component> = node
            .inputs()
            .iter()
            .enumerate()
            .map(|(i, input)| Component {
                node: input.clone(),
                members: BTreeSet::from([i]),
                columns: (offsets[i]..offsets[i] + input.field_count()).collect(),
                rows: row_count(input, ctx.stats()),
            })
            .collect();
        if components.is_empty() {
            return Ok(None);
        }

        while components.len() > 1 {
            let (i, j) = if self.bushy {
                let mut best: Option<(bool, f64, usize, usize)> = None;
                for i in 0..components.len() {
                    for j in i + 1..components.len() {
                        let linked = Self::connected(&pending, &components[i].members, &components[j].members);
                        let product = components[i].rows * components[j].rows;
                        let better = match best {
                            None => true,
                            Some((best_linked, best_product, _, _)) => {
                                (linked && !best_linked) || (linked == best_linked && product < best_product)
                            }
                        };
                        if better {
                            best = Some((linked, product, i, j));
                        }
                    }
                }
                match best {
                    Some((_, _, i, j)) => (i, j),
                    None => break,
                }
            } else {
                if components.len() == node.inputs().len() {
                    // Seed the chain with the smallest input.
                    let smallest = (0..components.len())
                        .min_by(|&a, &b| components[a].rows.total_cmp(&components[b].rows))
                        .unwrap_or(0);
                    components.swap(0, smallest);
                }
                let next = (1..components.len())
                    .min_by(|&a, &b| {
                        let la = Self::connected(&pending, &components[0].members, &components[a].members);
                        let lb = Self::connected(&pending, &components[0].members, &components[b].members);
                        lb.cmp(&la)
                            .then(components[a].rows.total_cmp(&components[b].rows))
                            .then(a.cmp(&b))
                    })
                    .unwrap_or(1);
                (0, next)
            };
            let b = components.remove(j);
            let a = components.remove(i);
            let merged = Self::combine(a, b, &mut pending, total, ctx);
            components.insert(i, merged);
        }

        let Some(mut last) = components.pop() else {
            return Ok(None);
        };
        if !pending.is_empty() {
            let mut position = vec![usize::MAX; total];
            for (pos, &global) in last.columns.iter().enumerate() {
                position[global] = pos;
            }
            let rest = pending.into_iter().map(|c| c.rex.remap(&|i| position[i])).collect();
            last.node = AlgNode::filter(last.node, Rex::and_all(rest));
        }
        let mut order = vec![0; total];
        for (pos, &global) in last.columns.iter().enumerate() {
            order[global] = pos;
        }
        debug!(inputs = node.inputs().len(), bushy = self.bushy, "join_order.expanded");
        let identity = order.iter().enumerate().all(|(i, &p)| i == p);
        if identity {
            return Ok(Some(last.node.with_row_type(node.row_type().clone())));
        }
        Ok(Some(reorder(last.node, &order, node.row_type().names())))
    }
}
