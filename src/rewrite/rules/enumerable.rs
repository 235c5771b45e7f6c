//! Implementation of logical operators in the enumerable convention.
//!
//! The cost-based planner asks [`alternatives`] which physical variants exist
//! for a logical node and the input collations each variant needs, then builds
//! the chosen variant over already-implemented inputs with [`implement`].

use crate::alg::node::{project_collation, AggStrategy, AlgNode, AlgOp, JoinAlgorithm, JoinKind};
use crate::alg::rex::{Op, Rex};
use crate::alg::traits::{Collation, Convention, FieldCollation};

/// Physical choice made when implementing a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Operator without physical variants.
    Plain,
    /// Join algorithm.
    Join(JoinAlgorithm),
    /// Aggregation strategy.
    Aggregate(AggStrategy),
}

/// One physical variant and the collation it requires of each input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alternative {
    /// Chosen variant.
    pub strategy: Strategy,
    /// Required collation, parallel to the node's inputs.
    pub input_collations: Vec<Collation>,
}

/// Equi-join key pairs `(left, right)` of `condition`; right ordinals are
/// relative to the right input.
pub fn equi_keys(condition: &Rex, left_count: usize) -> Vec<(usize, usize)> {
    let mut keys = Vec::new();
    for conjunct in condition.conjunctions() {
        let Rex::Call {
            op: Op::Eq,
            operands,
            ..
        } = &conjunct
        else {
            continue;
        };
        let [a, b] = operands.as_slice() else {
            continue;
        };
        match (a.as_input_ref(), b.as_input_ref()) {
            (Some(l), Some(r)) if l < left_count && r >= left_count => keys.push((l, r - left_count)),
            (Some(r), Some(l)) if l < left_count && r >= left_count => keys.push((l, r - left_count)),
            _ => {}
        }
    }
    keys
}

/// Physical variants of `node`. Empty when the node cannot be implemented
/// directly (multi-joins, nodes still holding sub-query expressions).
pub fn alternatives(node: &AlgNode) -> Vec<Alternative> {
    if matches!(node.op(), AlgOp::MultiJoin { .. })
        || node.op().expressions().iter().any(|e| e.contains_subquery())
    {
        return Vec::new();
    }
    let unordered = || vec![Collation::empty(); node.inputs().len()];
    match node.op() {
        AlgOp::Join { condition, .. } => {
            let left_count = node.inputs().first().map(AlgNode::field_count).unwrap_or(0);
            let mut alternatives = Vec::with_capacity(2);
            if !equi_keys(condition, left_count).is_empty() {
                alternatives.push(Alternative {
                    strategy: Strategy::Join(JoinAlgorithm::Hash),
                    input_collations: unordered(),
                });
            }
            alternatives.push(Alternative {
                strategy: Strategy::Join(JoinAlgorithm::NestedLoop),
                input_collations: unordered(),
            });
            alternatives
        }
        AlgOp::Aggregate { group_set, .. } => {
            let mut alternatives = vec![Alternative {
                strategy: Strategy::Aggregate(AggStrategy::Hash),
                input_collations: unordered(),
            }];
            if !group_set.is_empty() {
                let keys = group_set.iter().map(|&g| FieldCollation::asc(g)).collect();
                alternatives.push(Alternative {
                    strategy: Strategy::Aggregate(AggStrategy::Sorted),
                    input_collations: vec![Collation(keys)],
                });
            }
            alternatives
        }
        _ => vec![Alternative {
            strategy: Strategy::Plain,
            input_collations: unordered(),
        }],
    }
}

fn output_collation(op: &AlgOp, inputs: &[AlgNode]) -> Collation {
    let input = |i: usize| {
        inputs
            .get(i)
            .map(|n| n.traits().collation.clone())
            .unwrap_or_default()
    };
    match op {
        AlgOp::Sort { collation, .. } => collation.clone(),
        AlgOp::Filter { .. } | AlgOp::BatchIterator => input(0),
        AlgOp::ConditionalExecute { .. } => input(1),
        AlgOp::Project { exprs } | AlgOp::Calc { exprs, .. } => project_collation(&input(0), exprs),
        AlgOp::Aggregate {
            group_set,
            group_sets,
            strategy: AggStrategy::Sorted,
            ..
        } if group_sets.len() <= 1 => {
            let mut keys = Vec::new();
            for key in input(0).keys() {
                match group_set.iter().position(|&g| g == key.field) {
                    Some(pos) => keys.push(FieldCollation { field: pos, ..*key }),
                    None => break,
                }
            }
            Collation(keys)
        }
        // The interpreter drives joins from the left input.
        AlgOp::Join { kind, .. } | AlgOp::Correlate { kind, .. }
            if matches!(kind, JoinKind::Inner | JoinKind::Left | JoinKind::Semi | JoinKind::Anti) =>
        {
            input(0)
        }
        _ => Collation::empty(),
    }
}

/// Builds the enumerable variant of `node` over `inputs`.
pub fn implement(node: &AlgNode, alternative: &Alternative, inputs: Vec<AlgNode>) -> AlgNode {
    let op = match (node.op(), alternative.strategy) {
        (AlgOp::Join { kind, condition, .. }, Strategy::Join(algorithm)) => AlgOp::Join {
            kind: *kind,
            condition: condition.clone(),
            algorithm,
        },
        (
            AlgOp::Aggregate {
                group_set,
                group_sets,
                calls,
                ..
            },
            Strategy::Aggregate(strategy),
        ) => AlgOp::Aggregate {
            group_set: group_set.clone(),
            group_sets: group_sets.clone(),
            calls: calls.clone(),
            strategy,
        },
        (op, _) => op.clone(),
    };
    let collation = output_collation(&op, &inputs);
    let traits = node
        .traits()
        .with_convention(Convention::Enumerable)
        .with_collation(collation);
    AlgNode::new(op, inputs, node.row_type().clone(), traits)
}

/// Sort enforcer placed over an implemented input.
pub fn sort_enforcer(input: AlgNode, collation: Collation) -> AlgNode {
    AlgNode::sort(input, collation, None, None).with_convention(Convention::Enumerable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::EntityRef;
    use crate::alg::types::{DataType, TupleType};
    use crate::types::EntityId;

    fn table(id: u64) -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(id), format!("t{id}")),
            TupleType::of(&[("k", DataType::BigInt, false), ("v", DataType::Varchar, true)]),
        )
    }

    #[test]
    fn equi_keys_accept_either_operand_order() {
        let join = AlgNode::join(JoinKind::Inner, table(1), table(2), Rex::true_lit());
        let f = join.row_type().fields().to_vec();
        let cond = Rex::and_all(vec![
            Rex::eq(Rex::input(2, &f[2]), Rex::input(0, &f[0])),
            Rex::eq(Rex::input(1, &f[1]), Rex::lit("x")),
        ]);
        assert_eq!(equi_keys(&cond, 2), vec![(0, 0)]);
    }

    #[test]
    fn theta_join_only_has_nested_loop() {
        let join = AlgNode::join(JoinKind::Inner, table(1), table(2), Rex::true_lit());
        let alts = alternatives(&join);
        assert_eq!(alts.len(), 1);
        assert_eq!(alts[0].strategy, Strategy::Join(JoinAlgorithm::NestedLoop));
    }

    #[test]
    fn sorted_aggregate_requests_group_order() {
        let agg = AlgNode::aggregate(table(1), vec![1], vec![vec![1]], vec![]);
        let alts = alternatives(&agg);
        assert_eq!(alts.len(), 2);
        assert_eq!(alts[1].input_collations, vec![Collation(vec![FieldCollation::asc(1)])]);

        let input = sort_enforcer(table(1).with_convention(Convention::Enumerable), alts[1].input_collations[0].clone());
        let physical = implement(&agg, &alts[1], vec![input]);
        assert_eq!(physical.convention(), Convention::Enumerable);
        assert_eq!(physical.traits().collation, Collation(vec![FieldCollation::asc(0)]));
    }

    #[test]
    fn multi_join_has_no_implementation() {
        let mj = AlgNode::multi_join(vec![table(1), table(2)], Rex::true_lit());
        assert!(alternatives(&mj).is_empty());
    }
}
