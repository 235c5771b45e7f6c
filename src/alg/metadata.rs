//! Derived properties of algebra trees: cardinality bounds, uniqueness and estimates.

use std::collections::{BTreeMap, HashSet};

use crate::alg::node::{AlgNode, AlgOp, JoinKind, SetOpKind};
use crate::alg::rex::{Op, Rex};
use crate::types::EntityId;

/// Source of table statistics for cost estimation.
pub trait Statistics {
    /// Estimated row count of an entity, when known.
    fn row_count(&self, entity: EntityId) -> Option<f64>;
}

/// Statistics provider that knows nothing.
pub struct NoStatistics;

impl Statistics for NoStatistics {
    fn row_count(&self, _entity: EntityId) -> Option<f64> {
        None
    }
}

/// Row count assumed for entities without statistics.
pub const DEFAULT_ROW_COUNT: f64 = 100.0;

/// Lower bound on the number of rows the node returns.
pub fn min_row_count(node: &AlgNode) -> f64 {
    match node.op() {
        AlgOp::Values { tuples } => tuples.len() as f64,
        AlgOp::Aggregate { group_set, .. } if group_set.is_empty() => 1.0,
        AlgOp::Aggregate { .. } => first_min(node).min(1.0),
        AlgOp::Project { .. } | AlgOp::BatchIterator => first_min(node),
        AlgOp::Sort { offset, fetch, .. } => {
            let available = (first_min(node) - offset.unwrap_or(0) as f64).max(0.0);
            match fetch {
                Some(fetch) => available.min(*fetch as f64),
                None => available,
            }
        }
        AlgOp::Modify { .. } => 1.0,
        AlgOp::Join { kind, .. } | AlgOp::Correlate { kind, .. } => match kind {
            JoinKind::Left | JoinKind::Full => first_min(node),
            _ => 0.0,
        },
        AlgOp::SetOp {
            kind: SetOpKind::Union,
            all: true,
        } => node.inputs().iter().map(min_row_count).sum(),
        AlgOp::ConditionalExecute { .. } => 0.0,
        AlgOp::Scan { .. }
        | AlgOp::Filter { .. }
        | AlgOp::Calc { .. }
        | AlgOp::MultiJoin { .. }
        | AlgOp::SetOp { .. } => 0.0,
    }
}

/// Upper bound on the number of rows the node returns; `None` when unbounded.
pub fn max_row_count(node: &AlgNode) -> Option<f64> {
    match node.op() {
        AlgOp::Values { tuples } => Some(tuples.len() as f64),
        AlgOp::Aggregate {
            group_set,
            group_sets,
            ..
        } if group_set.is_empty() => Some(group_sets.len().max(1) as f64),
        AlgOp::Aggregate { .. }
        | AlgOp::Project { .. }
        | AlgOp::Filter { .. }
        | AlgOp::Calc { .. }
        | AlgOp::BatchIterator => first_max(node),
        AlgOp::Sort { fetch, .. } => match (first_max(node), fetch) {
            (Some(max), Some(fetch)) => Some(max.min(*fetch as f64)),
            (None, Some(fetch)) => Some(*fetch as f64),
            (max, None) => max,
        },
        AlgOp::Modify { .. } => Some(1.0),
        AlgOp::Join { kind, .. } | AlgOp::Correlate { kind, .. } => {
            let left = node.inputs().first().and_then(max_row_count)?;
            if matches!(kind, JoinKind::Semi | JoinKind::Anti) {
                return Some(left);
            }
            let right = node.inputs().get(1).and_then(max_row_count)?;
            Some(left * right.max(1.0))
        }
        AlgOp::MultiJoin { .. } => node
            .inputs()
            .iter()
            .map(max_row_count)
            .try_fold(1.0, |acc, max| max.map(|m| acc * m)),
        AlgOp::SetOp { kind, .. } => match kind {
            SetOpKind::Union => node
                .inputs()
                .iter()
                .map(max_row_count)
                .try_fold(0.0, |acc, max| max.map(|m| acc + m)),
            SetOpKind::Intersect | SetOpKind::Minus => first_max(node),
        },
        AlgOp::ConditionalExecute { .. } => node.inputs().get(1).and_then(max_row_count),
        AlgOp::Scan { .. } => None,
    }
}

fn first_min(node: &AlgNode) -> f64 {
    node.inputs().first().map(min_row_count).unwrap_or(0.0)
}

fn first_max(node: &AlgNode) -> Option<f64> {
    node.inputs().first().and_then(max_row_count)
}

/// True when the node provably returns no duplicate rows.
pub fn are_rows_unique(node: &AlgNode) -> bool {
    match node.op() {
        // One grouping set means one row per distinct group key.
        AlgOp::Aggregate { group_sets, .. } => group_sets.len() <= 1,
        AlgOp::Values { tuples } => {
            let distinct: HashSet<_> = tuples.iter().collect();
            distinct.len() == tuples.len()
        }
        AlgOp::Filter { .. } | AlgOp::Sort { .. } => {
            node.inputs().first().map(are_rows_unique).unwrap_or(false)
        }
        AlgOp::SetOp { all: false, .. } => true,
        AlgOp::SetOp { all: true, kind } => {
            *kind != SetOpKind::Union && node.inputs().first().map(are_rows_unique).unwrap_or(false)
        }
        _ => max_row_count(node).map(|m| m <= 1.0).unwrap_or(false),
    }
}

/// Number of binary joins and correlates in the tree; a multi-join of n inputs counts n-1.
pub fn count_joins(node: &AlgNode) -> usize {
    let mut count = 0;
    node.walk(&mut |n| match n.op() {
        AlgOp::Join { .. } | AlgOp::Correlate { .. } => count += 1,
        AlgOp::MultiJoin { .. } => count += n.inputs().len().saturating_sub(1),
        _ => {}
    });
    count
}

/// How a statement touches an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    /// Only scanned.
    Read,
    /// Target of a modification.
    Write,
}

/// Entities read or written anywhere in the tree, sub-queries included.
/// A write wins over a read of the same entity.
pub fn entity_access(node: &AlgNode) -> BTreeMap<EntityId, Access> {
    let mut access = BTreeMap::new();
    collect_access(node, &mut access);
    access
}

fn collect_access(node: &AlgNode, access: &mut BTreeMap<EntityId, Access>) {
    node.walk(&mut |n| {
        match n.op() {
            AlgOp::Scan { entity } => {
                access.entry(entity.id).or_insert(Access::Read);
            }
            AlgOp::Modify { entity, .. } => {
                access.insert(entity.id, Access::Write);
            }
            _ => {}
        }
        for rex in n.op().expressions() {
            rex.visit(&mut |r| {
                if let Rex::SubQuery { rel, .. } = r {
                    collect_access(rel, access);
                }
            });
        }
    });
}

/// Fixed selectivity estimate of a predicate.
pub fn selectivity(condition: &Rex) -> f64 {
    match condition {
        r if r.is_true() => 1.0,
        r if r.is_false() => 0.0,
        Rex::Call { op: Op::And, operands, .. } => operands.iter().map(selectivity).product(),
        Rex::Call { op: Op::Or, operands, .. } => operands
            .iter()
            .map(selectivity)
            .fold(0.0, |acc, s| acc + s - acc * s),
        Rex::Call { op: Op::Not, operands, .. } => {
            1.0 - operands.first().map(selectivity).unwrap_or(0.5)
        }
        Rex::Call { op: Op::Eq, .. } => 0.15,
        Rex::Call { op: Op::IsNull, .. } => 0.1,
        Rex::Call { op, .. } if op.is_comparison() => 0.5,
        _ => 0.25,
    }
}

/// Estimated output rows.
pub fn row_count(node: &AlgNode, stats: &dyn Statistics) -> f64 {
    let input = |i: usize| node.inputs().get(i).map(|n| row_count(n, stats)).unwrap_or(1.0);
    let estimate = match node.op() {
        AlgOp::Scan { entity } => stats.row_count(entity.id).unwrap_or(DEFAULT_ROW_COUNT),
        AlgOp::Values { tuples } => tuples.len() as f64,
        AlgOp::Filter { condition } => input(0) * selectivity(condition),
        AlgOp::Calc { condition, .. } => {
            input(0) * condition.as_ref().map(selectivity).unwrap_or(1.0)
        }
        AlgOp::Project { .. } | AlgOp::BatchIterator => input(0),
        AlgOp::Join { kind, condition, .. } => {
            let left = input(0);
            let right = input(1);
            match kind {
                JoinKind::Semi => left * selectivity(condition).max(0.5),
                JoinKind::Anti => left * (1.0 - selectivity(condition)).max(0.5),
                JoinKind::Left => (left * right * selectivity(condition)).max(left),
                JoinKind::Right => (left * right * selectivity(condition)).max(right),
                JoinKind::Full => (left * right * selectivity(condition)).max(left + right),
                JoinKind::Inner => left * right * selectivity(condition),
            }
        }
        AlgOp::Correlate { kind, .. } => match kind {
            JoinKind::Semi | JoinKind::Anti => input(0) * 0.5,
            _ => input(0) * input(1),
        },
        AlgOp::MultiJoin { condition } => {
            node.inputs().iter().map(|n| row_count(n, stats)).product::<f64>() * selectivity(condition)
        }
        AlgOp::Aggregate { group_set, .. } => {
            if group_set.is_empty() {
                1.0
            } else {
                (input(0) * 0.1 * group_set.len() as f64).min(input(0))
            }
        }
        AlgOp::Sort { fetch, .. } => match fetch {
            Some(fetch) => input(0).min(*fetch as f64),
            None => input(0),
        },
        AlgOp::SetOp { kind, .. } => match kind {
            SetOpKind::Union => node.inputs().iter().map(|n| row_count(n, stats)).sum(),
            SetOpKind::Intersect => node
                .inputs()
                .iter()
                .map(|n| row_count(n, stats))
                .fold(f64::INFINITY, f64::min)
                * 0.25,
            SetOpKind::Minus => input(0) * 0.5,
        },
        AlgOp::Modify { .. } => 1.0,
        AlgOp::ConditionalExecute { .. } => input(1),
    };
    let min = min_row_count(node);
    let bounded = estimate.max(min);
    match max_row_count(node) {
        Some(max) => bounded.min(max),
        None => bounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::EntityRef;
    use crate::alg::types::{DataType, TupleType};
    use crate::alg::value::Value;

    fn values(rows: usize) -> AlgNode {
        let ty = TupleType::of(&[("a", DataType::BigInt, false)]);
        AlgNode::values(ty, (0..rows).map(|i| vec![Value::Int(i as i64)]).collect()).unwrap()
    }

    #[test]
    fn empty_group_aggregate_has_exactly_one_row() {
        let agg = AlgNode::aggregate(values(3), vec![], vec![vec![]], vec![]);
        assert_eq!(min_row_count(&agg), 1.0);
        assert_eq!(max_row_count(&agg), Some(1.0));
    }

    #[test]
    fn joins_are_counted_through_the_tree() {
        let scan = AlgNode::scan(
            EntityRef::new(EntityId(1), "t"),
            TupleType::of(&[("a", DataType::BigInt, false)]),
        );
        let j1 = AlgNode::join(JoinKind::Inner, scan.clone(), scan.clone(), Rex::true_lit());
        let j2 = AlgNode::join(JoinKind::Inner, j1, scan, Rex::true_lit());
        assert_eq!(count_joins(&j2), 2);
        assert_eq!(row_count(&j2, &NoStatistics), DEFAULT_ROW_COUNT.powi(3));
    }

    #[test]
    fn writes_dominate_reads_of_the_same_entity() {
        let ty = TupleType::of(&[("a", DataType::BigInt, false)]);
        let target = EntityRef::new(EntityId(1), "t");
        let source = AlgNode::scan(target.clone(), ty.clone());
        let other = AlgNode::scan(EntityRef::new(EntityId(2), "u"), ty);
        let exists = Rex::SubQuery {
            kind: crate::alg::rex::SubQueryKind::Exists,
            operands: vec![],
            rel: other,
            ty: DataType::Boolean,
        };
        let filtered = AlgNode::filter(source, exists);
        let delete = AlgNode::modify(
            filtered,
            target,
            crate::alg::node::ModifyOperation::Delete,
            vec![],
            vec![],
        );
        let access = entity_access(&delete);
        assert_eq!(access.get(&EntityId(1)), Some(&Access::Write));
        assert_eq!(access.get(&EntityId(2)), Some(&Access::Read));
    }

    #[test]
    fn distinct_values_are_unique() {
        assert!(are_rows_unique(&values(3)));
    }
}
