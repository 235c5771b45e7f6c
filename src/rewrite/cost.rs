//! Plan costs and the pluggable cost model.

use std::fmt;
use std::ops::Add;

use serde::Serialize;

use crate::alg::metadata::{row_count, Statistics};
use crate::alg::node::{AggStrategy, AlgNode, AlgOp, JoinAlgorithm};
use crate::alg::traits::Convention;

/// Estimated cost of a (sub)plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Cost {
    /// Rows produced.
    pub rows: f64,
    /// Processing effort.
    pub cpu: f64,
    /// Storage access effort.
    pub io: f64,
}

impl Cost {
    /// Free.
    pub const ZERO: Cost = Cost {
        rows: 0.0,
        cpu: 0.0,
        io: 0.0,
    };

    /// Not implementable.
    pub const INFINITE: Cost = Cost {
        rows: f64::INFINITY,
        cpu: f64::INFINITY,
        io: f64::INFINITY,
    };

    /// Creates a cost.
    pub fn new(rows: f64, cpu: f64, io: f64) -> Self {
        Self { rows, cpu, io }
    }

    /// Scalar used for ranking.
    pub fn total(&self) -> f64 {
        self.rows + self.cpu + self.io
    }

    /// True when any component is infinite.
    pub fn is_infinite(&self) -> bool {
        self.total().is_infinite()
    }

    /// Strictly cheaper than `other`.
    pub fn is_lt(&self, other: &Cost) -> bool {
        self.total() < other.total()
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, other: Cost) -> Cost {
        Cost {
            rows: self.rows + other.rows,
            cpu: self.cpu + other.cpu,
            io: self.io + other.io,
        }
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            return write!(f, "{{inf}}");
        }
        write!(f, "{{{:.1} rows, {:.1} cpu, {:.1} io}}", self.rows, self.cpu, self.io)
    }
}

/// Scores plans. Implementations must be deterministic for equal trees.
pub trait CostModel: Send + Sync {
    /// Cost of `node` alone, excluding its inputs.
    fn self_cost(&self, node: &AlgNode, stats: &dyn Statistics) -> Cost;

    /// Cost of the whole subtree.
    fn cumulative_cost(&self, node: &AlgNode, stats: &dyn Statistics) -> Cost {
        node.inputs()
            .iter()
            .fold(self.self_cost(node, stats), |acc, input| {
                acc + self.cumulative_cost(input, stats)
            })
    }
}

/// Row-count driven model. Logical nodes are infinitely expensive so the search
/// always prefers an implemented alternative.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCostModel;

impl CostModel for DefaultCostModel {
    fn self_cost(&self, node: &AlgNode, stats: &dyn Statistics) -> Cost {
        if node.convention() == Convention::Logical {
            return Cost::INFINITE;
        }
        let rows = row_count(node, stats);
        let input_rows = |i: usize| node.inputs().get(i).map(|n| row_count(n, stats)).unwrap_or(0.0);
        match node.op() {
            AlgOp::Scan { .. } => Cost::new(rows, rows, rows),
            AlgOp::Values { .. } => Cost::new(rows, rows, 0.0),
            AlgOp::Filter { .. } | AlgOp::Calc { .. } => Cost::new(rows, input_rows(0), 0.0),
            AlgOp::Project { exprs } => {
                // Field references are free; only computed expressions cost cpu.
                let computed = exprs.iter().filter(|e| e.as_input_ref().is_none()).count();
                Cost::new(0.0, input_rows(0) * computed as f64 * 0.1, 0.0)
            }
            AlgOp::Join { algorithm, .. } => {
                let (left, right) = (input_rows(0), input_rows(1));
                let cpu = match algorithm {
                    JoinAlgorithm::Hash => left + right * 1.5,
                    JoinAlgorithm::NestedLoop | JoinAlgorithm::Logical => left * right,
                };
                Cost::new(rows, cpu, 0.0)
            }
            AlgOp::Correlate { .. } => Cost::new(rows, input_rows(0) * input_rows(1).max(1.0), 0.0),
            AlgOp::Aggregate { strategy, .. } => {
                let cpu = match strategy {
                    AggStrategy::Sorted => input_rows(0),
                    AggStrategy::Hash | AggStrategy::Logical => input_rows(0) * 1.5,
                };
                Cost::new(rows, cpu, 0.0)
            }
            AlgOp::Sort { .. } => {
                let n = input_rows(0).max(1.0);
                Cost::new(rows, n * n.log2().max(1.0), 0.0)
            }
            AlgOp::SetOp { .. } => Cost::new(rows, (0..node.inputs().len()).map(input_rows).sum(), 0.0),
            AlgOp::Modify { .. } => Cost::new(rows, input_rows(0), input_rows(0)),
            AlgOp::ConditionalExecute { .. } | AlgOp::BatchIterator => Cost::new(rows, 1.0, 0.0),
            AlgOp::MultiJoin { .. } => Cost::INFINITE,
        }
    }
}

/// Cost model backed by a closure returning the self cost of each node.
pub struct FnCostModel<F>(pub F);

impl<F> CostModel for FnCostModel<F>
where
    F: Fn(&AlgNode) -> f64 + Send + Sync,
{
    fn self_cost(&self, node: &AlgNode, _stats: &dyn Statistics) -> Cost {
        Cost::new(0.0, (self.0)(node), 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::metadata::NoStatistics;
    use crate::alg::node::EntityRef;
    use crate::alg::types::{DataType, TupleType};
    use crate::types::EntityId;

    fn scan() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(1), "t"),
            TupleType::of(&[("a", DataType::BigInt, false)]),
        )
    }

    #[test]
    fn logical_nodes_are_infinite() {
        let cost = DefaultCostModel.cumulative_cost(&scan(), &NoStatistics);
        assert!(cost.is_infinite());
        let physical = scan().with_convention(Convention::Enumerable);
        let cost = DefaultCostModel.cumulative_cost(&physical, &NoStatistics);
        assert!(!cost.is_infinite());
        assert!(Cost::ZERO.is_lt(&cost));
    }

    #[test]
    fn closure_model_sums_over_the_tree() {
        let model = FnCostModel(|n: &AlgNode| if matches!(n.op(), AlgOp::Scan { .. }) { 7.0 } else { 1.0 });
        let tree = AlgNode::filter(scan(), crate::alg::rex::Rex::true_lit());
        assert_eq!(model.cumulative_cost(&tree, &NoStatistics).total(), 8.0);
    }
}
