//! Local rewrite rules shared by the deterministic and cost-based planners.

use std::sync::Arc;

use crate::alg::node::AlgNode;
use crate::rewrite::RewriteContext;
use crate::types::Result;

pub mod calc;
pub mod enumerable;
pub mod join;
pub mod subquery;

pub use calc::{CalcMerge, FilterMerge, FilterToCalc, ProjectMerge, ProjectRemove, ProjectToCalc};
pub use join::{FilterIntoJoin, JoinCommute, JoinToMultiJoin, MultiJoinOptimize};
pub use subquery::SubQueryRemove;

/// A local, equivalence-preserving rewrite.
///
/// `apply` inspects `node` (and, where the pattern needs it, its inputs) and
/// returns a replacement with the same field count, or `None` when the rule
/// does not match.
pub trait Rule: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Returns the rewritten node if the rule matches.
    fn apply(&self, node: &AlgNode, ctx: &RewriteContext) -> Result<Option<AlgNode>>;
}

/// Shared rule handle.
pub type RuleRef = Arc<dyn Rule>;
