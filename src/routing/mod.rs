//! Routing: turning one logical tree into candidate placed trees.
//!
//! A [`Router`] proposes zero or more [`ProposedRoutingPlan`]s, each a copy of the
//! logical tree whose scans and modifies name the adapters they run on. The
//! [`RouterSet`] fans out over every registered router, absorbs individual router
//! failures and deduplicates the candidates structurally.

mod partitions;
mod routers;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

pub use partitions::accessed_partitions;
pub use routers::{CachedPlanRouter, DmlRouter, FullPlacementRouter, SimplePlacementRouter};

use crate::alg::node::{transform, AlgNode, AlgOp, AlgRoot, EntityRef, Placement};
use crate::alg::rex::Rex;
use crate::catalog::Snapshot;
use crate::types::{QuarryError, Result, TxnId};

/// What a router may consult.
#[derive(Clone)]
pub struct RoutingContext {
    /// Catalog view of the statement.
    pub snapshot: Arc<dyn Snapshot>,
    /// Transaction the statement runs in.
    pub txn: TxnId,
}

/// A routed candidate plan.
#[derive(Clone, Debug)]
pub struct ProposedRoutingPlan {
    /// Routed root.
    pub root: AlgRoot,
    /// Router that produced it.
    pub router: String,
    /// Whether the routing decision may be replayed from the routing-plan cache.
    pub cacheable: bool,
    /// Placement signature, see [`physical_query_class`].
    pub query_class: Option<String>,
}

impl ProposedRoutingPlan {
    /// Cacheable candidate whose query class is derived from the routed tree.
    pub fn new(root: AlgRoot, router: impl Into<String>) -> Self {
        let query_class = Some(physical_query_class(&root.node));
        Self {
            root,
            router: router.into(),
            cacheable: true,
            query_class,
        }
    }

    /// Same candidate, excluded from the routing-plan cache.
    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// Strategy producing candidate plans from a logical tree.
pub trait Router: Send + Sync {
    /// Name used in logs and cached routing decisions.
    fn name(&self) -> &'static str;

    /// Proposes candidates for `root`.
    fn route(&self, root: &AlgRoot, ctx: &RoutingContext) -> Result<Vec<ProposedRoutingPlan>>;
}

/// Every registered router, invoked in registration order.
#[derive(Clone)]
pub struct RouterSet {
    routers: Vec<Arc<dyn Router>>,
    deadline: Option<Duration>,
}

impl RouterSet {
    /// Router set over `routers`, without a deadline.
    pub fn new(routers: Vec<Arc<dyn Router>>) -> Self {
        Self {
            routers,
            deadline: None,
        }
    }

    /// The default pair: first placement per entity, then one plan per full placement.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(SimplePlacementRouter),
            Arc::new(FullPlacementRouter),
        ])
    }

    /// Skips the routers not yet invoked once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Registered routers.
    pub fn routers(&self) -> &[Arc<dyn Router>] {
        &self.routers
    }

    /// Candidates of every router, deduplicated by digest, in proposal order.
    ///
    /// A router that fails or panics abstains. Fails with [`QuarryError::NoRoute`]
    /// when no candidate remains, or [`QuarryError::Timeout`] when routers were
    /// skipped because of the deadline.
    pub fn route(&self, root: &AlgRoot, ctx: &RoutingContext) -> Result<Vec<ProposedRoutingPlan>> {
        let started = Instant::now();
        let mut seen = FxHashSet::default();
        let mut candidates = Vec::new();
        let mut skipped = 0;
        for (i, router) in self.routers.iter().enumerate() {
            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    skipped = self.routers.len() - i;
                    warn!(skipped, "routing.deadline.expired");
                    break;
                }
            }
            match panic::catch_unwind(AssertUnwindSafe(|| router.route(root, ctx))) {
                Ok(Ok(plans)) => {
                    for plan in plans {
                        if seen.insert(plan.root.node.digest()) {
                            candidates.push(plan);
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(router = router.name(), error = %err, "routing.router.failed");
                }
                Err(_) => {
                    warn!(router = router.name(), "routing.router.panicked");
                }
            }
        }
        let elapsed = started.elapsed();
        if candidates.is_empty() {
            if skipped > 0 {
                return Err(QuarryError::Timeout {
                    stage: "routing",
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            return Err(QuarryError::NoRoute);
        }
        debug!(
            txn = %ctx.txn,
            candidates = candidates.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "routing.done"
        );
        Ok(candidates)
    }
}

/// Sorted `entity@adapter` list of every placed scan and modify, `;`-separated.
pub fn physical_query_class(node: &AlgNode) -> String {
    let mut parts = Vec::new();
    collect_placements(node, &mut parts);
    parts.sort();
    parts.dedup();
    parts.join(";")
}

fn collect_placements(node: &AlgNode, parts: &mut Vec<String>) {
    node.walk(&mut |n| {
        match n.op() {
            AlgOp::Scan { entity } | AlgOp::Modify { entity, .. } => {
                parts.push(format!("{}{}", entity.name, entity.placement));
            }
            _ => {}
        }
        for rex in n.op().expressions() {
            rex.visit(&mut |r| {
                if let Rex::SubQuery { rel, .. } = r {
                    collect_placements(rel, parts);
                }
            });
        }
    });
}

/// Whether an entity is read by a scan or written by a modify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Use {
    Scan,
    Modify,
}

/// Copy of `node` with every scan and modify placed by `resolve`.
pub(crate) fn place(
    node: &AlgNode,
    resolve: &dyn Fn(&EntityRef, Use) -> Result<Placement>,
) -> Result<AlgNode> {
    transform(node, &mut |n| {
        let op = match n.op() {
            AlgOp::Scan { entity } => AlgOp::Scan {
                entity: entity.placed(resolve(entity, Use::Scan)?),
            },
            AlgOp::Modify {
                entity,
                operation,
                update_columns,
                source_exprs,
            } => AlgOp::Modify {
                entity: entity.placed(resolve(entity, Use::Modify)?),
                operation: *operation,
                update_columns: update_columns.clone(),
                source_exprs: source_exprs.clone(),
            },
            _ => return Ok(n),
        };
        Ok(n.with_op(op))
    })
}
