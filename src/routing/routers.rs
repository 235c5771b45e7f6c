use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::alg::metadata::entity_access;
use crate::alg::node::{AlgOp, AlgRoot, EntityRef, Placement};
use crate::catalog::Snapshot;
use crate::types::{AdapterId, QuarryError, Result};

use super::{place, ProposedRoutingPlan, Router, RoutingContext, Use};

/// Writes go to every placement of the entity.
fn write_placement(snapshot: &dyn Snapshot, entity: &EntityRef) -> Result<Placement> {
    let def = snapshot.entity_by_id(entity.id)?;
    let mut adapters = def.placements.clone();
    adapters.sort();
    adapters.dedup();
    match adapters.as_slice() {
        [] => Err(no_placement(&entity.name)),
        [only] => Ok(Placement::Adapter(*only)),
        _ => Ok(Placement::All(adapters)),
    }
}

/// Reads go to the first placement the catalog lists.
fn first_placement(snapshot: &dyn Snapshot, entity: &EntityRef) -> Result<Placement> {
    let def = snapshot.entity_by_id(entity.id)?;
    def.placements
        .first()
        .map(|a| Placement::Adapter(*a))
        .ok_or_else(|| no_placement(&entity.name))
}

fn no_placement(name: &str) -> QuarryError {
    QuarryError::Routing(format!("entity `{name}` has no placement"))
}

/// Reads every entity from its first placement.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimplePlacementRouter;

impl Router for SimplePlacementRouter {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn route(&self, root: &AlgRoot, ctx: &RoutingContext) -> Result<Vec<ProposedRoutingPlan>> {
        let snapshot = ctx.snapshot.as_ref();
        let node = place(&root.node, &|entity, usage| match usage {
            Use::Scan => first_placement(snapshot, entity),
            Use::Modify => write_placement(snapshot, entity),
        })?;
        Ok(vec![ProposedRoutingPlan::new(root.with_node(node)?, self.name())])
    }
}

/// One candidate per adapter holding a full placement of every accessed entity.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullPlacementRouter;

impl Router for FullPlacementRouter {
    fn name(&self) -> &'static str {
        "full-placement"
    }

    fn route(&self, root: &AlgRoot, ctx: &RoutingContext) -> Result<Vec<ProposedRoutingPlan>> {
        let snapshot = ctx.snapshot.as_ref();
        let mut common: Option<BTreeSet<AdapterId>> = None;
        for id in entity_access(&root.node).into_keys() {
            let placements: BTreeSet<AdapterId> =
                snapshot.entity_by_id(id)?.placements.iter().copied().collect();
            common = Some(match common {
                Some(acc) => acc.intersection(&placements).copied().collect(),
                None => placements,
            });
        }
        let adapters = common.unwrap_or_default();
        trace!(adapters = adapters.len(), "routing.full_placement.adapters");
        let mut plans = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let node = place(&root.node, &|entity, usage| match usage {
                Use::Scan => Ok(Placement::Adapter(adapter)),
                Use::Modify => write_placement(snapshot, entity),
            })?;
            plans.push(ProposedRoutingPlan::new(root.with_node(node)?, self.name()));
        }
        Ok(plans)
    }
}

/// Replays a physical query class remembered by the routing-plan cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct CachedPlanRouter;

impl CachedPlanRouter {
    /// Re-places `root` as described by `query_class`, attributing the plan to `router`.
    pub fn replay(
        &self,
        root: &AlgRoot,
        ctx: &RoutingContext,
        query_class: &str,
        router: &str,
    ) -> Result<ProposedRoutingPlan> {
        let mut reads: HashMap<&str, AdapterId> = HashMap::new();
        for part in query_class.split(';').filter(|p| !p.is_empty()) {
            let (name, adapter) = part
                .rsplit_once('@')
                .ok_or_else(|| QuarryError::Routing(format!("malformed query class `{part}`")))?;
            // Replicated writes are re-derived from the catalog.
            if adapter.starts_with('{') {
                continue;
            }
            let adapter = adapter
                .parse::<u32>()
                .map_err(|_| QuarryError::Routing(format!("malformed query class `{part}`")))?;
            reads.insert(name, AdapterId(adapter));
        }
        let snapshot = ctx.snapshot.as_ref();
        let node = place(&root.node, &|entity, usage| match usage {
            Use::Scan => reads
                .get(entity.name.as_str())
                .map(|a| Placement::Adapter(*a))
                .ok_or_else(|| {
                    QuarryError::Routing(format!("query class does not place `{}`", entity.name))
                }),
            Use::Modify => write_placement(snapshot, entity),
        })?;
        Ok(ProposedRoutingPlan::new(root.with_node(node)?, router))
    }
}

/// Routes data-modification, conditional-execute and batch-iterator trees.
///
/// Writes go to all placements of the target; the reads of the input and of any
/// constraint checks use the first placement. Never cached.
#[derive(Clone, Copy, Debug, Default)]
pub struct DmlRouter;

impl Router for DmlRouter {
    fn name(&self) -> &'static str {
        "dml"
    }

    fn route(&self, root: &AlgRoot, ctx: &RoutingContext) -> Result<Vec<ProposedRoutingPlan>> {
        match root.node.op() {
            AlgOp::Modify { .. } | AlgOp::ConditionalExecute { .. } | AlgOp::BatchIterator => {}
            other => {
                return Err(QuarryError::Invalid(format!(
                    "{} is not a data-modification root",
                    other.name()
                )))
            }
        }
        let snapshot = ctx.snapshot.as_ref();
        let node = place(&root.node, &|entity, usage| match usage {
            Use::Scan => first_placement(snapshot, entity),
            Use::Modify => write_placement(snapshot, entity),
        })?;
        Ok(vec![
            ProposedRoutingPlan::new(root.with_node(node)?, self.name()).uncacheable()
        ])
    }
}
