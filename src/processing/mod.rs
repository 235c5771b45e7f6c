//! Statement preparation.
//!
//! [`QueryProcessor`] owns the process-wide collaborators: the plan caches, the
//! lock manager behind the [`ConcurrencyGate`], the router set, the cost model
//! and the [`Implementor`] that turns physical trees into executable results.
//! Statements run inside a [`Transaction`]; each [`Statement::prepare`] call
//! walks the pipeline
//!
//! ```text
//! lock -> enforce constraints -> simplify -> route -> flatten -> parameterize
//!      -> implementation cache / plan cache / optimize -> implement -> select
//! ```
//!
//! and returns one [`PreparedQuery`].

mod diagnostics;
mod flatten;
mod parameterize;
mod selector;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub use diagnostics::{Diagnostics, RecordingDiagnostics, Snapshot as DiagnosticSnapshot, Stage};
pub use flatten::{flat_type, flatten, flatten_node};
pub use parameterize::{parameterize, supplied_type, Parameterized};
pub use selector::select;

use crate::alg::explain::{dump_plan, hash_digest, ExplainFormat};
use crate::alg::metadata::{entity_access, Access};
use crate::alg::node::{AlgNode, AlgOp, AlgRoot, Kind};
use crate::alg::traits::TraitSet;
use crate::alg::types::TupleType;
use crate::alg::value::Value;
use crate::cache::{CachedImplementation, CachedRoute, PlanCaches, RoutingKey};
use crate::catalog::{CatalogStatistics, Snapshot};
use crate::config::{EnforcementTime, ProcessorConfig};
use crate::constraint::{ConstraintEnforcer, ConstraintTracker};
use crate::lock::{ConcurrencyGate, LockManager, WaitForGraphLockManager};
use crate::rewrite::{CostModel, DefaultCostModel, Program, Programs, RewriteContext};
use crate::routing::{
    accessed_partitions, CachedPlanRouter, DmlRouter, ProposedRoutingPlan, Router, RouterSet,
    RoutingContext,
};
use crate::types::{EntityId, QuarryError, Result, TxnId};

/// Executable artifact produced by an [`Implementor`].
pub trait PreparedResult: Send + Sync {
    /// Row type of the rows `bind` returns.
    fn row_type(&self) -> TupleType;
    /// True for data-modification statements.
    fn is_dml(&self) -> bool;
    /// Executes once per call with the given parameter rows.
    fn bind(&self, parameters: &[Vec<Value>]) -> Result<Vec<Vec<Value>>>;
    /// Human-readable rendering of what was generated.
    fn code(&self) -> String;
}

/// Turns a physical root into an executable artifact.
pub trait Implementor: Send + Sync {
    /// Implements `root`, whose dynamic parameters have `parameter_type`.
    fn implement(&self, root: &AlgRoot, parameter_type: &TupleType) -> Result<Arc<dyn PreparedResult>>;
}

/// Optional rewrite of a root using index knowledge. Implementations may
/// prepare inner queries through [`Statement::prepare`] with
/// [`PrepareOptions::subquery`].
pub trait IndexSimplifier: Send + Sync {
    /// Simplified root.
    fn simplify(&self, root: AlgRoot, statement: &Statement<'_>) -> Result<AlgRoot>;
}

/// Per-call switches of [`Statement::prepare`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Prepared on behalf of another statement: no locking, no diagnostics.
    pub is_subquery: bool,
}

impl PrepareOptions {
    /// Options for a re-entrant inner preparation.
    pub fn subquery() -> Self {
        Self { is_subquery: true }
    }
}

/// The selected plan, ready to execute.
#[derive(Clone)]
pub struct PreparedQuery {
    /// Executable artifact.
    pub result: Arc<dyn PreparedResult>,
    /// Parameter rows bound on execution.
    pub parameters: Vec<Vec<Value>>,
    /// Physical root the artifact was implemented from.
    pub physical: AlgRoot,
    /// Router whose candidate won.
    pub router: String,
    /// Cost the selector saw.
    pub cost: f64,
}

impl std::fmt::Debug for PreparedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedQuery")
            .field("result", &"<dyn PreparedResult>")
            .field("parameters", &self.parameters)
            .field("physical", &self.physical)
            .field("router", &self.router)
            .field("cost", &self.cost)
            .finish()
    }
}

impl PreparedQuery {
    /// Executes the plan with its parameters.
    pub fn execute(&self) -> Result<Vec<Vec<Value>>> {
        self.result.bind(&self.parameters)
    }

    /// Output row type.
    pub fn row_type(&self) -> TupleType {
        self.result.row_type()
    }
}

/// A routed candidate after optimization and implementation.
struct Plan {
    proposal: ProposedRoutingPlan,
    parameters: Vec<Vec<Value>>,
    physical: AlgRoot,
    result: Arc<dyn PreparedResult>,
    cost: f64,
}

struct StageTimer {
    last: Instant,
    laps: Vec<(&'static str, u64)>,
}

impl StageTimer {
    fn start() -> Self {
        Self {
            last: Instant::now(),
            laps: Vec::new(),
        }
    }

    fn lap(&mut self, stage: &'static str) {
        let now = Instant::now();
        self.laps
            .push((stage, now.duration_since(self.last).as_micros() as u64));
        self.last = now;
    }

    fn to_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .laps
            .iter()
            .map(|(stage, us)| (format!("{stage}_us"), serde_json::Value::from(*us)))
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}

/// Cache key of a flattened, parameterized root. Output names are part of it
/// because cached results carry the root they were prepared for.
fn plan_signature(root: &AlgRoot) -> String {
    format!(
        "{}|{:?}|{}|{:?}",
        root.node.digest(),
        root.kind,
        root.collation,
        root.fields
    )
}

fn routes_directly(node: &AlgNode) -> bool {
    matches!(
        node.op(),
        AlgOp::Modify { .. } | AlgOp::ConditionalExecute { .. } | AlgOp::BatchIterator
    )
}

/// Process-wide query preparation service.
pub struct QueryProcessor {
    config: RwLock<ProcessorConfig>,
    snapshot: RwLock<Arc<dyn Snapshot>>,
    caches: Arc<PlanCaches>,
    gate: ConcurrencyGate,
    routers: RouterSet,
    implementor: Arc<dyn Implementor>,
    cost_model: Arc<dyn CostModel>,
    simplifier: Option<Arc<dyn IndexSimplifier>>,
    next_txn: AtomicU64,
}

impl QueryProcessor {
    /// Processor with the standard routers, the default cost model and a
    /// wait-for-graph lock manager.
    pub fn new(
        config: ProcessorConfig,
        snapshot: Arc<dyn Snapshot>,
        implementor: Arc<dyn Implementor>,
    ) -> Self {
        let deadline = config.router_deadline_ms.map(Duration::from_millis);
        Self {
            caches: Arc::new(PlanCaches::from_config(&config)),
            config: RwLock::new(config),
            snapshot: RwLock::new(snapshot),
            gate: ConcurrencyGate::new(Arc::new(WaitForGraphLockManager::new())),
            routers: RouterSet::standard().with_deadline(deadline),
            implementor,
            cost_model: Arc::new(DefaultCostModel),
            simplifier: None,
            next_txn: AtomicU64::new(1),
        }
    }

    /// Replaces the router set; the configured router deadline still applies.
    pub fn with_routers(mut self, routers: RouterSet) -> Self {
        let deadline = self.config.read().router_deadline_ms.map(Duration::from_millis);
        self.routers = routers.with_deadline(deadline);
        self
    }

    /// Replaces the cost model used for optimization and selection.
    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Replaces the lock manager.
    pub fn with_lock_manager(mut self, manager: Arc<dyn LockManager>) -> Self {
        self.gate = ConcurrencyGate::new(manager);
        self
    }

    /// Shares caches with other processors.
    pub fn with_caches(mut self, caches: Arc<PlanCaches>) -> Self {
        self.caches = caches;
        self
    }

    /// Installs an index simplification hook.
    pub fn with_index_simplifier(mut self, simplifier: Arc<dyn IndexSimplifier>) -> Self {
        self.simplifier = Some(simplifier);
        self
    }

    /// Current configuration.
    pub fn config(&self) -> ProcessorConfig {
        self.config.read().clone()
    }

    /// Current catalog snapshot.
    pub fn snapshot(&self) -> Arc<dyn Snapshot> {
        self.snapshot.read().clone()
    }

    /// Installs a new catalog snapshot. A newer version resets the caches on
    /// the next statement.
    pub fn set_snapshot(&self, snapshot: Arc<dyn Snapshot>) {
        info!(version = snapshot.version(), "processor.snapshot.changed");
        *self.snapshot.write() = snapshot;
    }

    /// The plan caches.
    pub fn caches(&self) -> &Arc<PlanCaches> {
        &self.caches
    }

    /// The concurrency gate.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Starts a transaction.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        debug!(txn = %id, "txn.begin");
        Transaction {
            id,
            processor: Arc::clone(self),
            diagnostics: None,
            modified: Mutex::new(BTreeSet::new()),
            finished: false,
        }
    }

    /// Switches constraint enforcement. Turning a kind of constraint on first
    /// validates every entity against it; on a violation the switch is not
    /// applied and the violation is returned.
    pub fn set_enforcement(self: &Arc<Self>, unique: bool, foreign_keys: bool) -> Result<()> {
        let current = self.config();
        let check_unique = unique && !current.unique_constraint_enforcement;
        let check_foreign_keys = foreign_keys && !current.foreign_key_enforcement;
        if check_unique || check_foreign_keys {
            let txn = self.begin();
            let tracker = ConstraintTracker::new(self.snapshot());
            let outcome = tracker.validate_all(check_unique, check_foreign_keys, &mut |check| {
                txn.run_check(check)
            });
            txn.rollback();
            if let Err(err) = outcome {
                warn!(unique, foreign_keys, error = %err, "processor.enforcement.rejected");
                return Err(err);
            }
        }
        let mut config = self.config.write();
        config.unique_constraint_enforcement = unique;
        config.foreign_key_enforcement = foreign_keys;
        info!(unique, foreign_keys, "processor.enforcement.changed");
        Ok(())
    }

    /// Prepares `root` for `statement`. See the module documentation for the
    /// stages.
    pub fn prepare(
        &self,
        statement: &Statement<'_>,
        root: &AlgRoot,
        options: PrepareOptions,
    ) -> Result<PreparedQuery> {
        let started = Instant::now();
        let mut timer = StageTimer::start();
        let txn = statement.transaction();
        let config = self.config();
        let snapshot = statement.snapshot().clone();
        let diagnostics = if options.is_subquery {
            None
        } else {
            txn.diagnostics.clone()
        };
        if let Some(d) = &diagnostics {
            d.record(Stage::LogicalPlan, dump_plan("logical plan", &root.node, ExplainFormat::Text));
        }

        if !options.is_subquery {
            self.gate.acquire(&root.node, txn.id())?;
            timer.lap("lock");
        }
        let version = snapshot.version();
        let cache_version = self.caches.sync_version(version).then_some(version);

        let enforcer = ConstraintEnforcer::new(snapshot.clone(), &config);
        let mut root = enforcer.enforce(root, statement.parameters())?;
        if config.constraint_enforcement == EnforcementTime::AfterQueryExecution
            && !enforcer.is_disabled()
        {
            txn.mark_modified(
                entity_access(&root.node)
                    .into_iter()
                    .filter(|(_, access)| *access == Access::Write)
                    .map(|(id, _)| id),
            );
        }
        if let Some(d) = &diagnostics {
            if matches!(root.node.op(), AlgOp::ConditionalExecute { .. }) {
                d.record(
                    Stage::ConstraintEnforcementPlan,
                    dump_plan("constraint enforcement plan", &root.node, ExplainFormat::Text),
                );
            }
        }
        timer.lap("enforce");

        if let Some(simplifier) = &self.simplifier {
            root = simplifier.simplify(root, statement)?;
            timer.lap("simplify");
        }

        let ctx = RoutingContext {
            snapshot: snapshot.clone(),
            txn: txn.id(),
        };
        let (proposals, routing_key) = self.route(&root, &ctx, &config, cache_version)?;
        if let Some(d) = &diagnostics {
            let listing: Vec<String> = proposals
                .iter()
                .map(|p| dump_plan(&format!("router {}", p.router), &p.root.node, ExplainFormat::Text))
                .collect();
            d.record(Stage::RoutedPlans, listing.join("\n"));
        }
        timer.lap("route");

        let rewrite = RewriteContext::from_config(
            &config,
            Arc::new(CatalogStatistics(snapshot.clone())),
            self.cost_model.clone(),
        );
        let mut plans = Vec::with_capacity(proposals.len());
        let mut first_error = None;
        for proposal in proposals {
            let router = proposal.router.clone();
            match self.optimize(statement, proposal, &rewrite, &config, cache_version) {
                Ok(plan) => plans.push(plan),
                Err(err @ QuarryError::CouldNotImplement(_)) => {
                    warn!(router = %router, error = %err, "processor.candidate.dropped");
                    first_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        timer.lap("optimize");
        if plans.is_empty() {
            return Err(first_error.unwrap_or(QuarryError::NoRoute));
        }

        if let (Some(key), Some(version)) = (routing_key, cache_version) {
            let routes: Vec<CachedRoute> = plans
                .iter()
                .filter(|p| p.proposal.cacheable)
                .filter_map(|p| {
                    p.proposal.query_class.clone().map(|query_class| CachedRoute {
                        router: p.proposal.router.clone(),
                        query_class,
                        cost: p.cost,
                    })
                })
                .collect();
            if !routes.is_empty() {
                self.caches.put_routing(version, key, routes);
            }
        }
        let chosen = if plans.len() == 1 {
            0
        } else {
            let costs: Vec<f64> = plans.iter().map(|p| p.cost).collect();
            select(&costs).unwrap_or(0)
        };
        let candidates = plans.len();
        let plan = plans.swap_remove(chosen);
        timer.lap("select");

        if let Some(d) = &diagnostics {
            d.record(
                Stage::PhysicalPlan,
                dump_plan("physical plan", &plan.physical.node, ExplainFormat::Text),
            );
            d.record(Stage::GeneratedCode, plan.result.code());
            d.record(Stage::StageTimings, timer.to_json());
        }
        debug!(
            txn = %txn.id(),
            router = %plan.proposal.router,
            candidates,
            cost = plan.cost,
            subquery = options.is_subquery,
            elapsed_us = started.elapsed().as_micros() as u64,
            "processor.prepare.done"
        );
        Ok(PreparedQuery {
            result: plan.result,
            parameters: plan.parameters,
            physical: plan.physical,
            router: plan.proposal.router,
            cost: plan.cost,
        })
    }

    /// Candidates for `root`, plus the routing-cache key to record them under
    /// when they came from a fresh routing pass.
    fn route(
        &self,
        root: &AlgRoot,
        ctx: &RoutingContext,
        config: &ProcessorConfig,
        cache_version: Option<u64>,
    ) -> Result<(Vec<ProposedRoutingPlan>, Option<RoutingKey>)> {
        if routes_directly(&root.node) {
            return Ok((DmlRouter.route(root, ctx)?, None));
        }
        let version = match cache_version {
            Some(version) if config.routing_plan_caching && !root.kind.is_dml() => version,
            _ => return Ok((self.routers.route(root, ctx)?, None)),
        };
        let key = RoutingKey {
            query_hash: hash_digest(&root.node.digest()),
            partitions: accessed_partitions(&root.node, ctx.snapshot.as_ref())?,
        };
        if let Some(routes) = self.caches.routing(version, &key) {
            let costs: Vec<f64> = routes.iter().map(|r| r.cost).collect();
            if let Some(route) = select(&costs).and_then(|i| routes.get(i)) {
                match CachedPlanRouter.replay(root, ctx, &route.query_class, &route.router) {
                    Ok(plan) => {
                        debug!(router = %route.router, class = %route.query_class, "processor.route.cached");
                        return Ok((vec![plan], None));
                    }
                    Err(err) => warn!(error = %err, "processor.route.replay_failed"),
                }
            }
        }
        Ok((self.routers.route(root, ctx)?, Some(key)))
    }

    /// Flattens, parameterizes, optimizes and implements one candidate.
    fn optimize(
        &self,
        statement: &Statement<'_>,
        proposal: ProposedRoutingPlan,
        rewrite: &RewriteContext,
        config: &ProcessorConfig,
        cache_version: Option<u64>,
    ) -> Result<Plan> {
        let flat = flatten(&proposal.root)?;
        let (node, parameter_type, parameters) = match statement.parameters() {
            Some(rows) => (flat.node.clone(), supplied_type(rows), rows.to_vec()),
            None => {
                let p = parameterize(&flat.node)?;
                (p.node, p.parameter_type, p.rows)
            }
        };
        let root = flat.with_node(node)?;
        let signature = plan_signature(&root);
        let dml = root.kind.is_dml();
        let use_caches = cache_version.is_some();
        let version = cache_version.unwrap_or_default();
        let cache_implementation = use_caches
            && if dml {
                config.implementation_caching_dml
            } else {
                config.implementation_caching
            };
        let cache_plan = use_caches
            && if dml {
                config.query_plan_caching_dml
            } else {
                config.query_plan_caching
            };
        if !cache_implementation && !cache_plan {
            self.caches.record_uncacheable();
        }

        if cache_implementation {
            if let Some(hit) = self.caches.implementation(version, &signature) {
                debug!(router = %proposal.router, "processor.implementation.cached");
                let cost = rewrite.cumulative_cost(&hit.physical).total();
                return Ok(Plan {
                    physical: root.with_node(hit.physical)?,
                    proposal,
                    parameters,
                    result: hit.result,
                    cost,
                });
            }
        }
        let cached = if cache_plan {
            self.caches.plan(version, &signature)
        } else {
            None
        };
        let physical_node = match cached {
            Some(node) => node,
            None => {
                let required = TraitSet::enumerable().with_collation(root.collation.clone());
                let node = Programs::standard().run(rewrite, root.node.clone(), &required)?;
                if cache_plan {
                    self.caches.put_plan(version, signature.clone(), node.clone());
                }
                node
            }
        };
        let physical = root.with_node(physical_node.clone())?;
        let result = self.implementor.implement(&physical, &parameter_type)?;
        if cache_implementation {
            self.caches.put_implementation(
                version,
                signature,
                CachedImplementation {
                    physical: physical_node.clone(),
                    result: result.clone(),
                },
            );
        }
        Ok(Plan {
            cost: rewrite.cumulative_cost(&physical_node).total(),
            proposal,
            parameters,
            physical,
            result,
        })
    }
}

/// A unit of work. Locks taken by its statements are held until commit,
/// rollback or drop.
pub struct Transaction {
    id: TxnId,
    processor: Arc<QueryProcessor>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
    modified: Mutex<BTreeSet<EntityId>>,
    finished: bool,
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Processor the transaction runs on.
    pub fn processor(&self) -> &Arc<QueryProcessor> {
        &self.processor
    }

    /// Requests detailed analysis: every statement records plan snapshots.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// New statement over the processor's current snapshot.
    pub fn statement(&self) -> Statement<'_> {
        Statement {
            txn: self,
            snapshot: self.processor.snapshot(),
            parameters: None,
        }
    }

    /// Entities marked for validation at commit.
    pub fn modified(&self) -> Vec<EntityId> {
        self.modified.lock().iter().copied().collect()
    }

    fn mark_modified(&self, entities: impl IntoIterator<Item = EntityId>) {
        self.modified.lock().extend(entities);
    }

    /// Runs a check query and returns its row count.
    fn run_check(&self, check: &AlgNode) -> Result<usize> {
        let root = AlgRoot::of(check.clone(), Kind::Select);
        let query = self.statement().prepare(&root, PrepareOptions::subquery())?;
        Ok(query.execute()?.len())
    }

    fn validate_modified(&self) -> Result<()> {
        let config = self.processor.config();
        let modified = self.modified();
        if config.constraint_enforcement != EnforcementTime::AfterQueryExecution
            || modified.is_empty()
        {
            return Ok(());
        }
        let tracker = ConstraintTracker::new(self.processor.snapshot());
        tracker.validate(
            modified,
            config.unique_constraint_enforcement,
            config.foreign_key_enforcement,
            &mut |check| {
                if let Some(d) = &self.diagnostics {
                    d.record(
                        Stage::ConstraintEnforcementPlan,
                        dump_plan("commit check", check, ExplainFormat::Text),
                    );
                }
                self.run_check(check)
            },
        )
    }

    /// Validates deferred constraints and ends the transaction. Locks are
    /// released whatever the outcome.
    pub fn commit(mut self) -> Result<()> {
        let outcome = self.validate_modified();
        self.finish();
        match &outcome {
            Ok(()) => debug!(txn = %self.id, "txn.commit"),
            Err(err) => warn!(txn = %self.id, error = %err, "txn.commit.failed"),
        }
        outcome
    }

    /// Ends the transaction without validation.
    pub fn rollback(mut self) {
        self.finish();
        debug!(txn = %self.id, "txn.rollback");
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.processor.gate.release(self.id);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

/// One statement of a transaction, pinned to a catalog snapshot.
pub struct Statement<'t> {
    txn: &'t Transaction,
    snapshot: Arc<dyn Snapshot>,
    parameters: Option<Vec<Vec<Value>>>,
}

impl<'t> Statement<'t> {
    /// Binds caller-supplied parameter rows; parameterization is then skipped.
    pub fn with_parameters(mut self, rows: Vec<Vec<Value>>) -> Self {
        self.parameters = Some(rows);
        self
    }

    /// Owning transaction.
    pub fn transaction(&self) -> &'t Transaction {
        self.txn
    }

    /// Catalog view of the statement.
    pub fn snapshot(&self) -> &Arc<dyn Snapshot> {
        &self.snapshot
    }

    /// Caller-supplied parameter rows.
    pub fn parameters(&self) -> Option<&[Vec<Value>]> {
        self.parameters.as_deref()
    }

    /// Prepares `root`.
    pub fn prepare(&self, root: &AlgRoot, options: PrepareOptions) -> Result<PreparedQuery> {
        self.txn.processor.prepare(self, root, options)
    }

    /// Prepares and executes `root`.
    pub fn execute(&self, root: &AlgRoot) -> Result<Vec<Vec<Value>>> {
        self.prepare(root, PrepareOptions::default())?.execute()
    }
}
