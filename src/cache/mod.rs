//! Process-wide plan caches.
//!
//! [`PlanCaches`] is constructed once and shared by every statement. It holds
//! three independent memoization layers:
//!
//! * the routing-plan cache, keyed by query hash and accessed partitions, which
//!   remembers the physical query classes the routers proposed and their costs;
//! * the query-plan cache, mapping a parameterized logical signature to its
//!   optimized physical tree;
//! * the implementation cache, mapping the same signature to the prepared result.
//!
//! All entries are only valid for the catalog version they were computed
//! against. Observing a newer version resets all three caches at once, and
//! every lookup or insert names the version its caller synced to, so a
//! statement that raced a reset neither reads nor writes entries of another
//! version.

mod lru;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

pub use lru::{CacheStats, ShardedLru};

use crate::alg::node::AlgNode;
use crate::config::ProcessorConfig;
use crate::processing::PreparedResult;
use crate::types::PartitionId;

/// Routing-plan cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    /// Hash of the logical query's digest.
    pub query_hash: u64,
    /// Partitions the query touches, sorted.
    pub partitions: Vec<PartitionId>,
}

/// One router proposal remembered by the routing-plan cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedRoute {
    /// Router that proposed the plan.
    pub router: String,
    /// Physical query class of the routed tree.
    pub query_class: String,
    /// Cost the selector saw.
    pub cost: f64,
}

/// Cached optimization and implementation of one signature.
#[derive(Clone)]
pub struct CachedImplementation {
    /// Optimized physical tree.
    pub physical: AlgNode,
    /// Executable artifact.
    pub result: Arc<dyn PreparedResult>,
}

/// Counters across all caches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PlanCacheStats {
    /// Routing-plan cache.
    pub routing: CacheStats,
    /// Query-plan cache.
    pub plans: CacheStats,
    /// Implementation cache.
    pub implementations: CacheStats,
    /// Plans that could not be cached.
    pub uncacheable: u64,
}

/// The three plan caches plus the catalog version they are valid for.
pub struct PlanCaches {
    version: Mutex<u64>,
    routing: ShardedLru<RoutingKey, Arc<Vec<CachedRoute>>>,
    plans: ShardedLru<String, AlgNode>,
    implementations: ShardedLru<String, CachedImplementation>,
    uncacheable: AtomicU64,
}

impl PlanCaches {
    /// Empty caches sized by `shards` and `capacity` entries each.
    pub fn new(shards: usize, capacity: usize) -> Self {
        Self {
            version: Mutex::new(0),
            routing: ShardedLru::new(shards, capacity),
            plans: ShardedLru::new(shards, capacity),
            implementations: ShardedLru::new(shards, capacity),
            uncacheable: AtomicU64::new(0),
        }
    }

    /// Caches sized from the processor configuration.
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::new(config.cache_shards, config.cache_capacity)
    }

    /// Aligns the caches with the catalog version of a statement's snapshot.
    ///
    /// A newer version drops every entry. Returns false when the snapshot is
    /// older than the caches, in which case the statement must not use them.
    pub fn sync_version(&self, version: u64) -> bool {
        let mut current = self.version.lock();
        if version > *current {
            if *current != 0 {
                info!(from = *current, to = version, "cache.version.reset");
            }
            *current = version;
            self.clear_entries();
            return true;
        }
        version == *current
    }

    /// Drops every entry of all three caches.
    pub fn reset(&self) {
        self.clear_entries();
        self.uncacheable.store(0, Ordering::Relaxed);
        debug!("cache.reset");
    }

    fn clear_entries(&self) {
        self.routing.clear();
        self.plans.clear();
        self.implementations.clear();
    }

    /// Runs `f` only while the caches are still at `version`.
    fn at_version<T>(&self, version: u64, f: impl FnOnce() -> T) -> Option<T> {
        let current = self.version.lock();
        if *current != version {
            debug!(stale = version, current = *current, "cache.version.stale");
            return None;
        }
        Some(f())
    }

    /// Routing decisions recorded for `key` at catalog `version`.
    pub fn routing(&self, version: u64, key: &RoutingKey) -> Option<Arc<Vec<CachedRoute>>> {
        self.at_version(version, || self.routing.get(key)).flatten()
    }

    /// Records routing decisions for `key`, unless the caches moved past `version`.
    pub fn put_routing(&self, version: u64, key: RoutingKey, routes: Vec<CachedRoute>) {
        self.at_version(version, || self.routing.insert(key, Arc::new(routes)));
    }

    /// Optimized tree for a parameterized signature.
    pub fn plan(&self, version: u64, signature: &str) -> Option<AlgNode> {
        self.at_version(version, || self.plans.get(&signature.to_string()))
            .flatten()
    }

    /// Records an optimized tree computed against `version`.
    pub fn put_plan(&self, version: u64, signature: String, physical: AlgNode) {
        self.at_version(version, || self.plans.insert(signature, physical));
    }

    /// Prepared result for a parameterized signature.
    pub fn implementation(&self, version: u64, signature: &str) -> Option<CachedImplementation> {
        self.at_version(version, || self.implementations.get(&signature.to_string()))
            .flatten()
    }

    /// Records a prepared result computed against `version`.
    pub fn put_implementation(&self, version: u64, signature: String, entry: CachedImplementation) {
        self.at_version(version, || self.implementations.insert(signature, entry));
    }

    /// Counts a plan that was not cacheable.
    pub fn record_uncacheable(&self) {
        self.uncacheable.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of every counter.
    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            routing: self.routing.stats(),
            plans: self.plans.stats(),
            implementations: self.implementations.stats(),
            uncacheable: self.uncacheable.load(Ordering::Relaxed),
        }
    }

    /// Total number of entries across the caches.
    pub fn len(&self) -> usize {
        self.routing.len() + self.plans.len() + self.implementations.len()
    }

    /// True when no cache holds anything.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
