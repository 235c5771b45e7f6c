//! Entity and global locks held by transactions.
//!
//! The pipeline only depends on the [`LockManager`] contract. [`WaitForGraphLockManager`]
//! is the in-process implementation: shared/exclusive locks per target, blocking
//! waits on a condition variable, and deadlock detection on the wait-for graph at
//! the moment a request would block.

mod gate;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

pub use gate::ConcurrencyGate;

use crate::types::{EntityId, QuarryError, Result, TxnId};

/// Lock strength.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Excludes every other holder.
    Exclusive,
}

/// What is being locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockTarget {
    /// The catalog as a whole; schema changes take it exclusively.
    Global,
    /// One entity.
    Entity(EntityId),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Global => write!(f, "global"),
            LockTarget::Entity(id) => write!(f, "entity#{id}"),
        }
    }
}

/// One element of a batched lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockRequest {
    /// Target.
    pub target: LockTarget,
    /// Requested mode.
    pub mode: LockMode,
}

impl LockRequest {
    /// Shared lock on `target`.
    pub fn shared(target: LockTarget) -> Self {
        Self {
            target,
            mode: LockMode::Shared,
        }
    }

    /// Exclusive lock on `target`.
    pub fn exclusive(target: LockTarget) -> Self {
        Self {
            target,
            mode: LockMode::Exclusive,
        }
    }
}

/// Lock/unlock contract used by the concurrency gate.
pub trait LockManager: Send + Sync {
    /// Acquires every request for `txn`, blocking until granted.
    /// Fails with [`QuarryError::Deadlock`] when waiting would deadlock.
    fn lock(&self, requests: &[LockRequest], txn: TxnId) -> Result<()>;

    /// Releases the given targets held by `txn`.
    fn unlock(&self, targets: &[LockTarget], txn: TxnId);

    /// Releases everything `txn` holds.
    fn unlock_all(&self, txn: TxnId);

    /// Mode in which `txn` holds `target`, if any.
    fn held(&self, target: LockTarget, txn: TxnId) -> Option<LockMode>;
}

#[derive(Default)]
struct Holders {
    shared: BTreeSet<TxnId>,
    exclusive: Option<TxnId>,
}

impl Holders {
    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }

    /// Transactions that prevent `txn` from taking `mode`.
    fn blockers(&self, mode: LockMode, txn: TxnId) -> BTreeSet<TxnId> {
        let mut blockers = BTreeSet::new();
        if let Some(owner) = self.exclusive {
            if owner != txn {
                blockers.insert(owner);
            }
        }
        if mode == LockMode::Exclusive {
            blockers.extend(self.shared.iter().copied().filter(|t| *t != txn));
        }
        blockers
    }

    fn grant(&mut self, mode: LockMode, txn: TxnId) {
        match mode {
            LockMode::Shared => {
                if self.exclusive != Some(txn) {
                    self.shared.insert(txn);
                }
            }
            LockMode::Exclusive => {
                self.shared.remove(&txn);
                self.exclusive = Some(txn);
            }
        }
    }

    fn release(&mut self, txn: TxnId) {
        self.shared.remove(&txn);
        if self.exclusive == Some(txn) {
            self.exclusive = None;
        }
    }

    fn mode_of(&self, txn: TxnId) -> Option<LockMode> {
        if self.exclusive == Some(txn) {
            Some(LockMode::Exclusive)
        } else if self.shared.contains(&txn) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<LockTarget, Holders>,
    waits_for: HashMap<TxnId, BTreeSet<TxnId>>,
}

impl LockTable {
    /// True when `txn` is reachable from any of `start` in the wait-for graph.
    fn reaches(&self, start: &BTreeSet<TxnId>, txn: TxnId) -> bool {
        let mut stack: Vec<TxnId> = start.iter().copied().collect();
        let mut seen = BTreeSet::new();
        while let Some(next) = stack.pop() {
            if next == txn {
                return true;
            }
            if !seen.insert(next) {
                continue;
            }
            if let Some(edges) = self.waits_for.get(&next) {
                stack.extend(edges.iter().copied());
            }
        }
        false
    }
}

/// Blocking lock manager with wait-for-graph deadlock detection.
#[derive(Default)]
pub struct WaitForGraphLockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl WaitForGraphLockManager {
    /// Creates a manager with no locks held.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sorts requests into the global acquisition order and keeps the strongest
/// mode per target, so every transaction locks in the same order.
pub(crate) fn normalize(requests: &[LockRequest]) -> Vec<LockRequest> {
    let mut strongest: BTreeMap<LockTarget, LockMode> = BTreeMap::new();
    for request in requests {
        let mode = strongest.entry(request.target).or_insert(request.mode);
        *mode = (*mode).max(request.mode);
    }
    strongest
        .into_iter()
        .map(|(target, mode)| LockRequest { target, mode })
        .collect()
}

impl LockManager for WaitForGraphLockManager {
    fn lock(&self, requests: &[LockRequest], txn: TxnId) -> Result<()> {
        let mut table = self.table.lock();
        for request in normalize(requests) {
            loop {
                let blockers = table
                    .holders
                    .get(&request.target)
                    .map(|h| h.blockers(request.mode, txn))
                    .unwrap_or_default();
                if blockers.is_empty() {
                    table
                        .holders
                        .entry(request.target)
                        .or_default()
                        .grant(request.mode, txn);
                    table.waits_for.remove(&txn);
                    break;
                }
                if table.reaches(&blockers, txn) {
                    table.waits_for.remove(&txn);
                    warn!(txn = %txn, target = %request.target, "lock.deadlock");
                    return Err(QuarryError::Deadlock { txn });
                }
                debug!(txn = %txn, target = %request.target, waiting_on = blockers.len(), "lock.wait");
                table.waits_for.insert(txn, blockers);
                self.released.wait(&mut table);
            }
        }
        Ok(())
    }

    fn unlock(&self, targets: &[LockTarget], txn: TxnId) {
        let mut table = self.table.lock();
        for target in targets {
            if let Some(holders) = table.holders.get_mut(target) {
                holders.release(txn);
                if holders.is_empty() {
                    table.holders.remove(target);
                }
            }
        }
        self.released.notify_all();
    }

    fn unlock_all(&self, txn: TxnId) {
        let mut table = self.table.lock();
        table.holders.retain(|_, holders| {
            holders.release(txn);
            !holders.is_empty()
        });
        table.waits_for.remove(&txn);
        self.released.notify_all();
    }

    fn held(&self, target: LockTarget, txn: TxnId) -> Option<LockMode> {
        self.table.lock().holders.get(&target).and_then(|h| h.mode_of(txn))
    }
}
