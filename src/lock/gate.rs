use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::alg::metadata::{entity_access, Access};
use crate::alg::node::AlgNode;
use crate::types::{Result, TxnId};

use super::{LockManager, LockRequest, LockTarget};

/// Locks everything a statement touches before it is routed.
#[derive(Clone)]
pub struct ConcurrencyGate {
    manager: Arc<dyn LockManager>,
}

impl ConcurrencyGate {
    /// Gate over a lock manager.
    pub fn new(manager: Arc<dyn LockManager>) -> Self {
        Self { manager }
    }

    /// Underlying lock manager.
    pub fn manager(&self) -> &Arc<dyn LockManager> {
        &self.manager
    }

    /// Shared global lock plus one lock per accessed entity: exclusive when
    /// written, shared when only read.
    pub fn requests_for(node: &AlgNode) -> Vec<LockRequest> {
        let mut requests = vec![LockRequest::shared(LockTarget::Global)];
        requests.extend(entity_access(node).into_iter().map(|(id, access)| match access {
            Access::Read => LockRequest::shared(LockTarget::Entity(id)),
            Access::Write => LockRequest::exclusive(LockTarget::Entity(id)),
        }));
        requests
    }

    /// Acquires the locks for `node` in one batched request.
    pub fn acquire(&self, node: &AlgNode, txn: TxnId) -> Result<Vec<LockRequest>> {
        let requests = Self::requests_for(node);
        let started = Instant::now();
        self.manager.lock(&requests, txn)?;
        debug!(
            txn = %txn,
            locks = requests.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "lock.acquired"
        );
        Ok(requests)
    }

    /// Releases every lock held by `txn`.
    pub fn release(&self, txn: TxnId) {
        self.manager.unlock_all(txn);
        debug!(txn = %txn, "lock.released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::{EntityRef, ModifyOperation};
    use crate::alg::types::{DataType, TupleType};
    use crate::lock::{LockMode, WaitForGraphLockManager};
    use crate::types::EntityId;

    #[test]
    fn writes_take_exclusive_entity_locks() {
        let ty = TupleType::of(&[("a", DataType::BigInt, false)]);
        let source = AlgNode::scan(EntityRef::new(EntityId(2), "src"), ty);
        let insert = AlgNode::modify(
            source,
            EntityRef::new(EntityId(1), "dst"),
            ModifyOperation::Insert,
            vec![],
            vec![],
        );
        let gate = ConcurrencyGate::new(Arc::new(WaitForGraphLockManager::new()));
        let requests = gate.acquire(&insert, TxnId(1)).unwrap();
        assert_eq!(requests.len(), 3);
        let manager = gate.manager();
        assert_eq!(manager.held(LockTarget::Global, TxnId(1)), Some(LockMode::Shared));
        assert_eq!(
            manager.held(LockTarget::Entity(EntityId(1)), TxnId(1)),
            Some(LockMode::Exclusive)
        );
        assert_eq!(
            manager.held(LockTarget::Entity(EntityId(2)), TxnId(1)),
            Some(LockMode::Shared)
        );
        gate.release(TxnId(1));
        assert_eq!(manager.held(LockTarget::Global, TxnId(1)), None);
    }
}
