//! Lock acquisition across concurrent transactions: disjoint work proceeds in
//! parallel, shared readers coexist and opposite-order writers are broken by
//! deadlock detection rather than hanging.

#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use quarry::alg::types::DataType;
use quarry::alg::{AlgNode, AlgRoot, Kind, ModifyOperation, Value};
use quarry::catalog::{EntityDef, InMemorySnapshot, Snapshot};
use quarry::exec::{Interpreter, MemStore};
use quarry::lock::{LockManager, LockMode, LockRequest, LockTarget, WaitForGraphLockManager};
use quarry::types::{AdapterId, EntityId, QuarryError, TxnId};
use quarry::{ProcessorConfig, QueryProcessor};

const A: EntityId = EntityId(1);
const B: EntityId = EntityId(2);

fn processor() -> (Arc<QueryProcessor>, Arc<MemStore>) {
    quarry::telemetry::init_from_env();
    let entity = |id, name| {
        EntityDef::new(id, name)
            .column("k", DataType::BigInt, false)
            .placement(AdapterId(1))
    };
    let snapshot: Arc<dyn Snapshot> = Arc::new(
        InMemorySnapshot::new()
            .with_entity(entity(A, "a"))
            .with_entity(entity(B, "b")),
    );
    let store = Arc::new(MemStore::new());
    let processor = Arc::new(QueryProcessor::new(
        ProcessorConfig::default(),
        snapshot,
        Arc::new(Interpreter::new(store.clone())),
    ));
    (processor, store)
}

fn insert(processor: &QueryProcessor, entity: &str, k: i64) -> AlgRoot {
    let def = processor.snapshot().entity(entity).unwrap();
    let values = AlgNode::values(def.row_type(), vec![vec![Value::Int(k)]]).unwrap();
    let modify = AlgNode::modify(values, def.entity_ref(), ModifyOperation::Insert, vec![], vec![]);
    AlgRoot::of(modify, Kind::Insert)
}

fn scan(processor: &QueryProcessor, entity: &str) -> AlgRoot {
    let def = processor.snapshot().entity(entity).unwrap();
    AlgRoot::of(AlgNode::scan(def.entity_ref(), def.row_type()), Kind::Select)
}

#[test]
fn disjoint_exclusive_locks_are_granted_concurrently() {
    let manager = Arc::new(WaitForGraphLockManager::new());
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(TxnId(1), A), (TxnId(2), B)]
        .into_iter()
        .map(|(txn, entity)| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let target = LockTarget::Entity(entity);
                manager
                    .lock(
                        &[LockRequest::shared(LockTarget::Global), LockRequest::exclusive(target)],
                        txn,
                    )
                    .unwrap();
                // Both hold their lock at the same time.
                barrier.wait();
                let held = manager.held(target, txn);
                barrier.wait();
                manager.unlock_all(txn);
                held
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(LockMode::Exclusive));
    }
}

#[test]
fn opposite_order_requests_deadlock_exactly_one_victim() {
    let manager = Arc::new(WaitForGraphLockManager::new());
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(TxnId(1), A, B), (TxnId(2), B, A)]
        .into_iter()
        .map(|(txn, first, second)| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                manager
                    .lock(&[LockRequest::exclusive(LockTarget::Entity(first))], txn)
                    .unwrap();
                barrier.wait();
                let outcome = manager.lock(&[LockRequest::exclusive(LockTarget::Entity(second))], txn);
                manager.unlock_all(txn);
                outcome
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let victims: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            Err(QuarryError::Deadlock { txn }) => Some(*txn),
            _ => None,
        })
        .collect();
    assert_eq!(victims.len(), 1, "{outcomes:?}");
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
}

#[test]
fn readers_share_an_entity() {
    let (processor, store) = processor();
    store.insert_rows(A, vec![vec![Value::Int(1)]]);
    let first = processor.begin();
    let second = processor.begin();
    assert_eq!(first.statement().execute(&scan(&processor, "a")).unwrap().len(), 1);
    assert_eq!(second.statement().execute(&scan(&processor, "a")).unwrap().len(), 1);

    let manager = processor.gate().manager().clone();
    assert_eq!(manager.held(LockTarget::Entity(A), first.id()), Some(LockMode::Shared));
    assert_eq!(manager.held(LockTarget::Entity(A), second.id()), Some(LockMode::Shared));
    first.commit().unwrap();
    second.commit().unwrap();
}

#[test]
fn transactions_writing_in_opposite_order_do_not_hang() {
    let (processor, store) = processor();
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [("a", "b"), ("b", "a")]
        .into_iter()
        .enumerate()
        .map(|(i, (first, second))| {
            let processor = processor.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let txn = processor.begin();
                txn.statement()
                    .execute(&insert(&processor, first, i as i64))
                    .unwrap();
                barrier.wait();
                let outcome = txn.statement().execute(&insert(&processor, second, i as i64));
                match outcome {
                    Ok(_) => txn.commit(),
                    // Dropping the victim releases its locks.
                    Err(err) => Err(err),
                }
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let codes: Vec<_> = outcomes
        .iter()
        .filter_map(|o| o.as_ref().err().map(|e| e.code()))
        .collect();
    assert_eq!(codes, vec!["Deadlock"], "{outcomes:?}");
    // The winner wrote both rows, the victim only its first.
    assert_eq!(store.len(A) + store.len(B), 3);
}
