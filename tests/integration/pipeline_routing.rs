//! Routing, candidate selection and the three plan caches, end to end.

#![allow(missing_docs)]

use std::sync::Arc;

use quarry::alg::rex::{Op, Rex};
use quarry::alg::types::DataType;
use quarry::alg::{AlgNode, AlgRoot, Kind, Value};
use quarry::catalog::{EntityDef, InMemorySnapshot, Snapshot};
use quarry::exec::{Interpreter, MemStore};
use quarry::processing::select;
use quarry::routing::{ProposedRoutingPlan, Router, RouterSet, RoutingContext, SimplePlacementRouter};
use quarry::types::{AdapterId, EntityId, QuarryError, Result};
use quarry::{PrepareOptions, ProcessorConfig, QueryProcessor};

const ITEMS: EntityId = EntityId(7);

fn snapshot(version: u64) -> Arc<dyn Snapshot> {
    Arc::new(
        InMemorySnapshot::new()
            .with_version(version)
            .with_entity(
                EntityDef::new(ITEMS, "items")
                    .column("id", DataType::BigInt, false)
                    .column("qty", DataType::BigInt, true)
                    .placement(AdapterId(1))
                    .placement(AdapterId(2)),
            )
            .with_row_count(ITEMS, 3.0),
    )
}

fn store() -> Arc<MemStore> {
    let store = Arc::new(MemStore::new());
    store.insert_rows(
        ITEMS,
        vec![
            vec![Value::Int(1), Value::Int(5)],
            vec![Value::Int(2), Value::Null],
            vec![Value::Int(3), Value::Int(9)],
        ],
    );
    store
}

fn processor(config: ProcessorConfig) -> Arc<QueryProcessor> {
    quarry::telemetry::init_from_env();
    Arc::new(QueryProcessor::new(
        config,
        snapshot(1),
        Arc::new(Interpreter::new(store())),
    ))
}

fn qty_above(snapshot: &Arc<dyn Snapshot>, bound: i64) -> AlgRoot {
    let def = snapshot.entity("items").unwrap();
    let scan = AlgNode::scan(def.entity_ref(), def.row_type());
    let f = scan.row_type().fields().to_vec();
    let filter = AlgNode::filter(scan, Rex::call(Op::Gt, vec![Rex::input(1, &f[1]), Rex::lit(bound)]));
    AlgRoot::of(filter, Kind::Select)
}

struct Failing;

impl Router for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn route(&self, _root: &AlgRoot, _ctx: &RoutingContext) -> Result<Vec<ProposedRoutingPlan>> {
        Err(QuarryError::Routing("no adapter available".into()))
    }
}

struct Panicking;

impl Router for Panicking {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn route(&self, _root: &AlgRoot, _ctx: &RoutingContext) -> Result<Vec<ProposedRoutingPlan>> {
        panic!("router bug")
    }
}

#[test]
fn cheapest_candidate_wins_and_ties_keep_the_first() {
    assert_eq!(select(&[30.0, 10.0, 10.0]), Some(1));
    assert_eq!(select(&[4.0]), Some(0));
    assert_eq!(select(&[]), None);
}

#[test]
fn failing_routers_abstain() {
    let routers = RouterSet::new(vec![
        Arc::new(Failing),
        Arc::new(Panicking),
        Arc::new(SimplePlacementRouter),
    ]);
    let processor = Arc::new(
        QueryProcessor::new(
            ProcessorConfig::default(),
            snapshot(1),
            Arc::new(Interpreter::new(store())),
        )
        .with_routers(routers),
    );
    let snapshot = processor.snapshot();
    let txn = processor.begin();
    let query = txn
        .statement()
        .prepare(&qty_above(&snapshot, 6), PrepareOptions::default())
        .unwrap();
    assert_eq!(query.router, "simple");
    assert_eq!(query.execute().unwrap(), vec![vec![Value::Int(3), Value::Int(9)]]);
}

#[test]
fn no_surviving_router_is_reported() {
    let routers = RouterSet::new(vec![Arc::new(Failing), Arc::new(Panicking)]);
    let processor = Arc::new(
        QueryProcessor::new(
            ProcessorConfig::default(),
            snapshot(1),
            Arc::new(Interpreter::new(store())),
        )
        .with_routers(routers),
    );
    let snapshot = processor.snapshot();
    let txn = processor.begin();
    let err = txn
        .statement()
        .prepare(&qty_above(&snapshot, 6), PrepareOptions::default())
        .unwrap_err();
    assert_eq!(err, QuarryError::NoRoute);
}

#[test]
fn warm_caches_return_the_cold_plan() {
    let processor = processor(ProcessorConfig::default());
    let snapshot = processor.snapshot();
    let txn = processor.begin();

    let cold = txn
        .statement()
        .prepare(&qty_above(&snapshot, 4), PrepareOptions::default())
        .unwrap();
    let warm = txn
        .statement()
        .prepare(&qty_above(&snapshot, 4), PrepareOptions::default())
        .unwrap();

    assert_eq!(cold.physical.node.digest(), warm.physical.node.digest());
    assert_eq!(cold.router, warm.router);
    assert_eq!(cold.execute().unwrap(), warm.execute().unwrap());
    assert!(processor.caches().stats().implementations.hits >= 1);
}

#[test]
fn cached_routing_replays_the_chosen_placement() {
    let processor = processor(ProcessorConfig::default());
    let snapshot = processor.snapshot();
    let txn = processor.begin();

    let first = txn
        .statement()
        .prepare(&qty_above(&snapshot, 0), PrepareOptions::default())
        .unwrap();
    let stats = processor.caches().stats().routing;
    assert_eq!(stats.hits, 0);
    assert!(!processor.caches().is_empty());

    let second = txn
        .statement()
        .prepare(&qty_above(&snapshot, 0), PrepareOptions::default())
        .unwrap();
    assert_eq!(processor.caches().stats().routing.hits, 1);
    assert_eq!(first.router, second.router);
    assert_eq!(first.physical.node.digest(), second.physical.node.digest());
    assert_eq!(second.execute().unwrap().len(), 2);
}

#[test]
fn disabled_caches_still_produce_the_same_rows() {
    let cached = processor(ProcessorConfig::default());
    let uncached = processor(ProcessorConfig::benchmark());
    for p in [&cached, &uncached] {
        let snapshot = p.snapshot();
        let txn = p.begin();
        let rows = txn.statement().execute(&qty_above(&snapshot, 4)).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Int(1), Value::Int(5)],
                vec![Value::Int(3), Value::Int(9)],
            ]
        );
    }
    assert!(uncached.caches().is_empty());
}

#[test]
fn catalog_change_invalidates_every_cache() {
    let processor = processor(ProcessorConfig::default());
    let snapshot = processor.snapshot();
    let txn = processor.begin();
    txn.statement().execute(&qty_above(&snapshot, 4)).unwrap();
    txn.statement().execute(&qty_above(&snapshot, 4)).unwrap();
    assert!(processor.caches().stats().implementations.hits >= 1);
    txn.commit().unwrap();

    processor.set_snapshot(self::snapshot(2));
    let snapshot = processor.snapshot();
    let txn = processor.begin();
    txn.statement().execute(&qty_above(&snapshot, 4)).unwrap();
    let stats = processor.caches().stats();
    assert_eq!(stats.implementations.hits, 0);
    assert!(stats.implementations.misses >= 1);
}
