//! Trees built with `AlgBuilder`, prepared by the processor and executed by the
//! interpreter.

#![allow(missing_docs)]

use std::sync::Arc;

use quarry::alg::types::DataType;
use quarry::alg::{AggFunction, AlgNode, AlgOp, AlgRoot, JoinKind, Kind, ModifyOperation, Value};
use quarry::builder::{AggCall, SortKey};
use quarry::catalog::{EntityDef, InMemorySnapshot, Snapshot};
use quarry::exec::{Interpreter, MemStore};
use quarry::types::{AdapterId, EntityId, Result};
use quarry::{AlgBuilder, ProcessorConfig, QueryProcessor};

const EMP: EntityId = EntityId(1);
const DEPT: EntityId = EntityId(2);

struct Fixture {
    processor: Arc<QueryProcessor>,
    store: Arc<MemStore>,
    snapshot: Arc<dyn Snapshot>,
}

impl Fixture {
    fn new() -> Self {
        quarry::telemetry::init_from_env();
        let snapshot: Arc<dyn Snapshot> = Arc::new(
            InMemorySnapshot::new()
                .with_entity(
                    EntityDef::new(EMP, "emp")
                        .column("id", DataType::BigInt, false)
                        .column("dept", DataType::Varchar, false)
                        .column("sal", DataType::BigInt, true)
                        .placement(AdapterId(1)),
                )
                .with_entity(
                    EntityDef::new(DEPT, "dept")
                        .column("name", DataType::Varchar, false)
                        .column("floor", DataType::BigInt, false)
                        .placement(AdapterId(1)),
                ),
        );
        let store = Arc::new(MemStore::new());
        store.insert_rows(
            EMP,
            vec![
                emp(1, "eng", Some(300)),
                emp(2, "eng", Some(200)),
                emp(3, "ops", Some(100)),
                emp(4, "ops", None),
                emp(5, "hr", Some(150)),
            ],
        );
        store.insert_rows(
            DEPT,
            vec![
                vec![Value::from("eng"), Value::Int(1)],
                vec![Value::from("ops"), Value::Int(2)],
            ],
        );
        let processor = Arc::new(QueryProcessor::new(
            ProcessorConfig::default(),
            snapshot.clone(),
            Arc::new(Interpreter::new(store.clone())),
        ));
        Self {
            processor,
            store,
            snapshot,
        }
    }

    fn builder(&self) -> AlgBuilder {
        AlgBuilder::new(self.snapshot.clone())
    }

    fn run(&self, node: AlgNode, kind: Kind) -> Result<Vec<Vec<Value>>> {
        let txn = self.processor.begin();
        let rows = txn.statement().execute(&AlgRoot::of(node, kind))?;
        txn.commit()?;
        Ok(rows)
    }
}

fn emp(id: i64, dept: &str, sal: Option<i64>) -> Vec<Value> {
    vec![
        Value::Int(id),
        Value::from(dept),
        sal.map(Value::Int).unwrap_or(Value::Null),
    ]
}

fn ints(rows: &[&[i64]]) -> Vec<Vec<Value>> {
    rows.iter()
        .map(|r| r.iter().map(|v| Value::Int(*v)).collect())
        .collect()
}

#[test]
fn filter_project_sort_limit() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    let cond = b.greater_than(b.field("sal").unwrap(), b.literal(120i64));
    b.filter(vec![cond]).unwrap();
    let fields = b.fields_named(&["id", "sal"]).unwrap();
    b.project(fields).unwrap();
    let key = SortKey::desc(b.field("sal").unwrap());
    b.sort_limit(None, Some(2), vec![key]).unwrap();
    let node = b.build().unwrap();

    let rows = fx.run(node, Kind::Select).unwrap();
    assert_eq!(rows, ints(&[&[1, 300], &[2, 200]]));
}

#[test]
fn group_by_counts_and_sums_ignoring_nulls() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    let key = b.group_key(vec![b.field("dept").unwrap()]);
    let sum = b.agg(AggFunction::Sum, vec![b.field("sal").unwrap()]).alias("total");
    b.aggregate(key, vec![AggCall::count_star().alias("n"), sum]).unwrap();
    let order = SortKey::asc(b.field("dept").unwrap());
    b.sort(vec![order]).unwrap();
    let node = b.build().unwrap();
    assert_eq!(
        node.row_type().names(),
        vec!["dept".to_string(), "n".to_string(), "total".to_string()]
    );

    let rows = fx.run(node, Kind::Select).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::from("eng"), Value::Int(2), Value::Int(500)],
            vec![Value::from("hr"), Value::Int(1), Value::Int(150)],
            vec![Value::from("ops"), Value::Int(2), Value::Int(100)],
        ]
    );
}

#[test]
fn rollup_adds_a_grand_total_with_null_key() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    let dept = b.field("dept").unwrap();
    let key = quarry::builder::GroupKey::with_sets(vec![dept.clone()], vec![vec![dept], vec![]]);
    b.aggregate(key, vec![AggCall::count_star().alias("n")]).unwrap();
    let order = SortKey::asc(b.field("dept").unwrap());
    b.sort(vec![order]).unwrap();
    let node = b.build().unwrap();

    let rows = fx.run(node, Kind::Select).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::from("eng"), Value::Int(2)],
            vec![Value::from("hr"), Value::Int(1)],
            vec![Value::from("ops"), Value::Int(2)],
            vec![Value::Null, Value::Int(5)],
        ]
    );
}

#[test]
fn inner_join_on_names() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    b.scan("dept").unwrap();
    let cond = b.equals(
        b.field_of(2, 0, "dept").unwrap(),
        b.field_of(2, 1, "name").unwrap(),
    );
    b.join(JoinKind::Inner, cond).unwrap();
    let fields = b.fields_named(&["id", "floor"]).unwrap();
    b.project(fields).unwrap();
    let order = SortKey::asc(b.field("id").unwrap());
    b.sort(vec![order]).unwrap();
    let node = b.build().unwrap();

    let rows = fx.run(node, Kind::Select).unwrap();
    assert_eq!(rows, ints(&[&[1, 1], &[2, 1], &[3, 2], &[4, 2]]));
}

#[test]
fn left_join_keeps_unmatched_rows() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    b.scan("dept").unwrap();
    let cond = b.equals(
        b.field_of(2, 0, "dept").unwrap(),
        b.field_of(2, 1, "name").unwrap(),
    );
    b.join(JoinKind::Left, cond).unwrap();
    let missing = b.is_null(b.field("floor").unwrap());
    b.filter(vec![missing]).unwrap();
    let id = b.field("id").unwrap();
    b.project(vec![id]).unwrap();
    let node = b.build().unwrap();

    let rows = fx.run(node, Kind::Select).unwrap();
    assert_eq!(rows, ints(&[&[5]]));
}

#[test]
fn distinct_union_with_literal_rows() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    let dept = b.fields_named(&["dept"]).unwrap();
    b.project(dept).unwrap();
    b.values(&["dept"], vec![vec![Value::from("eng")], vec![Value::from("qa")]])
        .unwrap();
    b.union(false, 2).unwrap();
    let order = SortKey::asc(b.field_at(0).unwrap());
    b.sort(vec![order]).unwrap();
    let node = b.build().unwrap();

    let rows = fx.run(node, Kind::Select).unwrap();
    let names: Vec<Value> = rows.into_iter().map(|mut r| r.remove(0)).collect();
    assert_eq!(
        names,
        vec![
            Value::from("eng"),
            Value::from("hr"),
            Value::from("ops"),
            Value::from("qa"),
        ]
    );
}

#[test]
fn contradictory_filter_runs_as_empty_rows() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    let never = b.is_null(b.field("id").unwrap());
    b.filter(vec![never]).unwrap();
    let node = b.build().unwrap();
    assert!(matches!(node.op(), AlgOp::Values { tuples } if tuples.is_empty()));

    assert!(fx.run(node, Kind::Select).unwrap().is_empty());
}

#[test]
fn update_through_the_builder() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    let cond = b.equals(b.field("id").unwrap(), b.literal(3i64));
    b.filter(vec![cond]).unwrap();
    let def = fx.snapshot.entity("emp").unwrap();
    let raise = b.literal(111i64);
    b.modify(def.entity_ref(), ModifyOperation::Update, vec!["sal".into()], vec![raise])
        .unwrap();
    let node = b.build().unwrap();

    let rows = fx.run(node, Kind::Update).unwrap();
    assert_eq!(rows, ints(&[&[1]]));
    assert!(fx.store.rows(EMP).contains(&emp(3, "ops", Some(111))));
    assert_eq!(fx.store.len(EMP), 5);
}

#[test]
fn delete_through_the_builder() {
    let fx = Fixture::new();
    let mut b = fx.builder();
    b.scan("emp").unwrap();
    let cond = b.equals(b.field("dept").unwrap(), b.literal("ops"));
    b.filter(vec![cond]).unwrap();
    let def = fx.snapshot.entity("emp").unwrap();
    b.modify(def.entity_ref(), ModifyOperation::Delete, vec![], vec![])
        .unwrap();
    let node = b.build().unwrap();

    let rows = fx.run(node, Kind::Delete).unwrap();
    assert_eq!(rows, ints(&[&[2]]));
    assert_eq!(fx.store.len(EMP), 3);
}
