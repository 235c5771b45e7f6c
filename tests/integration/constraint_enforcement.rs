//! Constraint enforcement through the full pipeline.
//!
//! Covers guards added before execution (the violating statement never writes),
//! deferred validation at commit, foreign-key lookups in both directions and
//! switching enforcement on at runtime.

#![allow(missing_docs)]

use std::sync::Arc;

use quarry::alg::rex::Rex;
use quarry::alg::{AlgNode, AlgRoot, Kind, ModifyOperation, Value};
use quarry::alg::types::DataType;
use quarry::catalog::{EntityDef, ForeignKeyAction, ForeignKeyDef, InMemorySnapshot, Snapshot};
use quarry::config::EnforcementTime;
use quarry::exec::{Interpreter, MemStore};
use quarry::processing::{RecordingDiagnostics, Stage};
use quarry::types::{AdapterId, EntityId};
use quarry::{ProcessorConfig, QueryProcessor};

const USERS: EntityId = EntityId(1);
const ORDERS: EntityId = EntityId(2);

fn snapshot() -> Arc<dyn Snapshot> {
    Arc::new(
        InMemorySnapshot::new()
            .with_entity(
                EntityDef::new(USERS, "users")
                    .column("id", DataType::BigInt, false)
                    .column("email", DataType::Varchar, true)
                    .placement(AdapterId(1)),
            )
            .with_entity(
                EntityDef::new(ORDERS, "orders")
                    .column("id", DataType::BigInt, false)
                    .column("user_id", DataType::BigInt, false)
                    .placement(AdapterId(1)),
            )
            .with_primary_key(USERS, &["id"])
            .with_unique(USERS, "uq_email", &["email"])
            .with_primary_key(ORDERS, &["id"])
            .with_foreign_key(ForeignKeyDef {
                name: "fk_user".into(),
                entity: ORDERS,
                columns: vec!["user_id".into()],
                referenced: USERS,
                referenced_columns: vec!["id".into()],
                on_update: ForeignKeyAction::Restrict,
                on_delete: ForeignKeyAction::Restrict,
            }),
    )
}

fn processor(config: ProcessorConfig) -> (Arc<QueryProcessor>, Arc<MemStore>, Arc<dyn Snapshot>) {
    quarry::telemetry::init_from_env();
    let snapshot = snapshot();
    let store = Arc::new(MemStore::new());
    store.insert_rows(USERS, vec![vec![Value::Int(1), Value::from("a@x.com")]]);
    let processor = Arc::new(QueryProcessor::new(
        config,
        snapshot.clone(),
        Arc::new(Interpreter::new(store.clone())),
    ));
    (processor, store, snapshot)
}

fn insert(snapshot: &Arc<dyn Snapshot>, entity: &str, rows: Vec<Vec<Value>>) -> AlgRoot {
    let def = snapshot.entity(entity).unwrap();
    let values = AlgNode::values(def.row_type(), rows).unwrap();
    let modify = AlgNode::modify(values, def.entity_ref(), ModifyOperation::Insert, vec![], vec![]);
    AlgRoot::of(modify, Kind::Insert)
}

/// `UPDATE entity SET column = value WHERE id = id`.
fn update(snapshot: &Arc<dyn Snapshot>, entity: &str, id: i64, column: &str, value: Value) -> AlgRoot {
    let def = snapshot.entity(entity).unwrap();
    let scan = AlgNode::scan(def.entity_ref(), def.row_type());
    let key = Rex::input(0, &scan.row_type().fields()[0]);
    let filtered = AlgNode::filter(scan, Rex::eq(key, Rex::lit(id)));
    let modify = AlgNode::modify(
        filtered,
        def.entity_ref(),
        ModifyOperation::Update,
        vec![column.into()],
        vec![Rex::lit(value)],
    );
    AlgRoot::of(modify, Kind::Update)
}

fn delete(snapshot: &Arc<dyn Snapshot>, entity: &str, id: i64) -> AlgRoot {
    let def = snapshot.entity(entity).unwrap();
    let scan = AlgNode::scan(def.entity_ref(), def.row_type());
    let key = Rex::input(0, &scan.row_type().fields()[0]);
    let filtered = AlgNode::filter(scan, Rex::eq(key, Rex::lit(id)));
    let modify = AlgNode::modify(filtered, def.entity_ref(), ModifyOperation::Delete, vec![], vec![]);
    AlgRoot::of(modify, Kind::Delete)
}

#[test]
fn duplicate_unique_key_is_rejected_before_writing() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    let recorder = Arc::new(RecordingDiagnostics::new());
    let txn = processor.begin().with_diagnostics(recorder.clone());

    let err = txn
        .statement()
        .execute(&insert(&snapshot, "users", vec![vec![Value::Int(2), Value::from("a@x.com")]]))
        .unwrap_err();

    assert_eq!(err.code(), "ConstraintViolation");
    assert!(err.to_string().contains("`users`.`uq_email`"), "{err}");
    assert_eq!(store.len(USERS), 1);
    assert!(!recorder.bodies(Stage::ConstraintEnforcementPlan).is_empty());
}

#[test]
fn distinct_keys_pass_every_guard() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    let txn = processor.begin();
    let rows = txn
        .statement()
        .execute(&insert(&snapshot, "users", vec![vec![Value::Int(2), Value::from("b@x.com")]]))
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Int(1)]]);
    assert_eq!(store.len(USERS), 2);
    txn.commit().unwrap();
}

#[test]
fn duplicates_within_one_batch_fail_without_touching_storage() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    let txn = processor.begin();
    let err = txn
        .statement()
        .execute(&insert(
            &snapshot,
            "users",
            vec![
                vec![Value::Int(5), Value::from("c@x.com")],
                vec![Value::Int(6), Value::from("c@x.com")],
            ],
        ))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert_eq!(store.len(USERS), 1);
}

#[test]
fn rejected_batch_writes_nothing() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    let txn = processor.begin();
    let err = txn
        .statement()
        .execute(&insert(
            &snapshot,
            "users",
            vec![
                vec![Value::Int(2), Value::from("b@x.com")],
                vec![Value::Int(3), Value::from("a@x.com")],
            ],
        ))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert!(err.to_string().contains("`users`.`uq_email`"), "{err}");
    assert_eq!(store.len(USERS), 1);
}

#[test]
fn update_onto_another_rows_unique_key_is_rejected() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    store.insert_rows(USERS, vec![vec![Value::Int(2), Value::from("b@x.com")]]);
    let txn = processor.begin();

    let err = txn
        .statement()
        .execute(&update(&snapshot, "users", 2, "email", Value::from("a@x.com")))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert_eq!(err.to_string(), "Update violates unique constraint `users`.`uq_email`");
    assert!(store
        .rows(USERS)
        .contains(&vec![Value::Int(2), Value::from("b@x.com")]));

    let rows = txn
        .statement()
        .execute(&update(&snapshot, "users", 1, "email", Value::from("a@x.com")))
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Int(1)]]);
}

#[test]
fn merge_onto_an_existing_unique_key_is_rejected() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    let def = snapshot.entity("users").unwrap();
    let source = AlgNode::values(
        def.row_type(),
        vec![vec![Value::Int(2), Value::from("a@x.com")]],
    )
    .unwrap();
    let email = Rex::input(1, &source.row_type().fields()[1]);
    let merge = AlgNode::modify(
        source,
        def.entity_ref(),
        ModifyOperation::Merge,
        vec!["email".into()],
        vec![email],
    );
    let txn = processor.begin();

    let err = txn
        .statement()
        .execute(&AlgRoot::of(merge, Kind::Merge))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert_eq!(err.to_string(), "Merge violates unique constraint `users`.`uq_email`");
    assert_eq!(store.len(USERS), 1);
}

#[test]
fn deleting_a_referenced_row_is_restricted() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    store.insert_rows(ORDERS, vec![vec![Value::Int(10), Value::Int(1)]]);
    let txn = processor.begin();

    let err = txn
        .statement()
        .execute(&delete(&snapshot, "users", 1))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert_eq!(
        err.to_string(),
        "Delete violates foreign key constraint `fk_user` (`orders` [user_id] -> `users` [id], ON DELETE RESTRICT)"
    );
    assert_eq!(store.len(USERS), 1);

    txn.statement().execute(&delete(&snapshot, "orders", 10)).unwrap();
    txn.statement().execute(&delete(&snapshot, "users", 1)).unwrap();
    assert_eq!(store.len(USERS), 0);
}

#[test]
fn changing_a_referenced_key_is_restricted() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    store.insert_rows(ORDERS, vec![vec![Value::Int(10), Value::Int(1)]]);
    let txn = processor.begin();

    let err = txn
        .statement()
        .execute(&update(&snapshot, "users", 1, "id", Value::Int(5)))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert!(err.to_string().contains("ON UPDATE RESTRICT"), "{err}");
    assert_eq!(store.rows(USERS), vec![vec![Value::Int(1), Value::from("a@x.com")]]);
}

#[test]
fn unique_key_without_a_primary_key_is_still_enforced_on_update() {
    quarry::telemetry::init_from_env();
    const PEOPLE: EntityId = EntityId(3);
    let snapshot: Arc<dyn Snapshot> = Arc::new(
        InMemorySnapshot::new()
            .with_entity(
                EntityDef::new(PEOPLE, "people")
                    .column("id", DataType::BigInt, false)
                    .column("email", DataType::Varchar, true)
                    .column("nick", DataType::Varchar, true)
                    .placement(AdapterId(1)),
            )
            .with_unique(PEOPLE, "uq_people_email", &["email"]),
    );
    let store = Arc::new(MemStore::new());
    store.insert_rows(
        PEOPLE,
        vec![
            vec![Value::Int(1), Value::from("a@x.com"), Value::Null],
            vec![Value::Int(2), Value::from("b@x.com"), Value::Null],
        ],
    );
    let processor = Arc::new(QueryProcessor::new(
        ProcessorConfig::strict(),
        snapshot.clone(),
        Arc::new(Interpreter::new(store.clone())),
    ));
    let txn = processor.begin();

    let err = txn
        .statement()
        .execute(&update(&snapshot, "people", 2, "email", Value::from("a@x.com")))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert!(err.to_string().contains("`people`.`uq_people_email`"), "{err}");
    assert!(store
        .rows(PEOPLE)
        .contains(&vec![Value::Int(2), Value::from("b@x.com"), Value::Null]));

    // A row keeping its own key does not collide with itself.
    txn.statement()
        .execute(&update(&snapshot, "people", 1, "email", Value::from("a@x.com")))
        .unwrap();
}

#[test]
fn dangling_foreign_key_is_rejected() {
    let (processor, store, snapshot) = processor(ProcessorConfig::strict());
    let txn = processor.begin();

    let err = txn
        .statement()
        .execute(&insert(&snapshot, "orders", vec![vec![Value::Int(10), Value::Int(99)]]))
        .unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert!(err.to_string().contains("fk_user"), "{err}");
    assert_eq!(store.len(ORDERS), 0);

    txn.statement()
        .execute(&insert(&snapshot, "orders", vec![vec![Value::Int(11), Value::Int(1)]]))
        .unwrap();
    assert_eq!(store.len(ORDERS), 1);
}

#[test]
fn deferred_checks_run_at_commit() {
    let config = ProcessorConfig {
        unique_constraint_enforcement: true,
        constraint_enforcement: EnforcementTime::AfterQueryExecution,
        ..ProcessorConfig::default()
    };
    let (processor, store, snapshot) = processor(config);
    let txn = processor.begin();
    txn.statement()
        .execute(&insert(&snapshot, "users", vec![vec![Value::Int(2), Value::from("a@x.com")]]))
        .unwrap();
    assert_eq!(store.len(USERS), 2);
    assert_eq!(txn.modified(), vec![USERS]);

    let err = txn.commit().unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert_eq!(
        err.to_string(),
        "Transaction violates unique constraint `users`.`uq_email`"
    );
}

#[test]
fn deferred_commit_succeeds_when_data_is_clean() {
    let config = ProcessorConfig {
        unique_constraint_enforcement: true,
        foreign_key_enforcement: true,
        constraint_enforcement: EnforcementTime::AfterQueryExecution,
        ..ProcessorConfig::default()
    };
    let (processor, _, snapshot) = processor(config);
    let txn = processor.begin();
    txn.statement()
        .execute(&insert(&snapshot, "orders", vec![vec![Value::Int(1), Value::Int(1)]]))
        .unwrap();
    txn.commit().unwrap();
}

#[test]
fn enabling_enforcement_validates_existing_data() {
    let (processor, store, snapshot) = processor(ProcessorConfig::default());
    let txn = processor.begin();
    txn.statement()
        .execute(&insert(&snapshot, "users", vec![vec![Value::Int(2), Value::from("a@x.com")]]))
        .unwrap();
    txn.commit().unwrap();
    assert_eq!(store.len(USERS), 2);

    let err = processor.set_enforcement(true, false).unwrap_err();
    assert_eq!(err.code(), "ConstraintViolation");
    assert!(!processor.config().unique_constraint_enforcement);

    processor.set_enforcement(false, true).unwrap();
    assert!(processor.config().foreign_key_enforcement);
}
