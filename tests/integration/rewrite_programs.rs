//! The standard rewrite programs preserve query results while turning logical
//! trees into enumerable ones.
//!
//! Every test interprets the logical tree and the rewritten tree over the same
//! store and compares the rows.

#![allow(missing_docs)]

use std::sync::Arc;

use quarry::alg::rex::{Op, Rex, SubQueryKind};
use quarry::alg::traits::{Collation, FieldCollation, TraitSet};
use quarry::alg::types::DataType;
use quarry::alg::{AlgNode, AlgOp, Convention, JoinKind, Value};
use quarry::catalog::{CatalogStatistics, EntityDef, InMemorySnapshot, Snapshot};
use quarry::exec::{Interpreter, MemStore, Row};
use quarry::rewrite::{DefaultCostModel, Program, Programs, RewriteContext};
use quarry::types::EntityId;

const EMP: EntityId = EntityId(1);
const DEPT: EntityId = EntityId(2);
const FLOORS: EntityId = EntityId(3);

fn snapshot() -> Arc<dyn Snapshot> {
    Arc::new(
        InMemorySnapshot::new()
            .with_entity(
                EntityDef::new(EMP, "emp")
                    .column("id", DataType::BigInt, false)
                    .column("dept", DataType::Varchar, false)
                    .column("sal", DataType::BigInt, true),
            )
            .with_entity(
                EntityDef::new(DEPT, "dept")
                    .column("name", DataType::Varchar, false)
                    .column("floor", DataType::BigInt, false),
            )
            .with_entity(
                EntityDef::new(FLOORS, "floors")
                    .column("floor", DataType::BigInt, false)
                    .column("label", DataType::Varchar, false),
            )
            .with_row_count(EMP, 1000.0)
            .with_row_count(DEPT, 10.0)
            .with_row_count(FLOORS, 3.0),
    )
}

fn interpreter() -> Interpreter {
    quarry::telemetry::init_from_env();
    let store = Arc::new(MemStore::new());
    store.insert_rows(
        EMP,
        vec![
            vec![Value::Int(1), Value::from("eng"), Value::Int(300)],
            vec![Value::Int(2), Value::from("eng"), Value::Int(200)],
            vec![Value::Int(3), Value::from("ops"), Value::Null],
            vec![Value::Int(4), Value::from("hr"), Value::Int(150)],
        ],
    );
    store.insert_rows(
        DEPT,
        vec![
            vec![Value::from("eng"), Value::Int(1)],
            vec![Value::from("ops"), Value::Int(2)],
        ],
    );
    store.insert_rows(
        FLOORS,
        vec![
            vec![Value::Int(1), Value::from("ground")],
            vec![Value::Int(2), Value::from("roof")],
        ],
    );
    Interpreter::new(store)
}

fn context(snapshot: &Arc<dyn Snapshot>) -> RewriteContext {
    RewriteContext::new(
        Arc::new(CatalogStatistics(snapshot.clone())),
        Arc::new(DefaultCostModel),
    )
}

fn scan(snapshot: &Arc<dyn Snapshot>, name: &str) -> AlgNode {
    let def = snapshot.entity(name).unwrap();
    AlgNode::scan(def.entity_ref(), def.row_type())
}

fn col(node: &AlgNode, i: usize) -> Rex {
    Rex::input(i, &node.row_type().fields()[i])
}

fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by_key(|r| format!("{r:?}"));
    rows
}

fn assert_enumerable(node: &AlgNode) {
    node.walk(&mut |n| {
        assert_eq!(n.convention(), Convention::Enumerable, "{}", n.op().name());
        for rex in n.op().expressions() {
            assert!(!rex.contains_subquery(), "sub-query left in {}", n.op().name());
        }
    });
}

fn optimize(ctx: &RewriteContext, node: &AlgNode, required: &TraitSet) -> AlgNode {
    let out = Programs::standard().run(ctx, node.clone(), required).unwrap();
    assert_enumerable(&out);
    assert_eq!(out.field_count(), node.field_count());
    out
}

#[test]
fn filters_and_projections_fuse_into_calcs() {
    let snapshot = snapshot();
    let interpreter = interpreter();
    let emp = scan(&snapshot, "emp");
    let rich = AlgNode::filter(
        emp.clone(),
        Rex::call(Op::Gt, vec![col(&emp, 2), Rex::lit(180i64)]),
    );
    let doubled = Rex::call(Op::Times, vec![col(&rich, 2), Rex::lit(2i64)]);
    let logical = AlgNode::project(rich.clone(), vec![col(&rich, 0), doubled], vec!["id".into(), "x".into()]);

    let physical = optimize(&context(&snapshot), &logical, &TraitSet::enumerable());
    let mut ops = Vec::new();
    physical.walk(&mut |n| ops.push(n.op().name()));
    assert!(ops.contains(&"Calc"), "{ops:?}");
    assert!(!ops.contains(&"Filter") && !ops.contains(&"Project"), "{ops:?}");

    assert_eq!(
        sorted(interpreter.run(&physical).unwrap()),
        sorted(interpreter.run(&logical).unwrap())
    );
}

#[test]
fn uncorrelated_in_becomes_a_join() {
    let snapshot = snapshot();
    let interpreter = interpreter();
    let emp = scan(&snapshot, "emp");
    let dept = scan(&snapshot, "dept");
    let names = AlgNode::project(dept.clone(), vec![col(&dept, 0)], vec!["name".into()]);
    let condition = Rex::SubQuery {
        kind: SubQueryKind::In,
        operands: vec![col(&emp, 1)],
        rel: names,
        ty: DataType::Boolean,
    };
    let logical = AlgNode::filter(emp, condition);

    let physical = optimize(&context(&snapshot), &logical, &TraitSet::enumerable());
    let rows = sorted(interpreter.run(&physical).unwrap());
    assert_eq!(rows, sorted(interpreter.run(&logical).unwrap()));
    let ids: Vec<Value> = rows.into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn not_exists_over_an_empty_match_keeps_every_row() {
    let snapshot = snapshot();
    let interpreter = interpreter();
    let dept = scan(&snapshot, "dept");
    let floors = scan(&snapshot, "floors");
    let none = AlgNode::filter(
        floors.clone(),
        Rex::call(Op::Gt, vec![col(&floors, 0), Rex::lit(100i64)]),
    );
    let condition = Rex::not(Rex::SubQuery {
        kind: SubQueryKind::Exists,
        operands: vec![],
        rel: none,
        ty: DataType::Boolean,
    });
    let logical = AlgNode::filter(dept, condition);

    let physical = optimize(&context(&snapshot), &logical, &TraitSet::enumerable());
    assert_eq!(interpreter.run(&physical).unwrap().len(), 2);
    assert_eq!(
        sorted(interpreter.run(&physical).unwrap()),
        sorted(interpreter.run(&logical).unwrap())
    );
}

#[test]
fn heuristic_join_order_keeps_field_order_and_rows() {
    let snapshot = snapshot();
    let interpreter = interpreter();
    let emp = scan(&snapshot, "emp");
    let dept = scan(&snapshot, "dept");
    let floors = scan(&snapshot, "floors");
    let emp_dept = AlgNode::join(
        JoinKind::Inner,
        emp.clone(),
        dept.clone(),
        Rex::eq(col(&emp, 1), Rex::input(3, &dept.row_type().fields()[0])),
    );
    let all = AlgNode::join(
        JoinKind::Inner,
        emp_dept.clone(),
        floors.clone(),
        Rex::eq(col(&emp_dept, 4), Rex::input(5, &floors.row_type().fields()[0])),
    );

    let mut ctx = context(&snapshot);
    ctx.join_order.min_join_count = 2;
    let physical = optimize(&ctx, &all, &TraitSet::enumerable());
    assert_eq!(physical.row_type().names(), all.row_type().names());

    let rows = sorted(interpreter.run(&physical).unwrap());
    assert_eq!(rows.len(), 3);
    assert_eq!(rows, sorted(interpreter.run(&all).unwrap()));
}

#[test]
fn required_collation_is_delivered() {
    let snapshot = snapshot();
    let interpreter = interpreter();
    let emp = scan(&snapshot, "emp");
    let required = TraitSet::enumerable().with_collation(Collation(vec![FieldCollation::desc(0)]));

    let physical = optimize(&context(&snapshot), &emp, &required);
    assert!(physical.traits().collation.satisfies(&required.collation));
    let ids: Vec<Value> = interpreter
        .run(&physical)
        .unwrap()
        .into_iter()
        .map(|r| r[0].clone())
        .collect();
    assert_eq!(ids, vec![Value::Int(4), Value::Int(3), Value::Int(2), Value::Int(1)]);
}

#[test]
fn exhausted_search_budget_still_implements_the_tree() {
    let snapshot = snapshot();
    let interpreter = interpreter();
    let emp = scan(&snapshot, "emp");
    let dept = scan(&snapshot, "dept");
    let join = AlgNode::join(
        JoinKind::Inner,
        emp.clone(),
        dept.clone(),
        Rex::eq(col(&emp, 1), Rex::input(3, &dept.row_type().fields()[0])),
    );
    let mut ctx = context(&snapshot);
    ctx.volcano.max_iterations = Some(0);

    let physical = optimize(&ctx, &join, &TraitSet::enumerable());
    assert!(matches!(physical.op(), AlgOp::Join { .. } | AlgOp::Calc { .. } | AlgOp::Project { .. }));
    assert_eq!(
        sorted(interpreter.run(&physical).unwrap()),
        sorted(interpreter.run(&join).unwrap())
    );
}
