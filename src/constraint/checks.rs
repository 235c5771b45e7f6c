//! Check queries. Each returns the violating rows, so an empty result means the
//! guarded statement may proceed.

use std::sync::Arc;

use crate::alg::node::{AlgNode, JoinKind};
use crate::alg::rex::{Op, Rex};
use crate::builder::{AggCall, AlgBuilder, GroupKey};
use crate::catalog::{EntityDef, ForeignKeyDef, Snapshot};
use crate::types::{QuarryError, Result};

/// Ordinal of entity column `column` in the modify input.
///
/// Inputs name their fields after the target columns; positional lookup covers
/// inputs whose names were lost.
pub(crate) fn input_ordinal(input: &AlgNode, def: &EntityDef, column: &str) -> Result<usize> {
    input
        .row_type()
        .index_of(column)
        .or_else(|| def.column_index(column).filter(|&i| i < input.field_count()))
        .ok_or_else(|| {
            QuarryError::Invalid(format!(
                "modify input of `{}` has no column `{column}`",
                def.name
            ))
        })
}

/// New value of every `columns` entry after an update: the source expression when
/// the column is updated, the current field otherwise.
pub(crate) fn updated_values(
    input: &AlgNode,
    def: &EntityDef,
    columns: &[String],
    update_columns: &[String],
    source_exprs: &[Rex],
) -> Result<Vec<Rex>> {
    columns
        .iter()
        .map(|column| match update_columns.iter().position(|c| c == column) {
            Some(pos) => source_exprs.get(pos).cloned().ok_or_else(|| {
                QuarryError::Invalid(format!("no source expression for `{column}`"))
            }),
            None => {
                let ordinal = input_ordinal(input, def, column)?;
                Ok(Rex::input(ordinal, &input.row_type().fields()[ordinal]))
            }
        })
        .collect()
}

fn equalities(b: &AlgBuilder, width: usize, left_offset: usize, right_offset: usize) -> Result<Rex> {
    let mut conjuncts = Vec::with_capacity(width);
    for i in 0..width {
        conjuncts.push(b.equals(b.field_of_at(2, 0, left_offset + i)?, b.field_of_at(2, 1, right_offset + i)?));
    }
    Ok(b.and(conjuncts))
}

/// Like [`equalities`], but two nulls compare equal and the result is never null.
fn same_values(b: &AlgBuilder, width: usize, left_offset: usize, right_offset: usize) -> Result<Rex> {
    let mut conjuncts = Vec::with_capacity(width);
    for i in 0..width {
        let left = b.field_of_at(2, 0, left_offset + i)?;
        let right = b.field_of_at(2, 1, right_offset + i)?;
        let equal = b.call(Op::Coalesce, vec![b.equals(left.clone(), right.clone()), b.literal(false)]);
        let both_null = b.and(vec![b.is_null(left), b.is_null(right)]);
        conjuncts.push(b.or(vec![equal, both_null]));
    }
    Ok(b.and(conjuncts))
}

fn non_null(b: &AlgBuilder, width: usize) -> Result<Vec<Rex>> {
    (0..width).map(|i| Ok(b.is_not_null(b.field_at(i)?))).collect()
}

/// Pushes a scan of `def` projected to `columns`.
fn push_scan_of(b: &mut AlgBuilder, def: &EntityDef, columns: &[String]) -> Result<()> {
    b.scan_entity(def);
    let names: Vec<&str> = columns.iter().map(String::as_str).collect();
    let fields = b.fields_named(&names)?;
    b.project(fields)?;
    Ok(())
}

/// Rows whose key `exprs` already exists in `def`.
pub(crate) fn existing_key_check(
    snapshot: &Arc<dyn Snapshot>,
    input: &AlgNode,
    exprs: Vec<Rex>,
    def: &EntityDef,
    key: &[String],
) -> Result<AlgNode> {
    let mut b = AlgBuilder::new(snapshot.clone());
    b.push(input.clone());
    b.project(exprs)?;
    push_scan_of(&mut b, def, key)?;
    let condition = equalities(&b, key.len(), 0, 0)?;
    b.join(JoinKind::Inner, condition)?;
    let last = b.peek()?.field_count() - 1;
    let last = b.field_at(last)?;
    b.filter(vec![b.is_not_null(last)])?;
    b.build()
}

/// Key values that occur more than once among `exprs` over `input`; null keys never collide.
pub(crate) fn duplicate_key_check(
    snapshot: &Arc<dyn Snapshot>,
    input: &AlgNode,
    exprs: Vec<Rex>,
) -> Result<AlgNode> {
    let width = exprs.len();
    let mut b = AlgBuilder::new(snapshot.clone());
    b.push(input.clone());
    b.project(exprs)?;
    let not_null = non_null(&b, width)?;
    b.filter(not_null)?;
    let key = GroupKey::new(b.fields()?);
    b.aggregate(key, vec![AggCall::count_star().alias("count")])?;
    let count = b.field_at(width)?;
    b.filter(vec![b.greater_than(count, b.literal(1i64))])?;
    b.build()
}

/// Rows of a projected key `exprs` that match an existing row of `def` other than
/// the row identified by `pk_exprs` itself.
///
/// Without a primary key, `pk` lists every column and rows are told apart by
/// comparing all of them with nulls equal.
#[allow(clippy::too_many_arguments)]
pub(crate) fn other_row_key_check(
    snapshot: &Arc<dyn Snapshot>,
    input: &AlgNode,
    pk_exprs: Vec<Rex>,
    key_exprs: Vec<Rex>,
    def: &EntityDef,
    pk: &[String],
    key: &[String],
    whole_row: bool,
) -> Result<AlgNode> {
    let pk_width = pk_exprs.len();
    let mut b = AlgBuilder::new(snapshot.clone());
    b.push(input.clone());
    b.project(pk_exprs.into_iter().chain(key_exprs).collect())?;
    let columns: Vec<String> = pk.iter().chain(key).cloned().collect();
    b.scan_entity(def);
    let scan_fields = columns
        .iter()
        .map(|c| b.field(c))
        .collect::<Result<Vec<_>>>()?;
    b.project_named(scan_fields, Vec::new(), true)?;
    let same_row = if whole_row {
        same_values(&b, pk_width, 0, 0)?
    } else {
        equalities(&b, pk_width, 0, 0)?
    };
    let same_key = equalities(&b, key.len(), pk_width, pk_width)?;
    let condition = b.and(vec![b.not(same_row), same_key]);
    b.join(JoinKind::Inner, condition)?;
    b.build()
}

/// Rows whose non-null referencing values `exprs` have no match in the referenced entity.
pub(crate) fn missing_reference_check(
    snapshot: &Arc<dyn Snapshot>,
    input: &AlgNode,
    exprs: Vec<Rex>,
    referenced: &EntityDef,
    fk: &ForeignKeyDef,
) -> Result<AlgNode> {
    let width = exprs.len();
    let mut b = AlgBuilder::new(snapshot.clone());
    b.push(input.clone());
    b.project(exprs)?;
    push_scan_of(&mut b, referenced, &fk.referenced_columns)?;
    let condition = equalities(&b, width, 0, 0)?;
    b.join(JoinKind::Left, condition)?;
    let mut conditions = vec![b.is_null(b.field_at(2 * width - 1)?)];
    conditions.extend(non_null(&b, width)?);
    b.filter(conditions)?;
    b.build()
}

/// Rows of the referencing entity of `fk` that point at the keys `exprs`.
pub(crate) fn referencing_rows_check(
    snapshot: &Arc<dyn Snapshot>,
    input: &AlgNode,
    exprs: Vec<Rex>,
    referencing: &EntityDef,
    fk: &ForeignKeyDef,
) -> Result<AlgNode> {
    let width = exprs.len();
    let mut b = AlgBuilder::new(snapshot.clone());
    b.push(input.clone());
    b.project(exprs)?;
    push_scan_of(&mut b, referencing, &fk.columns)?;
    let condition = equalities(&b, width, 0, 0)?;
    b.join(JoinKind::Inner, condition)?;
    b.build()
}

/// Full-table duplicate check of `key` over `def`, used at commit.
pub(crate) fn table_duplicate_check(
    snapshot: &Arc<dyn Snapshot>,
    def: &EntityDef,
    key: &[String],
) -> Result<AlgNode> {
    let scan = AlgNode::scan(def.entity_ref(), def.row_type());
    let exprs = key
        .iter()
        .map(|c| input_ordinal(&scan, def, c).map(|i| Rex::input(i, &scan.row_type().fields()[i])))
        .collect::<Result<Vec<_>>>()?;
    duplicate_key_check(snapshot, &scan, exprs)
}

/// Full-table dangling-reference check of `fk`, used at commit.
pub(crate) fn table_reference_check(
    snapshot: &Arc<dyn Snapshot>,
    referencing: &EntityDef,
    referenced: &EntityDef,
    fk: &ForeignKeyDef,
) -> Result<AlgNode> {
    let scan = AlgNode::scan(referencing.entity_ref(), referencing.row_type());
    let exprs = fk
        .columns
        .iter()
        .map(|c| {
            input_ordinal(&scan, referencing, c).map(|i| Rex::input(i, &scan.row_type().fields()[i]))
        })
        .collect::<Result<Vec<_>>>()?;
    missing_reference_check(snapshot, &scan, exprs, referenced, fk)
}
