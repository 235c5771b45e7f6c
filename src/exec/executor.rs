//! Row-at-a-time evaluation of algebra trees against a [`MemStore`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::alg::node::{
    AggFunction, AggregateCall, AlgNode, AlgOp, JoinAlgorithm, JoinKind, ModifyOperation, SetOpKind,
};
use crate::alg::rex::{eval_call, CorrelationId, Op, Rex, SubQueryKind};
use crate::alg::traits::{Collation, Direction, NullDirection};
use crate::alg::value::Value;
use crate::rewrite::rules::enumerable::equi_keys;
use crate::types::{QuarryError, Result};

use super::store::{MemStore, Row};

/// Execution state of one binding of a prepared plan.
pub(crate) struct Executor<'a> {
    store: &'a MemStore,
    batch: &'a [Row],
    params: Row,
    correlations: Vec<(CorrelationId, Row)>,
}

impl<'a> Executor<'a> {
    /// Executor binding dynamic parameters from the first row of `batch`.
    pub(crate) fn new(store: &'a MemStore, batch: &'a [Row]) -> Self {
        Self {
            store,
            batch,
            params: batch.first().cloned().unwrap_or_default(),
            correlations: Vec::new(),
        }
    }

    pub(crate) fn run(&mut self, node: &AlgNode) -> Result<Vec<Row>> {
        match node.op() {
            AlgOp::Scan { entity } => Ok(self.store.rows(entity.id)),
            AlgOp::Values { tuples } => Ok(tuples.clone()),
            AlgOp::Filter { condition } => {
                let rows = self.run(node.input(0)?)?;
                self.filter(rows, condition)
            }
            AlgOp::Project { exprs } => {
                let rows = self.run(node.input(0)?)?;
                rows.iter().map(|row| self.project(row, exprs)).collect()
            }
            AlgOp::Calc { exprs, condition } => {
                let mut rows = self.run(node.input(0)?)?;
                if let Some(condition) = condition {
                    rows = self.filter(rows, condition)?;
                }
                rows.iter().map(|row| self.project(row, exprs)).collect()
            }
            AlgOp::Join {
                kind,
                condition,
                algorithm,
            } => {
                let left = self.run(node.input(0)?)?;
                let right = self.run(node.input(1)?)?;
                let widths = (node.input(0)?.field_count(), node.input(1)?.field_count());
                self.join(*kind, *algorithm, condition, left, right, widths)
            }
            AlgOp::Correlate {
                kind, correlation, ..
            } => self.correlate(node, *kind, *correlation),
            AlgOp::MultiJoin { condition } => {
                let mut rows: Vec<Row> = vec![Vec::new()];
                for input in node.inputs() {
                    let next = self.run(input)?;
                    rows = rows
                        .iter()
                        .flat_map(|l| next.iter().map(move |r| concat(l, r)))
                        .collect();
                }
                self.filter(rows, condition)
            }
            AlgOp::Aggregate {
                group_set,
                group_sets,
                calls,
                ..
            } => {
                let rows = self.run(node.input(0)?)?;
                aggregate(&rows, group_set, group_sets, calls)
            }
            AlgOp::Sort {
                collation,
                offset,
                fetch,
            } => {
                let mut rows = self.run(node.input(0)?)?;
                sort_rows(&mut rows, collation);
                let skip = offset.unwrap_or(0) as usize;
                let take = fetch.map_or(usize::MAX, |f| f as usize);
                Ok(rows.into_iter().skip(skip).take(take).collect())
            }
            AlgOp::SetOp { kind, all } => {
                let mut inputs = Vec::with_capacity(node.inputs().len());
                for input in node.inputs() {
                    inputs.push(self.run(input)?);
                }
                Ok(set_op(*kind, *all, inputs))
            }
            AlgOp::Modify {
                entity,
                operation,
                update_columns,
                source_exprs,
            } => {
                let input = node.input(0)?;
                let rows = self.run(input)?;
                let positions = update_columns
                    .iter()
                    .map(|c| {
                        input.row_type().index_of(c).ok_or_else(|| {
                            QuarryError::Invalid(format!("modify input has no column `{c}`"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let count = match operation {
                    ModifyOperation::Insert => self.store.insert_rows(entity.id, rows),
                    ModifyOperation::Delete => self.store.delete_rows(entity.id, &rows),
                    ModifyOperation::Update => self.update(entity.id, rows, &positions, source_exprs)?,
                    ModifyOperation::Merge => self.merge(entity.id, rows, &positions, source_exprs)?,
                };
                Ok(vec![vec![Value::Int(count as i64)]])
            }
            AlgOp::ConditionalExecute { .. } => {
                let body = self.check_guards(node)?;
                self.run(body)
            }
            AlgOp::BatchIterator => {
                let input = node.input(0)?;
                if self.batch.len() <= 1 {
                    return self.run(input);
                }
                // Every row's guards pass before any row is written.
                let mut body = input;
                for params in self.batch {
                    self.params = params.clone();
                    body = self.check_guards(input)?;
                }
                let counts_rows = input.row_type().names() == ["ROWCOUNT"];
                let mut total = 0i64;
                let mut out = Vec::new();
                for params in self.batch {
                    self.params = params.clone();
                    let rows = self.run(body)?;
                    if counts_rows {
                        total += rows
                            .first()
                            .and_then(|r| r.first())
                            .and_then(|v| match v {
                                Value::Int(n) => Some(*n),
                                _ => None,
                            })
                            .unwrap_or(0);
                    } else {
                        out.extend(rows);
                    }
                }
                if counts_rows {
                    out.push(vec![Value::Int(total)]);
                }
                Ok(out)
            }
        }
    }

    /// Evaluates the guard chain at the top of `node` and returns the node it protects.
    fn check_guards<'n>(&mut self, mut node: &'n AlgNode) -> Result<&'n AlgNode> {
        while let AlgOp::ConditionalExecute {
            condition, message, ..
        } = node.op()
        {
            let check = self.run(node.input(0)?)?;
            if !condition.holds(check.len()) {
                return Err(QuarryError::ConstraintViolation(message.clone()));
            }
            node = node.input(1)?;
        }
        Ok(node)
    }

    fn filter(&mut self, rows: Vec<Row>, condition: &Rex) -> Result<Vec<Row>> {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if self.eval(condition, &row)? == Value::Bool(true) {
                kept.push(row);
            }
        }
        Ok(kept)
    }

    fn project(&mut self, row: &Row, exprs: &[Rex]) -> Result<Row> {
        exprs.iter().map(|e| self.eval(e, row)).collect()
    }

    fn matches(&mut self, condition: &Rex, left: &Row, right: &Row) -> Result<bool> {
        Ok(self.eval(condition, &concat(left, right))? == Value::Bool(true))
    }

    fn join(
        &mut self,
        kind: JoinKind,
        algorithm: JoinAlgorithm,
        condition: &Rex,
        left: Vec<Row>,
        right: Vec<Row>,
        (left_width, right_width): (usize, usize),
    ) -> Result<Vec<Row>> {
        let keys = equi_keys(condition, left_width);
        let index: Option<FxHashMap<Row, Vec<usize>>> = (algorithm == JoinAlgorithm::Hash
            && !keys.is_empty())
        .then(|| {
            let mut index: FxHashMap<Row, Vec<usize>> = FxHashMap::default();
            for (i, row) in right.iter().enumerate() {
                let key: Row = keys.iter().map(|&(_, r)| row[r].clone()).collect();
                // Null keys never satisfy an equality.
                if !key.iter().any(Value::is_null) {
                    index.entry(key).or_default().push(i);
                }
            }
            index
        });
        let all: Vec<usize> = (0..right.len()).collect();
        let mut right_matched = vec![false; right.len()];
        let mut out = Vec::new();
        for l in &left {
            let candidates: &[usize] = match &index {
                Some(index) => {
                    let key: Row = keys.iter().map(|&(li, _)| l[li].clone()).collect();
                    index.get(&key).map_or(&[][..], Vec::as_slice)
                }
                None => &all,
            };
            let mut matched = false;
            for &ri in candidates {
                if !self.matches(condition, l, &right[ri])? {
                    continue;
                }
                matched = true;
                right_matched[ri] = true;
                match kind {
                    JoinKind::Semi | JoinKind::Anti => break,
                    _ => out.push(concat(l, &right[ri])),
                }
            }
            match kind {
                JoinKind::Semi if matched => out.push(l.clone()),
                JoinKind::Anti if !matched => out.push(l.clone()),
                JoinKind::Left | JoinKind::Full if !matched => out.push(concat(l, &nulls(right_width))),
                _ => {}
            }
        }
        if matches!(kind, JoinKind::Right | JoinKind::Full) {
            for (r, matched) in right.iter().zip(right_matched) {
                if !matched {
                    out.push(concat(&nulls(left_width), r));
                }
            }
        }
        Ok(out)
    }

    fn correlate(&mut self, node: &AlgNode, kind: JoinKind, id: CorrelationId) -> Result<Vec<Row>> {
        let left = self.run(node.input(0)?)?;
        let right_node = node.input(1)?;
        let right_width = right_node.field_count();
        let mut out = Vec::new();
        for l in left {
            self.correlations.push((id, l.clone()));
            let rights = self.run(right_node);
            self.correlations.pop();
            let rights = rights?;
            match kind {
                JoinKind::Semi if !rights.is_empty() => out.push(l),
                JoinKind::Anti if rights.is_empty() => out.push(l),
                JoinKind::Left if rights.is_empty() => out.push(concat(&l, &nulls(right_width))),
                JoinKind::Inner | JoinKind::Left => out.extend(rights.iter().map(|r| concat(&l, r))),
                _ => {}
            }
        }
        Ok(out)
    }

    /// Stored rows equal to an input row's prefix get the source expressions applied.
    fn update(
        &mut self,
        entity: crate::types::EntityId,
        rows: Vec<Row>,
        positions: &[usize],
        source_exprs: &[Rex],
    ) -> Result<usize> {
        let store = self.store;
        let mut pending: Vec<Row> = rows;
        store.update_with(entity, &mut |stored| {
            let width = stored.len();
            let Some(pos) = pending.iter().position(|r| r.len() >= width && r[..width] == stored[..]) else {
                return Ok(false);
            };
            let input = pending.swap_remove(pos);
            for (&column, expr) in positions.iter().zip(source_exprs) {
                if column < width {
                    stored[column] = self.eval(expr, &input)?;
                }
            }
            Ok(true)
        })
    }

    /// Input rows matching a stored row on every non-updated column update it; the
    /// rest are inserted with the source expressions applied.
    fn merge(
        &mut self,
        entity: crate::types::EntityId,
        rows: Vec<Row>,
        positions: &[usize],
        source_exprs: &[Rex],
    ) -> Result<usize> {
        let mut updates = Vec::new();
        let mut inserts = Vec::new();
        let stored = self.store.rows(entity);
        for row in rows {
            let mut assigned = row.clone();
            for (&column, expr) in positions.iter().zip(source_exprs) {
                assigned[column] = self.eval(expr, &row)?;
            }
            let matches = stored.iter().any(|s| same_except(s, &row, positions));
            if matches {
                updates.push((row, assigned));
            } else {
                inserts.push(assigned);
            }
        }
        let store = self.store;
        let updated = store.update_with(entity, &mut |s| {
            match updates.iter().find(|(row, _)| same_except(s, row, positions)) {
                Some((_, assigned)) => {
                    *s = assigned.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;
        Ok(updated + store.insert_rows(entity, inserts))
    }

    pub(crate) fn eval(&mut self, rex: &Rex, row: &Row) -> Result<Value> {
        match rex {
            Rex::InputRef { index, .. } => row
                .get(*index)
                .cloned()
                .ok_or_else(|| QuarryError::Invalid(format!("input ${index} out of range"))),
            Rex::Literal { value, .. } => Ok(value.clone()),
            Rex::Call { op, operands, .. } => {
                let mut args = Vec::with_capacity(operands.len());
                for operand in operands {
                    args.push(self.eval(operand, row)?);
                }
                eval_call(*op, &args)
            }
            Rex::DynamicParam { index, .. } => self
                .params
                .get(*index)
                .cloned()
                .ok_or_else(|| QuarryError::Invalid(format!("parameter ?{index} is not bound"))),
            Rex::FieldAccess { expr, index, .. } => match expr.as_ref() {
                Rex::CorrelVariable { id, .. } => self
                    .correlations
                    .iter()
                    .rev()
                    .find(|(bound, _)| bound == id)
                    .and_then(|(_, values)| values.get(*index).cloned())
                    .ok_or_else(|| QuarryError::Invalid(format!("variable {id} is not bound"))),
                _ => Err(QuarryError::Invalid("record values cannot be evaluated".into())),
            },
            Rex::CorrelVariable { id, .. } => Err(QuarryError::Invalid(format!(
                "variable {id} used as a value"
            ))),
            Rex::SubQuery {
                kind,
                operands,
                rel,
                ..
            } => {
                let rows = self.run(rel)?;
                match kind {
                    SubQueryKind::Exists => Ok(Value::Bool(!rows.is_empty())),
                    SubQueryKind::Scalar => match rows.as_slice() {
                        [] => Ok(Value::Null),
                        [only] => Ok(only.first().cloned().unwrap_or(Value::Null)),
                        _ => Err(QuarryError::Invalid(
                            "scalar sub-query returned more than one row".into(),
                        )),
                    },
                    SubQueryKind::In => {
                        let mut needle = Vec::with_capacity(operands.len());
                        for operand in operands {
                            needle.push(self.eval(operand, row)?);
                        }
                        let mut any = false;
                        for candidate in &rows {
                            let mut equal = Vec::with_capacity(needle.len());
                            for (a, b) in needle.iter().zip(candidate) {
                                equal.push(eval_call(Op::Eq, &[a.clone(), b.clone()])?);
                            }
                            if eval_call(Op::And, &equal)? == Value::Bool(true) {
                                any = true;
                                break;
                            }
                        }
                        Ok(Value::Bool(any))
                    }
                }
            }
        }
    }
}

fn concat(left: &Row, right: &Row) -> Row {
    let mut row = Vec::with_capacity(left.len() + right.len());
    row.extend_from_slice(left);
    row.extend_from_slice(right);
    row
}

fn nulls(width: usize) -> Row {
    vec![Value::Null; width]
}

fn same_except(stored: &Row, input: &Row, skipped: &[usize]) -> bool {
    stored.len() <= input.len()
        && stored
            .iter()
            .enumerate()
            .all(|(i, v)| skipped.contains(&i) || *v == input[i])
}

fn compare(a: &Row, b: &Row, collation: &Collation) -> Ordering {
    for key in collation.keys() {
        let (x, y) = (&a[key.field], &b[key.field]);
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => match key.nulls {
                NullDirection::First => Ordering::Less,
                NullDirection::Last => Ordering::Greater,
            },
            (false, true) => match key.nulls {
                NullDirection::First => Ordering::Greater,
                NullDirection::Last => Ordering::Less,
            },
            (false, false) => match key.direction {
                Direction::Ascending => x.cmp(y),
                Direction::Descending => y.cmp(x),
            },
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

pub(crate) fn sort_rows(rows: &mut [Row], collation: &Collation) {
    rows.sort_by(|a, b| compare(a, b, collation));
}

fn set_op(kind: SetOpKind, all: bool, inputs: Vec<Vec<Row>>) -> Vec<Row> {
    let mut inputs = inputs.into_iter();
    let first = inputs.next().unwrap_or_default();
    let rest: Vec<Vec<Row>> = inputs.collect();
    let distinct = |rows: Vec<Row>| {
        let mut seen = FxHashSet::default();
        rows.into_iter().filter(|r| seen.insert(r.clone())).collect::<Vec<_>>()
    };
    let counts = |rows: &[Row]| {
        let mut counts: FxHashMap<Row, usize> = FxHashMap::default();
        for row in rows {
            *counts.entry(row.clone()).or_default() += 1;
        }
        counts
    };
    match kind {
        SetOpKind::Union => {
            let mut out = first;
            out.extend(rest.into_iter().flatten());
            if all {
                out
            } else {
                distinct(out)
            }
        }
        SetOpKind::Intersect => {
            let mut others: Vec<FxHashMap<Row, usize>> = rest.iter().map(|r| counts(r.as_slice())).collect();
            let mut out = Vec::new();
            for row in first {
                let present = others.iter().all(|c| c.get(&row).is_some_and(|n| *n > 0));
                if present {
                    if all {
                        for c in others.iter_mut() {
                            if let Some(n) = c.get_mut(&row) {
                                *n -= 1;
                            }
                        }
                    }
                    out.push(row);
                }
            }
            if all {
                out
            } else {
                distinct(out)
            }
        }
        SetOpKind::Minus => {
            let mut removed = counts(rest.concat().as_slice());
            let mut out = Vec::new();
            for row in first {
                match removed.get_mut(&row) {
                    Some(n) if *n > 0 => {
                        if all {
                            *n -= 1;
                        }
                    }
                    _ => out.push(row),
                }
            }
            if all {
                out
            } else {
                distinct(out)
            }
        }
    }
}

fn aggregate(
    rows: &[Row],
    group_set: &[usize],
    group_sets: &[Vec<usize>],
    calls: &[AggregateCall],
) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    for set in group_sets {
        let mut groups: BTreeMap<Row, Vec<&Row>> = BTreeMap::new();
        for row in rows {
            let key = group_set
                .iter()
                .map(|&i| if set.contains(&i) { row[i].clone() } else { Value::Null })
                .collect();
            groups.entry(key).or_default().push(row);
        }
        if groups.is_empty() && set.is_empty() {
            groups.insert(vec![Value::Null; group_set.len()], Vec::new());
        }
        for (key, members) in groups {
            let mut result = key;
            for call in calls {
                result.push(accumulate(call, &members)?);
            }
            out.push(result);
        }
    }
    Ok(out)
}

fn accumulate(call: &AggregateCall, rows: &[&Row]) -> Result<Value> {
    let mut values: Vec<Vec<Value>> = rows
        .iter()
        .filter(|r| call.filter.map_or(true, |f| r[f] == Value::Bool(true)))
        .map(|r| call.args.iter().map(|&a| r[a].clone()).collect())
        .collect();
    if !call.args.is_empty() {
        values.retain(|v: &Vec<Value>| !v.iter().any(Value::is_null));
    }
    if call.distinct {
        let mut seen = FxHashSet::default();
        values.retain(|v| seen.insert(v.clone()));
    }
    let firsts = || values.iter().filter_map(|v| v.first());
    Ok(match call.function {
        AggFunction::Count => Value::Int(values.len() as i64),
        AggFunction::Sum => firsts().try_fold(None::<Value>, |acc, v| -> Result<Option<Value>> {
            Ok(Some(match acc {
                None => v.clone(),
                Some(acc) => eval_call(Op::Plus, &[acc, v.clone()])?,
            }))
        })?
        .unwrap_or(Value::Null),
        AggFunction::Min => firsts().min().cloned().unwrap_or(Value::Null),
        AggFunction::Max => firsts().max().cloned().unwrap_or(Value::Null),
        AggFunction::Avg => {
            let numbers: Vec<f64> = firsts().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggFunction::SingleValue => match values.as_slice() {
            [] => Value::Null,
            [only] => only.first().cloned().unwrap_or(Value::Null),
            _ => {
                return Err(QuarryError::Invalid(
                    "more than one value in agg SINGLE_VALUE".into(),
                ))
            }
        },
    })
}
