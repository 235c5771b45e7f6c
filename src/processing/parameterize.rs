//! Extraction of literals into a parameter vector so prepared plans can be
//! reused across executions that differ only in constants.

use crate::alg::node::{transform, AlgNode, AlgOp, ModifyOperation};
use crate::alg::rex::Rex;
use crate::alg::types::{DataType, Field, TupleType};
use crate::alg::value::Value;
use crate::types::Result;

/// A tree whose literals were replaced by dynamic parameters.
#[derive(Clone, Debug)]
pub struct Parameterized {
    /// Residual tree.
    pub node: AlgNode,
    /// Types of the parameters, by index.
    pub parameter_type: TupleType,
    /// Parameter rows; more than one for a batched insert.
    pub rows: Vec<Vec<Value>>,
}

/// Literals that stay in the tree: booleans and nulls carry no reusable value.
fn extractable(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(_))
}

/// Multi-row `Values` directly feeding an insert, with its tuples.
fn batch_values(node: &AlgNode) -> Option<(AlgNode, Vec<Vec<Value>>)> {
    let mut found = None;
    node.walk(&mut |n| {
        if found.is_some() {
            return;
        }
        if let AlgOp::Modify {
            operation: ModifyOperation::Insert,
            ..
        } = n.op()
        {
            if let Some(input) = n.inputs().first() {
                if let AlgOp::Values { tuples } = input.op() {
                    if tuples.len() > 1 {
                        found = Some((input.clone(), tuples.clone()));
                    }
                }
            }
        }
    });
    found
}

/// Replaces non-boolean, non-null literals with dynamic parameters.
///
/// A multi-row `Values` feeding an insert becomes a one-row projection of
/// parameters under a batch iterator, with one parameter row per tuple. The
/// remaining literals are shared by every row of the batch.
pub fn parameterize(node: &AlgNode) -> Result<Parameterized> {
    let mut types: Vec<Field> = Vec::new();
    let mut batch: Vec<Vec<Value>> = Vec::new();
    let mut node = node.clone();

    if let Some((values, tuples)) = batch_values(&node) {
        let digest = values.digest();
        let fields = values.row_type().fields().to_vec();
        let exprs: Vec<Rex> = fields
            .iter()
            .enumerate()
            .map(|(index, f)| Rex::DynamicParam {
                index,
                ty: f.ty.clone(),
            })
            .collect();
        let names = values.row_type().names();
        let one_row = AlgNode::values(TupleType::new(Vec::new()), vec![Vec::new()])?;
        let replacement = AlgNode::project(one_row, exprs, names);
        types.extend(
            fields
                .iter()
                .enumerate()
                .map(|(i, f)| Field::new(format!("?{i}"), f.ty.clone(), true)),
        );
        batch = tuples;
        node = transform(&node, &mut |n| {
            if matches!(n.op(), AlgOp::Values { .. }) && n.digest() == digest {
                Ok(replacement.clone())
            } else {
                Ok(n)
            }
        })?;
        node = AlgNode::batch_iterator(node);
    }

    let mut shared: Vec<Value> = Vec::new();
    let offset = types.len();
    node = transform(&node, &mut |n| {
        if n.op().expressions().is_empty() {
            return Ok(n);
        }
        let op = n.op().map_expressions(&mut |rex| {
            rex.rewrite(&mut |r| match r {
                Rex::Literal { value, ty } if extractable(value) => {
                    let index = offset + shared.len();
                    shared.push(value.clone());
                    types.push(Field::new(format!("?{index}"), ty.clone(), false));
                    Some(Rex::DynamicParam {
                        index,
                        ty: ty.clone(),
                    })
                }
                // Sub-query trees are visited by `transform` itself.
                _ => None,
            })
        });
        Ok(n.with_op(op))
    })?;

    let rows = if batch.is_empty() {
        vec![shared]
    } else {
        batch
            .into_iter()
            .map(|mut row| {
                row.extend(shared.iter().cloned());
                row
            })
            .collect()
    };
    Ok(Parameterized {
        node,
        parameter_type: TupleType::new(types),
        rows,
    })
}

/// Parameter type of caller-supplied rows, inferred from the first row.
pub fn supplied_type(rows: &[Vec<Value>]) -> TupleType {
    TupleType::new(
        rows.first()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(i, v)| Field::new(format!("?{i}"), DataType::of(v), true))
                    .collect()
            })
            .unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::EntityRef;
    use crate::types::EntityId;

    fn table() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(1), "t"),
            TupleType::of(&[("a", DataType::BigInt, false), ("b", DataType::Boolean, true)]),
        )
    }

    #[test]
    fn literals_become_params_but_booleans_stay() {
        let t = table();
        let f = t.row_type().fields().to_vec();
        let condition = Rex::and_all(vec![
            Rex::eq(Rex::input(0, &f[0]), Rex::lit(7i64)),
            Rex::eq(Rex::input(1, &f[1]), Rex::true_lit()),
        ]);
        let p = parameterize(&AlgNode::filter(t, condition)).unwrap();
        assert_eq!(p.rows, vec![vec![Value::Int(7)]]);
        assert_eq!(p.parameter_type.len(), 1);
        assert!(p.node.digest().contains("?0"));
        assert!(!p.node.digest().contains('7'));
    }

    #[test]
    fn queries_differing_in_constants_share_a_digest() {
        let make = |v: i64| {
            let t = table();
            let f = t.row_type().fields().to_vec();
            AlgNode::filter(t, Rex::eq(Rex::input(0, &f[0]), Rex::lit(v)))
        };
        let a = parameterize(&make(1)).unwrap();
        let b = parameterize(&make(2)).unwrap();
        assert_eq!(a.node.digest(), b.node.digest());
        assert_ne!(a.rows, b.rows);
    }

    #[test]
    fn multi_row_insert_becomes_a_batch() {
        let values = AlgNode::values(
            TupleType::of(&[("a", DataType::BigInt, false), ("b", DataType::Boolean, true)]),
            vec![
                vec![Value::Int(1), Value::Bool(true)],
                vec![Value::Int(2), Value::Null],
            ],
        )
        .unwrap();
        let insert = AlgNode::modify(
            values,
            EntityRef::new(EntityId(1), "t"),
            ModifyOperation::Insert,
            vec![],
            vec![],
        );
        let p = parameterize(&insert).unwrap();
        assert!(matches!(p.node.op(), AlgOp::BatchIterator));
        assert_eq!(p.rows.len(), 2);
        assert_eq!(p.rows[1], vec![Value::Int(2), Value::Null]);
        assert_eq!(p.parameter_type.len(), 2);
    }
}
