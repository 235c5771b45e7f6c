//! Lowering of struct-typed fields into scalar `parent.child` fields.
//!
//! Field accesses over input references collapse into plain input references
//! into the flattened layout. A projection that forwards a whole record expands
//! into one output field per leaf.

use crate::alg::node::{AlgNode, AlgOp, AlgRoot};
use crate::alg::rex::Rex;
use crate::alg::traits::{Collation, FieldCollation};
use crate::alg::types::{DataType, Field, TupleType};
use crate::alg::value::Value;
use crate::types::{QuarryError, Result};

fn leaves(ty: &DataType) -> usize {
    match ty {
        DataType::Struct(children) => children.iter().map(|(_, t)| leaves(t)).sum(),
        _ => 1,
    }
}

fn has_struct(row_type: &TupleType) -> bool {
    row_type.fields().iter().any(|f| f.ty.is_struct())
}

fn leaf_fields(name: &str, ty: &DataType, nullable: bool, out: &mut Vec<Field>) {
    match ty {
        DataType::Struct(children) => {
            for (child, child_ty) in children {
                leaf_fields(&format!("{name}.{child}"), child_ty, true, out);
            }
        }
        _ => out.push(Field::new(name, ty.clone(), nullable)),
    }
}

/// Flattened tuple type; scalar fields keep their identity.
pub fn flat_type(row_type: &TupleType) -> TupleType {
    let mut fields = Vec::with_capacity(row_type.len());
    for field in row_type.fields() {
        if field.ty.is_struct() {
            leaf_fields(&field.name, &field.ty, field.nullable, &mut fields);
        } else {
            fields.push(field.clone());
        }
    }
    TupleType::new(fields)
}

/// Start of each field in the flattened layout.
fn starts(fields: &[Field]) -> Vec<usize> {
    let mut next = 0;
    fields
        .iter()
        .map(|f| {
            let start = next;
            next += leaves(&f.ty);
            start
        })
        .collect()
}

/// Old field ordinal to its flattened ordinals.
fn expand(fields: &[Field], ordinal: usize) -> Result<Vec<usize>> {
    let starts = starts(fields);
    let field = fields
        .get(ordinal)
        .ok_or_else(|| QuarryError::Invalid(format!("field ordinal {ordinal} out of range")))?;
    Ok((starts[ordinal]..starts[ordinal] + leaves(&field.ty)).collect())
}

fn expand_all(fields: &[Field], ordinals: &[usize]) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for &ordinal in ordinals {
        out.extend(expand(fields, ordinal)?);
    }
    Ok(out)
}

fn remap_collation(fields: &[Field], collation: &Collation) -> Result<Collation> {
    let mut keys = Vec::new();
    for key in collation.keys() {
        for field in expand(fields, key.field)? {
            keys.push(FieldCollation { field, ..*key });
        }
    }
    Ok(Collation(keys))
}

enum Base {
    Input,
    Correl(Rex),
}

/// A field-access path resolved to its leaf offset.
struct Resolved {
    base: Base,
    start: usize,
    ty: DataType,
    name: String,
    nullable: bool,
}

/// Expression rewriting against one input layout.
struct Scope<'a> {
    fields: &'a [Field],
    starts: Vec<usize>,
}

impl<'a> Scope<'a> {
    fn new(fields: &'a [Field]) -> Self {
        Self {
            fields,
            starts: starts(fields),
        }
    }

    fn resolve(&self, rex: &Rex) -> Option<Resolved> {
        match rex {
            Rex::InputRef { index, .. } => {
                let field = self.fields.get(*index)?;
                Some(Resolved {
                    base: Base::Input,
                    start: self.starts[*index],
                    ty: field.ty.clone(),
                    name: field.name.clone(),
                    nullable: field.nullable,
                })
            }
            Rex::CorrelVariable { id, row_type } => Some(Resolved {
                base: Base::Correl(Rex::CorrelVariable {
                    id: *id,
                    row_type: flat_type(row_type),
                }),
                start: 0,
                ty: DataType::Struct(
                    row_type
                        .fields()
                        .iter()
                        .map(|f| (f.name.clone(), f.ty.clone()))
                        .collect(),
                ),
                name: String::new(),
                nullable: false,
            }),
            Rex::FieldAccess { expr, index, .. } => {
                let parent = self.resolve(expr)?;
                let DataType::Struct(children) = &parent.ty else {
                    return None;
                };
                let (child, ty) = children.get(*index)?;
                let offset: usize = children[..*index].iter().map(|(_, t)| leaves(t)).sum();
                let name = if parent.name.is_empty() {
                    child.clone()
                } else {
                    format!("{}.{child}", parent.name)
                };
                Some(Resolved {
                    base: parent.base,
                    start: parent.start + offset,
                    ty: ty.clone(),
                    name,
                    nullable: true,
                })
            }
            _ => None,
        }
    }

    fn scalar(&self, resolved: Resolved) -> Result<Rex> {
        if resolved.ty.is_struct() {
            return Err(QuarryError::NotImplemented(format!(
                "record-valued expression `{}` outside a projection",
                resolved.name
            )));
        }
        Ok(match resolved.base {
            Base::Input => Rex::InputRef {
                index: resolved.start,
                ty: resolved.ty,
                nullable: resolved.nullable,
            },
            Base::Correl(var) => Rex::FieldAccess {
                expr: Box::new(var),
                index: resolved.start,
                name: resolved.name,
                ty: resolved.ty,
            },
        })
    }

    fn rex(&self, rex: &Rex) -> Result<Rex> {
        let mut failure = None;
        let rewritten = rex.rewrite(&mut |r| {
            let result = match r {
                Rex::InputRef { .. } | Rex::FieldAccess { .. } => match self.resolve(r) {
                    Some(resolved) => self.scalar(resolved).map(Some),
                    None => Ok(None),
                },
                Rex::CorrelVariable { id, row_type } => Ok(Some(Rex::CorrelVariable {
                    id: *id,
                    row_type: flat_type(row_type),
                })),
                Rex::SubQuery {
                    kind,
                    operands,
                    rel,
                    ty,
                } => operands
                    .iter()
                    .map(|o| self.rex(o))
                    .collect::<Result<Vec<_>>>()
                    .and_then(|operands| {
                        Ok(Some(Rex::SubQuery {
                            kind: *kind,
                            operands,
                            rel: flatten_node(rel)?,
                            ty: ty.clone(),
                        }))
                    }),
                _ => Ok(None),
            };
            match result {
                Ok(replacement) => replacement,
                Err(err) => {
                    failure.get_or_insert(err);
                    None
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(rewritten),
        }
    }

    /// Projection expressions; whole records expand into their leaves.
    fn project(&self, exprs: &[Rex], names: &[String]) -> Result<(Vec<Rex>, Vec<String>)> {
        let mut out = Vec::with_capacity(exprs.len());
        let mut out_names = Vec::with_capacity(exprs.len());
        for (expr, name) in exprs.iter().zip(names) {
            match self.resolve(expr) {
                Some(resolved) if resolved.ty.is_struct() && matches!(resolved.base, Base::Input) => {
                    let mut fields = Vec::new();
                    leaf_fields(name, &resolved.ty, resolved.nullable, &mut fields);
                    for (i, field) in fields.into_iter().enumerate() {
                        out.push(Rex::InputRef {
                            index: resolved.start + i,
                            ty: field.ty,
                            nullable: field.nullable,
                        });
                        out_names.push(field.name);
                    }
                }
                _ => {
                    out.push(self.rex(expr)?);
                    out_names.push(name.clone());
                }
            }
        }
        Ok((out, out_names))
    }
}

fn needs_rewrite(node: &AlgNode) -> bool {
    if has_struct(node.row_type()) || node.inputs().iter().any(|i| has_struct(i.row_type())) {
        return true;
    }
    node.op().expressions().iter().any(|rex| {
        let mut found = rex.contains_subquery();
        rex.visit(&mut |r| {
            if let Rex::CorrelVariable { row_type, .. } = r {
                found |= has_struct(row_type);
            }
        });
        found
    })
}

/// Flattens `node` and everything below it. Returns `node` itself when
/// nothing in the tree is struct-typed.
pub fn flatten_node(node: &AlgNode) -> Result<AlgNode> {
    let mut inputs = Vec::with_capacity(node.inputs().len());
    for input in node.inputs() {
        inputs.push(flatten_node(input)?);
    }
    let inputs_unchanged = inputs
        .iter()
        .zip(node.inputs())
        .all(|(new, old)| AlgNode::ptr_eq(new, old));
    if inputs_unchanged && !needs_rewrite(node) {
        return Ok(node.clone());
    }
    let input_fields: Vec<Field> = node
        .inputs()
        .iter()
        .flat_map(|i| i.row_type().fields().iter().cloned())
        .collect();
    let scope = Scope::new(&input_fields);
    let first_fields: &[Field] = node.inputs().first().map_or(&[][..], |i| i.row_type().fields());
    let flat_row_type = flat_type(node.row_type());
    let rebuilt = match node.op() {
        AlgOp::Scan { .. } => node.with_row_type(flat_row_type),
        AlgOp::Values { tuples } => {
            let fields = node.row_type().fields();
            let tuples = tuples
                .iter()
                .map(|tuple| {
                    tuple
                        .iter()
                        .zip(fields)
                        .flat_map(|(value, field)| {
                            let n = leaves(&field.ty);
                            if n == 1 && !field.ty.is_struct() {
                                vec![value.clone()]
                            } else {
                                vec![Value::Null; n]
                            }
                        })
                        .collect()
                })
                .collect();
            AlgNode::values(flat_row_type, tuples)?
        }
        AlgOp::Project { exprs } => {
            let input = inputs[0].clone();
            let (exprs, names) = scope.project(exprs, &node.row_type().names())?;
            AlgNode::project(input, exprs, names)
        }
        AlgOp::Calc { exprs, condition } => {
            let input = inputs[0].clone();
            let (exprs, names) = scope.project(exprs, &node.row_type().names())?;
            let condition = condition.as_ref().map(|c| scope.rex(c)).transpose()?;
            AlgNode::calc(input, exprs, names, condition)
        }
        AlgOp::Correlate {
            kind,
            correlation,
            required,
        } => node
            .with_inputs(inputs)
            .with_op(AlgOp::Correlate {
                kind: *kind,
                correlation: *correlation,
                required: expand_all(first_fields, required)?,
            })
            .with_row_type(flat_row_type),
        AlgOp::Aggregate {
            group_set,
            group_sets,
            calls,
            ..
        } => {
            let mut flat_calls = Vec::with_capacity(calls.len());
            for call in calls {
                let mut call = call.clone();
                let mut args = Vec::with_capacity(call.args.len());
                for &arg in &call.args {
                    match expand(first_fields, arg)?.as_slice() {
                        [only] if !first_fields[arg].ty.is_struct() => args.push(*only),
                        _ => {
                            return Err(QuarryError::NotImplemented(format!(
                                "aggregate {} over a record",
                                call.function.name()
                            )))
                        }
                    }
                }
                call.args = args;
                call.filter = call
                    .filter
                    .map(|f| expand(first_fields, f).map(|v| v[0]))
                    .transpose()?;
                flat_calls.push(call);
            }
            let group_sets = group_sets
                .iter()
                .map(|g| expand_all(first_fields, g))
                .collect::<Result<Vec<_>>>()?;
            AlgNode::aggregate(
                inputs[0].clone(),
                expand_all(first_fields, group_set)?,
                group_sets,
                flat_calls,
            )
        }
        AlgOp::Sort {
            collation,
            offset,
            fetch,
        } => AlgNode::sort(
            inputs[0].clone(),
            remap_collation(first_fields, collation)?,
            *offset,
            *fetch,
        ),
        _ => {
            let mut failure = None;
            let op = node.op().map_expressions(&mut |rex| match scope.rex(rex) {
                Ok(rex) => rex,
                Err(err) => {
                    failure.get_or_insert(err);
                    rex.clone()
                }
            });
            if let Some(err) = failure {
                return Err(err);
            }
            let row_type = match node.op() {
                AlgOp::Modify { .. } => node.row_type().clone(),
                _ => flat_row_type,
            };
            node.with_inputs(inputs).with_op(op).with_row_type(row_type)
        }
    };
    Ok(rebuilt)
}

/// Flattens a root, re-deriving its output mapping and collation.
pub fn flatten(root: &AlgRoot) -> Result<AlgRoot> {
    let node = flatten_node(&root.node)?;
    if AlgNode::ptr_eq(&node, &root.node) {
        return Ok(root.clone());
    }
    let old_fields = root.node.row_type().fields();
    let starts = starts(old_fields);
    let mut fields = Vec::with_capacity(root.fields.len());
    for (ordinal, name) in &root.fields {
        let field = old_fields.get(*ordinal).ok_or_else(|| {
            QuarryError::Invalid(format!("root field '{name}' out of range"))
        })?;
        if field.ty.is_struct() {
            let mut leaves = Vec::new();
            leaf_fields(name, &field.ty, field.nullable, &mut leaves);
            for (i, leaf) in leaves.into_iter().enumerate() {
                fields.push((starts[*ordinal] + i, leaf.name));
            }
        } else {
            fields.push((starts[*ordinal], name.clone()));
        }
    }
    let collation = remap_collation(old_fields, &root.collation)?;
    AlgRoot::new(node, flat_type(&root.validated_row_type), root.kind, fields, collation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::{EntityRef, Kind};
    use crate::types::EntityId;

    fn address() -> DataType {
        DataType::Struct(vec![
            ("city".into(), DataType::Varchar),
            ("zip".into(), DataType::BigInt),
        ])
    }

    fn people() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(1), "people"),
            TupleType::of(&[
                ("id", DataType::BigInt, false),
                ("address", address(), true),
                ("age", DataType::BigInt, true),
            ]),
        )
    }

    #[test]
    fn field_access_becomes_input_ref() {
        let scan = people();
        let f = scan.row_type().fields().to_vec();
        let zip = Rex::FieldAccess {
            expr: Box::new(Rex::input(1, &f[1])),
            index: 1,
            name: "zip".into(),
            ty: DataType::BigInt,
        };
        let filter = AlgNode::filter(scan, Rex::eq(zip, Rex::lit(12345i64)));
        let project = AlgNode::project(
            filter,
            vec![Rex::input(0, &f[0]), Rex::input(2, &f[2])],
            vec!["id".into(), "age".into()],
        );
        let flat = flatten_node(&project).unwrap();
        let AlgOp::Project { exprs } = flat.op() else {
            panic!("expected project");
        };
        assert_eq!(exprs[1].as_input_ref(), Some(3));
        let AlgOp::Filter { condition } = flat.inputs()[0].op() else {
            panic!("expected filter");
        };
        assert_eq!(condition.operands()[0].as_input_ref(), Some(2));
        assert_eq!(
            flat.inputs()[0].row_type().names(),
            vec!["id", "address.city", "address.zip", "age"]
        );
    }

    #[test]
    fn root_mapping_expands_records() {
        let root = AlgRoot::of(people(), Kind::Select);
        let flat = flatten(&root).unwrap();
        assert_eq!(
            flat.fields,
            vec![
                (0, "id".to_string()),
                (1, "address.city".to_string()),
                (2, "address.zip".to_string()),
                (3, "age".to_string()),
            ]
        );
        assert_eq!(flat.validated_row_type.len(), 4);
    }

    #[test]
    fn scalar_trees_are_returned_as_is() {
        let scan = AlgNode::scan(
            EntityRef::new(EntityId(2), "t"),
            TupleType::of(&[("a", DataType::BigInt, false)]),
        );
        assert!(AlgNode::ptr_eq(&flatten_node(&scan).unwrap(), &scan));
    }
}
