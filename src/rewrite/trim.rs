//! Field trimming: drops fields that no consumer reads.

use std::collections::BTreeSet;

use tracing::debug;

use crate::alg::node::{AggregateCall, AlgNode, AlgOp};
use crate::alg::rex::Rex;
use crate::alg::traits::{Collation, FieldCollation, TraitSet};
use crate::rewrite::{Program, RewriteContext};
use crate::types::{QuarryError, Result};

/// For every old field ordinal, its new ordinal when kept.
type Mapping = Vec<Option<usize>>;

fn positions(kept: &[usize], len: usize) -> Mapping {
    let mut mapping = vec![None; len];
    for (new, &old) in kept.iter().enumerate() {
        mapping[old] = Some(new);
    }
    mapping
}

fn identity(len: usize) -> Mapping {
    (0..len).map(Some).collect()
}

fn lookup(mapping: &Mapping, old: usize) -> Result<usize> {
    mapping
        .get(old)
        .copied()
        .flatten()
        .ok_or_else(|| QuarryError::Invalid(format!("field ${old} was trimmed but is still referenced")))
}

fn remap(rex: &Rex, mapping: &Mapping) -> Result<Rex> {
    for old in rex.input_refs() {
        lookup(mapping, old)?;
    }
    Ok(rex.remap(&|old| mapping[old].unwrap_or(old)))
}

fn all(node: &AlgNode) -> BTreeSet<usize> {
    (0..node.field_count()).collect()
}

/// Trims `node` to the `required` fields. The result may keep more fields
/// than required; the mapping locates every kept field.
pub fn trim(node: &AlgNode, required: &BTreeSet<usize>) -> Result<(AlgNode, Mapping)> {
    match node.op() {
        AlgOp::Scan { .. } => {
            if required.len() == node.field_count() {
                return Ok((node.clone(), identity(node.field_count())));
            }
            let mut kept: Vec<usize> = required.iter().copied().collect();
            if kept.is_empty() && node.field_count() > 0 {
                kept.push(0);
            }
            let fields = node.row_type().fields();
            let exprs = kept.iter().map(|&i| Rex::input(i, &fields[i])).collect();
            let names = kept.iter().map(|&i| fields[i].name.clone()).collect();
            Ok((AlgNode::project(node.clone(), exprs, names), positions(&kept, node.field_count())))
        }
        AlgOp::Project { exprs } => {
            let mut kept: Vec<usize> = required.iter().copied().filter(|&i| i < exprs.len()).collect();
            if kept.is_empty() && !exprs.is_empty() {
                kept.push(0);
            }
            let input = node.input(0)?;
            let used: BTreeSet<usize> = kept.iter().flat_map(|&i| exprs[i].input_refs()).collect();
            let (input, input_map) = if matches!(input.op(), AlgOp::Scan { .. }) {
                (input.clone(), identity(input.field_count()))
            } else {
                trim(input, &used)?
            };
            let new_exprs = kept
                .iter()
                .map(|&i| remap(&exprs[i], &input_map))
                .collect::<Result<Vec<_>>>()?;
            let names = kept
                .iter()
                .filter_map(|&i| node.row_type().field(i).map(|f| f.name.clone()))
                .collect();
            Ok((AlgNode::project(input, new_exprs, names), positions(&kept, exprs.len())))
        }
        AlgOp::Filter { condition } => {
            let mut needed = required.clone();
            needed.extend(condition.input_refs());
            let (input, mapping) = trim(node.input(0)?, &needed)?;
            Ok((AlgNode::filter(input, remap(condition, &mapping)?), mapping))
        }
        AlgOp::Join { kind, condition, .. } => {
            let (left, right) = (node.input(0)?, node.input(1)?);
            let left_count = left.field_count();
            let mut needed = required.clone();
            needed.extend(condition.input_refs());
            let left_required = needed.iter().copied().filter(|&i| i < left_count).collect();
            let right_required = needed
                .iter()
                .filter(|&&i| i >= left_count)
                .map(|&i| i - left_count)
                .collect();
            let (new_left, left_map) = trim(left, &left_required)?;
            let (new_right, right_map) = trim(right, &right_required)?;
            let new_left_count = new_left.field_count();
            let mut mapping: Mapping = left_map.clone();
            mapping.extend(right_map.iter().map(|m| m.map(|p| p + new_left_count)));
            let condition = remap(condition, &mapping)?;
            let joined = AlgNode::join(*kind, new_left, new_right, condition);
            if !kind.projects_right() {
                return Ok((joined, left_map));
            }
            Ok((joined, mapping))
        }
        AlgOp::Aggregate {
            group_set,
            group_sets,
            calls,
            ..
        } => {
            let group_count = group_set.len();
            let kept_calls: Vec<(usize, &AggregateCall)> = calls
                .iter()
                .enumerate()
                .filter(|(i, _)| required.contains(&(group_count + i)))
                .collect();
            let mut used: BTreeSet<usize> = group_set.iter().copied().collect();
            for (_, call) in &kept_calls {
                used.extend(call.args.iter().copied());
                used.extend(call.filter);
                used.extend(call.order.keys().iter().map(|k| k.field));
            }
            let (input, input_map) = trim(node.input(0)?, &used)?;
            let map_all = |ordinals: &[usize]| -> Result<Vec<usize>> {
                ordinals.iter().map(|&o| lookup(&input_map, o)).collect()
            };
            let new_group_set = map_all(group_set)?;
            let new_group_sets = group_sets
                .iter()
                .map(|set| map_all(set))
                .collect::<Result<Vec<_>>>()?;
            let mut new_calls = Vec::with_capacity(kept_calls.len());
            for (_, call) in &kept_calls {
                let order = call
                    .order
                    .keys()
                    .iter()
                    .map(|k| Ok(FieldCollation { field: lookup(&input_map, k.field)?, ..*k }))
                    .collect::<Result<Vec<_>>>()?;
                new_calls.push(AggregateCall {
                    args: map_all(&call.args)?,
                    filter: call.filter.map(|f| lookup(&input_map, f)).transpose()?,
                    order: Collation(order),
                    ..(*call).clone()
                });
            }
            let mut mapping: Mapping = (0..group_count).map(Some).collect();
            mapping.extend(vec![None; calls.len()]);
            for (new, (old, _)) in kept_calls.iter().enumerate() {
                mapping[group_count + old] = Some(group_count + new);
            }
            let aggregate = AlgNode::aggregate(input, new_group_set, new_group_sets, new_calls);
            Ok((aggregate, mapping))
        }
        AlgOp::Sort {
            collation,
            offset,
            fetch,
        } => {
            let mut needed = required.clone();
            needed.extend(collation.keys().iter().map(|k| k.field));
            let (input, mapping) = trim(node.input(0)?, &needed)?;
            let keys = collation
                .keys()
                .iter()
                .map(|k| Ok(FieldCollation { field: lookup(&mapping, k.field)?, ..*k }))
                .collect::<Result<Vec<_>>>()?;
            Ok((AlgNode::sort(input, Collation(keys), *offset, *fetch), mapping))
        }
        _ => {
            let inputs = node
                .inputs()
                .iter()
                .map(|input| trim(input, &all(input)).map(|(n, _)| n))
                .collect::<Result<Vec<_>>>()?;
            Ok((node.with_inputs(inputs), identity(node.field_count())))
        }
    }
}

/// Runs [`trim`] with every root field required.
pub struct TrimProgram;

impl Program for TrimProgram {
    fn name(&self) -> &'static str {
        "trim"
    }

    fn run(&self, _ctx: &RewriteContext, node: AlgNode, _required: &TraitSet) -> Result<AlgNode> {
        let before = node.field_count();
        let (trimmed, _) = trim(&node, &all(&node))?;
        debug_assert_eq!(trimmed.field_count(), before);
        debug!(fields = before, "trim.done");
        Ok(trimmed.with_row_type(node.row_type().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::{AggFunction, EntityRef, JoinKind};
    use crate::alg::types::{DataType, TupleType};
    use crate::types::EntityId;

    fn wide(id: u64) -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(id), format!("t{id}")),
            TupleType::of(&[
                ("k", DataType::BigInt, false),
                ("a", DataType::Varchar, true),
                ("b", DataType::Varchar, true),
                ("c", DataType::Double, true),
            ]),
        )
    }

    #[test]
    fn join_inputs_are_narrowed_to_used_fields() {
        let join = AlgNode::join(JoinKind::Inner, wide(1), wide(2), Rex::true_lit());
        let f = join.row_type().fields().to_vec();
        let join = AlgNode::join(
            JoinKind::Inner,
            wide(1),
            wide(2),
            Rex::eq(Rex::input(0, &f[0]), Rex::input(4, &f[4])),
        );
        let project = AlgNode::project(join, vec![Rex::input(7, &f[7])], vec!["c".into()]);
        let out = TrimProgram
            .run(&RewriteContext::default(), project.clone(), &TraitSet::logical())
            .unwrap();
        assert_eq!(out.row_type(), project.row_type());
        let join = out.input(0).unwrap();
        assert_eq!(join.field_count(), 3);
        let AlgOp::Join { condition, .. } = join.op() else {
            panic!("expected join");
        };
        assert_eq!(condition.to_string(), "=($0, $1)");
    }

    #[test]
    fn unused_aggregate_calls_are_dropped() {
        let input = wide(1);
        let f = input.row_type().fields().to_vec();
        let call = |function, arg: usize, name: &str| AggregateCall {
            function,
            distinct: false,
            args: vec![arg],
            filter: None,
            order: Collation::empty(),
            name: name.into(),
            ty: DataType::Double,
            nullable: true,
        };
        let agg = AlgNode::aggregate(
            input,
            vec![1],
            vec![vec![1]],
            vec![call(AggFunction::Sum, 3, "s"), call(AggFunction::Max, 2, "m")],
        );
        let af = agg.row_type().fields().to_vec();
        let project = AlgNode::project(agg, vec![Rex::input(0, &af[0]), Rex::input(1, &af[1])], vec!["a".into(), "s".into()]);
        let out = TrimProgram
            .run(&RewriteContext::default(), project, &TraitSet::logical())
            .unwrap();
        let AlgOp::Aggregate { group_set, calls, .. } = out.input(0).unwrap().op() else {
            panic!("expected aggregate");
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(group_set, &vec![0]);
        assert_eq!(calls[0].args, vec![1]);
    }
}
