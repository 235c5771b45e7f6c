//! Replaces sub-query expressions with joins and correlates.

use crate::alg::node::{correlations_in, AggFunction, AggregateCall, AlgNode, AlgOp, JoinKind};
use crate::alg::rex::{CorrelationId, Op, Rex, SubQueryKind};
use crate::alg::traits::Collation;
use crate::alg::types::DataType;
use crate::builder::{correlate_condition, required_columns};
use crate::rewrite::rules::Rule;
use crate::rewrite::RewriteContext;
use crate::types::Result;

enum Binding {
    Uncorrelated,
    Correlated(CorrelationId),
    Unsupported,
}

fn binding(rel: &AlgNode) -> Binding {
    let ids = correlations_in(rel);
    let mut iter = ids.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => Binding::Uncorrelated,
        (Some(id), None) => Binding::Correlated(id),
        _ => Binding::Unsupported,
    }
}

/// Joins `rel` to `input`; `condition` ranges over `input ++ rel`.
/// Produces a correlate when `rel` reads a correlation variable.
fn attach(kind: JoinKind, input: &AlgNode, rel: AlgNode, condition: Rex) -> Option<AlgNode> {
    match binding(&rel) {
        Binding::Uncorrelated => Some(AlgNode::join(kind, input.clone(), rel, condition)),
        Binding::Correlated(id) => Some(correlated(kind, input, rel, condition, id)),
        Binding::Unsupported => None,
    }
}

fn correlated(kind: JoinKind, input: &AlgNode, rel: AlgNode, condition: Rex, id: CorrelationId) -> AlgNode {
    let pushed = correlate_condition(&condition, id, input);
    let right = if pushed.is_true() {
        rel
    } else {
        AlgNode::filter(rel, pushed)
    };
    let required = required_columns(&right, id);
    AlgNode::correlate(kind, input.clone(), right, id, required)
}

fn filtered(node: AlgNode, conjuncts: Vec<Rex>) -> AlgNode {
    if conjuncts.is_empty() {
        node
    } else {
        AlgNode::filter(node, Rex::and_all(conjuncts))
    }
}

fn single_row(rel: AlgNode, call: AggregateCall) -> AlgNode {
    AlgNode::aggregate(rel, Vec::new(), vec![Vec::new()], vec![call])
}

fn count_star() -> AggregateCall {
    AggregateCall {
        function: AggFunction::Count,
        distinct: false,
        args: Vec::new(),
        filter: None,
        order: Collation::empty(),
        name: "$c".into(),
        ty: DataType::BigInt,
        nullable: false,
    }
}

fn in_condition(operands: &[Rex], rel: &AlgNode, offset: usize) -> Option<Rex> {
    let fields = rel.row_type().fields();
    if operands.len() != fields.len() {
        return None;
    }
    Some(Rex::and_all(
        operands
            .iter()
            .zip(fields)
            .enumerate()
            .map(|(i, (operand, field))| Rex::eq(operand.clone(), Rex::input(offset + i, field)))
            .collect(),
    ))
}

/// Turns any sub-query into a one-row right input plus the expression that
/// replaces it over `input ++ [value]`.
fn scalarize(input: &AlgNode, subquery: &Rex) -> Option<(AlgNode, Rex)> {
    let Rex::SubQuery {
        kind,
        operands,
        rel,
        ty,
    } = subquery
    else {
        return None;
    };
    let n = input.field_count();
    match kind {
        SubQueryKind::Scalar => {
            let field = rel.row_type().field(0)?.clone();
            let call = AggregateCall {
                function: AggFunction::SingleValue,
                distinct: false,
                args: vec![0],
                filter: None,
                order: Collation::empty(),
                name: field.name.clone(),
                ty: field.ty.clone(),
                nullable: true,
            };
            let joined = attach(JoinKind::Left, input, single_row(rel.clone(), call), Rex::true_lit())?;
            Some((
                joined,
                Rex::InputRef {
                    index: n,
                    ty: ty.clone(),
                    nullable: true,
                },
            ))
        }
        SubQueryKind::Exists | SubQueryKind::In => {
            let counted = |right: AlgNode| single_row(right, count_star());
            let joined = if *kind == SubQueryKind::Exists {
                attach(JoinKind::Left, input, counted(rel.clone()), Rex::true_lit())?
            } else {
                let id = match binding(rel) {
                    Binding::Uncorrelated => CorrelationId::fresh(),
                    Binding::Correlated(id) => id,
                    Binding::Unsupported => return None,
                };
                let condition = in_condition(operands, rel, n)?;
                let pushed = correlate_condition(&condition, id, input);
                let right = counted(AlgNode::filter(rel.clone(), pushed));
                let required = required_columns(&right, id);
                AlgNode::correlate(JoinKind::Left, input.clone(), right, id, required)
            };
            let count = Rex::InputRef {
                index: n,
                ty: DataType::BigInt,
                nullable: false,
            };
            Some((joined, Rex::call(Op::Gt, vec![count, Rex::lit(0i64)])))
        }
    }
}

fn first_subquery<'a>(exprs: impl IntoIterator<Item = &'a Rex>) -> Option<Rex> {
    let mut found = None;
    for expr in exprs {
        expr.visit(&mut |rex| {
            if found.is_none() && matches!(rex, Rex::SubQuery { .. }) {
                found = Some(rex.clone());
            }
        });
        if found.is_some() {
            break;
        }
    }
    found
}

fn replace(expr: &Rex, target: &Rex, replacement: &Rex) -> Rex {
    expr.rewrite(&mut |rex| (rex == target).then(|| replacement.clone()))
}

/// Removes `EXISTS`, `IN` and scalar sub-queries from filters and projections.
///
/// Top-level `[NOT] EXISTS` and `IN` conjuncts of a filter become semi or anti
/// joins; every other occurrence is evaluated through a left join against a
/// one-row aggregate of the sub-query.
pub struct SubQueryRemove;

impl SubQueryRemove {
    fn filter(&self, node: &AlgNode, condition: &Rex) -> Result<Option<AlgNode>> {
        let input = node.input(0)?;
        let n = input.field_count();
        let conjuncts = condition.conjunctions();
        for (pos, conjunct) in conjuncts.iter().enumerate() {
            let rest = || {
                conjuncts
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != pos)
                    .map(|(_, c)| c.clone())
                    .collect::<Vec<_>>()
            };
            let (negated, inner) = match conjunct {
                Rex::Call {
                    op: Op::Not,
                    operands,
                    ..
                } if operands.len() == 1 => (true, &operands[0]),
                other => (false, other),
            };
            let joined = match inner {
                Rex::SubQuery {
                    kind: SubQueryKind::Exists,
                    rel,
                    ..
                } => {
                    let kind = if negated { JoinKind::Anti } else { JoinKind::Semi };
                    attach(kind, input, rel.clone(), Rex::true_lit())
                }
                Rex::SubQuery {
                    kind: SubQueryKind::In,
                    operands,
                    rel,
                    ..
                } if !negated => in_condition(operands, rel, n)
                    .and_then(|cond| attach(JoinKind::Semi, input, rel.clone(), cond)),
                _ => None,
            };
            if let Some(joined) = joined {
                return Ok(Some(filtered(joined, rest())));
            }
        }

        let Some(target) = first_subquery([condition]) else {
            return Ok(None);
        };
        let Some((joined, replacement)) = scalarize(input, &target) else {
            return Ok(None);
        };
        let filter = AlgNode::filter(joined, replace(condition, &target, &replacement));
        let fields = filter.row_type().fields().to_vec();
        let exprs = fields.iter().take(n).enumerate().map(|(i, f)| Rex::input(i, f)).collect();
        Ok(Some(AlgNode::project(filter, exprs, node.row_type().names())))
    }

    fn project(&self, node: &AlgNode, exprs: &[Rex]) -> Result<Option<AlgNode>> {
        let input = node.input(0)?;
        let Some(target) = first_subquery(exprs) else {
            return Ok(None);
        };
        let Some((joined, replacement)) = scalarize(input, &target) else {
            return Ok(None);
        };
        let exprs = exprs.iter().map(|e| replace(e, &target, &replacement)).collect();
        Ok(Some(AlgNode::project(joined, exprs, node.row_type().names())))
    }
}

impl Rule for SubQueryRemove {
    fn name(&self) -> &'static str {
        "SubQueryRemove"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        match node.op() {
            AlgOp::Filter { condition } if condition.contains_subquery() => self.filter(node, condition),
            AlgOp::Project { exprs } if exprs.iter().any(Rex::contains_subquery) => self.project(node, exprs),
            _ => Ok(None),
        }
    }
}
