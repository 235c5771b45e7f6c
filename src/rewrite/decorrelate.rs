//! Turns correlates whose right side only filters on the correlation variable
//! into ordinary joins.

use tracing::debug;

use crate::alg::node::{correlations_in, AlgNode, AlgOp, JoinKind};
use crate::alg::rex::{CorrelationId, Rex};
use crate::alg::traits::TraitSet;
use crate::rewrite::{Program, RewriteContext};
use crate::types::Result;

/// Decorrelation pass; a no-op unless the context forces it.
pub struct DecorrelateProgram;

impl Program for DecorrelateProgram {
    fn name(&self) -> &'static str {
        "decorrelate"
    }

    fn run(&self, ctx: &RewriteContext, node: AlgNode, _required: &TraitSet) -> Result<AlgNode> {
        if !ctx.force_decorrelate {
            return Ok(node);
        }
        let mut rewritten = 0;
        let result = decorrelate(&node, &mut rewritten);
        debug!(rewritten, "decorrelate.done");
        Ok(result)
    }
}

/// Bottom-up decorrelation of every eligible correlate in the tree.
pub fn decorrelate(node: &AlgNode, rewritten: &mut usize) -> AlgNode {
    let inputs = node
        .inputs()
        .iter()
        .map(|input| decorrelate(input, rewritten))
        .collect();
    let node = node.with_inputs(inputs);
    let AlgOp::Correlate {
        kind, correlation, ..
    } = node.op()
    else {
        return node;
    };
    if !matches!(kind, JoinKind::Inner | JoinKind::Left | JoinKind::Semi | JoinKind::Anti) {
        return node;
    }
    match (node.input(0), node.input(1)) {
        (Ok(left), Ok(right)) => match as_join(&node, *kind, left, right, *correlation) {
            Some(joined) => {
                *rewritten += 1;
                joined
            }
            None => node,
        },
        _ => node,
    }
}

fn as_join(
    correlate: &AlgNode,
    kind: JoinKind,
    left: &AlgNode,
    right: &AlgNode,
    id: CorrelationId,
) -> Option<AlgNode> {
    let (exprs, below) = match right.op() {
        AlgOp::Project { exprs } if exprs.iter().all(|e| e.correlation_ids().is_empty()) => {
            (Some(exprs.clone()), right.input(0).ok()?.clone())
        }
        _ => (None, right.clone()),
    };
    if kind == JoinKind::Left
        && exprs
            .as_ref()
            .is_some_and(|exprs| exprs.iter().any(|e| e.as_input_ref().is_none()))
    {
        return None;
    }
    let (base, condition) = match below.op() {
        AlgOp::Filter { condition } => (below.input(0).ok()?.clone(), condition.clone()),
        _ => (below.clone(), Rex::true_lit()),
    };
    if correlations_in(&base).contains(&id) {
        return None;
    }
    let left_count = left.field_count();
    let left_fields = left.row_type().fields();
    let condition = condition
        .shift(0, left_count as isize)
        .rewrite(&mut |rex| match rex {
            Rex::FieldAccess {
                expr, index, ty, ..
            } if matches!(expr.as_ref(), Rex::CorrelVariable { id: v, .. } if *v == id) => {
                Some(Rex::InputRef {
                    index: *index,
                    ty: ty.clone(),
                    nullable: left_fields.get(*index).map_or(true, |f| f.nullable),
                })
            }
            _ => None,
        });
    if condition.correlation_ids().contains(&id) {
        return None;
    }
    let joined = AlgNode::join(kind, left.clone(), base, condition);
    match exprs {
        Some(exprs) if kind.projects_right() => {
            let joined_fields = joined.row_type().fields().to_vec();
            let projection = joined_fields
                .iter()
                .take(left_count)
                .enumerate()
                .map(|(i, f)| Rex::input(i, f))
                .chain(exprs.iter().map(|e| e.shift(0, left_count as isize)))
                .collect();
            Some(AlgNode::project(joined, projection, correlate.row_type().names()))
        }
        _ => Some(joined.with_row_type(correlate.row_type().clone())),
    }
}
