//! Filter/project fusion into calc operators and the related merges.

use crate::alg::node::{AlgNode, AlgOp};
use crate::alg::rex::Rex;
use crate::builder::simplify::simplify;
use crate::rewrite::rules::Rule;
use crate::rewrite::RewriteContext;
use crate::types::Result;

fn identity(node: &AlgNode) -> Vec<Rex> {
    node.row_type()
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| Rex::input(i, f))
        .collect()
}

fn is_identity(exprs: &[Rex], input: &AlgNode) -> bool {
    exprs.len() == input.field_count()
        && exprs.iter().enumerate().all(|(i, e)| e.as_input_ref() == Some(i))
}

/// `Filter(c)` becomes `Calc(identity, c)`.
pub struct FilterToCalc;

impl Rule for FilterToCalc {
    fn name(&self) -> &'static str {
        "FilterToCalc"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let AlgOp::Filter { condition } = node.op() else {
            return Ok(None);
        };
        let input = node.input(0)?;
        let calc = AlgNode::calc(
            input.clone(),
            identity(input),
            node.row_type().names(),
            Some(condition.clone()),
        );
        Ok(Some(
            calc.with_row_type(node.row_type().clone())
                .with_traits(node.traits().clone()),
        ))
    }
}

/// `Project(e)` becomes `Calc(e)`.
pub struct ProjectToCalc;

impl Rule for ProjectToCalc {
    fn name(&self) -> &'static str {
        "ProjectToCalc"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let AlgOp::Project { exprs } = node.op() else {
            return Ok(None);
        };
        let calc = AlgNode::calc(node.input(0)?.clone(), exprs.clone(), node.row_type().names(), None);
        Ok(Some(
            calc.with_row_type(node.row_type().clone())
                .with_traits(node.traits().clone()),
        ))
    }
}

/// Merges a calc into the calc below it.
pub struct CalcMerge;

impl Rule for CalcMerge {
    fn name(&self) -> &'static str {
        "CalcMerge"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let AlgOp::Calc { exprs, condition } = node.op() else {
            return Ok(None);
        };
        let inner = node.input(0)?;
        let AlgOp::Calc {
            exprs: inner_exprs,
            condition: inner_condition,
        } = inner.op()
        else {
            return Ok(None);
        };
        if inner.convention() != node.convention() {
            return Ok(None);
        }
        let merged_exprs = exprs.iter().map(|e| e.substitute(inner_exprs)).collect();
        let outer_condition = condition.as_ref().map(|c| c.substitute(inner_exprs));
        let merged_condition = match (inner_condition.clone(), outer_condition) {
            (None, None) => None,
            (Some(c), None) | (None, Some(c)) => Some(c),
            (Some(a), Some(b)) => Some(simplify(&Rex::and_all(vec![a, b]))),
        };
        let below = inner.input(0)?.clone();
        let calc = AlgNode::calc(below, merged_exprs, node.row_type().names(), merged_condition);
        Ok(Some(
            calc.with_row_type(node.row_type().clone())
                .with_traits(node.traits().clone()),
        ))
    }
}

/// Merges stacked filters into one conjunction.
pub struct FilterMerge;

impl Rule for FilterMerge {
    fn name(&self) -> &'static str {
        "FilterMerge"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let AlgOp::Filter { condition } = node.op() else {
            return Ok(None);
        };
        let inner = node.input(0)?;
        let AlgOp::Filter {
            condition: inner_condition,
        } = inner.op()
        else {
            return Ok(None);
        };
        let merged = simplify(&Rex::and_all(vec![inner_condition.clone(), condition.clone()]));
        Ok(Some(
            AlgNode::filter(inner.input(0)?.clone(), merged).with_traits(node.traits().clone()),
        ))
    }
}

/// Pushes a projection through the projection below it.
pub struct ProjectMerge;

impl Rule for ProjectMerge {
    fn name(&self) -> &'static str {
        "ProjectMerge"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let AlgOp::Project { exprs } = node.op() else {
            return Ok(None);
        };
        let inner = node.input(0)?;
        let AlgOp::Project { exprs: inner_exprs } = inner.op() else {
            return Ok(None);
        };
        let merged = exprs.iter().map(|e| e.substitute(inner_exprs)).collect();
        let project = AlgNode::project(inner.input(0)?.clone(), merged, node.row_type().names());
        Ok(Some(project.with_row_type(node.row_type().clone())))
    }
}

/// Drops a projection that returns its input unchanged.
pub struct ProjectRemove;

impl Rule for ProjectRemove {
    fn name(&self) -> &'static str {
        "ProjectRemove"
    }

    fn apply(&self, node: &AlgNode, _ctx: &RewriteContext) -> Result<Option<AlgNode>> {
        let AlgOp::Project { exprs } = node.op() else {
            return Ok(None);
        };
        let input = node.input(0)?;
        if is_identity(exprs, input) && input.row_type().names() == node.row_type().names() {
            return Ok(Some(input.clone()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::EntityRef;
    use crate::alg::rex::Op;
    use crate::alg::types::{DataType, TupleType};
    use crate::rewrite::RewriteContext;
    use crate::types::EntityId;

    fn scan() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(1), "t"),
            TupleType::of(&[("a", DataType::BigInt, false), ("b", DataType::BigInt, true)]),
        )
    }

    #[test]
    fn filter_and_project_fuse_into_one_calc() {
        let ctx = RewriteContext::default();
        let input = scan();
        let fields = input.row_type().fields().to_vec();
        let filter = AlgNode::filter(
            input,
            Rex::call(Op::Gt, vec![Rex::input(1, &fields[1]), Rex::lit(3i64)]),
        );
        let project = AlgNode::project(filter.clone(), vec![Rex::input(1, &fields[1])], vec!["b".into()]);

        let calc_filter = FilterToCalc.apply(&filter, &ctx).unwrap().unwrap();
        let project = project.with_inputs(vec![calc_filter]);
        let calc_project = ProjectToCalc.apply(&project, &ctx).unwrap().unwrap();
        let merged = CalcMerge.apply(&calc_project, &ctx).unwrap().unwrap();

        let AlgOp::Calc { exprs, condition } = merged.op() else {
            panic!("expected calc");
        };
        assert_eq!(exprs.len(), 1);
        assert_eq!(condition.as_ref().map(|c| c.to_string()), Some(">($1, 3)".to_string()));
        assert!(matches!(merged.input(0).unwrap().op(), AlgOp::Scan { .. }));
        assert_eq!(merged.row_type(), project.row_type());
    }

    #[test]
    fn identity_project_is_removed() {
        let ctx = RewriteContext::default();
        let input = scan();
        let exprs = identity(&input);
        let project = AlgNode::project(input.clone(), exprs, input.row_type().names());
        let removed = ProjectRemove.apply(&project, &ctx).unwrap().unwrap();
        assert!(AlgNode::ptr_eq(&removed, &input));
    }
}
