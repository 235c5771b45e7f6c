//! Explain trees, digests and plan hashes.

use std::fmt::Write as _;
use std::hash::Hasher;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::alg::node::{AggStrategy, AlgNode, AlgOp, JoinAlgorithm, SetOpKind};
use crate::alg::traits::Convention;

/// Explain node representing an operator with its properties.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name, prefixed with the convention for physical nodes.
    pub op: String,
    /// Properties describing the operator.
    pub props: Vec<ExplainProp>,
    /// Input operators.
    pub inputs: Vec<ExplainNode>,
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

/// Output format of [`dump_plan`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExplainFormat {
    /// Indented text, one operator per line.
    Text,
    /// Pretty-printed JSON of the explain tree.
    Json,
}

/// Builds the explain tree of `node`.
pub fn explain(node: &AlgNode) -> ExplainNode {
    ExplainNode {
        op: op_name(node),
        props: op_props(node),
        inputs: node.inputs().iter().map(explain).collect(),
    }
}

impl ExplainNode {
    /// Indented text rendering. Redactable values are replaced with `?` when `redact` is set.
    pub fn to_text(&self, redact: bool) -> String {
        let mut out = String::new();
        self.write_text(&mut out, 0, redact);
        out
    }

    fn write_text(&self, out: &mut String, depth: usize, redact: bool) {
        let _ = write!(out, "{:indent$}{}", "", self.op, indent = depth * 2);
        if !self.props.is_empty() {
            out.push('(');
            for (i, prop) in self.props.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let value = if redact && prop.redactable {
                    "?"
                } else {
                    prop.value.as_str()
                };
                let _ = write!(out, "{}={}", prop.key, value);
            }
            out.push(')');
        }
        out.push('\n');
        for input in &self.inputs {
            input.write_text(out, depth + 1, redact);
        }
    }
}

/// Renders a titled plan dump for diagnostics.
pub fn dump_plan(title: &str, node: &AlgNode, format: ExplainFormat) -> String {
    let tree = explain(node);
    match format {
        ExplainFormat::Text => format!("{title}\n{}", tree.to_text(false)),
        ExplainFormat::Json => {
            let body = serde_json::json!({ "title": title, "plan": tree });
            serde_json::to_string_pretty(&body).unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
        }
    }
}

/// Structural comparison string: operator names, payloads and child digests.
/// Field identities are excluded, so equal structures compare equal across rebuilds.
pub fn digest(node: &AlgNode) -> String {
    let mut out = String::new();
    write_digest(node, &mut out);
    out
}

/// Digest of the operator and its payload only, without inputs.
pub fn op_digest(node: &AlgNode) -> String {
    let mut out = String::new();
    write_op(node, &mut out);
    out
}

fn write_op(node: &AlgNode, out: &mut String) {
    out.push_str(&op_name(node));
    out.push('(');
    for (i, prop) in op_props(node).iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}={}", prop.key, prop.value);
    }
    out.push(')');
}

fn write_digest(node: &AlgNode, out: &mut String) {
    write_op(node, out);
    if !node.inputs().is_empty() {
        out.push('[');
        for (i, input) in node.inputs().iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_digest(input, out);
        }
        out.push(']');
    }
}

/// Deterministic 64-bit hash of a digest string.
pub fn hash_digest(digest: &str) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.write(digest.as_bytes());
    hasher.finish()
}

/// Deterministic 64-bit plan hash, written operator by operator.
pub fn plan_hash(node: &AlgNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_node(node, &mut hasher);
    hasher.finish()
}

fn hash_node(node: &AlgNode, hasher: &mut Xxh64) {
    hasher.write(op_name(node).as_bytes());
    for prop in op_props(node) {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs().len() as u64);
    for child in node.inputs() {
        hash_node(child, hasher);
    }
}

fn op_name(node: &AlgNode) -> String {
    let base = match node.op() {
        AlgOp::Join {
            algorithm: JoinAlgorithm::Hash,
            ..
        } => "HashJoin",
        AlgOp::Join {
            algorithm: JoinAlgorithm::NestedLoop,
            ..
        } => "NestedLoopJoin",
        AlgOp::Aggregate {
            strategy: AggStrategy::Hash,
            ..
        } => "HashAggregate",
        AlgOp::Aggregate {
            strategy: AggStrategy::Sorted,
            ..
        } => "SortedAggregate",
        AlgOp::SetOp { kind, .. } => match kind {
            SetOpKind::Union => "Union",
            SetOpKind::Intersect => "Intersect",
            SetOpKind::Minus => "Minus",
        },
        op => op.name(),
    };
    match node.convention() {
        Convention::Logical => base.to_string(),
        Convention::Enumerable => format!("Enumerable{base}"),
    }
}

fn list<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    let mut out = String::from("[");
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{item}");
    }
    out.push(']');
    out
}

fn op_props(node: &AlgNode) -> Vec<ExplainProp> {
    match node.op() {
        AlgOp::Scan { entity } => vec![
            ExplainProp::plain("entity", entity.name.clone()),
            ExplainProp::plain("placement", entity.placement.to_string()),
            ExplainProp::plain("fields", list(node.row_type().names())),
        ],
        AlgOp::Values { tuples } => vec![
            ExplainProp::plain("type", node.row_type().to_string()),
            ExplainProp::literal(
                "tuples",
                list(tuples.iter().map(|t| list(t.iter()))),
            ),
        ],
        AlgOp::Filter { condition } => vec![ExplainProp::literal("condition", condition.to_string())],
        AlgOp::Project { exprs } => vec![
            ExplainProp::literal("exprs", list(exprs.iter())),
            ExplainProp::plain("fields", list(node.row_type().names())),
        ],
        AlgOp::Calc { exprs, condition } => {
            let mut props = vec![
                ExplainProp::literal("exprs", list(exprs.iter())),
                ExplainProp::plain("fields", list(node.row_type().names())),
            ];
            if let Some(condition) = condition {
                props.push(ExplainProp::literal("condition", condition.to_string()));
            }
            props
        }
        AlgOp::Join {
            kind, condition, ..
        } => vec![
            ExplainProp::literal("condition", condition.to_string()),
            ExplainProp::plain("kind", kind.name()),
        ],
        AlgOp::Correlate {
            kind,
            correlation,
            required,
        } => vec![
            ExplainProp::plain("correlation", correlation.to_string()),
            ExplainProp::plain("kind", kind.name()),
            ExplainProp::plain("required", list(required.iter())),
        ],
        AlgOp::MultiJoin { condition } => {
            vec![ExplainProp::literal("condition", condition.to_string())]
        }
        AlgOp::Aggregate {
            group_set,
            group_sets,
            calls,
            ..
        } => {
            let mut props = vec![ExplainProp::plain("group", list(group_set.iter()))];
            if group_sets.len() > 1 || group_sets.first() != Some(group_set) {
                props.push(ExplainProp::plain(
                    "groups",
                    list(group_sets.iter().map(|g| list(g.iter()))),
                ));
            }
            for (call, field) in calls
                .iter()
                .zip(node.row_type().fields().iter().skip(group_set.len()))
            {
                props.push(ExplainProp::plain(field.name.clone(), call.to_string()));
            }
            props
        }
        AlgOp::Sort {
            collation,
            offset,
            fetch,
        } => {
            let mut props = vec![ExplainProp::plain("sort", collation.to_string())];
            if let Some(offset) = offset {
                props.push(ExplainProp::literal("offset", offset.to_string()));
            }
            if let Some(fetch) = fetch {
                props.push(ExplainProp::literal("fetch", fetch.to_string()));
            }
            props
        }
        AlgOp::SetOp { all, .. } => vec![ExplainProp::plain("all", all.to_string())],
        AlgOp::Modify {
            entity,
            operation,
            update_columns,
            source_exprs,
        } => {
            let mut props = vec![
                ExplainProp::plain("entity", entity.name.clone()),
                ExplainProp::plain("placement", entity.placement.to_string()),
                ExplainProp::plain("operation", operation.verb().to_uppercase()),
            ];
            if !update_columns.is_empty() {
                props.push(ExplainProp::plain("columns", list(update_columns.iter())));
                props.push(ExplainProp::literal("sources", list(source_exprs.iter())));
            }
            props
        }
        AlgOp::ConditionalExecute {
            condition,
            message,
            ..
        } => vec![
            ExplainProp::plain("condition", condition.name()),
            ExplainProp::plain("message", message.clone()),
        ],
        AlgOp::BatchIterator => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::EntityRef;
    use crate::alg::rex::Rex;
    use crate::alg::types::{DataType, TupleType};
    use crate::types::EntityId;

    fn scan() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(7), "emp"),
            TupleType::of(&[("id", DataType::BigInt, false)]),
        )
    }

    #[test]
    fn digest_ignores_field_identity() {
        let a = AlgNode::filter(scan(), Rex::true_lit());
        let b = AlgNode::filter(scan(), Rex::true_lit());
        assert_ne!(a.row_type().fields()[0].id, b.row_type().fields()[0].id);
        assert_eq!(digest(&a), digest(&b));
        assert_eq!(plan_hash(&a), plan_hash(&b));
    }

    #[test]
    fn text_dump_redacts_literals() {
        let node = AlgNode::filter(
            scan(),
            Rex::eq(Rex::input(0, &scan().row_type().fields()[0]), Rex::lit(42i64)),
        );
        let text = explain(&node).to_text(true);
        assert!(text.starts_with("Filter(condition=?)"));
        assert!(text.contains("  Scan(entity=emp"));
    }
}
