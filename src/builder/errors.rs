#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Structured errors raised by builder misuse.
///
/// These are fatal to the statement under construction and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// An operation needed more frames than the stack holds.
    #[error("builder stack holds {available} frame(s), {needed} needed")]
    EmptyStack { needed: usize, available: usize },
    /// Field name not found in the inspected frame(s).
    #[error("field '{name}' not found; input fields are: {candidates:?}")]
    FieldNotFound { name: String, candidates: Vec<String> },
    /// Field name not found under a table alias.
    #[error("field '{alias}.{name}' not found; fields are: {candidates:?}")]
    AliasFieldNotFound {
        alias: String,
        name: String,
        candidates: Vec<String>,
    },
    /// Field ordinal outside the frame.
    #[error("field ordinal {ordinal} out of range; input has {count} field(s)")]
    OrdinalOutOfRange { ordinal: usize, count: usize },
    /// Literal rows or names disagree with the field count.
    #[error("values expect {expected} column(s), got {found}")]
    ValuesArity { expected: usize, found: usize },
    /// A grouping set references a key outside the group key.
    #[error("grouping set {set:?} is not a subset of the group key {group:?}")]
    GroupSetNotSubset { set: Vec<usize>, group: Vec<usize> },
    /// DISTINCT or FILTER applied to an aggregate function that rejects it.
    #[error("aggregate function {function} does not allow {feature}")]
    AggregateDisallows {
        function: &'static str,
        feature: &'static str,
    },
    /// Inputs of an operation do not line up.
    #[error("{operation}: {detail}")]
    InputMismatch {
        operation: &'static str,
        detail: String,
    },
    /// Correlated joins accept exactly one correlation variable.
    #[error("join supports exactly one correlation variable, got {count}")]
    CorrelationVariables { count: usize },
}

/// Convenience wrapper that formats builder errors with their codes.
pub struct BuildErrorWithCode<'a>(pub &'a BuildError);

impl fmt::Display for BuildErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

impl BuildError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::EmptyStack { .. } => "EmptyStack",
            BuildError::FieldNotFound { .. } => "FieldNotFound",
            BuildError::AliasFieldNotFound { .. } => "FieldNotFound",
            BuildError::OrdinalOutOfRange { .. } => "OrdinalOutOfRange",
            BuildError::ValuesArity { .. } => "ValuesArity",
            BuildError::GroupSetNotSubset { .. } => "GroupSetNotSubset",
            BuildError::AggregateDisallows { .. } => "AggregateDisallows",
            BuildError::InputMismatch { .. } => "InputMismatch",
            BuildError::CorrelationVariables { .. } => "CorrelationVariables",
        }
    }

    /// Builds a [`BuildError::InputMismatch`].
    pub fn mismatch(operation: &'static str, detail: impl Into<String>) -> Self {
        BuildError::InputMismatch {
            operation,
            detail: detail.into(),
        }
    }
}
