//! Identifier newtypes and the crate-wide error type.

use std::fmt;

use crate::builder::BuildError;

/// Catalog identifier of a table, collection or graph.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EntityId(pub u64);
/// Identifier of one horizontal partition of an entity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PartitionId(pub u64);
/// Storage adapter that holds a placement of an entity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct AdapterId(pub u32);
/// Stable identity of a tuple field; survives renames.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FieldId(pub u64);
/// Transaction identifier used by the lock manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by every stage of the compilation pipeline.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QuarryError {
    /// Builder misuse; fatal to the statement.
    #[error("construction: {0}")]
    Build(#[from] BuildError),
    /// Every registered router failed or abstained.
    #[error("no router was able to route the query")]
    NoRoute,
    /// A single router failed; absorbed by the router set.
    #[error("routing: {0}")]
    Routing(String),
    /// Cost-based search found no tree satisfying the required traits.
    #[error("could not implement: {0}")]
    CouldNotImplement(String),
    /// A generated check query reported a violation.
    #[error("{0}")]
    ConstraintViolation(String),
    /// Granting the lock request would deadlock.
    #[error("deadlock detected for transaction {txn}")]
    Deadlock {
        /// Transaction chosen as the victim.
        txn: TxnId,
    },
    /// Feature deliberately left unimplemented.
    #[error("{0}")]
    NotImplemented(String),
    /// Catalog lookup miss.
    #[error("not found: {0}")]
    NotFound(String),
    /// Invalid argument or malformed tree.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// A deadline expired before a stage produced a result.
    #[error("{stage} exceeded its deadline after {elapsed_ms}ms")]
    Timeout {
        /// Stage that ran out of time.
        stage: &'static str,
        /// Time spent before giving up.
        elapsed_ms: u64,
    },
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

impl QuarryError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QuarryError::Build(err) => err.code(),
            QuarryError::NoRoute => "NoRoute",
            QuarryError::Routing(_) => "Routing",
            QuarryError::CouldNotImplement(_) => "CouldNotImplement",
            QuarryError::ConstraintViolation(_) => "ConstraintViolation",
            QuarryError::Deadlock { .. } => "Deadlock",
            QuarryError::NotImplemented(_) => "NotImplemented",
            QuarryError::NotFound(_) => "NotFound",
            QuarryError::Invalid(_) => "Invalid",
            QuarryError::Timeout { .. } => "Timeout",
            QuarryError::Config(_) => "Config",
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QuarryError>;
