//! Quarry: the query-compilation core of a federated relational/document/graph engine.
//!
//! A validated logical [`alg::AlgRoot`] flows through the [`processing::QueryProcessor`]:
//! locking, constraint enforcement, routing into candidate plans, parameterization,
//! cached or fresh optimization by the [`rewrite`] programs, implementation and finally
//! cost-based selection of a single prepared result.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alg;
pub mod builder;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod constraint;
pub mod exec;
pub mod lock;
pub mod processing;
pub mod rewrite;
pub mod routing;
pub mod telemetry;
pub mod types;

pub use alg::{AlgNode, AlgRoot, Kind};
pub use builder::AlgBuilder;
pub use config::ProcessorConfig;
pub use processing::{PrepareOptions, PreparedQuery, QueryProcessor, Statement, Transaction};
pub use types::{QuarryError, Result};
