//! Algebra IR: immutable typed operator trees and scalar expressions.

pub mod explain;
pub mod metadata;
pub mod node;
pub mod rex;
pub mod traits;
pub mod types;
pub mod value;

pub use explain::{digest, dump_plan, op_digest, explain, ExplainFormat, ExplainNode, ExplainProp};
pub use node::{
    AggFunction, AggStrategy, AggregateCall, AlgNode, AlgOp, AlgRoot, CheckCondition, EntityRef,
    JoinAlgorithm, JoinKind, Kind, ModifyOperation, Placement, SetOpKind,
};
pub use rex::{CorrelationId, Op, Rex, SubQueryKind};
pub use traits::{Collation, Convention, DataModel, Direction, FieldCollation, NullDirection, TraitSet};
pub use types::{DataType, Field, TupleType};
pub use value::Value;
