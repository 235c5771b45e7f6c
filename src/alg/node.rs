//! Algebra tree nodes.
//!
//! Nodes are immutable and reference counted. Rewrites never mutate a node in place;
//! they build a new node that may share unchanged sub-trees with the old one.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::alg::rex::{CorrelationId, Rex};
use crate::alg::traits::{Collation, Convention, TraitSet};
use crate::alg::types::{uniquify, DataType, Field, TupleType};
use crate::alg::value::Value;
use crate::types::{AdapterId, EntityId, QuarryError, Result};

/// Where a routed scan or modify executes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Not yet routed.
    Unrouted,
    /// Executes on one adapter.
    Adapter(AdapterId),
    /// Executes on every listed adapter (writes to replicated placements).
    All(Vec<AdapterId>),
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Unrouted => write!(f, "-"),
            Placement::Adapter(id) => write!(f, "@{id}"),
            Placement::All(ids) => {
                write!(f, "@{{")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{id}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Reference to a catalog entity from a scan or modify.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef {
    /// Catalog id.
    pub id: EntityId,
    /// Qualified name.
    pub name: String,
    /// Routing decision.
    pub placement: Placement,
}

impl EntityRef {
    /// Unrouted reference.
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            placement: Placement::Unrouted,
        }
    }

    /// Same entity on a different placement.
    pub fn placed(&self, placement: Placement) -> Self {
        Self {
            placement,
            ..self.clone()
        }
    }
}

/// Join semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinKind {
    /// Matching pairs only.
    Inner,
    /// All left rows, right padded with nulls.
    Left,
    /// All right rows, left padded with nulls.
    Right,
    /// Both sides preserved.
    Full,
    /// Left rows with at least one match; right fields not projected.
    Semi,
    /// Left rows with no match; right fields not projected.
    Anti,
}

impl JoinKind {
    /// Whether the right side's fields appear in the output.
    pub fn projects_right(self) -> bool {
        !matches!(self, JoinKind::Semi | JoinKind::Anti)
    }

    /// Digest spelling.
    pub fn name(self) -> &'static str {
        match self {
            JoinKind::Inner => "inner",
            JoinKind::Left => "left",
            JoinKind::Right => "right",
            JoinKind::Full => "full",
            JoinKind::Semi => "semi",
            JoinKind::Anti => "anti",
        }
    }
}

/// Physical join algorithm; `Logical` before implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinAlgorithm {
    /// Not yet chosen.
    Logical,
    /// Build a hash table on the right equi-keys.
    Hash,
    /// Compare every pair.
    NestedLoop,
}

/// Physical aggregation strategy; `Logical` before implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggStrategy {
    /// Not yet chosen.
    Logical,
    /// Hash the group keys.
    Hash,
    /// Stream over input sorted on the group keys.
    Sorted,
}

/// Aggregate functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggFunction {
    /// `COUNT(*)` or `COUNT(x)`.
    Count,
    /// `SUM(x)`
    Sum,
    /// `MIN(x)`
    Min,
    /// `MAX(x)`
    Max,
    /// `AVG(x)`
    Avg,
    /// Value of the only row; errors on more than one.
    SingleValue,
}

impl AggFunction {
    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            AggFunction::Count => "COUNT",
            AggFunction::Sum => "SUM",
            AggFunction::Min => "MIN",
            AggFunction::Max => "MAX",
            AggFunction::Avg => "AVG",
            AggFunction::SingleValue => "SINGLE_VALUE",
        }
    }

    /// Whether `DISTINCT` may be applied.
    pub fn allows_distinct(self) -> bool {
        !matches!(self, AggFunction::SingleValue)
    }

    /// Whether a `FILTER (WHERE ...)` clause may be applied.
    pub fn allows_filter(self) -> bool {
        !matches!(self, AggFunction::SingleValue)
    }

    /// Result type and nullability for the given argument types.
    pub fn return_type(self, args: &[&Field], grouped: bool) -> (DataType, bool) {
        match self {
            AggFunction::Count => (DataType::BigInt, false),
            AggFunction::Avg => (DataType::Double, true),
            _ => {
                let ty = args.first().map(|f| f.ty.clone()).unwrap_or(DataType::Null);
                let nullable = args.first().map(|f| f.nullable).unwrap_or(true) || !grouped;
                (ty, nullable)
            }
        }
    }
}

/// Aggregate call resolved to input ordinals.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateCall {
    /// Function.
    pub function: AggFunction,
    /// Apply to distinct argument values only.
    pub distinct: bool,
    /// Argument ordinals.
    pub args: Vec<usize>,
    /// Ordinal of a boolean filter field.
    pub filter: Option<usize>,
    /// Ordering inside the group.
    pub order: Collation,
    /// Output field name.
    pub name: String,
    /// Output type.
    pub ty: DataType,
    /// Output nullability.
    pub nullable: bool,
}

impl fmt::Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function.name())?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "${arg}")?;
        }
        write!(f, ")")?;
        if let Some(filter) = self.filter {
            write!(f, " FILTER ${filter}")?;
        }
        if !self.order.is_empty() {
            write!(f, " WITHIN GROUP {}", self.order)?;
        }
        Ok(())
    }
}

/// Set operation family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SetOpKind {
    /// `UNION`
    Union,
    /// `INTERSECT`
    Intersect,
    /// `EXCEPT`
    Minus,
}

/// Data-modification operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModifyOperation {
    /// Append input rows.
    Insert,
    /// Rewrite matching rows.
    Update,
    /// Remove input rows.
    Delete,
    /// Insert-or-update.
    Merge,
}

impl ModifyOperation {
    /// Verb used in constraint messages.
    pub fn verb(self) -> &'static str {
        match self {
            ModifyOperation::Insert => "Insert",
            ModifyOperation::Update => "Update",
            ModifyOperation::Delete => "Delete",
            ModifyOperation::Merge => "Merge",
        }
    }
}

/// Condition a conditional-execute check result must satisfy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckCondition {
    /// The check returned no rows.
    EqualToZero,
    /// The check returned at least one row.
    GreaterZero,
    /// Always proceed.
    True,
    /// Never proceed.
    False,
}

impl CheckCondition {
    /// Whether a check that produced `rows` rows lets execution proceed.
    pub fn holds(self, rows: usize) -> bool {
        match self {
            CheckCondition::EqualToZero => rows == 0,
            CheckCondition::GreaterZero => rows > 0,
            CheckCondition::True => true,
            CheckCondition::False => false,
        }
    }

    /// Digest spelling.
    pub fn name(self) -> &'static str {
        match self {
            CheckCondition::EqualToZero => "EQUAL_TO_ZERO",
            CheckCondition::GreaterZero => "GREATER_ZERO",
            CheckCondition::True => "TRUE",
            CheckCondition::False => "FALSE",
        }
    }
}

/// Operator payload. One case per operator kind; every pass matches exhaustively.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlgOp {
    /// Read all rows of an entity.
    Scan {
        /// Scanned entity.
        entity: EntityRef,
    },
    /// Literal rows.
    Values {
        /// Rows, each matching the node's tuple type.
        tuples: Vec<Vec<Value>>,
    },
    /// Keep rows satisfying a predicate.
    Filter {
        /// Boolean predicate over the input row.
        condition: Rex,
    },
    /// Compute one expression per output field.
    Project {
        /// Output expressions.
        exprs: Vec<Rex>,
    },
    /// Fused filter and projection.
    Calc {
        /// Output expressions.
        exprs: Vec<Rex>,
        /// Optional predicate evaluated before the projection.
        condition: Option<Rex>,
    },
    /// Two-input join.
    Join {
        /// Join semantics.
        kind: JoinKind,
        /// Predicate over the concatenated row.
        condition: Rex,
        /// Physical algorithm.
        algorithm: JoinAlgorithm,
    },
    /// Nested-loop evaluation of the right input once per left row.
    Correlate {
        /// Join semantics.
        kind: JoinKind,
        /// Variable bound to the current left row.
        correlation: CorrelationId,
        /// Left ordinals the right side reads.
        required: Vec<usize>,
    },
    /// N-way inner join gathered for heuristic ordering.
    MultiJoin {
        /// Predicate over the concatenation of all inputs.
        condition: Rex,
    },
    /// Grouping and aggregation.
    Aggregate {
        /// Sorted group key ordinals.
        group_set: Vec<usize>,
        /// Sorted grouping sets, each a subset of `group_set`.
        group_sets: Vec<Vec<usize>>,
        /// Aggregate calls.
        calls: Vec<AggregateCall>,
        /// Physical strategy.
        strategy: AggStrategy,
    },
    /// Order and optionally slice the input.
    Sort {
        /// Sort keys.
        collation: Collation,
        /// Rows to skip.
        offset: Option<u64>,
        /// Maximum rows to return.
        fetch: Option<u64>,
    },
    /// Union, intersect or minus over n inputs.
    SetOp {
        /// Operation.
        kind: SetOpKind,
        /// Keep duplicates.
        all: bool,
    },
    /// Apply the input rows to an entity.
    Modify {
        /// Target entity.
        entity: EntityRef,
        /// Operation.
        operation: ModifyOperation,
        /// Updated column names (update/merge).
        update_columns: Vec<String>,
        /// New-value expressions over the input row, parallel to `update_columns`.
        source_exprs: Vec<Rex>,
    },
    /// Run input 0 (the check); proceed to input 1 only if its row count satisfies `condition`.
    ConditionalExecute {
        /// Condition on the check's row count.
        condition: CheckCondition,
        /// Error message raised when the condition fails.
        message: String,
        /// Human-readable description of the check.
        description: String,
    },
    /// Executes its input once per parameter row of a batch.
    BatchIterator,
}

impl AlgOp {
    /// Operator name without convention prefix.
    pub fn name(&self) -> &'static str {
        match self {
            AlgOp::Scan { .. } => "Scan",
            AlgOp::Values { .. } => "Values",
            AlgOp::Filter { .. } => "Filter",
            AlgOp::Project { .. } => "Project",
            AlgOp::Calc { .. } => "Calc",
            AlgOp::Join { .. } => "Join",
            AlgOp::Correlate { .. } => "Correlate",
            AlgOp::MultiJoin { .. } => "MultiJoin",
            AlgOp::Aggregate { .. } => "Aggregate",
            AlgOp::Sort { .. } => "Sort",
            AlgOp::SetOp { .. } => "SetOp",
            AlgOp::Modify { .. } => "Modify",
            AlgOp::ConditionalExecute { .. } => "ConditionalExecute",
            AlgOp::BatchIterator => "BatchIterator",
        }
    }

    /// Every scalar expression held by the payload.
    pub fn expressions(&self) -> Vec<&Rex> {
        match self {
            AlgOp::Filter { condition }
            | AlgOp::Join { condition, .. }
            | AlgOp::MultiJoin { condition } => vec![condition],
            AlgOp::Project { exprs } => exprs.iter().collect(),
            AlgOp::Calc { exprs, condition } => exprs.iter().chain(condition.iter()).collect(),
            AlgOp::Modify { source_exprs, .. } => source_exprs.iter().collect(),
            AlgOp::Scan { .. }
            | AlgOp::Values { .. }
            | AlgOp::Correlate { .. }
            | AlgOp::Aggregate { .. }
            | AlgOp::Sort { .. }
            | AlgOp::SetOp { .. }
            | AlgOp::ConditionalExecute { .. }
            | AlgOp::BatchIterator => Vec::new(),
        }
    }

    /// Same payload with every scalar expression passed through `f`.
    pub fn map_expressions(&self, f: &mut dyn FnMut(&Rex) -> Rex) -> AlgOp {
        match self {
            AlgOp::Filter { condition } => AlgOp::Filter {
                condition: f(condition),
            },
            AlgOp::Join {
                kind,
                condition,
                algorithm,
            } => AlgOp::Join {
                kind: *kind,
                condition: f(condition),
                algorithm: *algorithm,
            },
            AlgOp::MultiJoin { condition } => AlgOp::MultiJoin {
                condition: f(condition),
            },
            AlgOp::Project { exprs } => AlgOp::Project {
                exprs: exprs.iter().map(|e| f(e)).collect(),
            },
            AlgOp::Calc { exprs, condition } => AlgOp::Calc {
                exprs: exprs.iter().map(|e| f(e)).collect(),
                condition: condition.as_ref().map(|c| f(c)),
            },
            AlgOp::Modify {
                entity,
                operation,
                update_columns,
                source_exprs,
            } => AlgOp::Modify {
                entity: entity.clone(),
                operation: *operation,
                update_columns: update_columns.clone(),
                source_exprs: source_exprs.iter().map(|e| f(e)).collect(),
            },
            other => other.clone(),
        }
    }
}

/// Shared state of one node.
#[derive(Debug)]
pub struct AlgNodeData {
    op: AlgOp,
    inputs: Vec<AlgNode>,
    row_type: TupleType,
    traits: TraitSet,
}

/// Immutable, reference-counted algebra node.
#[derive(Clone, Debug)]
pub struct AlgNode(Arc<AlgNodeData>);

impl AlgNode {
    /// Assembles a node from parts. Callers are responsible for a consistent row type;
    /// the typed constructors below derive it.
    pub fn new(op: AlgOp, inputs: Vec<AlgNode>, row_type: TupleType, traits: TraitSet) -> Self {
        AlgNode(Arc::new(AlgNodeData {
            op,
            inputs,
            row_type,
            traits,
        }))
    }

    /// Operator payload.
    pub fn op(&self) -> &AlgOp {
        &self.0.op
    }

    /// Children in order.
    pub fn inputs(&self) -> &[AlgNode] {
        &self.0.inputs
    }

    /// Child at `i`.
    pub fn input(&self, i: usize) -> Result<&AlgNode> {
        self.0.inputs.get(i).ok_or_else(|| {
            QuarryError::Invalid(format!("{} has no input {i}", self.0.op.name()))
        })
    }

    /// Output tuple type.
    pub fn row_type(&self) -> &TupleType {
        &self.0.row_type
    }

    /// Physical traits.
    pub fn traits(&self) -> &TraitSet {
        &self.0.traits
    }

    /// Execution convention.
    pub fn convention(&self) -> Convention {
        self.0.traits.convention
    }

    /// Number of output fields.
    pub fn field_count(&self) -> usize {
        self.0.row_type.len()
    }

    /// True when both handles point at the same node.
    pub fn ptr_eq(a: &AlgNode, b: &AlgNode) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Structural comparison string.
    pub fn digest(&self) -> String {
        crate::alg::explain::digest(self)
    }

    /// Copy with different children; returns `self` when the children are identical.
    pub fn with_inputs(&self, inputs: Vec<AlgNode>) -> AlgNode {
        if inputs.len() == self.0.inputs.len()
            && inputs
                .iter()
                .zip(&self.0.inputs)
                .all(|(a, b)| AlgNode::ptr_eq(a, b))
        {
            return self.clone();
        }
        AlgNode::new(
            self.0.op.clone(),
            inputs,
            self.0.row_type.clone(),
            self.0.traits.clone(),
        )
    }

    /// Copy with a different payload, keeping children, row type and traits.
    pub fn with_op(&self, op: AlgOp) -> AlgNode {
        AlgNode::new(
            op,
            self.0.inputs.clone(),
            self.0.row_type.clone(),
            self.0.traits.clone(),
        )
    }

    /// Copy with a renamed (same-shape) row type.
    pub fn with_row_type(&self, row_type: TupleType) -> AlgNode {
        AlgNode::new(
            self.0.op.clone(),
            self.0.inputs.clone(),
            row_type,
            self.0.traits.clone(),
        )
    }

    /// Copy with different traits.
    pub fn with_traits(&self, traits: TraitSet) -> AlgNode {
        AlgNode::new(
            self.0.op.clone(),
            self.0.inputs.clone(),
            self.0.row_type.clone(),
            traits,
        )
    }

    /// Copy with a different convention.
    pub fn with_convention(&self, convention: Convention) -> AlgNode {
        self.with_traits(self.0.traits.with_convention(convention))
    }

    /// Pre-order walk over the tree.
    pub fn walk(&self, f: &mut dyn FnMut(&AlgNode)) {
        f(self);
        for input in self.inputs() {
            input.walk(f);
        }
    }

    // ---- typed constructors -------------------------------------------------

    /// Entity scan.
    pub fn scan(entity: EntityRef, row_type: TupleType) -> AlgNode {
        AlgNode::new(AlgOp::Scan { entity }, Vec::new(), row_type, TraitSet::logical())
    }

    /// Literal rows; validates arity.
    pub fn values(row_type: TupleType, tuples: Vec<Vec<Value>>) -> Result<AlgNode> {
        if let Some(bad) = tuples.iter().find(|t| t.len() != row_type.len()) {
            return Err(crate::builder::BuildError::ValuesArity {
                expected: row_type.len(),
                found: bad.len(),
            }
            .into());
        }
        Ok(AlgNode::new(
            AlgOp::Values { tuples },
            Vec::new(),
            row_type,
            TraitSet::logical(),
        ))
    }

    /// Zero-row leaf with the given schema.
    pub fn empty(row_type: TupleType) -> AlgNode {
        AlgNode::new(
            AlgOp::Values { tuples: Vec::new() },
            Vec::new(),
            row_type,
            TraitSet::logical(),
        )
    }

    /// Filter preserving the input's row type and collation.
    pub fn filter(input: AlgNode, condition: Rex) -> AlgNode {
        let row_type = input.row_type().clone();
        let traits = input.traits().clone();
        AlgNode::new(AlgOp::Filter { condition }, vec![input], row_type, traits)
    }

    /// Projection. Pass-through fields keep their identity.
    pub fn project(input: AlgNode, exprs: Vec<Rex>, names: Vec<String>) -> AlgNode {
        let row_type = projected_type(&input, &exprs, names);
        let traits = input
            .traits()
            .with_collation(project_collation(&input.traits().collation, &exprs));
        AlgNode::new(AlgOp::Project { exprs }, vec![input], row_type, traits)
    }

    /// Fused filter/projection.
    pub fn calc(
        input: AlgNode,
        exprs: Vec<Rex>,
        names: Vec<String>,
        condition: Option<Rex>,
    ) -> AlgNode {
        let row_type = projected_type(&input, &exprs, names);
        let traits = input
            .traits()
            .with_collation(project_collation(&input.traits().collation, &exprs));
        AlgNode::new(AlgOp::Calc { exprs, condition }, vec![input], row_type, traits)
    }

    /// Two-input join.
    pub fn join(kind: JoinKind, left: AlgNode, right: AlgNode, condition: Rex) -> AlgNode {
        let row_type = join_type(kind, &left, &right);
        AlgNode::new(
            AlgOp::Join {
                kind,
                condition,
                algorithm: JoinAlgorithm::Logical,
            },
            vec![left, right],
            row_type,
            TraitSet::logical(),
        )
    }

    /// Correlate binding `correlation` to each left row.
    pub fn correlate(
        kind: JoinKind,
        left: AlgNode,
        right: AlgNode,
        correlation: CorrelationId,
        required: Vec<usize>,
    ) -> AlgNode {
        let row_type = join_type(kind, &left, &right);
        AlgNode::new(
            AlgOp::Correlate {
                kind,
                correlation,
                required,
            },
            vec![left, right],
            row_type,
            TraitSet::logical(),
        )
    }

    /// N-way inner join.
    pub fn multi_join(inputs: Vec<AlgNode>, condition: Rex) -> AlgNode {
        let fields = inputs
            .iter()
            .flat_map(|i| i.row_type().fields().iter().cloned())
            .collect();
        AlgNode::new(
            AlgOp::MultiJoin { condition },
            inputs,
            TupleType::new(fields),
            TraitSet::logical(),
        )
    }

    /// Aggregate; the output is the group fields followed by one field per call.
    pub fn aggregate(
        input: AlgNode,
        group_set: Vec<usize>,
        group_sets: Vec<Vec<usize>>,
        calls: Vec<AggregateCall>,
    ) -> AlgNode {
        let in_fields = input.row_type().fields();
        let mut fields: Vec<Field> = group_set
            .iter()
            .filter_map(|&i| in_fields.get(i).cloned())
            .map(|mut f| {
                f.nullable |= group_sets.len() > 1;
                f
            })
            .collect();
        fields.extend(
            calls
                .iter()
                .map(|call| Field::new(call.name.clone(), call.ty.clone(), call.nullable)),
        );
        let names = uniquify(fields.iter().map(|f| f.name.clone()).collect());
        let row_type = TupleType::new(fields).renamed(&names);
        AlgNode::new(
            AlgOp::Aggregate {
                group_set,
                group_sets,
                calls,
                strategy: AggStrategy::Logical,
            },
            vec![input],
            row_type,
            TraitSet::logical(),
        )
    }

    /// Sort with optional offset/fetch.
    pub fn sort(
        input: AlgNode,
        collation: Collation,
        offset: Option<u64>,
        fetch: Option<u64>,
    ) -> AlgNode {
        let row_type = input.row_type().clone();
        let traits = input.traits().with_collation(collation.clone());
        AlgNode::new(
            AlgOp::Sort {
                collation,
                offset,
                fetch,
            },
            vec![input],
            row_type,
            traits,
        )
    }

    /// Set operation; field names come from the first input.
    pub fn set_op(kind: SetOpKind, all: bool, inputs: Vec<AlgNode>) -> AlgNode {
        let mut fields: Vec<Field> = inputs
            .first()
            .map(|i| i.row_type().fields().to_vec())
            .unwrap_or_default();
        for input in inputs.iter().skip(1) {
            for (field, other) in fields.iter_mut().zip(input.row_type().fields()) {
                field.ty = field.ty.least_restrictive(&other.ty);
                field.nullable |= other.nullable;
            }
        }
        AlgNode::new(
            AlgOp::SetOp { kind, all },
            inputs,
            TupleType::new(fields),
            TraitSet::logical(),
        )
    }

    /// Data modification returning a row count.
    pub fn modify(
        input: AlgNode,
        entity: EntityRef,
        operation: ModifyOperation,
        update_columns: Vec<String>,
        source_exprs: Vec<Rex>,
    ) -> AlgNode {
        AlgNode::new(
            AlgOp::Modify {
                entity,
                operation,
                update_columns,
                source_exprs,
            },
            vec![input],
            TupleType::of(&[("ROWCOUNT", DataType::BigInt, false)]),
            TraitSet::logical(),
        )
    }

    /// Guard `guarded` by `check`.
    pub fn conditional_execute(
        check: AlgNode,
        guarded: AlgNode,
        condition: CheckCondition,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> AlgNode {
        let row_type = guarded.row_type().clone();
        AlgNode::new(
            AlgOp::ConditionalExecute {
                condition,
                message: message.into(),
                description: description.into(),
            },
            vec![check, guarded],
            row_type,
            TraitSet::logical(),
        )
    }

    /// Batch driver over a parameterized input.
    pub fn batch_iterator(input: AlgNode) -> AlgNode {
        let row_type = input.row_type().clone();
        AlgNode::new(AlgOp::BatchIterator, vec![input], row_type, TraitSet::logical())
    }
}

fn projected_type(input: &AlgNode, exprs: &[Rex], names: Vec<String>) -> TupleType {
    let names = uniquify(names);
    let fields = exprs
        .iter()
        .zip(names)
        .map(|(expr, name)| match expr.as_input_ref() {
            Some(i) => match input.row_type().field(i) {
                Some(field) => field.renamed(name),
                None => Field::new(name, expr.data_type(), expr.nullable()),
            },
            None => Field::new(name, expr.data_type(), expr.nullable()),
        })
        .collect();
    TupleType::new(fields)
}

pub(crate) fn project_collation(input: &Collation, exprs: &[Rex]) -> Collation {
    let mut keys = Vec::new();
    for key in input.keys() {
        match exprs.iter().position(|e| e.as_input_ref() == Some(key.field)) {
            Some(pos) => keys.push(crate::alg::traits::FieldCollation { field: pos, ..*key }),
            None => break,
        }
    }
    Collation(keys)
}

fn join_type(kind: JoinKind, left: &AlgNode, right: &AlgNode) -> TupleType {
    if !kind.projects_right() {
        return left.row_type().clone();
    }
    TupleType::join(
        left.row_type(),
        right.row_type(),
        matches!(kind, JoinKind::Right | JoinKind::Full),
        matches!(kind, JoinKind::Left | JoinKind::Full),
    )
}

impl PartialEq for AlgNode {
    fn eq(&self, other: &Self) -> bool {
        AlgNode::ptr_eq(self, other) || self.digest() == other.digest()
    }
}

impl Eq for AlgNode {}

impl Hash for AlgNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest().hash(state);
    }
}

/// Correlation variables referenced anywhere in the tree.
pub fn correlations_in(node: &AlgNode) -> BTreeSet<CorrelationId> {
    let mut ids = BTreeSet::new();
    node.walk(&mut |n| {
        for rex in n.op().expressions() {
            ids.extend(rex.correlation_ids());
        }
    });
    ids
}

/// Bottom-up rebuild: `f` receives each node after its inputs and the trees of
/// its sub-query expressions have been rebuilt.
pub fn transform(node: &AlgNode, f: &mut dyn FnMut(AlgNode) -> Result<AlgNode>) -> Result<AlgNode> {
    let mut inputs = Vec::with_capacity(node.inputs().len());
    for input in node.inputs() {
        inputs.push(transform(input, f)?);
    }
    let mut rebuilt = node.with_inputs(inputs);
    if rebuilt.op().expressions().iter().any(|r| r.contains_subquery()) {
        let mut failure = None;
        let op = rebuilt.op().map_expressions(&mut |rex| {
            rex.rewrite(&mut |r| match r {
                Rex::SubQuery {
                    kind,
                    operands,
                    rel,
                    ty,
                } => match transform(rel, &mut *f) {
                    Ok(rel) => Some(Rex::SubQuery {
                        kind: *kind,
                        operands: operands.clone(),
                        rel,
                        ty: ty.clone(),
                    }),
                    Err(err) => {
                        failure.get_or_insert(err);
                        None
                    }
                },
                _ => None,
            })
        });
        if let Some(err) = failure {
            return Err(err);
        }
        rebuilt = rebuilt.with_op(op);
    }
    f(rebuilt)
}

/// Statement kind of a root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Query.
    Select,
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
    /// `MERGE`
    Merge,
    /// Anything else (DDL passthrough, procedures).
    Other,
}

impl Kind {
    /// True for the data-modification kinds.
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            Kind::Insert | Kind::Update | Kind::Delete | Kind::Merge
        )
    }
}

/// Entry point of a query: root node plus the shape the caller expects back.
#[derive(Clone, Debug)]
pub struct AlgRoot {
    /// Root node.
    pub node: AlgNode,
    /// Row type produced by validation.
    pub validated_row_type: TupleType,
    /// Statement kind.
    pub kind: Kind,
    /// Output mapping: `(ordinal in node, output name)`.
    pub fields: Vec<(usize, String)>,
    /// Required output order.
    pub collation: Collation,
}

impl AlgRoot {
    /// Root whose output mapping is the identity over `node`'s fields.
    pub fn of(node: AlgNode, kind: Kind) -> Self {
        let fields = node
            .row_type()
            .fields()
            .iter()
            .enumerate()
            .map(|(i, f)| (i, f.name.clone()))
            .collect();
        Self {
            validated_row_type: node.row_type().clone(),
            collation: node.traits().collation.clone(),
            node,
            kind,
            fields,
        }
    }

    /// Root with an explicit output mapping; every ordinal must resolve.
    pub fn new(
        node: AlgNode,
        validated_row_type: TupleType,
        kind: Kind,
        fields: Vec<(usize, String)>,
        collation: Collation,
    ) -> Result<Self> {
        let root = Self {
            node,
            validated_row_type,
            kind,
            fields,
            collation,
        };
        root.check_fields()?;
        Ok(root)
    }

    /// Same root over a replacement node with the same number of fields.
    pub fn with_node(&self, node: AlgNode) -> Result<Self> {
        let root = Self {
            node,
            ..self.clone()
        };
        root.check_fields()?;
        Ok(root)
    }

    /// True when the output mapping selects every field in order.
    pub fn is_trivial(&self) -> bool {
        self.fields.len() == self.node.field_count()
            && self.fields.iter().enumerate().all(|(i, (ord, _))| i == *ord)
    }

    fn check_fields(&self) -> Result<()> {
        let count = self.node.field_count();
        match self.fields.iter().find(|(ord, _)| *ord >= count) {
            Some((ord, name)) => Err(QuarryError::Invalid(format!(
                "root field '{name}' maps to ordinal {ord} but the root has {count} fields"
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(1), "t"),
            TupleType::of(&[("a", DataType::BigInt, false), ("b", DataType::Varchar, true)]),
        )
    }

    #[test]
    fn project_keeps_identity_of_passthrough_fields() {
        let input = scan();
        let a = input.row_type().fields()[0].clone();
        let project = AlgNode::project(input, vec![Rex::input(0, &a)], vec!["x".into()]);
        assert_eq!(project.row_type().fields()[0].id, a.id);
        assert_eq!(project.row_type().names(), vec!["x"]);
    }

    #[test]
    fn semi_join_projects_left_only() {
        let join = AlgNode::join(JoinKind::Semi, scan(), scan(), Rex::true_lit());
        assert_eq!(join.field_count(), 2);
        let left = AlgNode::join(JoinKind::Left, scan(), scan(), Rex::true_lit());
        assert_eq!(left.field_count(), 4);
        assert!(left.row_type().fields()[2].nullable);
    }

    #[test]
    fn root_rejects_dangling_field_mapping() {
        let node = scan();
        let err = AlgRoot::new(
            node.clone(),
            node.row_type().clone(),
            Kind::Select,
            vec![(5, "z".into())],
            Collation::empty(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn with_inputs_shares_unchanged_nodes() {
        let filter = AlgNode::filter(scan(), Rex::true_lit());
        let same = filter.with_inputs(filter.inputs().to_vec());
        assert!(AlgNode::ptr_eq(&filter, &same));
    }
}
