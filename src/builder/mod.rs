//! Stack-based builder of algebra trees.
//!
//! [`AlgBuilder`] keeps a stack of immutable frames. Leaf operations push a
//! frame, unary operations replace the top frame and n-ary operations pop their
//! inputs and push the result. Field lookups resolve names and table aliases
//! against the frames on top of the stack.
//!
//! Construction is opportunistic: an identity projection is a no-op, an
//! always-false filter becomes empty literal rows, adjacent projections merge
//! and a limit fuses into an unbounded sort below it. The resulting trees are
//! what the rewrite programs expect as input.

mod aggregate;
mod errors;
mod frame;
pub mod simplify;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

pub use aggregate::{AggCall, GroupKey};
pub use errors::{BuildError, BuildErrorWithCode};

use crate::alg::metadata::{are_rows_unique, min_row_count};
use crate::alg::node::{
    correlations_in, AggFunction, AggregateCall, AlgNode, AlgOp, CheckCondition, EntityRef,
    JoinKind, ModifyOperation, SetOpKind,
};
use crate::alg::rex::{CorrelationId, Op, Rex, SubQueryKind};
use crate::alg::traits::{Collation, Direction, FieldCollation, NullDirection};
use crate::alg::types::{uniquify, DataType, Field, TupleType};
use crate::alg::value::Value;
use crate::catalog::{EntityDef, Snapshot};
use crate::types::{QuarryError, Result};

use aggregate::Registrar;
use frame::{Aliases, Frame};
use simplify::{is_always_false, simplify};

/// Knobs of the builder's opportunistic simplifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Simplify filter and join predicates as they are added.
    pub simplify: bool,
    /// Merge a projection into the projection directly below it.
    pub merge_projects: bool,
    /// Growth in expression size tolerated when merging projections.
    pub bloat: usize,
    /// Compute identical aggregate calls once.
    pub dedup_aggregate_calls: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            simplify: true,
            merge_projects: true,
            bloat: 100,
            dedup_aggregate_calls: true,
        }
    }
}

/// Sort key over an expression of the current frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    /// Key expression.
    pub expr: Rex,
    /// Direction.
    pub direction: Direction,
    /// Null placement.
    pub nulls: NullDirection,
}

impl SortKey {
    /// Ascending, nulls last.
    pub fn asc(expr: Rex) -> Self {
        Self {
            expr,
            direction: Direction::Ascending,
            nulls: NullDirection::Last,
        }
    }

    /// Descending, nulls first.
    pub fn desc(expr: Rex) -> Self {
        Self {
            expr,
            direction: Direction::Descending,
            nulls: NullDirection::First,
        }
    }

    /// Same key with nulls placed first.
    pub fn nulls_first(self) -> Self {
        Self {
            nulls: NullDirection::First,
            ..self
        }
    }

    /// Same key with nulls placed last.
    pub fn nulls_last(self) -> Self {
        Self {
            nulls: NullDirection::Last,
            ..self
        }
    }
}

/// Fluent constructor of algebra trees over a catalog snapshot.
#[derive(Clone)]
pub struct AlgBuilder {
    stack: Vec<Frame>,
    snapshot: Option<Arc<dyn Snapshot>>,
    config: BuilderConfig,
}

impl std::fmt::Debug for AlgBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgBuilder")
            .field("stack", &self.stack)
            .field("snapshot", &self.snapshot.as_ref().map(|_| "<dyn Snapshot>"))
            .field("config", &self.config)
            .finish()
    }
}

impl AlgBuilder {
    /// Builder resolving scans against `snapshot`.
    pub fn new(snapshot: Arc<dyn Snapshot>) -> Self {
        Self {
            stack: Vec::new(),
            snapshot: Some(snapshot),
            config: BuilderConfig::default(),
        }
    }

    /// Builder without a catalog; only literal rows and pushed nodes are available.
    pub fn detached() -> Self {
        Self {
            stack: Vec::new(),
            snapshot: None,
            config: BuilderConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    // ---- stack --------------------------------------------------------------

    /// Pushes an existing node without aliases.
    pub fn push(&mut self, node: AlgNode) -> &mut Self {
        self.stack.push(Frame::new(node, None));
        self
    }

    /// Pushes several nodes in order.
    pub fn push_all(&mut self, nodes: impl IntoIterator<Item = AlgNode>) -> &mut Self {
        for node in nodes {
            self.push(node);
        }
        self
    }

    /// Pops the top node.
    pub fn build(&mut self) -> Result<AlgNode> {
        Ok(self.pop_frame()?.node)
    }

    /// Top node without popping.
    pub fn peek(&self) -> Result<&AlgNode> {
        self.peek_n(0)
    }

    /// Node `n` positions below the top.
    pub fn peek_n(&self, n: usize) -> Result<&AlgNode> {
        Ok(&self.frame(n)?.node)
    }

    /// Number of frames on the stack.
    pub fn size(&self) -> usize {
        self.stack.len()
    }

    /// Drops every frame.
    pub fn clear(&mut self) {
        self.stack.clear();
    }

    fn require(&self, needed: usize) -> Result<()> {
        if self.stack.len() < needed {
            return Err(BuildError::EmptyStack {
                needed,
                available: self.stack.len(),
            }
            .into());
        }
        Ok(())
    }

    fn frame(&self, n: usize) -> Result<&Frame> {
        self.require(n + 1)?;
        Ok(&self.stack[self.stack.len() - 1 - n])
    }

    fn pop_frame(&mut self) -> Result<Frame> {
        self.require(1)?;
        self.stack.pop().ok_or(QuarryError::Build(BuildError::EmptyStack {
            needed: 1,
            available: 0,
        }))
    }

    fn replace_top(&mut self, frame: Frame) -> Result<&mut Self> {
        self.pop_frame()?;
        self.stack.push(frame);
        Ok(self)
    }

    /// Frame of input `input_ordinal` among the top `input_count`; ordinal 0 is the deepest.
    fn input_frame(&self, input_count: usize, input_ordinal: usize) -> Result<&Frame> {
        self.require(input_count)?;
        if input_ordinal >= input_count {
            return Err(BuildError::OrdinalOutOfRange {
                ordinal: input_ordinal,
                count: input_count,
            }
            .into());
        }
        self.frame(input_count - 1 - input_ordinal)
    }

    // ---- leaves -------------------------------------------------------------

    /// Pushes a scan of the named entity, aliased by its unqualified name.
    pub fn scan(&mut self, name: &str) -> Result<&mut Self> {
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or_else(|| QuarryError::Invalid("scan requires a catalog snapshot".into()))?;
        let entity = snapshot.entity(name)?;
        Ok(self.scan_entity(&entity))
    }

    /// Pushes a scan of a resolved entity.
    pub fn scan_entity(&mut self, entity: &EntityDef) -> &mut Self {
        let alias = entity.name.rsplit('.').next().unwrap_or(&entity.name).to_string();
        let node = AlgNode::scan(entity.entity_ref(), entity.row_type());
        self.stack.push(Frame::new(node, Some(&alias)));
        self
    }

    /// Pushes literal rows; column types are inferred from the non-null values.
    pub fn values(&mut self, names: &[&str], rows: Vec<Vec<Value>>) -> Result<&mut Self> {
        if let Some(bad) = rows.iter().find(|r| r.len() != names.len()) {
            return Err(BuildError::ValuesArity {
                expected: names.len(),
                found: bad.len(),
            }
            .into());
        }
        let fields = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let column = rows.iter().filter_map(|r| r.get(i));
                let ty = column
                    .clone()
                    .filter(|v| !v.is_null())
                    .map(DataType::of)
                    .reduce(|a, b| a.least_restrictive(&b))
                    .unwrap_or(DataType::Null);
                let nullable = column.clone().any(Value::is_null);
                Field::new(*name, ty, nullable)
            })
            .collect();
        let node = AlgNode::values(TupleType::new(fields), rows)?;
        self.stack.push(Frame::new(node, None));
        Ok(self)
    }

    /// Pushes literal rows of an explicit type.
    pub fn values_typed(&mut self, row_type: TupleType, rows: Vec<Vec<Value>>) -> Result<&mut Self> {
        let node = AlgNode::values(row_type, rows)?;
        self.stack.push(Frame::new(node, None));
        Ok(self)
    }

    /// Replaces the top frame with zero rows of the same schema.
    pub fn empty(&mut self) -> Result<&mut Self> {
        let frame = self.frame(0)?.clone();
        let node = AlgNode::empty(frame.node.row_type().clone());
        self.replace_top(frame.replaced(node))
    }

    // ---- field references ---------------------------------------------------

    /// Reference to the named field of the top frame.
    pub fn field(&self, name: &str) -> Result<Rex> {
        self.field_of(1, 0, name)
    }

    /// Reference to field `ordinal` of the top frame.
    pub fn field_at(&self, ordinal: usize) -> Result<Rex> {
        self.field_of_at(1, 0, ordinal)
    }

    /// Reference to a named field of one of the top `input_count` frames, offset
    /// into their concatenated row.
    pub fn field_of(&self, input_count: usize, input_ordinal: usize, name: &str) -> Result<Rex> {
        let row_type = self.input_frame(input_count, input_ordinal)?.node.row_type();
        match row_type.index_of(name) {
            Some(ordinal) => self.field_of_at(input_count, input_ordinal, ordinal),
            None => Err(BuildError::FieldNotFound {
                name: name.to_string(),
                candidates: row_type.names(),
            }
            .into()),
        }
    }

    /// Reference by ordinal into one of the top `input_count` frames.
    pub fn field_of_at(&self, input_count: usize, input_ordinal: usize, ordinal: usize) -> Result<Rex> {
        let frame = self.input_frame(input_count, input_ordinal)?;
        let field = frame
            .node
            .row_type()
            .field(ordinal)
            .ok_or(BuildError::OrdinalOutOfRange {
                ordinal,
                count: frame.node.field_count(),
            })?;
        let offset = (0..input_ordinal)
            .map(|i| self.input_frame(input_count, i).map(|f| f.node.field_count()))
            .sum::<Result<usize>>()?;
        Ok(Rex::input(offset + ordinal, field))
    }

    /// Reference to `alias.name` in the top frame.
    pub fn field_alias(&self, alias: &str, name: &str) -> Result<Rex> {
        self.field_alias_of(1, alias, name)
    }

    /// Reference to `alias.name` searched across the top `input_count` frames.
    pub fn field_alias_of(&self, input_count: usize, alias: &str, name: &str) -> Result<Rex> {
        let mut candidates = Vec::new();
        for input_ordinal in 0..input_count {
            let frame = self.input_frame(input_count, input_ordinal)?;
            for (i, field) in frame.node.row_type().fields().iter().enumerate() {
                if field.name == name && frame.has_alias(i, alias) {
                    return self.field_of_at(input_count, input_ordinal, i);
                }
                let aliases = frame.aliases.get(i).map(|a| a.as_slice()).unwrap_or(&[]);
                if aliases.is_empty() {
                    candidates.push(field.name.clone());
                }
                candidates.extend(aliases.iter().map(|a| format!("{a}.{}", field.name)));
            }
        }
        Err(BuildError::AliasFieldNotFound {
            alias: alias.to_string(),
            name: name.to_string(),
            candidates,
        }
        .into())
    }

    /// References to every field of the top frame.
    pub fn fields(&self) -> Result<Vec<Rex>> {
        let count = self.peek()?.field_count();
        (0..count).map(|i| self.field_at(i)).collect()
    }

    /// References to the given ordinals of the top frame.
    pub fn fields_at(&self, ordinals: &[usize]) -> Result<Vec<Rex>> {
        ordinals.iter().map(|&i| self.field_at(i)).collect()
    }

    /// References to the named fields of the top frame.
    pub fn fields_named(&self, names: &[&str]) -> Result<Vec<Rex>> {
        names.iter().map(|n| self.field(n)).collect()
    }

    // ---- scalar expressions -------------------------------------------------

    /// Literal.
    pub fn literal(&self, value: impl Into<Value>) -> Rex {
        Rex::lit(value)
    }

    /// Operator call.
    pub fn call(&self, op: Op, operands: Vec<Rex>) -> Rex {
        Rex::call(op, operands)
    }

    /// Conjunction.
    pub fn and(&self, operands: Vec<Rex>) -> Rex {
        Rex::and_all(operands)
    }

    /// Disjunction.
    pub fn or(&self, operands: Vec<Rex>) -> Rex {
        Rex::or_all(operands)
    }

    /// Negation.
    pub fn not(&self, operand: Rex) -> Rex {
        Rex::not(operand)
    }

    /// `a = b`
    pub fn equals(&self, a: Rex, b: Rex) -> Rex {
        Rex::eq(a, b)
    }

    /// `a > b`
    pub fn greater_than(&self, a: Rex, b: Rex) -> Rex {
        Rex::call(Op::Gt, vec![a, b])
    }

    /// `a < b`
    pub fn less_than(&self, a: Rex, b: Rex) -> Rex {
        Rex::call(Op::Lt, vec![a, b])
    }

    /// `x IS NULL`
    pub fn is_null(&self, operand: Rex) -> Rex {
        Rex::call(Op::IsNull, vec![operand])
    }

    /// `x IS NOT NULL`
    pub fn is_not_null(&self, operand: Rex) -> Rex {
        Rex::call(Op::IsNotNull, vec![operand])
    }

    /// Parameter placeholder.
    pub fn dynamic_param(&self, index: usize, ty: DataType) -> Rex {
        Rex::DynamicParam { index, ty }
    }

    /// Correlation variable bound to the rows of the top frame.
    pub fn correl(&self, id: CorrelationId) -> Result<Rex> {
        Ok(Rex::CorrelVariable {
            id,
            row_type: self.peek()?.row_type().clone(),
        })
    }

    /// Named field of a record-valued expression such as a correlation variable.
    pub fn field_access(&self, expr: Rex, name: &str) -> Result<Rex> {
        let DataType::Struct(fields) = expr.data_type() else {
            return Err(BuildError::mismatch("field access", format!("{expr} is not a record")).into());
        };
        match fields.iter().position(|(n, _)| n == name) {
            Some(index) => Ok(Rex::FieldAccess {
                ty: fields[index].1.clone(),
                expr: Box::new(expr),
                index,
                name: name.to_string(),
            }),
            None => Err(BuildError::FieldNotFound {
                name: name.to_string(),
                candidates: fields.into_iter().map(|(n, _)| n).collect(),
            }
            .into()),
        }
    }

    /// `EXISTS (rel)`
    pub fn exists(&self, rel: AlgNode) -> Rex {
        Rex::SubQuery {
            kind: SubQueryKind::Exists,
            operands: Vec::new(),
            rel,
            ty: DataType::Boolean,
        }
    }

    /// `(operands) IN (rel)`
    pub fn in_query(&self, operands: Vec<Rex>, rel: AlgNode) -> Result<Rex> {
        if operands.len() != rel.field_count() {
            return Err(BuildError::mismatch(
                "in",
                format!(
                    "{} operand(s) against a sub-query of {} field(s)",
                    operands.len(),
                    rel.field_count()
                ),
            )
            .into());
        }
        Ok(Rex::SubQuery {
            kind: SubQueryKind::In,
            operands,
            rel,
            ty: DataType::Boolean,
        })
    }

    /// Scalar sub-query; `rel` must produce one field.
    pub fn scalar_query(&self, rel: AlgNode) -> Result<Rex> {
        let ty = match rel.row_type().fields() {
            [field] => field.ty.clone(),
            other => {
                return Err(BuildError::mismatch(
                    "scalar query",
                    format!("expected one field, got {}", other.len()),
                )
                .into())
            }
        };
        Ok(Rex::SubQuery {
            kind: SubQueryKind::Scalar,
            operands: Vec::new(),
            rel,
            ty,
        })
    }

    /// Group key over expressions of the top frame.
    pub fn group_key(&self, nodes: Vec<Rex>) -> GroupKey {
        GroupKey::new(nodes)
    }

    /// Aggregate call over expressions of the top frame.
    pub fn agg(&self, function: AggFunction, operands: Vec<Rex>) -> AggCall {
        AggCall::new(function, operands)
    }

    // ---- relational operators -----------------------------------------------

    /// Re-aliases every field of the top frame.
    pub fn alias(&mut self, alias: &str) -> Result<&mut Self> {
        let node = self.peek()?.clone();
        self.replace_top(Frame::new(node, Some(alias)))
    }

    /// Filters the top frame by the conjunction of `conditions`.
    pub fn filter(&mut self, conditions: Vec<Rex>) -> Result<&mut Self> {
        let frame = self.frame(0)?.clone();
        let mut condition = Rex::and_all(conditions);
        if self.config.simplify {
            condition = simplify(&condition);
        }
        if condition.is_true() {
            return Ok(self);
        }
        let node = if is_always_false(&condition) {
            trace!(condition = %condition, "builder.filter.always_false");
            AlgNode::empty(frame.node.row_type().clone())
        } else {
            AlgNode::filter(frame.node.clone(), condition)
        };
        self.replace_top(frame.replaced(node))
    }

    /// Projects the top frame; names come from pass-through fields or `$f<i>`.
    pub fn project(&mut self, exprs: Vec<Rex>) -> Result<&mut Self> {
        self.project_named(exprs, Vec::new(), false)
    }

    /// Projects the top frame with explicit names. Unless `force` is set, an
    /// identity projection is dropped or turned into a rename.
    pub fn project_named(
        &mut self,
        exprs: Vec<Rex>,
        names: Vec<Option<String>>,
        force: bool,
    ) -> Result<&mut Self> {
        let frame = self.frame(0)?.clone();
        let input = frame.node.clone();
        let in_type = input.row_type();
        for expr in &exprs {
            if let Some(&bad) = expr.input_refs().iter().find(|&&i| i >= in_type.len()) {
                return Err(BuildError::OrdinalOutOfRange {
                    ordinal: bad,
                    count: in_type.len(),
                }
                .into());
            }
        }
        let out_names: Vec<String> = exprs
            .iter()
            .enumerate()
            .map(|(i, expr)| {
                names.get(i).cloned().flatten().unwrap_or_else(|| {
                    match expr.as_input_ref().and_then(|j| in_type.field(j)) {
                        Some(field) => field.name.clone(),
                        None => format!("$f{i}"),
                    }
                })
            })
            .collect();
        let aliases: Vec<Aliases> = exprs
            .iter()
            .map(|e| {
                e.as_input_ref()
                    .and_then(|j| frame.aliases.get(j).cloned())
                    .unwrap_or_default()
            })
            .collect();

        if !force && is_identity(&exprs, in_type.len()) {
            let unique = uniquify(out_names);
            if unique == in_type.names() {
                return Ok(self);
            }
            let renamed = AlgNode::project(input, exprs, unique);
            return self.replace_top(Frame::with_aliases(renamed, aliases));
        }

        let node = match self.merge_with_inner(&input, &exprs, &out_names) {
            Some(merged) => merged,
            None => AlgNode::project(input, exprs, out_names),
        };
        self.replace_top(Frame::with_aliases(node, aliases))
    }

    fn merge_with_inner(&self, input: &AlgNode, exprs: &[Rex], names: &[String]) -> Option<AlgNode> {
        if !self.config.merge_projects {
            return None;
        }
        let AlgOp::Project { exprs: inner } = input.op() else {
            return None;
        };
        let below = input.inputs().first()?;
        let merged: Vec<Rex> = exprs.iter().map(|e| e.substitute(inner)).collect();
        if complexity(&merged) > complexity(exprs) + complexity(inner) + self.config.bloat {
            trace!(bloat = self.config.bloat, "builder.project.merge_skipped");
            return None;
        }
        if is_identity(&merged, below.field_count())
            && uniquify(names.to_vec()) == below.row_type().names()
        {
            return Some(below.clone());
        }
        Some(AlgNode::project(below.clone(), merged, names.to_vec()))
    }

    /// Renames the leading fields of the top frame; `None` keeps a name.
    pub fn rename(&mut self, names: &[Option<&str>]) -> Result<&mut Self> {
        let count = self.peek()?.field_count();
        if names.len() > count {
            return Err(BuildError::mismatch(
                "rename",
                format!("{} name(s) for {count} field(s)", names.len()),
            )
            .into());
        }
        let names = names.iter().map(|n| n.map(str::to_string)).collect();
        let exprs = self.fields()?;
        self.project_named(exprs, names, false)
    }

    /// Removes duplicate rows of the top frame.
    pub fn distinct(&mut self) -> Result<&mut Self> {
        let key = GroupKey::new(self.fields()?);
        self.aggregate(key, Vec::new())
    }

    /// Groups the top frame by `key` and computes `calls`.
    pub fn aggregate(&mut self, key: GroupKey, calls: Vec<AggCall>) -> Result<&mut Self> {
        let frame = self.frame(0)?.clone();
        let field_count = frame.node.field_count();
        for call in &calls {
            if call.distinct && !call.function.allows_distinct() {
                return Err(BuildError::AggregateDisallows {
                    function: call.function.name(),
                    feature: "DISTINCT",
                }
                .into());
            }
            if call.filter.is_some() && !call.function.allows_filter() {
                return Err(BuildError::AggregateDisallows {
                    function: call.function.name(),
                    feature: "FILTER",
                }
                .into());
            }
        }

        let mut registrar = Registrar::new(self.fields()?);
        let mut group_set = registrar.register_all(&key.nodes);
        group_set.sort_unstable();
        group_set.dedup();
        let mut group_sets: Vec<Vec<usize>> = match &key.sets {
            Some(sets) => sets
                .iter()
                .map(|set| {
                    let mut ordinals = registrar.register_all(set);
                    ordinals.sort_unstable();
                    ordinals.dedup();
                    ordinals
                })
                .collect(),
            None => vec![group_set.clone()],
        };
        group_sets.sort();
        group_sets.dedup();
        if group_sets.is_empty() {
            return Err(BuildError::mismatch("aggregate", "at least one grouping set is required").into());
        }
        if let Some(bad) = group_sets
            .iter()
            .find(|set| !set.iter().all(|i| group_set.contains(i)))
        {
            return Err(BuildError::GroupSetNotSubset {
                set: bad.clone(),
                group: group_set,
            }
            .into());
        }

        struct Resolved {
            function: AggFunction,
            distinct: bool,
            args: Vec<usize>,
            filter: Option<usize>,
            order: Collation,
            alias: Option<String>,
        }
        let resolved: Vec<Resolved> = calls
            .iter()
            .map(|call| Resolved {
                function: call.function,
                distinct: call.distinct,
                args: registrar.register_all(&call.operands),
                filter: call.filter.as_ref().map(|f| registrar.register(f)),
                order: Collation(
                    call.order_keys
                        .iter()
                        .map(|k| FieldCollation {
                            field: registrar.register(&k.expr),
                            direction: k.direction,
                            nulls: k.nulls,
                        })
                        .collect(),
                ),
                alias: call.alias.clone(),
            })
            .collect();

        if !registrar.needs_project() && resolved.is_empty() && group_sets.len() == 1 {
            if group_set.len() == field_count && are_rows_unique(&frame.node) {
                trace!("builder.aggregate.noop");
                return match &key.alias {
                    Some(alias) => self.alias(alias),
                    None => Ok(self),
                };
            }
            if group_set.is_empty() && min_row_count(&frame.node) >= 1.0 {
                let node = AlgNode::values(TupleType::default(), vec![Vec::new()])?;
                return self.replace_top(Frame::new(node, key.alias.as_deref()));
            }
        }

        if registrar.needs_project() {
            let exprs = registrar.exprs.clone();
            self.project_named(exprs, Vec::new(), true)?;
        }
        let input = self.frame(0)?.clone();
        let in_type = input.node.row_type().clone();
        let grouped = !group_set.is_empty();
        let mut distinct_calls: Vec<AggregateCall> = Vec::new();
        let mut positions = Vec::with_capacity(resolved.len());
        let mut requested_names = Vec::with_capacity(resolved.len());
        for (i, r) in resolved.into_iter().enumerate() {
            let arg_fields: Vec<&Field> = r.args.iter().filter_map(|&a| in_type.field(a)).collect();
            let (ty, nullable) = r.function.return_type(&arg_fields, grouped);
            let name = r.alias.unwrap_or_else(|| format!("$f{}", group_set.len() + i));
            requested_names.push(name.clone());
            let call = AggregateCall {
                function: r.function,
                distinct: r.distinct,
                args: r.args,
                filter: r.filter,
                order: r.order,
                name,
                ty,
                nullable,
            };
            let existing = distinct_calls.iter().position(|c| same_call(c, &call));
            match existing {
                Some(pos) if self.config.dedup_aggregate_calls => positions.push(pos),
                _ => {
                    positions.push(distinct_calls.len());
                    distinct_calls.push(call);
                }
            }
        }
        let deduplicated = distinct_calls.len() != positions.len();

        let mut aliases: Vec<Aliases> = group_set
            .iter()
            .map(|&g| input.aliases.get(g).cloned().unwrap_or_default())
            .collect();
        aliases.extend(distinct_calls.iter().map(|_| Aliases::new()));
        if let Some(alias) = &key.alias {
            aliases = aliases
                .iter()
                .map(|_| Aliases::from_iter([alias.clone()]))
                .collect();
        }
        let group_count = group_set.len();
        let node = AlgNode::aggregate(input.node.clone(), group_set, group_sets, distinct_calls);
        self.replace_top(Frame::with_aliases(node, aliases))?;

        if deduplicated {
            let mut exprs = (0..group_count)
                .map(|i| self.field_at(i))
                .collect::<Result<Vec<_>>>()?;
            let mut names: Vec<Option<String>> = vec![None; group_count];
            for (pos, name) in positions.into_iter().zip(requested_names) {
                exprs.push(self.field_at(group_count + pos)?);
                names.push(Some(name));
            }
            self.project_named(exprs, names, false)?;
        }
        Ok(self)
    }

    /// Joins the two top frames; the deeper one is the left input.
    pub fn join(&mut self, kind: JoinKind, condition: Rex) -> Result<&mut Self> {
        self.join_correlated(kind, condition, &[])
    }

    /// Joins the two top frames. With one correlation variable the result is a
    /// correlate that re-evaluates the right input for every left row.
    pub fn join_correlated(
        &mut self,
        kind: JoinKind,
        condition: Rex,
        variables: &[CorrelationId],
    ) -> Result<&mut Self> {
        if variables.len() > 1 {
            return Err(BuildError::CorrelationVariables {
                count: variables.len(),
            }
            .into());
        }
        let right = self.frame(0)?.clone();
        let left = self.frame(1)?.clone();
        let condition = if self.config.simplify {
            simplify(&condition)
        } else {
            condition
        };

        let (node, post_filter) = match variables.first() {
            Some(&id) => {
                if correlations_in(&left.node).contains(&id) {
                    return Err(BuildError::mismatch(
                        "join",
                        format!("variable {id} must not be used by the left input"),
                    )
                    .into());
                }
                let (right_node, post_filter) = match kind {
                    JoinKind::Inner => (right.node.clone(), (!condition.is_true()).then_some(condition)),
                    JoinKind::Left | JoinKind::Semi | JoinKind::Anti => {
                        let pushed = correlate_condition(&condition, id, &left.node);
                        let right_node = if pushed.is_true() {
                            right.node.clone()
                        } else {
                            AlgNode::filter(right.node.clone(), pushed)
                        };
                        (right_node, None)
                    }
                    JoinKind::Right | JoinKind::Full => {
                        return Err(BuildError::mismatch(
                            "join",
                            format!("{} join cannot be correlated", kind.name()),
                        )
                        .into())
                    }
                };
                let required = required_columns(&right_node, id);
                (
                    AlgNode::correlate(kind, left.node.clone(), right_node, id, required),
                    post_filter,
                )
            }
            None => (
                AlgNode::join(kind, left.node.clone(), right.node.clone(), condition),
                None,
            ),
        };

        let mut aliases = left.aliases.clone();
        if kind.projects_right() {
            aliases.extend(right.aliases.iter().cloned());
        }
        self.stack.truncate(self.stack.len() - 2);
        self.stack.push(Frame::with_aliases(node, aliases));
        if let Some(condition) = post_filter {
            self.filter(vec![condition])?;
        }
        Ok(self)
    }

    /// `UNION` of the top `n` frames.
    pub fn union(&mut self, all: bool, n: usize) -> Result<&mut Self> {
        self.set_op(SetOpKind::Union, all, n)
    }

    /// `INTERSECT` of the top `n` frames.
    pub fn intersect(&mut self, all: bool, n: usize) -> Result<&mut Self> {
        self.set_op(SetOpKind::Intersect, all, n)
    }

    /// `MINUS` of the top `n` frames; the deepest is the minuend.
    pub fn minus(&mut self, all: bool, n: usize) -> Result<&mut Self> {
        self.set_op(SetOpKind::Minus, all, n)
    }

    fn set_op(&mut self, kind: SetOpKind, all: bool, n: usize) -> Result<&mut Self> {
        if n < 2 {
            return Err(BuildError::mismatch("set operation", "needs at least two inputs").into());
        }
        self.require(n)?;
        let start = self.stack.len() - n;
        let inputs: Vec<AlgNode> = self.stack[start..].iter().map(|f| f.node.clone()).collect();
        let width = inputs.first().map(AlgNode::field_count).unwrap_or(0);
        if let Some(bad) = inputs.iter().find(|i| i.field_count() != width) {
            return Err(BuildError::mismatch(
                "set operation",
                format!("inputs have {width} and {} field(s)", bad.field_count()),
            )
            .into());
        }
        self.stack.truncate(start);
        self.stack.push(Frame::new(AlgNode::set_op(kind, all, inputs), None));
        Ok(self)
    }

    /// Orders the top frame.
    pub fn sort(&mut self, keys: Vec<SortKey>) -> Result<&mut Self> {
        self.sort_limit(None, None, keys)
    }

    /// Slices the top frame without ordering it.
    pub fn limit(&mut self, offset: Option<u64>, fetch: Option<u64>) -> Result<&mut Self> {
        self.sort_limit(offset, fetch, Vec::new())
    }

    /// Orders and slices the top frame. A fetch of zero yields empty rows; a pure
    /// limit is fused into an unbounded sort below it, also through a projection.
    pub fn sort_limit(
        &mut self,
        offset: Option<u64>,
        fetch: Option<u64>,
        keys: Vec<SortKey>,
    ) -> Result<&mut Self> {
        let frame = self.frame(0)?.clone();
        let field_count = frame.node.field_count();
        let offset = offset.filter(|o| *o > 0);
        if fetch == Some(0) {
            return self.empty();
        }

        let mut extras: Vec<Rex> = Vec::new();
        let mut keys_out: Vec<FieldCollation> = Vec::new();
        for key in keys {
            let field = match key.expr.as_input_ref() {
                Some(i) if i < field_count => i,
                Some(i) => {
                    return Err(BuildError::OrdinalOutOfRange {
                        ordinal: i,
                        count: field_count,
                    }
                    .into())
                }
                None => match extras.iter().position(|e| e == &key.expr) {
                    Some(p) => field_count + p,
                    None => {
                        extras.push(key.expr.clone());
                        field_count + extras.len() - 1
                    }
                },
            };
            if keys_out.iter().all(|k| k.field != field) {
                keys_out.push(FieldCollation {
                    field,
                    direction: key.direction,
                    nulls: key.nulls,
                });
            }
        }
        if keys_out.is_empty() && offset.is_none() && fetch.is_none() {
            return Ok(self);
        }
        let collation = Collation(keys_out);

        if !extras.is_empty() {
            let mut exprs = self.fields()?;
            exprs.extend(extras);
            self.project_named(exprs, Vec::new(), true)?;
            let widened = self.frame(0)?.clone();
            let sorted = AlgNode::sort(widened.node.clone(), collation, offset, fetch);
            self.replace_top(widened.replaced(sorted))?;
            let original = (0..field_count)
                .map(|i| self.field_at(i))
                .collect::<Result<Vec<_>>>()?;
            return self.project_named(original, Vec::new(), false);
        }

        let node = match fuse_sort(&frame.node, &collation, offset, fetch) {
            Some(fused) => {
                trace!(offset = ?offset, fetch = ?fetch, "builder.sort.fused");
                fused
            }
            None => AlgNode::sort(frame.node.clone(), collation, offset, fetch),
        };
        self.replace_top(frame.replaced(node))
    }

    /// Applies the top frame's rows to `entity`.
    pub fn modify(
        &mut self,
        entity: EntityRef,
        operation: ModifyOperation,
        update_columns: Vec<String>,
        source_exprs: Vec<Rex>,
    ) -> Result<&mut Self> {
        if update_columns.len() != source_exprs.len() {
            return Err(BuildError::mismatch(
                "modify",
                format!(
                    "{} update column(s) but {} source expression(s)",
                    update_columns.len(),
                    source_exprs.len()
                ),
            )
            .into());
        }
        let input = self.peek()?.clone();
        let alias = entity.name.clone();
        let node = AlgNode::modify(input, entity, operation, update_columns, source_exprs);
        self.replace_top(Frame::new(node, Some(&alias)))
    }

    /// Guards the top frame by the frame below it: the guarded tree runs only when
    /// the check's row count satisfies `condition`.
    pub fn conditional_execute(
        &mut self,
        condition: CheckCondition,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<&mut Self> {
        let guarded = self.frame(0)?.clone();
        let check = self.frame(1)?.clone();
        let node = AlgNode::conditional_execute(check.node, guarded.node.clone(), condition, message, description);
        self.stack.truncate(self.stack.len() - 2);
        self.stack.push(guarded.replaced(node));
        Ok(self)
    }

    /// Wraps the top frame in a batch driver.
    pub fn batch_iterator(&mut self) -> Result<&mut Self> {
        let frame = self.frame(0)?.clone();
        let node = AlgNode::batch_iterator(frame.node.clone());
        self.replace_top(frame.replaced(node))
    }
}

fn is_identity(exprs: &[Rex], field_count: usize) -> bool {
    exprs.len() == field_count && exprs.iter().enumerate().all(|(i, e)| e.as_input_ref() == Some(i))
}

fn complexity(exprs: &[Rex]) -> usize {
    let mut count = 0;
    for expr in exprs {
        expr.visit(&mut |_| count += 1);
    }
    count
}

fn same_call(a: &AggregateCall, b: &AggregateCall) -> bool {
    a.function == b.function
        && a.distinct == b.distinct
        && a.args == b.args
        && a.filter == b.filter
        && a.order == b.order
}

/// Rewrites a join condition for the right side of a correlate: left fields
/// become fields of the correlation variable, right fields shift down.
pub(crate) fn correlate_condition(condition: &Rex, id: CorrelationId, left: &AlgNode) -> Rex {
    let left_type = left.row_type().clone();
    let left_count = left_type.len();
    condition.rewrite(&mut |rex| match rex {
        Rex::InputRef { index, ty, .. } if *index < left_count => Some(Rex::FieldAccess {
            expr: Box::new(Rex::CorrelVariable {
                id,
                row_type: left_type.clone(),
            }),
            index: *index,
            name: left_type
                .field(*index)
                .map(|f| f.name.clone())
                .unwrap_or_default(),
            ty: ty.clone(),
        }),
        Rex::InputRef {
            index,
            ty,
            nullable,
        } => Some(Rex::InputRef {
            index: index - left_count,
            ty: ty.clone(),
            nullable: *nullable,
        }),
        _ => None,
    })
}

/// Left ordinals read through `id` anywhere in `node`.
pub(crate) fn required_columns(node: &AlgNode, id: CorrelationId) -> Vec<usize> {
    let mut required = BTreeSet::new();
    node.walk(&mut |n| {
        for rex in n.op().expressions() {
            rex.visit(&mut |r| {
                if let Rex::FieldAccess { expr, index, .. } = r {
                    if matches!(expr.as_ref(), Rex::CorrelVariable { id: v, .. } if *v == id) {
                        required.insert(*index);
                    }
                }
            });
        }
    });
    required.into_iter().collect()
}

fn fuse_sort(
    top: &AlgNode,
    collation: &Collation,
    offset: Option<u64>,
    fetch: Option<u64>,
) -> Option<AlgNode> {
    match top.op() {
        AlgOp::Sort {
            collation: inner,
            offset: None,
            fetch: None,
        } => {
            let below = top.inputs().first()?;
            let keys = if collation.is_empty() { inner } else { collation };
            Some(AlgNode::sort(below.clone(), keys.clone(), offset, fetch))
        }
        AlgOp::Project { exprs } => {
            let sort = top.inputs().first()?;
            let AlgOp::Sort {
                collation: inner,
                offset: None,
                fetch: None,
            } = sort.op()
            else {
                return None;
            };
            let keys = if collation.is_empty() {
                inner.clone()
            } else {
                collation.remap(|f| exprs.get(f).and_then(Rex::as_input_ref))?
            };
            let below = sort.inputs().first()?;
            let fused = AlgNode::sort(below.clone(), keys, offset, fetch);
            Some(AlgNode::project(fused, exprs.clone(), top.row_type().names()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemorySnapshot;
    use crate::types::EntityId;

    fn builder() -> AlgBuilder {
        let snapshot = InMemorySnapshot::new()
            .with_entity(
                EntityDef::new(EntityId(1), "emp")
                    .column("id", DataType::BigInt, false)
                    .column("name", DataType::Varchar, true)
                    .column("deptno", DataType::BigInt, false)
                    .column("sal", DataType::Double, true),
            )
            .with_entity(
                EntityDef::new(EntityId(2), "dept")
                    .column("deptno", DataType::BigInt, false)
                    .column("dname", DataType::Varchar, false),
            );
        AlgBuilder::new(Arc::new(snapshot))
    }

    #[test]
    fn identity_projection_is_a_noop() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let scan = b.peek().unwrap().clone();
        let fields = b.fields().unwrap();
        b.project(fields).unwrap();
        assert!(AlgNode::ptr_eq(&scan, b.peek().unwrap()));
    }

    #[test]
    fn identity_projection_with_new_names_adds_a_rename() {
        let mut b = builder();
        b.scan("dept").unwrap();
        let scan = b.peek().unwrap().clone();
        b.rename(&[Some("d"), Some("n")]).unwrap();
        let node = b.build().unwrap();
        assert!(matches!(node.op(), AlgOp::Project { .. }));
        assert_eq!(node.row_type().names(), vec!["d", "n"]);
        assert_eq!(node.inputs()[0].digest(), scan.digest());
        assert_eq!(node.inputs()[0].row_type().names(), scan.row_type().names());
    }

    #[test]
    fn stacked_projections_merge() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let swapped = vec![b.field("name").unwrap(), b.field("id").unwrap()];
        b.project(swapped).unwrap();
        let id = b.field("id").unwrap();
        b.project(vec![id]).unwrap();
        let node = b.build().unwrap();
        let AlgOp::Project { exprs } = node.op() else {
            panic!("expected a project, got {}", node.digest());
        };
        assert_eq!(exprs[0].as_input_ref(), Some(0));
        assert!(matches!(node.inputs()[0].op(), AlgOp::Scan { .. }));
        assert_eq!(node.row_type().names(), vec!["id"]);
    }

    #[test]
    fn aliases_survive_projection() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let exprs = vec![b.field("deptno").unwrap(), b.field("sal").unwrap()];
        b.project(exprs).unwrap();
        assert!(b.field_alias("emp", "sal").is_ok());
        let err = b.field_alias("dept", "sal").unwrap_err();
        assert!(matches!(err, QuarryError::Build(BuildError::AliasFieldNotFound { .. })));
    }

    #[test]
    fn always_false_filter_becomes_empty_values() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let schema = b.peek().unwrap().row_type().clone();
        let cond = b.equals(b.literal(1i64), b.literal(2i64));
        b.filter(vec![cond]).unwrap();
        let node = b.peek().unwrap().clone();
        assert!(matches!(node.op(), AlgOp::Values { tuples } if tuples.is_empty()));
        assert_eq!(node.row_type(), &schema);
        assert!(b.field_alias("emp", "id").is_ok());
    }

    #[test]
    fn trivially_true_filter_is_dropped() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let scan = b.peek().unwrap().clone();
        let id = b.field("id").unwrap();
        let cond = b.is_not_null(id);
        b.filter(vec![cond]).unwrap();
        assert!(AlgNode::ptr_eq(&scan, b.peek().unwrap()));
    }

    #[test]
    fn aggregate_over_expression_adds_preparatory_project() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let bumped = b.call(Op::Plus, vec![b.field("deptno").unwrap(), b.literal(1i64)]);
        let key = b.group_key(vec![bumped]);
        b.aggregate(key, vec![AggCall::count_star().alias("c")]).unwrap();
        let node = b.build().unwrap();
        let AlgOp::Aggregate { group_set, .. } = node.op() else {
            panic!("expected an aggregate");
        };
        assert_eq!(group_set, &vec![4]);
        assert_eq!(node.inputs()[0].field_count(), 5);
        assert_eq!(node.row_type().names()[1], "c");
    }

    #[test]
    fn grouping_sets_must_be_subsets() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let key = GroupKey::with_sets(
            vec![b.field("deptno").unwrap()],
            vec![vec![b.field("id").unwrap()]],
        );
        let err = b.aggregate(key, Vec::new()).unwrap_err();
        assert!(matches!(err, QuarryError::Build(BuildError::GroupSetNotSubset { .. })));
    }

    #[test]
    fn single_value_rejects_distinct() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let call = b
            .agg(AggFunction::SingleValue, vec![b.field("id").unwrap()])
            .distinct(true);
        let err = b.aggregate(GroupKey::new(Vec::new()), vec![call]).unwrap_err();
        assert_eq!(
            err,
            QuarryError::Build(BuildError::AggregateDisallows {
                function: "SINGLE_VALUE",
                feature: "DISTINCT",
            })
        );
    }

    #[test]
    fn distinct_over_distinct_is_a_noop() {
        let mut b = builder();
        b.scan("emp").unwrap();
        b.distinct().unwrap();
        let first = b.peek().unwrap().clone();
        b.distinct().unwrap();
        assert!(AlgNode::ptr_eq(&first, b.peek().unwrap()));
    }

    #[test]
    fn empty_group_without_calls_over_nonempty_input_is_one_row() {
        let mut b = AlgBuilder::detached();
        b.values(&["a"], vec![vec![Value::Int(1)], vec![Value::Int(2)]])
            .unwrap();
        b.aggregate(GroupKey::new(Vec::new()), Vec::new()).unwrap();
        let node = b.build().unwrap();
        assert!(matches!(node.op(), AlgOp::Values { tuples } if tuples.len() == 1));
        assert_eq!(node.field_count(), 0);
    }

    #[test]
    fn duplicate_aggregate_calls_are_computed_once() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let key = b.group_key(vec![b.field("deptno").unwrap()]);
        b.aggregate(
            key,
            vec![AggCall::count_star().alias("a"), AggCall::count_star().alias("b")],
        )
        .unwrap();
        let node = b.build().unwrap();
        assert_eq!(node.row_type().names(), vec!["deptno", "a", "b"]);
        let AlgOp::Aggregate { calls, .. } = node.inputs()[0].op() else {
            panic!("expected a project over the aggregate");
        };
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn correlated_inner_join_filters_after_correlate() {
        let mut b = builder();
        let cor = CorrelationId::fresh();
        b.scan("dept").unwrap();
        let outer = b.correl(cor).unwrap();
        b.scan("emp").unwrap();
        let deptno = b.field_access(outer, "deptno").unwrap();
        let inner_cond = b.equals(b.field("deptno").unwrap(), deptno);
        b.filter(vec![inner_cond]).unwrap();
        let cond = b.greater_than(b.field_of(2, 1, "sal").unwrap(), b.literal(10.0));
        b.join_correlated(JoinKind::Inner, cond, &[cor]).unwrap();
        let node = b.build().unwrap();
        assert!(matches!(node.op(), AlgOp::Filter { .. }));
        let AlgOp::Correlate { required, .. } = node.inputs()[0].op() else {
            panic!("expected a correlate");
        };
        assert_eq!(required, &vec![0]);
    }

    #[test]
    fn correlated_left_join_pushes_condition_right() {
        let mut b = builder();
        let cor = CorrelationId::fresh();
        b.scan("dept").unwrap();
        b.scan("emp").unwrap();
        let cond = b.equals(
            b.field_of(2, 0, "deptno").unwrap(),
            b.field_of(2, 1, "deptno").unwrap(),
        );
        b.join_correlated(JoinKind::Left, cond, &[cor]).unwrap();
        let node = b.build().unwrap();
        assert!(matches!(node.op(), AlgOp::Correlate { .. }));
        assert!(matches!(node.inputs()[1].op(), AlgOp::Filter { .. }));
        assert_eq!(node.field_count(), 6);
    }

    #[test]
    fn join_rejects_two_correlation_variables() {
        let mut b = builder();
        b.scan("dept").unwrap();
        b.scan("emp").unwrap();
        let err = b
            .join_correlated(
                JoinKind::Inner,
                Rex::true_lit(),
                &[CorrelationId::fresh(), CorrelationId::fresh()],
            )
            .unwrap_err();
        assert_eq!(
            err,
            QuarryError::Build(BuildError::CorrelationVariables { count: 2 })
        );
        assert_eq!(b.size(), 2);
    }

    #[test]
    fn limit_fuses_into_sort() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let key = SortKey::desc(b.field("sal").unwrap());
        b.sort(vec![key]).unwrap();
        b.limit(None, Some(5)).unwrap();
        let node = b.build().unwrap();
        let AlgOp::Sort { collation, fetch, .. } = node.op() else {
            panic!("expected a sort");
        };
        assert_eq!(*fetch, Some(5));
        assert_eq!(collation.keys()[0].field, 3);
        assert!(matches!(node.inputs()[0].op(), AlgOp::Scan { .. }));
    }

    #[test]
    fn limit_fuses_through_projection() {
        let mut b = builder();
        b.scan("emp").unwrap();
        let key = SortKey::asc(b.field("sal").unwrap());
        b.sort(vec![key]).unwrap();
        let exprs = vec![b.field("name").unwrap(), b.field("sal").unwrap()];
        b.project(exprs).unwrap();
        b.limit(Some(2), Some(3)).unwrap();
        let node = b.build().unwrap();
        assert!(matches!(node.op(), AlgOp::Project { .. }));
        let sort = &node.inputs()[0];
        assert!(matches!(
            sort.op(),
            AlgOp::Sort { offset: Some(2), fetch: Some(3), .. }
        ));
    }

    #[test]
    fn fetch_zero_is_empty() {
        let mut b = builder();
        b.scan("emp").unwrap();
        b.limit(None, Some(0)).unwrap();
        assert!(matches!(b.peek().unwrap().op(), AlgOp::Values { tuples } if tuples.is_empty()));
    }

    #[test]
    fn unknown_field_lists_candidates() {
        let mut b = builder();
        b.scan("dept").unwrap();
        let err = b.field("nope").unwrap_err();
        assert_eq!(
            err,
            QuarryError::Build(BuildError::FieldNotFound {
                name: "nope".into(),
                candidates: vec!["deptno".into(), "dname".into()],
            })
        );
    }

    #[test]
    fn values_check_arity() {
        let mut b = AlgBuilder::detached();
        let err = b
            .values(&["a", "b"], vec![vec![Value::Int(1)]])
            .unwrap_err();
        assert_eq!(
            err,
            QuarryError::Build(BuildError::ValuesArity {
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn build_on_empty_stack_fails() {
        let mut b = AlgBuilder::detached();
        assert!(matches!(
            b.build(),
            Err(QuarryError::Build(BuildError::EmptyStack { .. }))
        ));
    }

    #[test]
    fn conditional_execute_takes_check_from_below() {
        let mut b = builder();
        b.scan("dept").unwrap();
        b.scan("emp").unwrap();
        b.conditional_execute(CheckCondition::EqualToZero, "boom", "check")
            .unwrap();
        let node = b.build().unwrap();
        assert_eq!(node.field_count(), 4);
        assert_eq!(node.inputs()[0].field_count(), 2);
    }
}
