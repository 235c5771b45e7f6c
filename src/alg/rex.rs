//! Scalar row expressions.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::alg::node::AlgNode;
use crate::alg::types::{DataType, Field, TupleType};
use crate::alg::value::Value;
use crate::types::{QuarryError, Result};

static NEXT_CORRELATION: AtomicU32 = AtomicU32::new(0);

/// Names a correlation variable bound by a correlate node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u32);

impl CorrelationId {
    /// Allocates a process-unique correlation id.
    pub fn fresh() -> Self {
        CorrelationId(NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$cor{}", self.0)
    }
}

/// Scalar operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Logical conjunction, n-ary.
    And,
    /// Logical disjunction, n-ary.
    Or,
    /// Logical negation.
    Not,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Times,
    /// `/`
    Divide,
    /// First non-null operand.
    Coalesce,
}

impl Op {
    /// Digest spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::NotEq => "<>",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Not => "NOT",
            Op::IsNull => "IS NULL",
            Op::IsNotNull => "IS NOT NULL",
            Op::Plus => "+",
            Op::Minus => "-",
            Op::Times => "*",
            Op::Divide => "/",
            Op::Coalesce => "COALESCE",
        }
    }

    /// True for the six comparison operators.
    pub fn is_comparison(self) -> bool {
        matches!(self, Op::Eq | Op::NotEq | Op::Lt | Op::Le | Op::Gt | Op::Ge)
    }

    /// Operator obtained by swapping the operands of a comparison.
    pub fn reversed(self) -> Op {
        match self {
            Op::Lt => Op::Gt,
            Op::Le => Op::Ge,
            Op::Gt => Op::Lt,
            Op::Ge => Op::Le,
            other => other,
        }
    }

    fn return_type(self, operands: &[Rex]) -> DataType {
        match self {
            Op::Plus | Op::Minus | Op::Times | Op::Divide | Op::Coalesce => operands
                .iter()
                .map(Rex::data_type)
                .reduce(|a, b| a.least_restrictive(&b))
                .unwrap_or(DataType::Null),
            _ => DataType::Boolean,
        }
    }
}

/// Kind of a nested sub-query expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubQueryKind {
    /// `EXISTS (q)`
    Exists,
    /// `(operands) IN (q)`
    In,
    /// Scalar sub-query producing one value.
    Scalar,
}

/// A scalar expression evaluated against the input row of its node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Rex {
    /// Reference to an input field by ordinal.
    InputRef {
        /// Field ordinal.
        index: usize,
        /// Field type.
        ty: DataType,
        /// Field nullability.
        nullable: bool,
    },
    /// Constant.
    Literal {
        /// The value.
        value: Value,
        /// Declared type; carries the type of typed nulls.
        ty: DataType,
    },
    /// Operator application.
    Call {
        /// Operator.
        op: Op,
        /// Arguments.
        operands: Vec<Rex>,
        /// Result type.
        ty: DataType,
    },
    /// Placeholder bound from the parameter vector at execution time.
    DynamicParam {
        /// Position in the parameter vector.
        index: usize,
        /// Parameter type.
        ty: DataType,
    },
    /// The current row of the left input of a correlate.
    CorrelVariable {
        /// Bound variable.
        id: CorrelationId,
        /// Row type of the correlated input.
        row_type: TupleType,
    },
    /// Field of a record-valued expression.
    FieldAccess {
        /// Record expression.
        expr: Box<Rex>,
        /// Field ordinal within the record.
        index: usize,
        /// Field name.
        name: String,
        /// Field type.
        ty: DataType,
    },
    /// Nested query used as an expression.
    SubQuery {
        /// Sub-query kind.
        kind: SubQueryKind,
        /// Left-hand operands for `IN`.
        operands: Vec<Rex>,
        /// The nested tree.
        rel: AlgNode,
        /// Result type.
        ty: DataType,
    },
}

impl Rex {
    /// Reference to `field` at `index`.
    pub fn input(index: usize, field: &Field) -> Rex {
        Rex::InputRef {
            index,
            ty: field.ty.clone(),
            nullable: field.nullable,
        }
    }

    /// Literal of the value's natural type.
    pub fn lit(value: impl Into<Value>) -> Rex {
        let value = value.into();
        let ty = DataType::of(&value);
        Rex::Literal { value, ty }
    }

    /// Null literal of a given type.
    pub fn typed_null(ty: DataType) -> Rex {
        Rex::Literal {
            value: Value::Null,
            ty,
        }
    }

    /// Boolean `TRUE`.
    pub fn true_lit() -> Rex {
        Rex::lit(true)
    }

    /// Boolean `FALSE`.
    pub fn false_lit() -> Rex {
        Rex::lit(false)
    }

    /// Operator call with derived result type.
    pub fn call(op: Op, operands: Vec<Rex>) -> Rex {
        let ty = op.return_type(&operands);
        Rex::Call { op, operands, ty }
    }

    /// `a = b`
    pub fn eq(a: Rex, b: Rex) -> Rex {
        Rex::call(Op::Eq, vec![a, b])
    }

    /// `NOT x`
    pub fn not(x: Rex) -> Rex {
        Rex::call(Op::Not, vec![x])
    }

    /// Conjunction; `TRUE` when empty, the operand itself when singular.
    pub fn and_all(mut conjuncts: Vec<Rex>) -> Rex {
        match conjuncts.len() {
            0 => Rex::true_lit(),
            1 => conjuncts.remove(0),
            _ => Rex::call(Op::And, conjuncts),
        }
    }

    /// Disjunction; `FALSE` when empty.
    pub fn or_all(mut disjuncts: Vec<Rex>) -> Rex {
        match disjuncts.len() {
            0 => Rex::false_lit(),
            1 => disjuncts.remove(0),
            _ => Rex::call(Op::Or, disjuncts),
        }
    }

    /// Type of the expression's result.
    pub fn data_type(&self) -> DataType {
        match self {
            Rex::InputRef { ty, .. }
            | Rex::Literal { ty, .. }
            | Rex::Call { ty, .. }
            | Rex::DynamicParam { ty, .. }
            | Rex::FieldAccess { ty, .. }
            | Rex::SubQuery { ty, .. } => ty.clone(),
            Rex::CorrelVariable { row_type, .. } => DataType::Struct(
                row_type
                    .fields()
                    .iter()
                    .map(|f| (f.name.clone(), f.ty.clone()))
                    .collect(),
            ),
        }
    }

    /// Conservative nullability of the result.
    pub fn nullable(&self) -> bool {
        match self {
            Rex::InputRef { nullable, .. } => *nullable,
            Rex::Literal { value, .. } => value.is_null(),
            Rex::Call { op, operands, .. } => match op {
                Op::IsNull | Op::IsNotNull => false,
                Op::Coalesce => operands.iter().all(Rex::nullable),
                _ => operands.iter().any(Rex::nullable),
            },
            Rex::DynamicParam { .. } | Rex::FieldAccess { .. } => true,
            Rex::CorrelVariable { .. } => false,
            Rex::SubQuery { kind, .. } => *kind == SubQueryKind::Scalar,
        }
    }

    /// Ordinal when the expression is a plain input reference.
    pub fn as_input_ref(&self) -> Option<usize> {
        match self {
            Rex::InputRef { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// True for the literal `TRUE`.
    pub fn is_true(&self) -> bool {
        matches!(self, Rex::Literal { value: Value::Bool(true), .. })
    }

    /// True for the literal `FALSE`.
    pub fn is_false(&self) -> bool {
        matches!(self, Rex::Literal { value: Value::Bool(false), .. })
    }

    /// True for any literal.
    pub fn is_literal(&self) -> bool {
        matches!(self, Rex::Literal { .. })
    }

    /// Immediate sub-expressions.
    pub fn operands(&self) -> &[Rex] {
        match self {
            Rex::Call { operands, .. } | Rex::SubQuery { operands, .. } => operands,
            Rex::FieldAccess { expr, .. } => std::slice::from_ref(expr.as_ref()),
            _ => &[],
        }
    }

    /// Pre-order walk. Does not descend into sub-query trees.
    pub fn visit(&self, f: &mut dyn FnMut(&Rex)) {
        f(self);
        for operand in self.operands() {
            operand.visit(f);
        }
    }

    /// Top-down rewrite: wherever `f` returns a replacement it is used as-is,
    /// otherwise the children are rewritten and the node rebuilt.
    pub fn rewrite(&self, f: &mut dyn FnMut(&Rex) -> Option<Rex>) -> Rex {
        if let Some(replacement) = f(self) {
            return replacement;
        }
        match self {
            Rex::Call { op, operands, ty } => Rex::Call {
                op: *op,
                operands: operands.iter().map(|o| o.rewrite(f)).collect(),
                ty: ty.clone(),
            },
            Rex::FieldAccess {
                expr,
                index,
                name,
                ty,
            } => Rex::FieldAccess {
                expr: Box::new(expr.rewrite(f)),
                index: *index,
                name: name.clone(),
                ty: ty.clone(),
            },
            Rex::SubQuery {
                kind,
                operands,
                rel,
                ty,
            } => Rex::SubQuery {
                kind: *kind,
                operands: operands.iter().map(|o| o.rewrite(f)).collect(),
                rel: rel.clone(),
                ty: ty.clone(),
            },
            other => other.clone(),
        }
    }

    /// Ordinals of every input reference.
    pub fn input_refs(&self) -> BTreeSet<usize> {
        let mut refs = BTreeSet::new();
        self.visit(&mut |rex| {
            if let Rex::InputRef { index, .. } = rex {
                refs.insert(*index);
            }
        });
        refs
    }

    /// Adds `offset` to every input reference at or above `from`.
    pub fn shift(&self, from: usize, offset: isize) -> Rex {
        self.rewrite(&mut |rex| match rex {
            Rex::InputRef {
                index,
                ty,
                nullable,
            } if *index >= from => Some(Rex::InputRef {
                index: (*index as isize + offset) as usize,
                ty: ty.clone(),
                nullable: *nullable,
            }),
            _ => None,
        })
    }

    /// Renumbers input references through `map`.
    pub fn remap(&self, map: &dyn Fn(usize) -> usize) -> Rex {
        self.rewrite(&mut |rex| match rex {
            Rex::InputRef {
                index,
                ty,
                nullable,
            } => Some(Rex::InputRef {
                index: map(*index),
                ty: ty.clone(),
                nullable: *nullable,
            }),
            _ => None,
        })
    }

    /// Replaces `$i` with `exprs[i]`; used to push one projection through another.
    pub fn substitute(&self, exprs: &[Rex]) -> Rex {
        self.rewrite(&mut |rex| match rex {
            Rex::InputRef { index, .. } => exprs.get(*index).cloned(),
            _ => None,
        })
    }

    /// Flattens nested `AND`s into a conjunct list. `TRUE` yields an empty list.
    pub fn conjunctions(&self) -> Vec<Rex> {
        let mut out = Vec::new();
        fn collect(rex: &Rex, out: &mut Vec<Rex>) {
            match rex {
                Rex::Call {
                    op: Op::And,
                    operands,
                    ..
                } => operands.iter().for_each(|o| collect(o, out)),
                r if r.is_true() => {}
                r => out.push(r.clone()),
            }
        }
        collect(self, &mut out);
        out
    }

    /// Correlation variables referenced by this expression, including inside sub-queries.
    pub fn correlation_ids(&self) -> BTreeSet<CorrelationId> {
        let mut ids = BTreeSet::new();
        self.visit(&mut |rex| match rex {
            Rex::CorrelVariable { id, .. } => {
                ids.insert(*id);
            }
            Rex::SubQuery { rel, .. } => ids.extend(crate::alg::node::correlations_in(rel)),
            _ => {}
        });
        ids
    }

    /// True when a sub-query expression occurs anywhere.
    pub fn contains_subquery(&self) -> bool {
        let mut found = false;
        self.visit(&mut |rex| found |= matches!(rex, Rex::SubQuery { .. }));
        found
    }

    /// True when the expression references no input, parameter or variable.
    pub fn is_constant(&self) -> bool {
        let mut constant = true;
        self.visit(&mut |rex| {
            constant &= matches!(rex, Rex::Literal { .. } | Rex::Call { .. });
        });
        constant
    }
}

impl fmt::Display for Rex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rex::InputRef { index, .. } => write!(f, "${index}"),
            Rex::Literal { value, ty } => {
                if value.is_null() {
                    write!(f, "null:{ty}")
                } else {
                    write!(f, "{value}")
                }
            }
            Rex::Call { op, operands, .. } => {
                write!(f, "{}(", op.symbol())?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{operand}")?;
                }
                write!(f, ")")
            }
            Rex::DynamicParam { index, ty } => write!(f, "?{index}:{ty}"),
            Rex::CorrelVariable { id, .. } => write!(f, "{id}"),
            Rex::FieldAccess { expr, name, .. } => write!(f, "{expr}.{name}"),
            Rex::SubQuery {
                kind,
                operands,
                rel,
                ..
            } => {
                let label = match kind {
                    SubQueryKind::Exists => "EXISTS",
                    SubQueryKind::In => "IN",
                    SubQueryKind::Scalar => "$SCALAR_QUERY",
                };
                write!(f, "{label}(")?;
                for operand in operands {
                    write!(f, "{operand}, ")?;
                }
                write!(f, "{{{}}})", crate::alg::explain::digest(rel))
            }
        }
    }
}

/// Evaluates an operator over already-evaluated operands with SQL three-valued logic.
pub fn eval_call(op: Op, args: &[Value]) -> Result<Value> {
    let arity = |n: usize| -> Result<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(QuarryError::Invalid(format!(
                "operator {} expects {n} operands, got {}",
                op.symbol(),
                args.len()
            )))
        }
    };
    match op {
        Op::And => {
            let mut saw_null = false;
            for arg in args {
                match arg {
                    Value::Bool(false) => return Ok(Value::Bool(false)),
                    Value::Bool(true) => {}
                    _ => saw_null = true,
                }
            }
            Ok(if saw_null { Value::Null } else { Value::Bool(true) })
        }
        Op::Or => {
            let mut saw_null = false;
            for arg in args {
                match arg {
                    Value::Bool(true) => return Ok(Value::Bool(true)),
                    Value::Bool(false) => {}
                    _ => saw_null = true,
                }
            }
            Ok(if saw_null { Value::Null } else { Value::Bool(false) })
        }
        Op::Not => {
            arity(1)?;
            Ok(match &args[0] {
                Value::Bool(b) => Value::Bool(!b),
                _ => Value::Null,
            })
        }
        Op::IsNull => {
            arity(1)?;
            Ok(Value::Bool(args[0].is_null()))
        }
        Op::IsNotNull => {
            arity(1)?;
            Ok(Value::Bool(!args[0].is_null()))
        }
        Op::Coalesce => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        Op::Eq | Op::NotEq | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            arity(2)?;
            let Some(ordering) = args[0].sql_cmp(&args[1]) else {
                return Ok(Value::Null);
            };
            use std::cmp::Ordering::*;
            let result = match op {
                Op::Eq => ordering == Equal,
                Op::NotEq => ordering != Equal,
                Op::Lt => ordering == Less,
                Op::Le => ordering != Greater,
                Op::Gt => ordering == Greater,
                _ => ordering != Less,
            };
            Ok(Value::Bool(result))
        }
        Op::Plus | Op::Minus | Op::Times | Op::Divide => {
            arity(2)?;
            match (&args[0], &args[1]) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::Int(a), Value::Int(b)) => {
                    let result = match op {
                        Op::Plus => a.checked_add(*b),
                        Op::Minus => a.checked_sub(*b),
                        Op::Times => a.checked_mul(*b),
                        _ => a.checked_div(*b),
                    };
                    result.map(Value::Int).ok_or_else(|| {
                        QuarryError::Invalid(format!("integer overflow or division by zero in {}", op.symbol()))
                    })
                }
                (a, b) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => Ok(Value::Float(match op {
                        Op::Plus => a + b,
                        Op::Minus => a - b,
                        Op::Times => a * b,
                        _ => a / b,
                    })),
                    _ => Err(QuarryError::Invalid(format!(
                        "operator {} requires numeric operands",
                        op.symbol()
                    ))),
                },
            }
        }
    }
}
