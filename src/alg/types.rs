//! Tuple types: ordered, named, typed fields with stable identities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::alg::value::Value;
use crate::types::FieldId;

static NEXT_FIELD_ID: AtomicU64 = AtomicU64::new(1);

impl FieldId {
    /// Allocates a process-unique field id.
    pub fn fresh() -> FieldId {
        FieldId(NEXT_FIELD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Scalar and composite types understood by the IR.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Boolean.
    Boolean,
    /// 64-bit signed integer.
    BigInt,
    /// 64-bit float.
    Double,
    /// Variable-length string.
    Varchar,
    /// Byte string.
    Binary,
    /// Type of an untyped `NULL` literal.
    Null,
    /// Nested record, lowered to scalar fields before physical planning.
    Struct(Vec<(String, DataType)>),
}

impl DataType {
    /// Type of a literal value.
    pub fn of(value: &Value) -> DataType {
        match value {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Boolean,
            Value::Int(_) => DataType::BigInt,
            Value::Float(_) => DataType::Double,
            Value::String(_) => DataType::Varchar,
            Value::Bytes(_) => DataType::Binary,
        }
    }

    /// True for [`DataType::Struct`].
    pub fn is_struct(&self) -> bool {
        matches!(self, DataType::Struct(_))
    }

    /// Least restrictive common type of two inputs, used by set operations.
    pub fn least_restrictive(&self, other: &DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a.clone(),
            (DataType::Null, b) => b.clone(),
            (a, DataType::Null) => a.clone(),
            (DataType::BigInt, DataType::Double) | (DataType::Double, DataType::BigInt) => {
                DataType::Double
            }
            (a, _) => a.clone(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Double => write!(f, "DOUBLE"),
            DataType::Varchar => write!(f, "VARCHAR"),
            DataType::Binary => write!(f, "BINARY"),
            DataType::Null => write!(f, "NULL"),
            DataType::Struct(fields) => {
                write!(f, "STRUCT(")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} {ty}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One named field of a tuple type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Field {
    /// Identity that survives renames and pass-through projections.
    pub id: FieldId,
    /// Output name.
    pub name: String,
    /// Field type.
    pub ty: DataType,
    /// Whether the field may hold null.
    pub nullable: bool,
}

impl Field {
    /// Creates a field with a freshly allocated id.
    pub fn new(name: impl Into<String>, ty: DataType, nullable: bool) -> Self {
        Self {
            id: FieldId::fresh(),
            name: name.into(),
            ty,
            nullable,
        }
    }

    /// Same identity and type under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Ordered list of fields describing the rows a node produces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TupleType {
    fields: Vec<Field>,
}

impl TupleType {
    /// Wraps a field list.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Convenience constructor from `(name, type, nullable)` triples.
    pub fn of(columns: &[(&str, DataType, bool)]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|(name, ty, nullable)| Field::new(*name, ty.clone(), *nullable))
                .collect(),
        )
    }

    /// Fields in order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the type has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field at `ordinal`, if in range.
    pub fn field(&self, ordinal: usize) -> Option<&Field> {
        self.fields.get(ordinal)
    }

    /// Position of the first field named `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Field names in order.
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Same fields with new names; identities and types are kept.
    pub fn renamed(&self, names: &[String]) -> Self {
        Self::new(
            self.fields
                .iter()
                .zip(names)
                .map(|(field, name)| field.renamed(name.clone()))
                .collect(),
        )
    }

    /// Concatenation used by joins. Outer sides become nullable.
    pub fn join(left: &TupleType, right: &TupleType, left_nullable: bool, right_nullable: bool) -> Self {
        let mut fields = Vec::with_capacity(left.len() + right.len());
        for field in left.fields() {
            let mut field = field.clone();
            field.nullable |= left_nullable;
            fields.push(field);
        }
        for field in right.fields() {
            let mut field = field.clone();
            field.nullable |= right_nullable;
            fields.push(field);
        }
        Self::new(fields)
    }

    /// True when both types have the same field types and nullability, ignoring names.
    pub fn same_shape(&self, other: &TupleType) -> bool {
        self.len() == other.len()
            && self
                .fields
                .iter()
                .zip(other.fields())
                .all(|(a, b)| a.ty == b.ty && a.nullable == b.nullable)
    }
}

impl fmt::Display for TupleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordType(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", field.ty, field.name)?;
            if !field.nullable {
                write!(f, " NOT NULL")?;
            }
        }
        write!(f, ")")
    }
}

/// Produces unique names by suffixing duplicates, e.g. `id`, `id0`, `id1`.
pub(crate) fn uniquify(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(names.len());
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if seen.insert(name.clone()) {
            out.push(name);
            continue;
        }
        let mut suffix = 0usize;
        loop {
            let candidate = format!("{name}{suffix}");
            if seen.insert(candidate.clone()) {
                out.push(candidate);
                break;
            }
            suffix += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_keeps_field_identity() {
        let ty = TupleType::of(&[("a", DataType::BigInt, false), ("b", DataType::Varchar, true)]);
        let renamed = ty.renamed(&["x".into(), "y".into()]);
        assert_eq!(renamed.names(), vec!["x", "y"]);
        assert_eq!(renamed.fields()[0].id, ty.fields()[0].id);
        assert!(renamed.same_shape(&ty));
    }

    #[test]
    fn uniquify_suffixes_duplicates() {
        let names = uniquify(vec!["id".into(), "id".into(), "id".into()]);
        assert_eq!(names, vec!["id", "id0", "id1"]);
    }
}
