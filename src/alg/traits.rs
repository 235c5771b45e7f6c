//! Physical traits attached to every node.

use std::fmt;

/// Execution family a node is compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Convention {
    /// Logical operator; not executable.
    Logical,
    /// Iterator-based physical operator.
    Enumerable,
}

/// Data model the node operates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataModel {
    /// Tables and rows.
    Relational,
    /// Collections of documents.
    Document,
    /// Property graphs.
    Graph,
}

/// Sort direction of one collation key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Placement of nulls in a collation key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NullDirection {
    /// Nulls before values.
    First,
    /// Nulls after values.
    Last,
}

/// One sort key over a field ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldCollation {
    /// Field ordinal in the node's tuple type.
    pub field: usize,
    /// Sort direction.
    pub direction: Direction,
    /// Null placement.
    pub nulls: NullDirection,
}

impl FieldCollation {
    /// Ascending, nulls last.
    pub fn asc(field: usize) -> Self {
        Self {
            field,
            direction: Direction::Ascending,
            nulls: NullDirection::Last,
        }
    }

    /// Descending, nulls first.
    pub fn desc(field: usize) -> Self {
        Self {
            field,
            direction: Direction::Descending,
            nulls: NullDirection::First,
        }
    }
}

impl fmt::Display for FieldCollation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.field)?;
        if self.direction == Direction::Descending {
            write!(f, " DESC")?;
        }
        if self.nulls == NullDirection::First {
            write!(f, " NULLS FIRST")?;
        }
        Ok(())
    }
}

/// Ordered list of sort keys; empty means "no particular order".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Collation(pub Vec<FieldCollation>);

impl Collation {
    /// The empty collation.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// True when no order is imposed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys in order.
    pub fn keys(&self) -> &[FieldCollation] {
        &self.0
    }

    /// A delivered collation satisfies a required one when the requirement is a prefix.
    pub fn satisfies(&self, required: &Collation) -> bool {
        required.0.len() <= self.0.len() && self.0.iter().zip(&required.0).all(|(a, b)| a == b)
    }

    /// Remaps key ordinals; `None` when a key has no image.
    pub fn remap(&self, map: impl Fn(usize) -> Option<usize>) -> Option<Collation> {
        self.0
            .iter()
            .map(|key| {
                map(key.field).map(|field| FieldCollation { field, ..*key })
            })
            .collect::<Option<Vec<_>>>()
            .map(Collation)
    }
}

impl fmt::Display for Collation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}")?;
        }
        write!(f, "]")
    }
}

/// A node's physical attributes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraitSet {
    /// Execution convention.
    pub convention: Convention,
    /// Order the node's output is known to have.
    pub collation: Collation,
    /// Data model.
    pub model: DataModel,
}

impl TraitSet {
    /// Logical relational traits with no ordering.
    pub fn logical() -> Self {
        Self {
            convention: Convention::Logical,
            collation: Collation::empty(),
            model: DataModel::Relational,
        }
    }

    /// Enumerable traits with no ordering; the usual root requirement.
    pub fn enumerable() -> Self {
        Self {
            convention: Convention::Enumerable,
            ..Self::logical()
        }
    }

    /// Replaces the convention.
    pub fn with_convention(&self, convention: Convention) -> Self {
        Self {
            convention,
            ..self.clone()
        }
    }

    /// Replaces the collation.
    pub fn with_collation(&self, collation: Collation) -> Self {
        Self {
            collation,
            ..self.clone()
        }
    }

    /// True when `self` can be used where `required` is demanded.
    pub fn satisfies(&self, required: &TraitSet) -> bool {
        self.convention == required.convention && self.collation.satisfies(&required.collation)
    }
}

impl Default for TraitSet {
    fn default() -> Self {
        Self::logical()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collation_prefix_satisfies_requirement() {
        let delivered = Collation(vec![FieldCollation::asc(0), FieldCollation::desc(2)]);
        assert!(delivered.satisfies(&Collation(vec![FieldCollation::asc(0)])));
        assert!(delivered.satisfies(&Collation::empty()));
        assert!(!delivered.satisfies(&Collation(vec![FieldCollation::desc(2)])));
    }
}
