//! Group keys, aggregate calls and the expression registrar used by `aggregate`.

use crate::alg::node::AggFunction;
use crate::alg::rex::Rex;

use super::SortKey;

/// Group key of an aggregate: key expressions plus optional grouping sets.
#[derive(Clone, Debug)]
pub struct GroupKey {
    pub(crate) nodes: Vec<Rex>,
    pub(crate) sets: Option<Vec<Vec<Rex>>>,
    pub(crate) alias: Option<String>,
}

impl GroupKey {
    /// Key over `nodes` with a single grouping set.
    pub fn new(nodes: Vec<Rex>) -> Self {
        Self {
            nodes,
            sets: None,
            alias: None,
        }
    }

    /// Key with explicit grouping sets; each must be a subset of `nodes`.
    pub fn with_sets(nodes: Vec<Rex>, sets: Vec<Vec<Rex>>) -> Self {
        Self {
            nodes,
            sets: Some(sets),
            alias: None,
        }
    }

    /// Copy of this key whose output fields are aliased `alias`.
    pub fn alias(&self, alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..self.clone()
        }
    }

    /// Number of key expressions.
    pub fn group_key_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Aggregate call description over expressions of the current frame.
///
/// Every modifier returns a new value; a call can be shared between builders.
#[derive(Clone, Debug)]
pub struct AggCall {
    pub(crate) function: AggFunction,
    pub(crate) distinct: bool,
    pub(crate) filter: Option<Rex>,
    pub(crate) operands: Vec<Rex>,
    pub(crate) order_keys: Vec<SortKey>,
    pub(crate) alias: Option<String>,
}

impl AggCall {
    /// Call of `function` over `operands`.
    pub fn new(function: AggFunction, operands: Vec<Rex>) -> Self {
        Self {
            function,
            distinct: false,
            filter: None,
            operands,
            order_keys: Vec::new(),
            alias: None,
        }
    }

    /// `COUNT(*)`
    pub fn count_star() -> Self {
        Self::new(AggFunction::Count, Vec::new())
    }

    /// Copy with the DISTINCT flag set to `distinct`.
    pub fn distinct(&self, distinct: bool) -> Self {
        Self {
            distinct,
            ..self.clone()
        }
    }

    /// Copy that only aggregates rows where `filter` is true.
    pub fn filter(&self, filter: Rex) -> Self {
        Self {
            filter: Some(filter),
            ..self.clone()
        }
    }

    /// Copy with an ordering inside each group.
    pub fn sort(&self, keys: Vec<SortKey>) -> Self {
        Self {
            order_keys: keys,
            ..self.clone()
        }
    }

    /// Copy whose output field is named `alias`.
    pub fn alias(&self, alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..self.clone()
        }
    }
}

/// Collects the expressions an aggregate reads, reusing the input fields where possible.
pub(crate) struct Registrar {
    pub(crate) exprs: Vec<Rex>,
    field_count: usize,
}

impl Registrar {
    /// Starts from the input fields as plain references.
    pub(crate) fn new(fields: Vec<Rex>) -> Self {
        let field_count = fields.len();
        Self {
            exprs: fields,
            field_count,
        }
    }

    /// Ordinal of `rex`, appending it when it is not yet known.
    pub(crate) fn register(&mut self, rex: &Rex) -> usize {
        if let Some(i) = rex.as_input_ref() {
            if i < self.field_count {
                return i;
            }
        }
        match self.exprs.iter().position(|e| e == rex) {
            Some(i) => i,
            None => {
                self.exprs.push(rex.clone());
                self.exprs.len() - 1
            }
        }
    }

    pub(crate) fn register_all(&mut self, rexes: &[Rex]) -> Vec<usize> {
        rexes.iter().map(|r| self.register(r)).collect()
    }

    /// True when some expression needs a preparatory projection.
    pub(crate) fn needs_project(&self) -> bool {
        self.exprs.len() > self.field_count
    }
}
