//! Reference interpreter for enumerable plans over an in-memory store.
//!
//! The interpreter is the implementor used by tests and benchmarks: it accepts
//! a fully enumerable tree, and binding the prepared result evaluates the tree
//! row by row against [`MemStore`].

mod executor;
mod store;

use std::sync::Arc;

use tracing::trace;

use crate::alg::explain::{dump_plan, ExplainFormat};
use crate::alg::node::AlgRoot;
use crate::alg::traits::Convention;
use crate::alg::types::TupleType;
use crate::alg::value::Value;
use crate::processing::{Implementor, PreparedResult};
use crate::types::{QuarryError, Result};

pub use store::{MemStore, Row};

use executor::Executor;

/// Implements enumerable plans by interpretation.
#[derive(Clone, Default)]
pub struct Interpreter {
    store: Arc<MemStore>,
}

impl Interpreter {
    /// Interpreter over `store`.
    pub fn new(store: Arc<MemStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    /// Runs an enumerable or logical node directly, outside any statement.
    pub fn run(&self, node: &crate::alg::node::AlgNode) -> Result<Vec<Row>> {
        Executor::new(&self.store, &[]).run(node)
    }
}

impl Implementor for Interpreter {
    fn implement(&self, root: &AlgRoot, parameter_type: &TupleType) -> Result<Arc<dyn PreparedResult>> {
        let mut logical = None;
        root.node.walk(&mut |n| {
            if logical.is_none() && n.convention() != Convention::Enumerable {
                logical = Some(n.op().name());
            }
        });
        if let Some(name) = logical {
            return Err(QuarryError::CouldNotImplement(format!(
                "interpreter cannot run logical {name}"
            )));
        }
        trace!(parameters = parameter_type.len(), "interpreter.implement");
        Ok(Arc::new(InterpretedPlan {
            store: self.store.clone(),
            root: root.clone(),
            parameter_type: parameter_type.clone(),
        }))
    }
}

/// A physical root bound to the store that will evaluate it.
pub struct InterpretedPlan {
    store: Arc<MemStore>,
    root: AlgRoot,
    parameter_type: TupleType,
}

impl InterpretedPlan {
    /// Row type of the dynamic parameters.
    pub fn parameter_type(&self) -> &TupleType {
        &self.parameter_type
    }
}

impl PreparedResult for InterpretedPlan {
    fn row_type(&self) -> TupleType {
        let fields = self.root.node.row_type().fields();
        TupleType::new(
            self.root
                .fields
                .iter()
                .filter_map(|(i, name)| fields.get(*i).map(|f| f.renamed(name.clone())))
                .collect(),
        )
    }

    fn is_dml(&self) -> bool {
        self.root.kind.is_dml()
    }

    fn bind(&self, parameters: &[Vec<Value>]) -> Result<Vec<Vec<Value>>> {
        if let Some(row) = parameters.iter().find(|r| r.len() < self.parameter_type.len()) {
            return Err(QuarryError::Invalid(format!(
                "expected {} parameters, got {}",
                self.parameter_type.len(),
                row.len()
            )));
        }
        let rows = Executor::new(&self.store, parameters).run(&self.root.node)?;
        if self.root.is_trivial() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .map(|row| self.root.fields.iter().map(|(i, _)| row[*i].clone()).collect())
            .collect())
    }

    fn code(&self) -> String {
        dump_plan("interpreted plan", &self.root.node, ExplainFormat::Text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::node::{AlgNode, EntityRef, Kind};
    use crate::alg::types::DataType;
    use crate::types::EntityId;

    fn scan() -> AlgNode {
        AlgNode::scan(
            EntityRef::new(EntityId(1), "t"),
            TupleType::of(&[("a", DataType::BigInt, false), ("b", DataType::BigInt, true)]),
        )
    }

    #[test]
    fn logical_trees_are_rejected() {
        let interpreter = Interpreter::default();
        let err = interpreter
            .implement(&AlgRoot::of(scan(), Kind::Select), &TupleType::new(vec![]))
            .err()
            .unwrap();
        assert_eq!(err.code(), "CouldNotImplement");
    }

    #[test]
    fn bind_projects_through_root_fields() {
        let store = Arc::new(MemStore::new());
        store.insert_rows(EntityId(1), vec![vec![Value::Int(1), Value::Int(2)]]);
        let interpreter = Interpreter::new(store);
        let node = scan().with_convention(Convention::Enumerable);
        let mut root = AlgRoot::of(node, Kind::Select);
        root.fields = vec![(1, "b".into())];
        let plan = interpreter.implement(&root, &TupleType::new(vec![])).unwrap();
        assert_eq!(plan.row_type().names(), vec!["b".to_string()]);
        assert_eq!(plan.bind(&[]).unwrap(), vec![vec![Value::Int(2)]]);
        assert!(plan.code().starts_with("interpreted plan"));
    }
}
