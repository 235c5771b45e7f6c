//! Read-only catalog snapshot consumed by the pipeline.
//!
//! The real catalog lives outside this crate. [`Snapshot`] is the contract the
//! builder, the constraint enforcer and the routers read through; one snapshot is a
//! point-in-time view used for a whole statement. [`InMemorySnapshot`] is a simple
//! implementation for tests and embedding.

use std::collections::HashMap;
use std::sync::Arc;

use crate::alg::metadata::Statistics;
use crate::alg::node::EntityRef;
use crate::alg::traits::DataModel;
use crate::alg::types::{DataType, Field, TupleType};
use crate::alg::value::Value;
use crate::types::{AdapterId, EntityId, PartitionId, QuarryError, Result};

/// Column of an entity.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub ty: DataType,
    /// Whether the column admits nulls.
    pub nullable: bool,
}

/// One partition and the partition-column values routed to it.
/// A partition with no values receives everything unmatched.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionDef {
    /// Partition id.
    pub id: PartitionId,
    /// Values of the partition column held by this partition.
    pub values: Vec<Value>,
}

/// List partitioning over a single column.
#[derive(Clone, Debug, PartialEq)]
pub struct Partitioning {
    /// Partition column.
    pub column: String,
    /// Partitions in declaration order.
    pub partitions: Vec<PartitionDef>,
}

/// Table, collection or graph known to the catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityDef {
    /// Catalog id.
    pub id: EntityId,
    /// Name used for lookups.
    pub name: String,
    /// Data model.
    pub model: DataModel,
    /// Columns in position order.
    pub columns: Vec<ColumnDef>,
    /// Adapters holding a full placement of the entity.
    pub placements: Vec<AdapterId>,
    /// Optional partitioning.
    pub partitioning: Option<Partitioning>,
}

impl EntityDef {
    /// Relational entity with no columns and no placements.
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            model: DataModel::Relational,
            columns: Vec::new(),
            placements: Vec::new(),
            partitioning: None,
        }
    }

    /// Appends a column.
    pub fn column(mut self, name: impl Into<String>, ty: DataType, nullable: bool) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
            nullable,
        });
        self
    }

    /// Adds a placement on an adapter.
    pub fn placement(mut self, adapter: AdapterId) -> Self {
        self.placements.push(adapter);
        self
    }

    /// Declares list partitioning.
    pub fn partitioned_by(mut self, column: impl Into<String>, partitions: Vec<PartitionDef>) -> Self {
        self.partitioning = Some(Partitioning {
            column: column.into(),
            partitions,
        });
        self
    }

    /// Fresh tuple type over the columns.
    pub fn row_type(&self) -> TupleType {
        TupleType::new(
            self.columns
                .iter()
                .map(|c| Field::new(c.name.clone(), c.ty.clone(), c.nullable))
                .collect(),
        )
    }

    /// Unrouted reference for scans and modifies.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.id, self.name.clone())
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Position of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Named column list forming a key.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyDef {
    /// Key columns.
    pub columns: Vec<String>,
}

/// UNIQUE constraint.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintDef {
    /// Constraint name.
    pub name: String,
    /// Key columns.
    pub key: KeyDef,
}

/// Referential action of a foreign key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForeignKeyAction {
    /// Reject changes to referenced rows.
    Restrict,
    /// Propagate the change.
    Cascade,
    /// Null out referencing columns.
    SetNull,
    /// Reset referencing columns to their default.
    SetDefault,
}

impl std::fmt::Display for ForeignKeyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ForeignKeyAction::Restrict => "RESTRICT",
            ForeignKeyAction::Cascade => "CASCADE",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::SetDefault => "SET DEFAULT",
        };
        f.write_str(name)
    }
}

/// FOREIGN KEY from `entity(columns)` to `referenced(referenced_columns)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ForeignKeyDef {
    /// Constraint name.
    pub name: String,
    /// Referencing entity.
    pub entity: EntityId,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced entity.
    pub referenced: EntityId,
    /// Referenced columns, parallel to `columns`.
    pub referenced_columns: Vec<String>,
    /// Action on update of a referenced row.
    pub on_update: ForeignKeyAction,
    /// Action on delete of a referenced row.
    pub on_delete: ForeignKeyAction,
}

/// Point-in-time, read-only view of catalog metadata.
pub trait Snapshot: Statistics + Send + Sync {
    /// Catalog version the snapshot was taken at; bumps on every schema change.
    fn version(&self) -> u64;
    /// Looks up an entity by name.
    fn entity(&self, name: &str) -> Result<Arc<EntityDef>>;
    /// Looks up an entity by id.
    fn entity_by_id(&self, id: EntityId) -> Result<Arc<EntityDef>>;
    /// All entities.
    fn entities(&self) -> Vec<Arc<EntityDef>>;
    /// Primary key of an entity.
    fn primary_key(&self, id: EntityId) -> Option<KeyDef>;
    /// UNIQUE constraints of an entity (excluding the primary key).
    fn constraints(&self, id: EntityId) -> Vec<ConstraintDef>;
    /// Foreign keys declared on an entity.
    fn foreign_keys(&self, id: EntityId) -> Vec<ForeignKeyDef>;
    /// Foreign keys in other entities that reference this one.
    fn exported_keys(&self, id: EntityId) -> Vec<ForeignKeyDef>;

    /// Partitions that may hold rows whose partition column equals one of `values`.
    /// `None` means the predicate does not restrict the partition column.
    fn accessed_partitions(&self, id: EntityId, values: Option<&[Value]>) -> Result<Vec<PartitionId>> {
        let entity = self.entity_by_id(id)?;
        let Some(partitioning) = &entity.partitioning else {
            return Ok(Vec::new());
        };
        let all = || partitioning.partitions.iter().map(|p| p.id).collect::<Vec<_>>();
        let Some(values) = values else {
            return Ok(all());
        };
        let mut ids = Vec::new();
        for value in values {
            let hit = partitioning
                .partitions
                .iter()
                .find(|p| p.values.contains(value))
                .or_else(|| partitioning.partitions.iter().find(|p| p.values.is_empty()));
            if let Some(partition) = hit {
                if !ids.contains(&partition.id) {
                    ids.push(partition.id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Statistics view over a shared snapshot, for code that only needs row counts.
#[derive(Clone)]
pub struct CatalogStatistics(pub Arc<dyn Snapshot>);

impl Statistics for CatalogStatistics {
    fn row_count(&self, entity: EntityId) -> Option<f64> {
        self.0.row_count(entity)
    }
}

/// Simple in-memory snapshot used for tests or embedding.
#[derive(Clone, Default)]
pub struct InMemorySnapshot {
    version: u64,
    entities: HashMap<String, Arc<EntityDef>>,
    names: HashMap<EntityId, String>,
    primary_keys: HashMap<EntityId, KeyDef>,
    uniques: HashMap<EntityId, Vec<ConstraintDef>>,
    foreign_keys: Vec<ForeignKeyDef>,
    row_counts: HashMap<EntityId, f64>,
}

impl InMemorySnapshot {
    /// Creates an empty snapshot at version 1.
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Self::default()
        }
    }

    /// Sets the catalog version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Registers an entity.
    pub fn with_entity(mut self, entity: EntityDef) -> Self {
        self.names.insert(entity.id, entity.name.clone());
        self.entities.insert(entity.name.clone(), Arc::new(entity));
        self
    }

    /// Declares the primary key of a registered entity.
    pub fn with_primary_key(mut self, id: EntityId, columns: &[&str]) -> Self {
        self.primary_keys.insert(
            id,
            KeyDef {
                columns: columns.iter().map(|c| c.to_string()).collect(),
            },
        );
        self
    }

    /// Declares a UNIQUE constraint.
    pub fn with_unique(mut self, id: EntityId, name: impl Into<String>, columns: &[&str]) -> Self {
        self.uniques.entry(id).or_default().push(ConstraintDef {
            name: name.into(),
            key: KeyDef {
                columns: columns.iter().map(|c| c.to_string()).collect(),
            },
        });
        self
    }

    /// Declares a foreign key.
    pub fn with_foreign_key(mut self, fk: ForeignKeyDef) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Records a row-count statistic.
    pub fn with_row_count(mut self, id: EntityId, rows: f64) -> Self {
        self.row_counts.insert(id, rows);
        self
    }
}

impl Statistics for InMemorySnapshot {
    fn row_count(&self, entity: EntityId) -> Option<f64> {
        self.row_counts.get(&entity).copied()
    }
}

impl Snapshot for InMemorySnapshot {
    fn version(&self) -> u64 {
        self.version
    }

    fn entity(&self, name: &str) -> Result<Arc<EntityDef>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| QuarryError::NotFound(format!("entity '{name}'")))
    }

    fn entity_by_id(&self, id: EntityId) -> Result<Arc<EntityDef>> {
        self.names
            .get(&id)
            .and_then(|name| self.entities.get(name))
            .cloned()
            .ok_or_else(|| QuarryError::NotFound(format!("entity #{id}")))
    }

    fn entities(&self) -> Vec<Arc<EntityDef>> {
        let mut all: Vec<_> = self.entities.values().cloned().collect();
        all.sort_by_key(|e| e.id);
        all
    }

    fn primary_key(&self, id: EntityId) -> Option<KeyDef> {
        self.primary_keys.get(&id).cloned()
    }

    fn constraints(&self, id: EntityId) -> Vec<ConstraintDef> {
        self.uniques.get(&id).cloned().unwrap_or_default()
    }

    fn foreign_keys(&self, id: EntityId) -> Vec<ForeignKeyDef> {
        self.foreign_keys
            .iter()
            .filter(|fk| fk.entity == id)
            .cloned()
            .collect()
    }

    fn exported_keys(&self, id: EntityId) -> Vec<ForeignKeyDef> {
        self.foreign_keys
            .iter()
            .filter(|fk| fk.referenced == id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> InMemorySnapshot {
        InMemorySnapshot::new().with_entity(
            EntityDef::new(EntityId(1), "orders")
                .column("id", DataType::BigInt, false)
                .column("region", DataType::Varchar, false)
                .partitioned_by(
                    "region",
                    vec![
                        PartitionDef {
                            id: PartitionId(10),
                            values: vec![Value::from("eu")],
                        },
                        PartitionDef {
                            id: PartitionId(11),
                            values: vec![Value::from("us")],
                        },
                        PartitionDef {
                            id: PartitionId(12),
                            values: Vec::new(),
                        },
                    ],
                ),
        )
    }

    #[test]
    fn partitions_resolve_by_value_with_default_fallback() {
        let snap = snapshot();
        let eu = snap
            .accessed_partitions(EntityId(1), Some(&[Value::from("eu")]))
            .unwrap();
        assert_eq!(eu, vec![PartitionId(10)]);
        let other = snap
            .accessed_partitions(EntityId(1), Some(&[Value::from("apac"), Value::from("us")]))
            .unwrap();
        assert_eq!(other, vec![PartitionId(11), PartitionId(12)]);
        assert_eq!(snap.accessed_partitions(EntityId(1), None).unwrap().len(), 3);
    }

    #[test]
    fn unknown_entity_is_not_found() {
        let err = snapshot().entity("nope").unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }
}
