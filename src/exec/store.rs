use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::alg::value::Value;
use crate::types::{EntityId, Result};

/// One stored row.
pub type Row = Vec<Value>;

/// Rows of every entity, kept in insertion order.
#[derive(Default)]
pub struct MemStore {
    tables: RwLock<FxHashMap<EntityId, Vec<Row>>>,
}

impl MemStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `rows` to `entity`; returns how many were added.
    pub fn insert_rows(&self, entity: EntityId, rows: Vec<Row>) -> usize {
        let count = rows.len();
        self.tables.write().entry(entity).or_default().extend(rows);
        count
    }

    /// Copy of the rows of `entity`.
    pub fn rows(&self, entity: EntityId) -> Vec<Row> {
        self.tables.read().get(&entity).cloned().unwrap_or_default()
    }

    /// Number of rows stored for `entity`.
    pub fn len(&self, entity: EntityId) -> usize {
        self.tables.read().get(&entity).map_or(0, Vec::len)
    }

    /// True when `entity` holds no rows.
    pub fn is_empty(&self, entity: EntityId) -> bool {
        self.len(entity) == 0
    }

    /// Removes one stored row per entry of `rows`; returns how many were removed.
    pub fn delete_rows(&self, entity: EntityId, rows: &[Row]) -> usize {
        let mut tables = self.tables.write();
        let Some(stored) = tables.get_mut(&entity) else {
            return 0;
        };
        let mut removed = 0;
        for row in rows {
            if let Some(pos) = stored.iter().position(|s| s == row) {
                stored.remove(pos);
                removed += 1;
            }
        }
        removed
    }

    /// Rewrites stored rows in place. `f` returns whether it changed the row;
    /// the write lock is held for the whole pass, so either every change lands or,
    /// on error, none does.
    pub fn update_with(
        &self,
        entity: EntityId,
        f: &mut dyn FnMut(&mut Row) -> Result<bool>,
    ) -> Result<usize> {
        let mut tables = self.tables.write();
        let Some(stored) = tables.get_mut(&entity) else {
            return Ok(0);
        };
        let mut next = stored.clone();
        let mut changed = 0;
        for row in next.iter_mut() {
            if f(row)? {
                changed += 1;
            }
        }
        *stored = next;
        Ok(changed)
    }
}
