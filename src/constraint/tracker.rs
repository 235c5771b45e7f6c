use std::sync::Arc;

use tracing::{debug, warn};

use crate::alg::node::AlgNode;
use crate::catalog::Snapshot;
use crate::types::{EntityId, QuarryError, Result};

use super::checks::{table_duplicate_check, table_reference_check};
use super::unique_constraints;

/// Whole-entity check run at commit.
#[derive(Clone, Debug)]
pub struct CommitCheck {
    /// Violating rows.
    pub check: AlgNode,
    /// Error raised when the check returns rows.
    pub message: String,
}

/// Checks re-validating every constraint that involves `entity`: its UNIQUE and
/// PRIMARY KEY constraints, its foreign keys and the foreign keys of other
/// entities that reference it.
pub fn commit_checks(
    snapshot: &Arc<dyn Snapshot>,
    entity: EntityId,
    unique: bool,
    foreign_keys: bool,
) -> Result<Vec<CommitCheck>> {
    let def = snapshot.entity_by_id(entity)?;
    let mut checks = Vec::new();
    if unique {
        for constraint in unique_constraints(snapshot.as_ref(), entity) {
            checks.push(CommitCheck {
                check: table_duplicate_check(snapshot, &def, &constraint.key.columns)?,
                message: format!(
                    "Transaction violates unique constraint `{}`.`{}`",
                    def.name, constraint.name
                ),
            });
        }
    }
    if foreign_keys {
        for fk in snapshot.foreign_keys(entity) {
            let referenced = snapshot.entity_by_id(fk.referenced)?;
            checks.push(CommitCheck {
                check: table_reference_check(snapshot, &def, &referenced, &fk)?,
                message: format!("Transaction violates foreign key constraint `{}`.`{}`", def.name, fk.name),
            });
        }
        for fk in snapshot.exported_keys(entity) {
            if fk.entity == entity {
                continue;
            }
            let referencing = snapshot.entity_by_id(fk.entity)?;
            checks.push(CommitCheck {
                check: table_reference_check(snapshot, &referencing, &def, &fk)?,
                message: format!(
                    "Transaction violates foreign key constraint `{}`.`{}`",
                    referencing.name, fk.name
                ),
            });
        }
    }
    Ok(checks)
}

/// Validates whole entities, for commits and for switching enforcement on at runtime.
pub struct ConstraintTracker {
    snapshot: Arc<dyn Snapshot>,
}

impl ConstraintTracker {
    /// Tracker over `snapshot`.
    pub fn new(snapshot: Arc<dyn Snapshot>) -> Self {
        Self { snapshot }
    }

    /// Runs the commit checks of `entities` through `run`, which executes a check
    /// and returns its row count. The first check returning rows fails.
    pub fn validate(
        &self,
        entities: impl IntoIterator<Item = EntityId>,
        unique: bool,
        foreign_keys: bool,
        run: &mut dyn FnMut(&AlgNode) -> Result<usize>,
    ) -> Result<()> {
        let mut ran = 0usize;
        for entity in entities {
            for check in commit_checks(&self.snapshot, entity, unique, foreign_keys)? {
                ran += 1;
                let rows = run(&check.check)?;
                if rows > 0 {
                    warn!(entity = %entity, rows, message = %check.message, "constraint.commit.violation");
                    return Err(QuarryError::ConstraintViolation(check.message));
                }
            }
        }
        debug!(checks = ran, "constraint.commit.validated");
        Ok(())
    }

    /// Validates every entity of the catalog.
    pub fn validate_all(
        &self,
        unique: bool,
        foreign_keys: bool,
        run: &mut dyn FnMut(&AlgNode) -> Result<usize>,
    ) -> Result<()> {
        let ids: Vec<EntityId> = self.snapshot.entities().iter().map(|e| e.id).collect();
        self.validate(ids, unique, foreign_keys, run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::types::DataType;
    use crate::catalog::{EntityDef, ForeignKeyAction, ForeignKeyDef, InMemorySnapshot};

    fn snapshot() -> Arc<dyn Snapshot> {
        Arc::new(
            InMemorySnapshot::new()
                .with_entity(EntityDef::new(EntityId(1), "users").column("id", DataType::BigInt, false))
                .with_entity(
                    EntityDef::new(EntityId(2), "orders")
                        .column("id", DataType::BigInt, false)
                        .column("user_id", DataType::BigInt, true),
                )
                .with_primary_key(EntityId(1), &["id"])
                .with_foreign_key(ForeignKeyDef {
                    name: "fk_user".into(),
                    entity: EntityId(2),
                    columns: vec!["user_id".into()],
                    referenced: EntityId(1),
                    referenced_columns: vec!["id".into()],
                    on_update: ForeignKeyAction::Restrict,
                    on_delete: ForeignKeyAction::Restrict,
                }),
        )
    }

    #[test]
    fn referenced_entity_rechecks_incoming_keys() {
        let messages: Vec<_> = commit_checks(&snapshot(), EntityId(1), true, true)
            .unwrap()
            .into_iter()
            .map(|c| c.message)
            .collect();
        assert_eq!(
            messages,
            vec![
                "Transaction violates unique constraint `users`.`PRIMARY KEY`",
                "Transaction violates foreign key constraint `orders`.`fk_user`",
            ]
        );
    }

    #[test]
    fn first_violating_check_fails_validation() {
        let tracker = ConstraintTracker::new(snapshot());
        let mut calls = 0;
        let err = tracker
            .validate_all(true, true, &mut |_| {
                calls += 1;
                Ok(if calls == 2 { 1 } else { 0 })
            })
            .unwrap_err();
        assert_eq!(err.code(), "ConstraintViolation");
        assert_eq!(calls, 2);
    }
}
