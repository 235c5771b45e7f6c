//! Constraint enforcement for data-modification trees.
//!
//! Before-execution enforcement wraps the modify in a chain of conditional-execute
//! guards, one per check query. The modify stays the innermost guarded input and
//! each new guard wraps the previous root, so the last guard added runs first.
//! After-execution enforcement leaves the tree alone; the transaction records the
//! modified entity and [`commit_checks`] re-validates it when the transaction commits.

mod checks;
mod tracker;

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

pub use tracker::{commit_checks, CommitCheck, ConstraintTracker};

use crate::alg::node::{AlgNode, AlgOp, AlgRoot, CheckCondition, ModifyOperation};
use crate::alg::rex::Rex;
use crate::alg::value::Value;
use crate::catalog::{ConstraintDef, EntityDef, ForeignKeyAction, ForeignKeyDef, KeyDef, Snapshot};
use crate::config::{EnforcementTime, ProcessorConfig};
use crate::types::{EntityId, QuarryError, Result};

use checks::{
    duplicate_key_check, existing_key_check, input_ordinal, missing_reference_check,
    other_row_key_check, referencing_rows_check, updated_values,
};

/// Name under which the primary key is enforced as a UNIQUE constraint.
pub const PRIMARY_KEY: &str = "PRIMARY KEY";

/// One guard to wrap around the statement.
#[derive(Clone, Debug)]
pub struct Guard {
    /// Check query; violating rows.
    pub check: AlgNode,
    /// Error raised when the check returns rows.
    pub message: String,
    /// Description attached to the guard.
    pub description: String,
}

/// UNIQUE constraints of an entity with the primary key first.
pub fn unique_constraints(snapshot: &dyn Snapshot, id: EntityId) -> Vec<ConstraintDef> {
    let mut all = Vec::new();
    if let Some(key) = snapshot.primary_key(id) {
        all.push(ConstraintDef {
            name: PRIMARY_KEY.to_string(),
            key,
        });
    }
    all.extend(snapshot.constraints(id));
    all
}

fn column_list(columns: &[String]) -> String {
    columns.join(", ")
}

/// `fk` (`t` [a] -> `r` [x], ON UPDATE RESTRICT)
fn describe_foreign_key(
    fk: &ForeignKeyDef,
    referencing: &str,
    referenced: &str,
    event: &str,
    action: ForeignKeyAction,
) -> String {
    format!(
        "`{}` (`{referencing}` [{}] -> `{referenced}` [{}], ON {event} {action})",
        fk.name,
        column_list(&fk.columns),
        column_list(&fk.referenced_columns),
    )
}

/// Rewrites data-modification roots so that constraint violations abort them.
pub struct ConstraintEnforcer {
    snapshot: Arc<dyn Snapshot>,
    time: EnforcementTime,
    unique: bool,
    foreign_keys: bool,
}

impl ConstraintEnforcer {
    /// Enforcer over `snapshot` with the enforcement switches of `config`.
    pub fn new(snapshot: Arc<dyn Snapshot>, config: &ProcessorConfig) -> Self {
        Self {
            snapshot,
            time: config.constraint_enforcement,
            unique: config.unique_constraint_enforcement,
            foreign_keys: config.foreign_key_enforcement,
        }
    }

    /// True when nothing would be enforced.
    pub fn is_disabled(&self) -> bool {
        !self.unique && !self.foreign_keys
    }

    /// Guarded copy of `root`. Non-modify roots and after-execution mode return
    /// `root` unchanged.
    ///
    /// `parameters` are the batch rows of an already parameterized insert; they
    /// allow the in-batch uniqueness check to run without a query.
    pub fn enforce(&self, root: &AlgRoot, parameters: Option<&[Vec<Value>]>) -> Result<AlgRoot> {
        if self.is_disabled() || self.time == EnforcementTime::AfterQueryExecution {
            return Ok(root.clone());
        }
        let guards = self.guards(&root.node, parameters)?;
        if guards.is_empty() {
            return Ok(root.clone());
        }
        debug!(guards = guards.len(), "constraint.guards");
        let mut node = root.node.clone();
        for guard in guards {
            trace!(description = %guard.description, "constraint.guard");
            node = AlgNode::conditional_execute(
                guard.check,
                node,
                CheckCondition::EqualToZero,
                guard.message,
                guard.description,
            );
        }
        root.with_node(node)
    }

    /// Guards for a modify node, in wrapping order.
    pub fn guards(&self, node: &AlgNode, parameters: Option<&[Vec<Value>]>) -> Result<Vec<Guard>> {
        let AlgOp::Modify {
            entity,
            operation,
            update_columns,
            source_exprs,
        } = node.op()
        else {
            return Ok(Vec::new());
        };
        let def = self.snapshot.entity_by_id(entity.id)?;
        let input = node.input(0)?;
        let mut guards = Vec::new();
        match operation {
            ModifyOperation::Insert => {
                if self.unique {
                    self.insert_unique(&def, input, parameters, &mut guards)?;
                }
                if self.foreign_keys {
                    self.insert_foreign_keys(&def, input, &mut guards)?;
                }
            }
            ModifyOperation::Update | ModifyOperation::Merge => {
                if self.unique {
                    self.update_unique(&def, input, *operation, update_columns, source_exprs, &mut guards)?;
                }
                if self.foreign_keys {
                    self.update_foreign_keys(&def, input, *operation, update_columns, source_exprs, &mut guards)?;
                    self.referencing_rows(&def, input, *operation, update_columns, &mut guards)?;
                }
            }
            ModifyOperation::Delete => {
                if self.foreign_keys {
                    self.referencing_rows(&def, input, *operation, update_columns, &mut guards)?;
                }
            }
        }
        Ok(guards)
    }

    fn key_refs(&self, def: &EntityDef, input: &AlgNode, key: &KeyDef) -> Result<Vec<Rex>> {
        key.columns
            .iter()
            .map(|c| {
                let i = input_ordinal(input, def, c)?;
                Ok(Rex::input(i, &input.row_type().fields()[i]))
            })
            .collect()
    }

    fn insert_unique(
        &self,
        def: &EntityDef,
        input: &AlgNode,
        parameters: Option<&[Vec<Value>]>,
        guards: &mut Vec<Guard>,
    ) -> Result<()> {
        for constraint in unique_constraints(self.snapshot.as_ref(), def.id) {
            let qualified = format!("`{}`.`{}`", def.name, constraint.name);
            let message = format!("Insert violates unique constraint {qualified}");
            let key = self.key_refs(def, input, &constraint.key)?;
            guards.push(Guard {
                check: existing_key_check(&self.snapshot, input, key.clone(), def, &constraint.key.columns)?,
                message: message.clone(),
                description: format!("Enforcement of unique constraint {qualified}"),
            });
            match batch_keys(input, &key, parameters) {
                BatchKeys::Skip => {}
                BatchKeys::Known(tuples) => {
                    if has_duplicate(tuples) {
                        return Err(QuarryError::ConstraintViolation(message));
                    }
                }
                BatchKeys::Unknown => guards.push(Guard {
                    check: duplicate_key_check(&self.snapshot, input, key)?,
                    message,
                    description: format!("Source-internal enforcement of unique constraint {qualified}"),
                }),
            }
        }
        Ok(())
    }

    fn insert_foreign_keys(&self, def: &EntityDef, input: &AlgNode, guards: &mut Vec<Guard>) -> Result<()> {
        for fk in self.snapshot.foreign_keys(def.id) {
            let referenced = self.snapshot.entity_by_id(fk.referenced)?;
            let exprs = self.key_refs(def, input, &KeyDef { columns: fk.columns.clone() })?;
            guards.push(Guard {
                check: missing_reference_check(&self.snapshot, input, exprs, &referenced, &fk)?,
                message: format!("Insert violates foreign key constraint `{}`.`{}`", def.name, fk.name),
                description: format!("Enforcement of foreign key `{}`.`{}`", def.name, fk.name),
            });
        }
        Ok(())
    }

    fn update_unique(
        &self,
        def: &EntityDef,
        input: &AlgNode,
        operation: ModifyOperation,
        update_columns: &[String],
        source_exprs: &[Rex],
        guards: &mut Vec<Guard>,
    ) -> Result<()> {
        let pk = self.snapshot.primary_key(def.id);
        for constraint in unique_constraints(self.snapshot.as_ref(), def.id) {
            if !constraint.key.columns.iter().any(|c| update_columns.contains(c)) {
                continue;
            }
            let qualified = format!("`{}`.`{}`", def.name, constraint.name);
            let message = format!("{} violates unique constraint {qualified}", operation.verb());
            let key = updated_values(input, def, &constraint.key.columns, update_columns, source_exprs)?;
            let (identity, whole_row) = match &pk {
                Some(pk) => (pk.clone(), false),
                None => (KeyDef { columns: def.column_names() }, true),
            };
            let identity_refs = self.key_refs(def, input, &identity)?;
            guards.push(Guard {
                check: other_row_key_check(
                    &self.snapshot,
                    input,
                    identity_refs,
                    key.clone(),
                    def,
                    &identity.columns,
                    &constraint.key.columns,
                    whole_row,
                )?,
                message: message.clone(),
                description: format!("Enforcement of unique constraint {qualified}"),
            });
            guards.push(Guard {
                check: duplicate_key_check(&self.snapshot, input, key)?,
                message,
                description: format!("Source-internal enforcement of unique constraint {qualified}"),
            });
        }
        Ok(())
    }

    fn update_foreign_keys(
        &self,
        def: &EntityDef,
        input: &AlgNode,
        operation: ModifyOperation,
        update_columns: &[String],
        source_exprs: &[Rex],
        guards: &mut Vec<Guard>,
    ) -> Result<()> {
        for fk in self.snapshot.foreign_keys(def.id) {
            if !fk.columns.iter().any(|c| update_columns.contains(c)) {
                continue;
            }
            let referenced = self.snapshot.entity_by_id(fk.referenced)?;
            let exprs = updated_values(input, def, &fk.columns, update_columns, source_exprs)?;
            let described = describe_foreign_key(&fk, &def.name, &referenced.name, "UPDATE", fk.on_update);
            guards.push(Guard {
                check: missing_reference_check(&self.snapshot, input, exprs, &referenced, &fk)?,
                message: format!("{} violates foreign key constraint {described}", operation.verb()),
                description: format!("Enforcement of foreign key `{}`.`{}`", def.name, fk.name),
            });
        }
        Ok(())
    }

    /// Rows of other entities still pointing at the keys an update or delete changes.
    fn referencing_rows(
        &self,
        def: &EntityDef,
        input: &AlgNode,
        operation: ModifyOperation,
        update_columns: &[String],
        guards: &mut Vec<Guard>,
    ) -> Result<()> {
        for fk in self.snapshot.exported_keys(def.id) {
            let (event, action) = match operation {
                ModifyOperation::Delete => ("DELETE", fk.on_delete),
                _ => {
                    if !fk.referenced_columns.iter().any(|c| update_columns.contains(c)) {
                        continue;
                    }
                    ("UPDATE", fk.on_update)
                }
            };
            if action != ForeignKeyAction::Restrict {
                return Err(QuarryError::NotImplemented(format!(
                    "The foreign key option ON {event} {action} is not yet implemented."
                )));
            }
            let referencing = self.snapshot.entity_by_id(fk.entity)?;
            let exprs = self.key_refs(def, input, &KeyDef { columns: fk.referenced_columns.clone() })?;
            let described = describe_foreign_key(&fk, &referencing.name, &def.name, event, action);
            guards.push(Guard {
                check: referencing_rows_check(&self.snapshot, input, exprs, &referencing, &fk)?,
                message: format!("{} violates foreign key constraint {described}", operation.verb()),
                description: format!("Enforcement of foreign key `{}`.`{}`", referencing.name, fk.name),
            });
        }
        Ok(())
    }
}

/// What is statically known about the keys of an insert batch.
enum BatchKeys {
    /// At most one row; nothing can collide.
    Skip,
    /// Every key tuple is a literal or a bound parameter.
    Known(Vec<Vec<Value>>),
    /// Keys only exist at execution time.
    Unknown,
}

fn batch_keys(input: &AlgNode, key: &[Rex], parameters: Option<&[Vec<Value>]>) -> BatchKeys {
    let ordinals: Option<Vec<usize>> = key.iter().map(Rex::as_input_ref).collect();
    let Some(ordinals) = ordinals else {
        return BatchKeys::Unknown;
    };
    match input.op() {
        AlgOp::Values { tuples } if tuples.len() <= 1 => BatchKeys::Skip,
        AlgOp::Values { tuples } => BatchKeys::Known(
            tuples
                .iter()
                .map(|t| ordinals.iter().map(|&i| t[i].clone()).collect())
                .collect(),
        ),
        AlgOp::Project { exprs } => {
            let single_row = matches!(
                input.inputs().first().map(|i| i.op()),
                Some(AlgOp::Values { tuples }) if tuples.len() == 1
            );
            let Some(rows) = parameters.filter(|_| single_row) else {
                return BatchKeys::Unknown;
            };
            if rows.len() <= 1 {
                return BatchKeys::Skip;
            }
            let mut tuples = vec![Vec::with_capacity(ordinals.len()); rows.len()];
            for &ordinal in &ordinals {
                match exprs.get(ordinal) {
                    Some(Rex::DynamicParam { index, .. }) => {
                        for (tuple, row) in tuples.iter_mut().zip(rows) {
                            tuple.push(row.get(*index).cloned().unwrap_or(Value::Null));
                        }
                    }
                    Some(Rex::Literal { value, .. }) => {
                        tuples.iter_mut().for_each(|t| t.push(value.clone()));
                    }
                    _ => return BatchKeys::Unknown,
                }
            }
            BatchKeys::Known(tuples)
        }
        _ => BatchKeys::Unknown,
    }
}

/// Set cardinality against row count; tuples holding a null never collide.
fn has_duplicate(tuples: Vec<Vec<Value>>) -> bool {
    let candidates: Vec<_> = tuples
        .into_iter()
        .filter(|t| !t.iter().any(Value::is_null))
        .collect();
    let count = candidates.len();
    let distinct: FxHashSet<Vec<Value>> = candidates.into_iter().collect();
    distinct.len() < count
}
