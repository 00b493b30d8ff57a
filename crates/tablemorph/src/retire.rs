//! Read-only retirement of columns and tables.
//!
//! Marking a column or table read-only blocks writes at the database while
//! reads continue, opening a safe multi-deploy window before physical
//! removal. The installed trigger is the authoritative lock substitute: once
//! in place, all writers everywhere are rejected, including future
//! migrations that have forgotten about the deprecation. Failures are loud
//! and immediate rather than silent data drift.

use tracing::{debug, info};

use crate::backend::{Backend, TriggerAction, TriggerDef};
use crate::error::Error;
use crate::guard::{GuardedOp, SafetyGuard};

/// Conventional name of the read-only trigger for `table.column`.
pub fn readonly_trigger_name(table: &str, column: &str) -> String {
    format!("{table}_{column}_readonly")
}

/// Conventional name of the whole-table read-only trigger.
pub fn table_readonly_trigger_name(table: &str) -> String {
    format!("{table}_readonly")
}

/// Mark `table.column` read-only.
///
/// Any subsequent write that changes the column's value fails with
/// [`Error::AlreadyRetired`]; same-value writes and reads are unaffected.
/// Idempotent: deploys can partially fail and retry.
pub fn mark_readonly(backend: &mut dyn Backend, table: &str, column: &str) -> Result<(), Error> {
    if !backend.column_exists(table, column)? {
        return Err(Error::Schema {
            message: format!("cannot retire {table}.{column}: column does not exist"),
        });
    }

    let name = readonly_trigger_name(table, column);
    if backend.trigger_exists(table, &name)? {
        debug!(table, column, "column already marked read-only");
        return Ok(());
    }

    backend.install_trigger(&TriggerDef {
        name: name.clone(),
        table: table.to_string(),
        action: TriggerAction::RejectColumnWrite {
            column: column.to_string(),
        },
    })?;

    info!(table, column, trigger = %name, "marked column read-only");
    Ok(())
}

/// Remove the read-only mark from `table.column`.
///
/// Used for rollback or iterative fixups during the deprecation window.
pub fn drop_readonly(backend: &mut dyn Backend, table: &str, column: &str) -> Result<(), Error> {
    let name = readonly_trigger_name(table, column);
    if !backend.trigger_exists(table, &name)? {
        debug!(table, column, "column is not marked read-only");
        return Ok(());
    }
    backend.drop_trigger(table, &name)?;
    info!(table, column, "removed read-only mark");
    Ok(())
}

/// Mark an entire table read-only: all inserts, updates, and deletes are
/// rejected with [`Error::AlreadyRetired`]; reads are unaffected. Idempotent.
pub fn read_only_table(backend: &mut dyn Backend, table: &str) -> Result<(), Error> {
    let name = table_readonly_trigger_name(table);
    if backend.trigger_exists(table, &name)? {
        debug!(table, "table already marked read-only");
        return Ok(());
    }

    backend.install_trigger(&TriggerDef {
        name: name.clone(),
        table: table.to_string(),
        action: TriggerAction::RejectTableWrites,
    })?;

    info!(table, trigger = %name, "marked table read-only");
    Ok(())
}

/// Remove the whole-table read-only mark.
pub fn release_table(backend: &mut dyn Backend, table: &str) -> Result<(), Error> {
    let name = table_readonly_trigger_name(table);
    if !backend.trigger_exists(table, &name)? {
        return Ok(());
    }
    backend.drop_trigger(table, &name)?;
    info!(table, "removed table read-only mark");
    Ok(())
}

/// Physically drop a retired table.
///
/// The table must already be marked read-only, and the drop requires a
/// [`SafetyGuard`] permit: removal is an explicit opt-in on top of the
/// grace window, never a side effect.
pub fn drop_retired_table(
    backend: &mut dyn Backend,
    guard: &SafetyGuard,
    table: &str,
) -> Result<(), Error> {
    let name = table_readonly_trigger_name(table);
    if !backend.trigger_exists(table, &name)? {
        return Err(Error::ValidationFailed {
            table: table.to_string(),
            message: "table must be marked read-only before it can be dropped".to_string(),
        });
    }
    guard.check(GuardedOp::DropTable)?;
    backend.drop_table(table)?;
    info!(table, "retired table dropped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ColumnDef, SqlType};
    use crate::memory::MemoryDb;

    #[test]
    fn test_trigger_naming() {
        assert_eq!(
            readonly_trigger_name("users", "legacy_email"),
            "users_legacy_email_readonly"
        );
        assert_eq!(table_readonly_trigger_name("old_sessions"), "old_sessions_readonly");
    }

    #[test]
    fn test_drop_retired_table_requires_mark_and_permit() {
        let db = MemoryDb::new();
        db.create_table("old_sessions", vec![ColumnDef::new("token", SqlType::Text)]);
        let mut backend = db.clone();
        let guard = SafetyGuard::new();

        // Not yet marked read-only.
        let err = drop_retired_table(&mut backend, &guard, "old_sessions").unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));

        read_only_table(&mut backend, "old_sessions").unwrap();

        // Marked, but no permit held.
        let err = drop_retired_table(&mut backend, &guard, "old_sessions").unwrap_err();
        assert!(matches!(
            err,
            Error::BlockedOperation {
                op: GuardedOp::DropTable
            }
        ));

        let _permit = guard.permit();
        drop_retired_table(&mut backend, &guard, "old_sessions").unwrap();
        assert!(db.row_count("old_sessions").is_err());
    }
}
