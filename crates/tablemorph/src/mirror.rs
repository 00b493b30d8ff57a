//! Dual-write mirror: keeps a shadow column consistent with its source.
//!
//! A batch backfill alone cannot keep up with a live high-write table; rows
//! written after the backfill starts but before it finishes would be missed.
//! The mirror closes that gap: every write touching the source column also
//! assigns `target := transform(source)` within the same row-level trigger,
//! so the two columns are transactionally consistent with no visible lag.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{Backend, TriggerAction, TriggerDef, Value};
use crate::error::Error;

/// Change-propagation function applied to the source value on every write.
///
/// The same transform drives both the mirror trigger and the backfill, so
/// live writes and batch writes converge regardless of interleaving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// Copy the value unchanged.
    Identity,
    /// Widen to a 64-bit integer; numeric text is parsed.
    ToBigInt,
    /// Arbitrary SQL expression over `NEW.<source>`. SQL backends only.
    Sql(String),
}

impl Transform {
    /// Apply the transform in process.
    ///
    /// NULL passes through untouched; a value that cannot be converted is an
    /// error, which rejects the triggering write rather than silently
    /// skipping the mirror.
    pub fn apply(&self, input: &Value) -> Result<Value, String> {
        match self {
            Transform::Identity => Ok(input.clone()),
            Transform::ToBigInt => match input {
                Value::Null => Ok(Value::Null),
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Text(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| format!("cannot cast '{s}' to bigint")),
                Value::Bool(_) => Err("cannot cast boolean to bigint".to_string()),
            },
            Transform::Sql(_) => Err("SQL transform requires a SQL backend".to_string()),
        }
    }
}

/// Conventional name of the mirror trigger for `table.source`.
///
/// A later migration step discovers and removes a mirror installed by an
/// earlier one through this convention, with no out-of-band bookkeeping.
pub fn sync_trigger_name(table: &str, source: &str) -> String {
    format!("{table}_{source}_sync")
}

/// Install a dual-write mirror from `source` to `target` on `table`.
///
/// At most one mirror may exist per column pair; installing a second without
/// removing the first is an error. Both columns must already exist.
pub fn install_mirror(
    backend: &mut dyn Backend,
    table: &str,
    source: &str,
    target: &str,
    transform: Transform,
) -> Result<(), Error> {
    for column in [source, target] {
        if !backend.column_exists(table, column)? {
            return Err(Error::Schema {
                message: format!("cannot mirror {table}.{source}: column {column} does not exist"),
            });
        }
    }

    let name = sync_trigger_name(table, source);
    if backend.trigger_exists(table, &name)? {
        return Err(Error::MirrorAlreadyInstalled {
            table: table.to_string(),
            trigger: name,
        });
    }

    backend.install_trigger(&TriggerDef {
        name: name.clone(),
        table: table.to_string(),
        action: TriggerAction::MirrorColumn {
            source: source.to_string(),
            target: target.to_string(),
            transform,
        },
    })?;

    info!(table, source, target, trigger = %name, "installed dual-write mirror");
    Ok(())
}

/// Remove the mirror for `table.source`, if one is installed.
pub fn remove_mirror(backend: &mut dyn Backend, table: &str, source: &str) -> Result<(), Error> {
    let name = sync_trigger_name(table, source);
    if !backend.trigger_exists(table, &name)? {
        debug!(table, source, "no mirror to remove");
        return Ok(());
    }
    backend.drop_trigger(table, &name)?;
    info!(table, source, trigger = %name, "removed dual-write mirror");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_naming_convention() {
        assert_eq!(sync_trigger_name("users", "source_id"), "users_source_id_sync");
    }

    #[test]
    fn test_identity_transform() {
        let t = Transform::Identity;
        assert_eq!(t.apply(&Value::Int(7)).unwrap(), Value::Int(7));
        assert_eq!(t.apply(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_bigint_transform() {
        let t = Transform::ToBigInt;
        assert_eq!(t.apply(&Value::Int(42)).unwrap(), Value::Int(42));
        assert_eq!(t.apply(&Value::Text(" 42 ".into())).unwrap(), Value::Int(42));
        assert_eq!(t.apply(&Value::Null).unwrap(), Value::Null);
        assert!(t.apply(&Value::Text("not a number".into())).is_err());
        assert!(t.apply(&Value::Bool(true)).is_err());
    }

    #[test]
    fn test_sql_transform_needs_sql_backend() {
        let t = Transform::Sql("lower(NEW.email)".into());
        assert!(t.apply(&Value::Text("X".into())).is_err());
    }
}
