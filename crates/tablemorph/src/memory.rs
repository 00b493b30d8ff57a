//! In-process reference backend.
//!
//! Interprets the [`Backend`] operations against in-memory tables with full
//! row-level trigger semantics: mirror triggers fire on every insert and on
//! updates touching the source column, and read-only triggers reject
//! changed-value writes exactly as their SQL counterparts do. This is the
//! "application middleware" realization of change propagation; it backs dry
//! runs and the test suite. Cloned handles share the same database, so one
//! handle can drive a migration while another plays live application traffic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{
    Backend, ColumnDef, IndexDef, IndexState, RangeOutcome, RowAction, RowFilter, TriggerAction,
    TriggerDef, Value,
};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmlOp {
    Insert,
    Update,
    Delete,
}

struct TableData {
    columns: Vec<ColumnDef>,
    rows: BTreeMap<i64, HashMap<String, Value>>,
    triggers: Vec<TriggerDef>,
}

struct IndexEntry {
    def: IndexDef,
    valid: bool,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, TableData>,
    indexes: HashMap<String, IndexEntry>,
    index_log: Vec<String>,
    fail_queue: VecDeque<Error>,
}

/// Shared in-memory database implementing [`Backend`].
#[derive(Clone, Default)]
pub struct MemoryDb {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryDb {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with an implicit `id` bigint primary key.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) {
        self.inner.write().tables.insert(
            name.to_string(),
            TableData {
                columns,
                rows: BTreeMap::new(),
                triggers: Vec::new(),
            },
        );
    }

    /// Insert a row, firing triggers. Application-side DML.
    pub fn insert(&self, table: &str, id: i64, values: &[(&str, Value)]) -> Result<(), Error> {
        let changes = values
            .iter()
            .map(|(c, v)| (c.to_string(), v.clone()))
            .collect();
        self.inner.write().write_row(table, id, changes, DmlOp::Insert)
    }

    /// Update a row, firing triggers. Application-side DML.
    pub fn update(&self, table: &str, id: i64, values: &[(&str, Value)]) -> Result<(), Error> {
        let changes = values
            .iter()
            .map(|(c, v)| (c.to_string(), v.clone()))
            .collect();
        self.inner.write().write_row(table, id, changes, DmlOp::Update)
    }

    /// Delete a row, firing triggers. Application-side DML.
    pub fn delete(&self, table: &str, id: i64) -> Result<(), Error> {
        self.inner
            .write()
            .write_row(table, id, BTreeMap::new(), DmlOp::Delete)
    }

    /// Read one column of one row. Reads are never blocked by retirement.
    pub fn get(&self, table: &str, id: i64, column: &str) -> Result<Value, Error> {
        let inner = self.inner.read();
        let data = inner.table(table)?;
        let row = data.rows.get(&id).ok_or_else(|| Error::Schema {
            message: format!("no row {id} in {table}"),
        })?;
        if column == "id" {
            return Ok(Value::Int(id));
        }
        if !data.has_column(column) {
            return Err(Error::Schema {
                message: format!("no column {column} on {table}"),
            });
        }
        Ok(row.get(column).cloned().unwrap_or(Value::Null))
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> Result<u64, Error> {
        Ok(self.inner.read().table(table)?.rows.len() as u64)
    }

    /// All row ids of a table, ascending.
    pub fn row_ids(&self, table: &str) -> Result<Vec<i64>, Error> {
        Ok(self.inner.read().table(table)?.rows.keys().copied().collect())
    }

    /// Whether `table.column` exists. Shared-handle convenience for tests
    /// and observers; the [`Backend`] impl delegates here.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool, Error> {
        let inner = self.inner.read();
        Ok(inner
            .tables
            .get(table)
            .map(|t| t.has_column(column))
            .unwrap_or(false))
    }

    /// Whether the named trigger exists on `table`.
    pub fn trigger_exists(&self, table: &str, name: &str) -> Result<bool, Error> {
        let inner = self.inner.read();
        Ok(inner
            .tables
            .get(table)
            .map(|t| t.triggers.iter().any(|tr| tr.name == name))
            .unwrap_or(false))
    }

    /// Observed state of the named index.
    pub fn index_state(&self, name: &str) -> Result<IndexState, Error> {
        let inner = self.inner.read();
        Ok(match inner.indexes.get(name) {
            None => IndexState::Absent,
            Some(entry) if entry.valid => IndexState::Valid,
            Some(_) => IndexState::Invalid,
        })
    }

    /// Number of rows matching `filter`.
    pub fn count_pending(&self, table: &str, filter: &RowFilter) -> Result<u64, Error> {
        let inner = self.inner.read();
        let data = inner.table(table)?;
        let mut count = 0;
        for row in data.rows.values() {
            if filter_matches(row, filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Queue an error to be returned by the next `apply_range` call.
    /// Failure injection for exercising retry behavior.
    pub fn fail_next_apply(&self, err: Error) {
        self.inner.write().fail_queue.push_back(err);
    }

    /// Register an index in the invalid state, as a crashed concurrent build
    /// would leave it.
    pub fn poison_index(&self, def: &IndexDef) {
        let mut inner = self.inner.write();
        inner.indexes.insert(
            def.name.clone(),
            IndexEntry {
                def: def.clone(),
                valid: false,
            },
        );
        inner.index_log.push(format!("poison {}", def.name));
    }

    /// Chronological log of index operations, for asserting cutover ordering.
    pub fn index_log(&self) -> Vec<String> {
        self.inner.read().index_log.clone()
    }
}

impl Inner {
    fn table(&self, name: &str) -> Result<&TableData, Error> {
        self.tables.get(name).ok_or_else(|| Error::Schema {
            message: format!("no such table: {name}"),
        })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData, Error> {
        self.tables.get_mut(name).ok_or_else(|| Error::Schema {
            message: format!("no such table: {name}"),
        })
    }

    fn write_row(
        &mut self,
        table: &str,
        id: i64,
        mut changes: BTreeMap<String, Value>,
        op: DmlOp,
    ) -> Result<(), Error> {
        let data = self.table(table)?;
        for column in changes.keys() {
            if !data.has_column(column) {
                return Err(Error::Schema {
                    message: format!("no column {column} on {table}"),
                });
            }
        }

        // Row-level triggers run before the write lands; any rejection or
        // transform failure rolls back the whole statement.
        let triggers = data.triggers.clone();
        let old_row = data.rows.get(&id);
        for trigger in &triggers {
            match &trigger.action {
                TriggerAction::RejectTableWrites => {
                    return Err(Error::AlreadyRetired {
                        target: table.to_string(),
                    });
                }
                TriggerAction::RejectColumnWrite { column } => {
                    if op == DmlOp::Delete {
                        continue;
                    }
                    let fires = op == DmlOp::Insert || changes.contains_key(column);
                    if !fires {
                        continue;
                    }
                    let new = changes.get(column).cloned().unwrap_or(Value::Null);
                    let old = old_row
                        .and_then(|r| r.get(column).cloned())
                        .unwrap_or(Value::Null);
                    if new != old {
                        return Err(Error::AlreadyRetired {
                            target: format!("{table}.{column}"),
                        });
                    }
                }
                TriggerAction::MirrorColumn {
                    source,
                    target,
                    transform,
                } => {
                    if op == DmlOp::Delete {
                        continue;
                    }
                    let fires = op == DmlOp::Insert || changes.contains_key(source);
                    if !fires {
                        continue;
                    }
                    let input = changes.get(source).cloned().unwrap_or(Value::Null);
                    let output =
                        transform
                            .apply(&input)
                            .map_err(|reason| Error::MirrorTransformFailure {
                                table: table.to_string(),
                                column: source.clone(),
                                reason,
                            })?;
                    changes.insert(target.clone(), output);
                }
            }
        }

        let data = self.table_mut(table)?;
        match op {
            DmlOp::Insert => {
                if data.rows.contains_key(&id) {
                    return Err(Error::Schema {
                        message: format!("duplicate id {id} in {table}"),
                    });
                }
                data.rows.insert(id, changes.into_iter().collect());
            }
            DmlOp::Update => {
                let row = data.rows.get_mut(&id).ok_or_else(|| Error::Schema {
                    message: format!("no row {id} in {table}"),
                })?;
                row.extend(changes);
            }
            DmlOp::Delete => {
                data.rows.remove(&id);
            }
        }
        Ok(())
    }
}

impl TableData {
    fn has_column(&self, name: &str) -> bool {
        name == "id" || self.columns.iter().any(|c| c.name == name)
    }
}

fn filter_matches(row: &HashMap<String, Value>, filter: &RowFilter) -> Result<bool, Error> {
    match filter {
        RowFilter::IsNull { column } => {
            Ok(row.get(column).map(Value::is_null).unwrap_or(true))
        }
        RowFilter::Sql(_) => Err(Error::Sql {
            message: "raw SQL filter requires a SQL backend".to_string(),
        }),
    }
}

impl Backend for MemoryDb {
    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, Error> {
        MemoryDb::column_exists(self, table, column)
    }

    fn trigger_exists(&mut self, table: &str, name: &str) -> Result<bool, Error> {
        MemoryDb::trigger_exists(self, table, name)
    }

    fn index_state(&mut self, name: &str) -> Result<IndexState, Error> {
        MemoryDb::index_state(self, name)
    }

    fn id_bounds(&mut self, table: &str, filter: &RowFilter) -> Result<Option<(i64, i64)>, Error> {
        let inner = self.inner.read();
        let data = inner.table(table)?;
        let mut bounds = None;
        for (id, row) in &data.rows {
            if filter_matches(row, filter)? {
                bounds = Some(match bounds {
                    None => (*id, *id),
                    Some((min, _)) => (min, *id),
                });
            }
        }
        Ok(bounds)
    }

    fn count_pending(&mut self, table: &str, filter: &RowFilter) -> Result<u64, Error> {
        MemoryDb::count_pending(self, table, filter)
    }

    fn add_column(&mut self, table: &str, def: &ColumnDef) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let data = inner.table_mut(table)?;
        if data.has_column(&def.name) {
            return Ok(());
        }
        data.columns.push(def.clone());
        Ok(())
    }

    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let data = inner.table_mut(table)?;
        data.columns.retain(|c| c.name != column);
        for row in data.rows.values_mut() {
            row.remove(column);
        }
        // Triggers bound to the column go with it.
        data.triggers.retain(|t| match &t.action {
            TriggerAction::MirrorColumn { source, target, .. } => {
                source != column && target != column
            }
            TriggerAction::RejectColumnWrite { column: c } => c != column,
            TriggerAction::RejectTableWrites => true,
        });
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> Result<(), Error> {
        self.inner.write().tables.remove(table);
        Ok(())
    }

    fn install_trigger(&mut self, def: &TriggerDef) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let data = inner.table_mut(&def.table)?;
        if data.triggers.iter().any(|t| t.name == def.name) {
            return Err(Error::Schema {
                message: format!("trigger {} already exists on {}", def.name, def.table),
            });
        }
        data.triggers.push(def.clone());
        Ok(())
    }

    fn drop_trigger(&mut self, table: &str, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let data = inner.table_mut(table)?;
        data.triggers.retain(|t| t.name != name);
        Ok(())
    }

    fn apply_range(
        &mut self,
        table: &str,
        low: i64,
        high: i64,
        limit: usize,
        filter: &RowFilter,
        action: &RowAction,
    ) -> Result<RangeOutcome, Error> {
        let mut inner = self.inner.write();
        if let Some(err) = inner.fail_queue.pop_front() {
            return Err(err);
        }

        let data = inner.table(table)?;
        let mut batch = Vec::new();
        for (id, row) in data.rows.range(low..high) {
            if filter_matches(row, filter)? {
                batch.push(*id);
                if batch.len() >= limit {
                    break;
                }
            }
        }

        let mut outcome = RangeOutcome::default();
        for id in batch {
            let changes = match action {
                RowAction::CopyColumn {
                    source,
                    target,
                    transform,
                } => {
                    let input = inner
                        .table(table)?
                        .rows
                        .get(&id)
                        .and_then(|r| r.get(source).cloned())
                        .unwrap_or(Value::Null);
                    let output = transform.apply(&input).map_err(|reason| Error::BackfillFatal {
                        reason: format!("transform failed for {table} id {id}: {reason}"),
                    })?;
                    BTreeMap::from([(target.clone(), output)])
                }
                RowAction::Sql(_) => {
                    return Err(Error::Sql {
                        message: "raw SQL action requires a SQL backend".to_string(),
                    });
                }
            };
            inner.write_row(table, id, changes, DmlOp::Update)?;
            outcome.rows_written += 1;
            outcome.last_id = Some(id);
        }
        Ok(outcome)
    }

    fn create_index(&mut self, def: &IndexDef, _concurrently: bool) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.indexes.contains_key(&def.name) {
            return Err(Error::Schema {
                message: format!("index {} already exists", def.name),
            });
        }
        inner.indexes.insert(
            def.name.clone(),
            IndexEntry {
                def: def.clone(),
                valid: true,
            },
        );
        inner.index_log.push(format!("create {}", def.name));
        Ok(())
    }

    fn rename_index(&mut self, from: &str, to: &str) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.indexes.contains_key(to) {
            return Err(Error::Schema {
                message: format!("index {to} already exists"),
            });
        }
        let mut entry = inner.indexes.remove(from).ok_or_else(|| Error::Schema {
            message: format!("no such index: {from}"),
        })?;
        entry.def.name = to.to_string();
        inner.indexes.insert(to.to_string(), entry);
        inner.index_log.push(format!("rename {from} -> {to}"));
        Ok(())
    }

    fn drop_index(&mut self, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.indexes.remove(name).is_some() {
            inner.index_log.push(format!("drop {name}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqlType;
    use crate::mirror::Transform;

    fn user_table(db: &MemoryDb) {
        db.create_table(
            "users",
            vec![
                ColumnDef::new("source_id", SqlType::Integer),
                ColumnDef::new("target_id", SqlType::BigInt),
                ColumnDef::new("legacy_email", SqlType::Text),
            ],
        );
    }

    #[test]
    fn test_insert_update_get() {
        let db = MemoryDb::new();
        user_table(&db);

        db.insert("users", 1, &[("source_id", Value::Int(10))]).unwrap();
        assert_eq!(db.get("users", 1, "source_id").unwrap(), Value::Int(10));
        assert_eq!(db.get("users", 1, "target_id").unwrap(), Value::Null);
        assert_eq!(db.get("users", 1, "id").unwrap(), Value::Int(1));

        db.update("users", 1, &[("source_id", Value::Int(11))]).unwrap();
        assert_eq!(db.get("users", 1, "source_id").unwrap(), Value::Int(11));

        db.delete("users", 1).unwrap();
        assert_eq!(db.row_count("users").unwrap(), 0);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let db = MemoryDb::new();
        user_table(&db);
        db.insert("users", 1, &[]).unwrap();
        assert!(db.insert("users", 1, &[]).is_err());
    }

    #[test]
    fn test_mirror_trigger_fires_on_insert_and_update() {
        let db = MemoryDb::new();
        user_table(&db);
        let mut backend = db.clone();
        backend
            .install_trigger(&TriggerDef {
                name: "users_source_id_sync".into(),
                table: "users".into(),
                action: TriggerAction::MirrorColumn {
                    source: "source_id".into(),
                    target: "target_id".into(),
                    transform: Transform::Identity,
                },
            })
            .unwrap();

        db.insert("users", 1, &[("source_id", Value::Int(5))]).unwrap();
        assert_eq!(db.get("users", 1, "target_id").unwrap(), Value::Int(5));

        db.update("users", 1, &[("source_id", Value::Int(6))]).unwrap();
        assert_eq!(db.get("users", 1, "target_id").unwrap(), Value::Int(6));

        // An update not touching the source leaves the target alone.
        db.update("users", 1, &[("legacy_email", Value::Text("a@b".into()))])
            .unwrap();
        assert_eq!(db.get("users", 1, "target_id").unwrap(), Value::Int(6));
    }

    #[test]
    fn test_failing_transform_rejects_the_write() {
        let db = MemoryDb::new();
        user_table(&db);
        let mut backend = db.clone();
        backend
            .install_trigger(&TriggerDef {
                name: "users_legacy_email_sync".into(),
                table: "users".into(),
                action: TriggerAction::MirrorColumn {
                    source: "legacy_email".into(),
                    target: "target_id".into(),
                    transform: Transform::ToBigInt,
                },
            })
            .unwrap();

        let err = db
            .insert("users", 1, &[("legacy_email", Value::Text("oops".into()))])
            .unwrap_err();
        assert!(matches!(err, Error::MirrorTransformFailure { .. }));
        // Fail closed: nothing was written.
        assert_eq!(db.row_count("users").unwrap(), 0);
    }

    #[test]
    fn test_readonly_column_rejects_changed_values_only() {
        let db = MemoryDb::new();
        user_table(&db);
        db.insert("users", 1, &[("legacy_email", Value::Text("a@b".into()))])
            .unwrap();

        let mut backend = db.clone();
        backend
            .install_trigger(&TriggerDef {
                name: "users_legacy_email_readonly".into(),
                table: "users".into(),
                action: TriggerAction::RejectColumnWrite {
                    column: "legacy_email".into(),
                },
            })
            .unwrap();

        // Changing the value is rejected.
        let err = db
            .update("users", 1, &[("legacy_email", Value::Text("x".into()))])
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRetired { .. }));

        // Writing the same value back and touching other columns is fine.
        db.update("users", 1, &[("legacy_email", Value::Text("a@b".into()))])
            .unwrap();
        db.update("users", 1, &[("source_id", Value::Int(9))]).unwrap();

        // Reads still succeed.
        assert_eq!(
            db.get("users", 1, "legacy_email").unwrap(),
            Value::Text("a@b".into())
        );
    }

    #[test]
    fn test_readonly_table_rejects_all_dml() {
        let db = MemoryDb::new();
        user_table(&db);
        db.insert("users", 1, &[("source_id", Value::Int(1))]).unwrap();

        let mut backend = db.clone();
        backend
            .install_trigger(&TriggerDef {
                name: "users_readonly".into(),
                table: "users".into(),
                action: TriggerAction::RejectTableWrites,
            })
            .unwrap();

        assert!(matches!(
            db.insert("users", 2, &[]).unwrap_err(),
            Error::AlreadyRetired { .. }
        ));
        assert!(matches!(
            db.update("users", 1, &[("source_id", Value::Int(2))]).unwrap_err(),
            Error::AlreadyRetired { .. }
        ));
        assert!(matches!(
            db.delete("users", 1).unwrap_err(),
            Error::AlreadyRetired { .. }
        ));
        assert_eq!(db.get("users", 1, "source_id").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_apply_range_respects_window_and_limit() {
        let db = MemoryDb::new();
        user_table(&db);
        for id in 1..=10 {
            db.insert("users", id, &[("source_id", Value::Int(id))]).unwrap();
        }

        let mut backend = db.clone();
        let filter = RowFilter::IsNull {
            column: "target_id".into(),
        };
        let action = RowAction::CopyColumn {
            source: "source_id".into(),
            target: "target_id".into(),
            transform: Transform::Identity,
        };

        let outcome = backend.apply_range("users", 3, 8, 3, &filter, &action).unwrap();
        assert_eq!(outcome.rows_written, 3);
        assert_eq!(outcome.last_id, Some(5));
        assert_eq!(db.get("users", 3, "target_id").unwrap(), Value::Int(3));
        assert_eq!(db.get("users", 6, "target_id").unwrap(), Value::Null);
    }

    #[test]
    fn test_raw_sql_fragments_need_sql_backend() {
        let db = MemoryDb::new();
        user_table(&db);
        db.insert("users", 1, &[]).unwrap();

        let mut backend = db.clone();
        let err = backend
            .apply_range(
                "users",
                0,
                10,
                10,
                &RowFilter::Sql("target_id IS NULL".into()),
                &RowAction::Sql("target_id = source_id".into()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Sql { .. }));
    }

    #[test]
    fn test_drop_column_removes_bound_triggers() {
        let db = MemoryDb::new();
        user_table(&db);
        let mut backend = db.clone();
        backend
            .install_trigger(&TriggerDef {
                name: "users_source_id_sync".into(),
                table: "users".into(),
                action: TriggerAction::MirrorColumn {
                    source: "source_id".into(),
                    target: "target_id".into(),
                    transform: Transform::Identity,
                },
            })
            .unwrap();

        backend.drop_column("users", "source_id").unwrap();
        assert!(!backend.column_exists("users", "source_id").unwrap());
        assert!(!backend.trigger_exists("users", "users_source_id_sync").unwrap());
    }
}
