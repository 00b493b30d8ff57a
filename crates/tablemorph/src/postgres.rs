//! PostgreSQL rendering of the backend operations.
//!
//! [`PgBackend`] turns each [`Backend`] operation into SQL executed through a
//! [`SqlSession`] supplied by the surrounding migration runner. The session
//! is the only thing the runner must provide: parameterized execution plus
//! its current transaction mode, which this backend inspects to refuse
//! concurrent index builds inside a transaction.

use crate::backend::{
    Backend, ColumnDef, IndexDef, IndexState, RangeOutcome, RowAction, RowFilter, SqlType,
    TriggerAction, TriggerDef, Value,
};
use crate::error::Error;
use crate::mirror::Transform;

/// Transaction mode of the runner-supplied session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Statements commit individually; concurrent DDL is allowed.
    Autocommit,
    /// A surrounding transaction is open.
    InTransaction,
}

/// Parameterized SQL execution supplied by the migration runner.
///
/// Implementations should map serialization failures, deadlocks, and lock
/// timeouts to [`Error::BackfillTransient`] so the backfill retry policy can
/// see them; any other driver failure maps to [`Error::Sql`].
pub trait SqlSession {
    /// Execute a statement, returning the affected row count.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error>;

    /// Run a query, returning rows of values.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>, Error>;

    /// The session's current transaction mode.
    fn txn_mode(&self) -> TxnMode;
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// RAISE message text is both a string literal and a format string: quotes
// must be doubled and % would be read as a format specifier.
fn escape_raise_message(message: &str) -> String {
    message.replace('\'', "''").replace('%', "%%")
}

fn sql_type_name(sql_type: SqlType) -> &'static str {
    match sql_type {
        SqlType::Integer => "integer",
        SqlType::BigInt => "bigint",
        SqlType::Text => "text",
        SqlType::Boolean => "boolean",
    }
}

fn render_transform(transform: &Transform, source_ref: &str) -> String {
    match transform {
        Transform::Identity => source_ref.to_string(),
        Transform::ToBigInt => format!("({source_ref})::bigint"),
        Transform::Sql(expr) => expr.clone(),
    }
}

fn render_filter(filter: &RowFilter) -> String {
    match filter {
        RowFilter::IsNull { column } => format!("{} IS NULL", quote_ident(column)),
        RowFilter::Sql(predicate) => predicate.clone(),
    }
}

/// [`Backend`] implementation rendering PostgreSQL SQL.
pub struct PgBackend<S: SqlSession> {
    session: S,
}

impl<S: SqlSession> PgBackend<S> {
    /// Wrap a runner-supplied session.
    pub fn new(session: S) -> Self {
        Self { session }
    }

    /// Access the underlying session.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    fn trigger_function(def: &TriggerDef) -> String {
        let name = quote_ident(&def.name);
        let body = match &def.action {
            TriggerAction::MirrorColumn {
                source,
                target,
                transform,
            } => {
                let source_ref = format!("NEW.{}", quote_ident(source));
                format!(
                    "    NEW.{} := {};\n    RETURN NEW;",
                    quote_ident(target),
                    render_transform(transform, &source_ref)
                )
            }
            TriggerAction::RejectColumnWrite { column } => {
                let col = quote_ident(column);
                let message = escape_raise_message(&format!(
                    "column {}.{} is retired and read-only",
                    def.table, column
                ));
                format!(
                    "    IF TG_OP = 'INSERT' AND NEW.{col} IS NOT NULL THEN\n        RAISE EXCEPTION '{message}';\n    ELSIF TG_OP = 'UPDATE' AND NEW.{col} IS DISTINCT FROM OLD.{col} THEN\n        RAISE EXCEPTION '{message}';\n    END IF;\n    RETURN NEW;"
                )
            }
            TriggerAction::RejectTableWrites => {
                let message =
                    escape_raise_message(&format!("table {} is retired and read-only", def.table));
                format!("    RAISE EXCEPTION '{message}';")
            }
        };
        format!(
            "CREATE OR REPLACE FUNCTION {name}() RETURNS trigger AS $fn$\nBEGIN\n{body}\nEND\n$fn$ LANGUAGE plpgsql"
        )
    }

    fn trigger_statement(def: &TriggerDef) -> String {
        let name = quote_ident(&def.name);
        let table = quote_ident(&def.table);
        let events = match &def.action {
            TriggerAction::MirrorColumn { source, .. } => {
                format!("INSERT OR UPDATE OF {}", quote_ident(source))
            }
            TriggerAction::RejectColumnWrite { column } => {
                format!("INSERT OR UPDATE OF {}", quote_ident(column))
            }
            TriggerAction::RejectTableWrites => "INSERT OR UPDATE OR DELETE".to_string(),
        };
        format!(
            "CREATE TRIGGER {name} BEFORE {events} ON {table} FOR EACH ROW EXECUTE FUNCTION {name}()"
        )
    }

    fn scalar(&mut self, sql: &str, params: &[Value]) -> Result<Option<Value>, Error> {
        let rows = self.session.query(sql, params)?;
        Ok(rows.into_iter().next().and_then(|r| r.into_iter().next()))
    }
}

impl<S: SqlSession> Backend for PgBackend<S> {
    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, Error> {
        let rows = self.session.query(
            "SELECT 1 FROM information_schema.columns WHERE table_name = $1 AND column_name = $2",
            &[Value::Text(table.to_string()), Value::Text(column.to_string())],
        )?;
        Ok(!rows.is_empty())
    }

    fn trigger_exists(&mut self, table: &str, name: &str) -> Result<bool, Error> {
        let rows = self.session.query(
            "SELECT 1 FROM pg_trigger t JOIN pg_class c ON c.oid = t.tgrelid \
             WHERE c.relname = $1 AND t.tgname = $2 AND NOT t.tgisinternal",
            &[Value::Text(table.to_string()), Value::Text(name.to_string())],
        )?;
        Ok(!rows.is_empty())
    }

    fn index_state(&mut self, name: &str) -> Result<IndexState, Error> {
        let rows = self.session.query(
            "SELECT i.indisvalid FROM pg_class c JOIN pg_index i ON i.indexrelid = c.oid \
             WHERE c.relname = $1",
            &[Value::Text(name.to_string())],
        )?;
        Ok(match rows.first().and_then(|r| r.first()) {
            None => IndexState::Absent,
            Some(Value::Bool(true)) => IndexState::Valid,
            Some(_) => IndexState::Invalid,
        })
    }

    fn id_bounds(&mut self, table: &str, filter: &RowFilter) -> Result<Option<(i64, i64)>, Error> {
        let sql = format!(
            "SELECT min(id), max(id) FROM {} WHERE {}",
            quote_ident(table),
            render_filter(filter)
        );
        let rows = self.session.query(&sql, &[])?;
        let row = match rows.into_iter().next() {
            Some(row) => row,
            None => return Ok(None),
        };
        match (row.first().and_then(Value::as_int), row.get(1).and_then(Value::as_int)) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }

    fn count_pending(&mut self, table: &str, filter: &RowFilter) -> Result<u64, Error> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE {}",
            quote_ident(table),
            render_filter(filter)
        );
        let count = self
            .scalar(&sql, &[])?
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        Ok(count as u64)
    }

    fn add_column(&mut self, table: &str, def: &ColumnDef) -> Result<(), Error> {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            quote_ident(table),
            quote_ident(&def.name),
            sql_type_name(def.sql_type)
        );
        if !def.nullable {
            sql.push_str(" NOT NULL");
        }
        self.session.execute(&sql, &[])?;
        Ok(())
    }

    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), Error> {
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            quote_ident(table),
            quote_ident(column)
        );
        self.session.execute(&sql, &[])?;
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> Result<(), Error> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        self.session.execute(&sql, &[])?;
        Ok(())
    }

    fn install_trigger(&mut self, def: &TriggerDef) -> Result<(), Error> {
        self.session.execute(&Self::trigger_function(def), &[])?;
        self.session.execute(&Self::trigger_statement(def), &[])?;
        Ok(())
    }

    fn drop_trigger(&mut self, table: &str, name: &str) -> Result<(), Error> {
        let sql = format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_ident(name),
            quote_ident(table)
        );
        self.session.execute(&sql, &[])?;
        let sql = format!("DROP FUNCTION IF EXISTS {}()", quote_ident(name));
        self.session.execute(&sql, &[])?;
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
        let table_ident = quote_ident(table);
        let set_clause = match action {
            RowAction::CopyColumn {
                source,
                target,
                transform,
            } => {
                let source_ref = format!("t.{}", quote_ident(source));
                format!("{} = {}", quote_ident(target), render_transform(transform, &source_ref))
            }
            RowAction::Sql(fragment) => fragment.clone(),
        };
        let sql = format!(
            "WITH batch AS (\n\
             \x20   SELECT id FROM {table_ident}\n\
             \x20   WHERE {} AND id >= $1 AND id < $2\n\
             \x20   ORDER BY id LIMIT {limit}\n\
             ), updated AS (\n\
             \x20   UPDATE {table_ident} t SET {set_clause}\n\
             \x20   FROM batch WHERE t.id = batch.id\n\
             \x20   RETURNING t.id\n\
             )\n\
             SELECT count(*), max(id) FROM updated",
            render_filter(filter)
        );
        let rows = self
            .session
            .query(&sql, &[Value::Int(low), Value::Int(high)])?;
        let row = rows.into_iter().next().unwrap_or_default();
        Ok(RangeOutcome {
            rows_written: row.first().and_then(Value::as_int).unwrap_or(0) as u64,
            last_id: row.get(1).and_then(Value::as_int),
        })
    }

    fn create_index(&mut self, def: &IndexDef, concurrently: bool) -> Result<(), Error> {
        if concurrently && self.session.txn_mode() == TxnMode::InTransaction {
            return Err(Error::ConcurrentBuildInTransaction {
                index: def.name.clone(),
            });
        }
        let unique = if def.unique { "UNIQUE " } else { "" };
        let concurrent = if concurrently { "CONCURRENTLY " } else { "" };
        let columns = def
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE {unique}INDEX {concurrent}{} ON {} ({columns})",
            quote_ident(&def.name),
            quote_ident(&def.table)
        );
        self.session.execute(&sql, &[])?;
        Ok(())
    }

    fn rename_index(&mut self, from: &str, to: &str) -> Result<(), Error> {
        let sql = format!(
            "ALTER INDEX {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        );
        self.session.execute(&sql, &[])?;
        Ok(())
    }

    fn drop_index(&mut self, name: &str) -> Result<(), Error> {
        let sql = format!("DROP INDEX IF EXISTS {}", quote_ident(name));
        self.session.execute(&sql, &[])?;
        Ok(())
    }
}
