//! Boundary with the surrounding migration runner.
//!
//! The primitives in this crate never talk to a database driver directly.
//! They are written against [`Backend`], a semantic interface over the
//! schema and DML operations an online change needs: column and trigger
//! management, index lifecycle, and short-transaction range updates.
//!
//! Two implementations ship with the crate: [`PgBackend`](crate::postgres::PgBackend)
//! renders the operations to PostgreSQL SQL over a runner-supplied session,
//! and [`MemoryDb`](crate::memory::MemoryDb) interprets them in process with
//! full trigger semantics.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::mirror::Transform;

/// A scalar value crossing the backend boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Text.
    Text(String),
    /// Boolean.
    Bool(bool),
}

impl Value {
    /// Whether this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Extract an integer, if this value is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// Declared SQL type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    /// Variable-length text.
    Text,
    /// Boolean.
    Boolean,
}

/// Definition of a column being added or inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub sql_type: SqlType,
    /// Whether NULL values are allowed.
    pub nullable: bool,
}

impl ColumnDef {
    /// Create a nullable column definition.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// What an installed row-level trigger does.
///
/// Change propagation is expressed as an explicit action rather than trigger
/// syntax so backends may realize it as database triggers, in-process
/// middleware, or a CDC stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriggerAction {
    /// Assign `target := transform(source)` on every write touching `source`.
    MirrorColumn {
        /// Column the application still writes.
        source: String,
        /// Shadow column kept consistent with `source`.
        target: String,
        /// Change-propagation function.
        transform: Transform,
    },
    /// Reject any write that changes the column's value; reads are unaffected.
    RejectColumnWrite {
        /// The retired column.
        column: String,
    },
    /// Reject all inserts, updates, and deletes on the table.
    RejectTableWrites,
}

/// A named row-level trigger owned by a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Trigger (and trigger function) name.
    pub name: String,
    /// Table the trigger is attached to.
    pub table: String,
    /// What the trigger does.
    pub action: TriggerAction,
}

/// Observed state of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// No index of this name exists.
    Absent,
    /// The index exists but a concurrent build left it broken.
    Invalid,
    /// The index exists and is usable.
    Valid,
}

/// Definition of an index to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name (temporary during a cutover).
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index definition.
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            unique: false,
        }
    }

    /// Mark the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Predicate selecting rows still pending migration.
///
/// Pending predicates must always exclude rows already populated, so an
/// interrupted run can restart from scratch and skip completed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowFilter {
    /// Rows whose column has not been populated yet.
    IsNull {
        /// The column to test.
        column: String,
    },
    /// Arbitrary SQL predicate fragment. SQL backends only.
    Sql(String),
}

/// Per-row work applied to one pending window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowAction {
    /// Assign `target := transform(source)`.
    CopyColumn {
        /// Column to read.
        source: String,
        /// Column to populate.
        target: String,
        /// Change-propagation function, shared with the dual-write mirror so
        /// backfill and live writes converge regardless of interleaving.
        transform: Transform,
    },
    /// Arbitrary SQL `SET` fragment. SQL backends only.
    Sql(String),
}

/// Result of one range update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RangeOutcome {
    /// Rows written in this window.
    pub rows_written: u64,
    /// Largest id touched, for advancing the cursor.
    pub last_id: Option<i64>,
}

/// Semantic schema and DML operations supplied by the migration runner.
///
/// Implementations map each operation to their platform. Structure-changing
/// operations are idempotent where the SQL equivalent is (`IF NOT EXISTS` /
/// `IF EXISTS` forms); [`Backend::apply_range`] must run in its own short
/// transaction so its lock footprint stays bounded by the window size.
pub trait Backend {
    /// Whether `table.column` exists.
    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, Error>;

    /// Whether the named trigger exists on `table`.
    fn trigger_exists(&mut self, table: &str, name: &str) -> Result<bool, Error>;

    /// Observed state of the named index.
    fn index_state(&mut self, name: &str) -> Result<IndexState, Error>;

    /// Smallest and largest primary-key id among rows matching `filter`.
    fn id_bounds(&mut self, table: &str, filter: &RowFilter) -> Result<Option<(i64, i64)>, Error>;

    /// Number of rows matching `filter`.
    fn count_pending(&mut self, table: &str, filter: &RowFilter) -> Result<u64, Error>;

    /// Add a column; a no-op if a column of that name already exists.
    fn add_column(&mut self, table: &str, def: &ColumnDef) -> Result<(), Error>;

    /// Drop a column; a no-op if already absent.
    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), Error>;

    /// Drop a table; a no-op if already absent.
    fn drop_table(&mut self, table: &str) -> Result<(), Error>;

    /// Install a row-level trigger. Fails if the name is taken.
    fn install_trigger(&mut self, def: &TriggerDef) -> Result<(), Error>;

    /// Drop a trigger; a no-op if already absent.
    fn drop_trigger(&mut self, table: &str, name: &str) -> Result<(), Error>;

    /// Apply `action` to at most `limit` rows matching `filter` with
    /// `low <= id < high`, ascending, inside one short transaction.
    fn apply_range(
        &mut self,
        table: &str,
        low: i64,
        high: i64,
        limit: usize,
        filter: &RowFilter,
        action: &RowAction,
    ) -> Result<RangeOutcome, Error>;

    /// Create an index, concurrently (outside any transaction) if requested.
    fn create_index(&mut self, def: &IndexDef, concurrently: bool) -> Result<(), Error>;

    /// Rename an index. Metadata-only, effectively instantaneous.
    fn rename_index(&mut self, from: &str, to: &str) -> Result<(), Error>;

    /// Drop an index; a no-op if already absent.
    fn drop_index(&mut self, name: &str) -> Result<(), Error>;
}
