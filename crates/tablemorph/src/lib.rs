//! tablemorph - Online schema changes without blocking writes.
//!
//! Primitives for evolving a live relational schema while the application
//! keeps reading and writing: dual-write mirrors, resumable batched
//! backfills, concurrent index cutover, and guarded retirement of old
//! columns and tables. [`MigrationOrchestrator`] sequences them into one
//! logical change:
//!
//! 1. `shadow-create` - add the replacement column, nullable
//! 2. `dual-write` - mirror live writes into it
//! 3. `backfilling` - copy pre-existing rows in bounded batches
//! 4. `validated` - zero rows pending
//! 5. `cutover` - swap indexes, remove the mirror
//! 6. `retiring` - old column read-only for the grace window
//! 7. `dropped` - old column removed, with a [`SafetyGuard`] permit
//!
//! Every step is idempotent and progress is re-derived from live database
//! structure, so an interrupted run resumes by simply running again. The
//! primitives speak to the database through the [`Backend`] trait;
//! [`PgBackend`] renders them to PostgreSQL and [`MemoryDb`] interprets
//! them in process with full trigger semantics.

pub mod backend;
pub mod backfill;
pub mod cutover;
pub mod error;
pub mod guard;
pub mod memory;
pub mod mirror;
pub mod orchestrator;
pub mod postgres;
pub mod retire;

pub use backend::{
    Backend, ColumnDef, IndexDef, IndexState, RangeOutcome, RowAction, RowFilter, SqlType,
    TriggerAction, TriggerDef, Value,
};
pub use backfill::{
    BackfillConfig, BackfillCursor, BackfillProgress, BatchedBackfill, WindowStrategy,
    run_backfill,
};
pub use cutover::{build_concurrent, swap};
pub use error::Error;
pub use guard::{GuardPermit, GuardedOp, SafetyGuard};
pub use memory::MemoryDb;
pub use mirror::{Transform, install_mirror, remove_mirror, sync_trigger_name};
pub use orchestrator::{
    ChangePhase, ChangeReport, ColumnChange, ColumnLifecycle, IndexSwap, MigrationOrchestrator,
};
pub use postgres::{PgBackend, SqlSession, TxnMode};
pub use retire::{
    drop_readonly, drop_retired_table, mark_readonly, read_only_table, readonly_trigger_name,
    release_table, table_readonly_trigger_name,
};
