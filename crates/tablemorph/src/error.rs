//! Crate-wide error types.

use crate::guard::GuardedOp;
use thiserror::Error;

/// Errors raised by the schema-change primitives.
#[derive(Debug, Error)]
pub enum Error {
    /// The safety guard rejected a destructive operation.
    #[error("operation '{op}' blocked by safety guard; hold a SafetyGuard permit to proceed")]
    BlockedOperation {
        /// The guarded operation that was attempted.
        op: GuardedOp,
    },

    /// A write touched a column or table that has been retired.
    #[error("write rejected: {target} is retired and read-only")]
    AlreadyRetired {
        /// The retired target, as `table` or `table.column`.
        target: String,
    },

    /// A mirror trigger already exists for this column pair.
    #[error("mirror already installed on {table}: trigger {trigger} exists")]
    MirrorAlreadyInstalled {
        /// The mirrored table.
        table: String,
        /// The conflicting trigger name.
        trigger: String,
    },

    /// The mirror transform failed, rejecting the triggering write.
    #[error("mirror transform failed for {table}.{column}: {reason}")]
    MirrorTransformFailure {
        /// The mirrored table.
        table: String,
        /// The source column of the mirror.
        column: String,
        /// Why the transform failed.
        reason: String,
    },

    /// A retryable backfill failure (lock timeout, serialization conflict).
    #[error("transient backfill failure: {reason}")]
    BackfillTransient {
        /// Description of the transient condition.
        reason: String,
    },

    /// A non-retryable backfill failure; the whole run is aborted.
    #[error("backfill aborted: {reason}")]
    BackfillFatal {
        /// Why the backfill cannot continue.
        reason: String,
    },

    /// A concurrent index build left a broken index behind.
    #[error("index {index} exists but is invalid; drop it before retrying")]
    IndexBuildInvalid {
        /// The invalid index name.
        index: String,
    },

    /// A concurrent index build was attempted inside a transaction.
    #[error("cannot build index {index} concurrently inside a transaction")]
    ConcurrentBuildInTransaction {
        /// The index that was being built.
        index: String,
    },

    /// A step's preconditions are not satisfied yet.
    #[error("validation failed for {table}: {message}")]
    ValidationFailed {
        /// The table being migrated.
        table: String,
        /// What is still missing.
        message: String,
    },

    /// A referenced table, column, trigger, or index does not exist.
    #[error("schema error: {message}")]
    Schema {
        /// Description of the inconsistency.
        message: String,
    },

    /// The underlying SQL session failed or the operation needs a SQL backend.
    #[error("sql error: {message}")]
    Sql {
        /// The session-level failure.
        message: String,
    },
}

impl Error {
    /// Whether this error may succeed on retry without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackfillTransient { .. })
    }
}
