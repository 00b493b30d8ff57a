//! Safety guard for destructive schema operations.
//!
//! Destructive operations (drop column, drop table, renames) are blocked by
//! default and require an explicit, scoped opt-out. The guard is plain scoped
//! state handed to the operations that need it, not a process global, and the
//! permit restores the guard on every exit path including unwind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Error;

/// Operations the safety guard protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardedOp {
    /// Dropping a column.
    DropColumn,
    /// Dropping a table.
    DropTable,
    /// Renaming a column.
    RenameColumn,
    /// Renaming a table.
    RenameTable,
}

impl std::fmt::Display for GuardedOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardedOp::DropColumn => write!(f, "drop column"),
            GuardedOp::DropTable => write!(f, "drop table"),
            GuardedOp::RenameColumn => write!(f, "rename column"),
            GuardedOp::RenameTable => write!(f, "rename table"),
        }
    }
}

/// Guard blocking destructive schema operations unless explicitly permitted.
///
/// Clones share the same underlying flag, so a guard can be handed to an
/// orchestrator while the calling migration step holds the permit.
#[derive(Debug, Clone)]
pub struct SafetyGuard {
    permits: Arc<AtomicUsize>,
}

impl SafetyGuard {
    /// Create a guard in the enabled (blocking) state.
    pub fn new() -> Self {
        Self {
            permits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether the guard currently blocks destructive operations.
    pub fn is_enabled(&self) -> bool {
        self.permits.load(Ordering::SeqCst) == 0
    }

    /// Check whether `op` may proceed.
    ///
    /// Fails before any SQL is issued when the guard is enabled.
    pub fn check(&self, op: GuardedOp) -> Result<(), Error> {
        if self.is_enabled() {
            return Err(Error::BlockedOperation { op });
        }
        Ok(())
    }

    /// Disable the guard until the returned permit is dropped.
    ///
    /// Permits nest; the guard re-enables once the last permit is gone.
    pub fn permit(&self) -> GuardPermit {
        self.permits.fetch_add(1, Ordering::SeqCst);
        GuardPermit {
            permits: Arc::clone(&self.permits),
        }
    }

    /// Run `f` with the guard disabled, re-enabling on every exit path.
    pub fn with_disabled<T>(&self, f: impl FnOnce() -> T) -> T {
        let _permit = self.permit();
        f()
    }
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped permit that re-enables the guard when dropped.
#[derive(Debug)]
pub struct GuardPermit {
    permits: Arc<AtomicUsize>,
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        self.permits.fetch_sub(1, Ordering::SeqCst);
    }
}
