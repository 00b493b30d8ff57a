//! Orchestration of a multi-step online column change.
//!
//! One logical schema change (replace a column's type, name, or ownership)
//! moves through a fixed sequence of phases, each deployed as its own
//! idempotent migration step:
//!
//! | Phase | Work | Re-run safety |
//! |-------|------|---------------|
//! | `shadow-create` | add the shadow column | additive, always safe |
//! | `dual-write` | install the mirror trigger | additive, always safe |
//! | `backfilling` | batched copy of pre-existing rows | resumable by predicate |
//! | `validated` | confirm zero pending rows | read-only check |
//! | `cutover` | swap indexes, remove the mirror | old index kept until rename lands |
//! | `retiring` | mark the old column read-only | grace window for stale deploys |
//! | `dropped` | drop the old column | requires validation + guard permit |
//!
//! No step assumes the previous step's process is still alive: progress is
//! re-derived from live structure (columns, triggers, indexes, pending-row
//! counts), never from in-memory state. Steps that only add structure may
//! re-run freely; steps that remove structure first confirm the replacement
//! is fully validated. That ordering is the core correctness invariant.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::backend::{Backend, ColumnDef, IndexDef, RowAction, RowFilter};
use crate::backfill::{BackfillConfig, BackfillProgress, BatchedBackfill};
use crate::cutover;
use crate::error::Error;
use crate::guard::{GuardedOp, SafetyGuard};
use crate::mirror::{self, Transform};
use crate::retire;

/// Phase of one logical column change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangePhase {
    /// Shadow column added.
    ShadowCreate,
    /// Mirror trigger keeping shadow and source consistent.
    DualWrite,
    /// Batched copy of pre-existing rows in progress.
    Backfilling,
    /// All rows populated; replacement confirmed complete.
    Validated,
    /// Indexes swapped, mirror removed; shadow column is authoritative.
    Cutover,
    /// Old column read-only, awaiting the grace period.
    Retiring,
    /// Old column physically removed.
    Dropped,
}

impl std::fmt::Display for ChangePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangePhase::ShadowCreate => write!(f, "shadow-create"),
            ChangePhase::DualWrite => write!(f, "dual-write"),
            ChangePhase::Backfilling => write!(f, "backfilling"),
            ChangePhase::Validated => write!(f, "validated"),
            ChangePhase::Cutover => write!(f, "cutover"),
            ChangePhase::Retiring => write!(f, "retiring"),
            ChangePhase::Dropped => write!(f, "dropped"),
        }
    }
}

/// Lifecycle state of a column involved in a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnLifecycle {
    /// Normal readable/writable column.
    Active,
    /// Newly added, being populated.
    Shadow,
    /// Kept consistent with its counterpart via the mirror.
    DualWrite,
    /// Read-only, pending physical removal.
    Retired,
    /// Physically removed.
    Dropped,
}

impl std::fmt::Display for ColumnLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnLifecycle::Active => write!(f, "active"),
            ColumnLifecycle::Shadow => write!(f, "shadow"),
            ColumnLifecycle::DualWrite => write!(f, "dual-write"),
            ColumnLifecycle::Retired => write!(f, "retired"),
            ColumnLifecycle::Dropped => write!(f, "dropped"),
        }
    }
}

/// An index replaced as part of the cutover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSwap {
    /// Replacement index, built concurrently under its temporary name.
    pub temp: IndexDef,
    /// Permanent name the replacement takes at cutover.
    pub final_name: String,
    /// Old index of the same role, dropped after the rename lands.
    pub replaces: Option<String>,
}

/// Parameterized description of one logical column change.
///
/// Per-table tuning (batch size, windowing strategy, index swaps) lives here
/// as plan parameters so every change runs the same protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnChange {
    /// The table being migrated.
    pub table: String,
    /// The column being replaced.
    pub source: String,
    /// The replacement (shadow) column.
    pub target: ColumnDef,
    /// Change-propagation function, shared by mirror and backfill.
    pub transform: Transform,
    /// Backfill tuning.
    pub backfill: BackfillConfig,
    /// Indexes to rebuild against the new column.
    pub index_swaps: Vec<IndexSwap>,
}

impl ColumnChange {
    /// Describe a change with default backfill tuning and no index swaps.
    pub fn new(
        table: impl Into<String>,
        source: impl Into<String>,
        target: ColumnDef,
        transform: Transform,
    ) -> Self {
        Self {
            table: table.into(),
            source: source.into(),
            target,
            transform,
            backfill: BackfillConfig::default(),
            index_swaps: Vec::new(),
        }
    }

    /// Override the backfill tuning.
    pub fn with_backfill(mut self, config: BackfillConfig) -> Self {
        self.backfill = config;
        self
    }

    /// Add an index swap to the cutover.
    pub fn with_index_swap(mut self, swap: IndexSwap) -> Self {
        self.index_swaps.push(swap);
        self
    }

    /// Predicate for rows not yet populated.
    fn pending_filter(&self) -> RowFilter {
        RowFilter::IsNull {
            column: self.target.name.clone(),
        }
    }

    /// Per-row backfill work.
    fn copy_action(&self) -> RowAction {
        RowAction::CopyColumn {
            source: self.source.clone(),
            target: self.target.name.clone(),
            transform: self.transform.clone(),
        }
    }
}

/// Operator-facing snapshot of a change's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeReport {
    /// The table being migrated.
    pub table: String,
    /// Furthest phase reached, if the change has started.
    pub phase: Option<ChangePhase>,
    /// Rows still pending backfill.
    pub pending_rows: u64,
    /// Lifecycle of the old column.
    pub source_lifecycle: ColumnLifecycle,
    /// Lifecycle of the new column, once it exists.
    pub target_lifecycle: Option<ColumnLifecycle>,
}

/// Sequences the schema-change primitives across deployable steps.
///
/// The orchestrator owns all shadow/mirror state for its change; no other
/// part of the running application may mutate it directly.
pub struct MigrationOrchestrator {
    change: ColumnChange,
    guard: SafetyGuard,
}

impl MigrationOrchestrator {
    /// Create an orchestrator for one logical change.
    pub fn new(change: ColumnChange, guard: SafetyGuard) -> Self {
        Self { change, guard }
    }

    /// The change being orchestrated.
    pub fn change(&self) -> &ColumnChange {
        &self.change
    }

    /// The safety guard gating destructive steps.
    pub fn guard(&self) -> &SafetyGuard {
        &self.guard
    }

    /// Furthest phase the change has reached, derived from live structure.
    ///
    /// Returns `None` when nothing has happened yet. `Backfilling` is a
    /// process state with no at-rest footprint, so it is never observed;
    /// a change with a mirror and pending rows reports `DualWrite`.
    pub fn observed_phase(&self, backend: &mut dyn Backend) -> Result<Option<ChangePhase>, Error> {
        let c = &self.change;

        let source_exists = backend.column_exists(&c.table, &c.source)?;
        let target_exists = backend.column_exists(&c.table, &c.target.name)?;
        if !target_exists {
            return Ok(None);
        }
        if !source_exists {
            return Ok(Some(ChangePhase::Dropped));
        }

        let readonly = retire::readonly_trigger_name(&c.table, &c.source);
        if backend.trigger_exists(&c.table, &readonly)? {
            return Ok(Some(ChangePhase::Retiring));
        }

        let sync = mirror::sync_trigger_name(&c.table, &c.source);
        let mirrored = backend.trigger_exists(&c.table, &sync)?;
        if !mirrored {
            // Mirror removal is the last act of cutover. Landed index swaps
            // plus zero pending rows witness a completed cutover; a change
            // with no swaps leaves no at-rest witness and reads
            // conservatively as shadow-create, so a resumed run re-installs
            // the mirror before anything destructive happens.
            if !c.index_swaps.is_empty()
                && self.swaps_complete(backend)?
                && backend.count_pending(&c.table, &c.pending_filter())? == 0
            {
                return Ok(Some(ChangePhase::Cutover));
            }
            return Ok(Some(ChangePhase::ShadowCreate));
        }

        if backend.count_pending(&c.table, &c.pending_filter())? == 0 {
            return Ok(Some(ChangePhase::Validated));
        }
        Ok(Some(ChangePhase::DualWrite))
    }

    fn swaps_complete(&self, backend: &mut dyn Backend) -> Result<bool, Error> {
        for swap in &self.change.index_swaps {
            if backend.index_state(&swap.final_name)? != crate::backend::IndexState::Valid {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Add the shadow column. Additive; always safe to re-run.
    ///
    /// The column is added nullable regardless of the target definition:
    /// existing rows have no value for it until the backfill lands.
    pub fn create_shadow(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let mut def = self.change.target.clone();
        def.nullable = true;
        backend.add_column(&self.change.table, &def)?;
        info!(table = %self.change.table, column = %def.name, "shadow column in place");
        Ok(())
    }

    /// Install the dual-write mirror. Additive; always safe to re-run.
    pub fn start_dual_write(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let c = &self.change;
        let sync = mirror::sync_trigger_name(&c.table, &c.source);
        if backend.trigger_exists(&c.table, &sync)? {
            debug!(table = %c.table, "mirror already installed");
            return Ok(());
        }
        mirror::install_mirror(backend, &c.table, &c.source, &c.target.name, c.transform.clone())
    }

    /// Copy pre-existing rows into the shadow column.
    ///
    /// Requires the mirror so rows written mid-backfill are never missed.
    pub fn run_backfill(&self, backend: &mut dyn Backend) -> Result<BackfillProgress, Error> {
        let c = &self.change;
        let sync = mirror::sync_trigger_name(&c.table, &c.source);
        if !backend.trigger_exists(&c.table, &sync)? {
            return Err(Error::ValidationFailed {
                table: c.table.clone(),
                message: "backfill requires the dual-write mirror to be installed first".to_string(),
            });
        }
        BatchedBackfill::new(c.backfill.clone()).run(
            backend,
            &c.table,
            &c.pending_filter(),
            &c.copy_action(),
        )
    }

    /// Build the replacement indexes concurrently under temporary names.
    ///
    /// Runs after the backfill so the builds scan complete data; never
    /// wrapped in a transaction.
    pub fn build_indexes(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        for swap in &self.change.index_swaps {
            cutover::build_concurrent(backend, &swap.temp)?;
        }
        Ok(())
    }

    /// Confirm the replacement column is fully populated.
    pub fn validate(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let c = &self.change;
        let sync = mirror::sync_trigger_name(&c.table, &c.source);
        if !backend.trigger_exists(&c.table, &sync)? {
            return Err(Error::ValidationFailed {
                table: c.table.clone(),
                message: "mirror is not installed; live writes would be missed".to_string(),
            });
        }
        let pending = backend.count_pending(&c.table, &c.pending_filter())?;
        if pending > 0 {
            return Err(Error::ValidationFailed {
                table: c.table.clone(),
                message: format!("{pending} rows still pending backfill"),
            });
        }
        debug!(table = %c.table, "change validated");
        Ok(())
    }

    /// Swap indexes to the new column and remove the mirror.
    ///
    /// Removes structure, so it first re-confirms validation; safe to re-run
    /// after a partial failure.
    #[instrument(skip_all, fields(table = %self.change.table))]
    pub fn cutover(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let c = &self.change;
        if backend.count_pending(&c.table, &c.pending_filter())? > 0 {
            return Err(Error::ValidationFailed {
                table: c.table.clone(),
                message: "cannot cut over with rows still pending backfill".to_string(),
            });
        }
        for swap in &c.index_swaps {
            cutover::swap(backend, &swap.temp.name, &swap.final_name, swap.replaces.as_deref())?;
        }
        mirror::remove_mirror(backend, &c.table, &c.source)?;
        info!(table = %c.table, target = %c.target.name, "cutover complete");
        Ok(())
    }

    /// Mark the old column read-only for the deprecation grace window.
    ///
    /// Any not-yet-updated code still writing the old column now fails
    /// loudly instead of corrupting data.
    pub fn retire_source(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let c = &self.change;
        let sync = mirror::sync_trigger_name(&c.table, &c.source);
        if backend.trigger_exists(&c.table, &sync)? {
            return Err(Error::ValidationFailed {
                table: c.table.clone(),
                message: "cutover has not completed; mirror is still installed".to_string(),
            });
        }
        retire::mark_readonly(backend, &c.table, &c.source)
    }

    /// Physically drop the old column.
    ///
    /// Only legal from the retiring phase, and only with a safety-guard
    /// permit held: removal must be an explicit, visible opt-in.
    pub fn drop_source(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let c = &self.change;
        if self.observed_phase(backend)? != Some(ChangePhase::Retiring) {
            return Err(Error::ValidationFailed {
                table: c.table.clone(),
                message: "old column may only be dropped from the retiring phase".to_string(),
            });
        }
        self.guard.check(GuardedOp::DropColumn)?;

        retire::drop_readonly(backend, &c.table, &c.source)?;
        backend.drop_column(&c.table, &c.source)?;
        info!(table = %c.table, column = %c.source, "old column dropped");
        Ok(())
    }

    /// Drive the change forward until `goal` is reached.
    ///
    /// Each iteration re-observes the phase and runs exactly the next step,
    /// so a run interrupted anywhere resumes cleanly; resuming past an
    /// ambiguous reading re-runs additive steps rather than skipping them.
    /// Reaching `Dropped` requires a guard permit, as with
    /// [`MigrationOrchestrator::drop_source`].
    pub fn run_to(&self, backend: &mut dyn Backend, goal: ChangePhase) -> Result<ChangePhase, Error> {
        // Phases established by steps run in this invocation. A change with
        // no index swaps leaves no at-rest witness of its cutover, so the
        // observation alone would never move past it.
        let mut floor: Option<ChangePhase> = None;
        loop {
            let mut observed = self.observed_phase(backend)?;
            if let Some(f) = floor {
                observed = Some(observed.map_or(f, |o| o.max(f)));
            }
            if let Some(phase) = observed {
                if phase >= goal {
                    return Ok(phase);
                }
            }
            match observed {
                None => self.create_shadow(backend)?,
                Some(ChangePhase::ShadowCreate) => self.start_dual_write(backend)?,
                Some(ChangePhase::DualWrite) | Some(ChangePhase::Backfilling) => {
                    self.run_backfill(backend)?;
                }
                Some(ChangePhase::Validated) => {
                    self.build_indexes(backend)?;
                    self.cutover(backend)?;
                    floor = Some(ChangePhase::Cutover);
                }
                Some(ChangePhase::Cutover) => self.retire_source(backend)?,
                Some(ChangePhase::Retiring) => self.drop_source(backend)?,
                Some(ChangePhase::Dropped) => return Ok(ChangePhase::Dropped),
            }
        }
    }

    /// Snapshot of progress for operators.
    pub fn report(&self, backend: &mut dyn Backend) -> Result<ChangeReport, Error> {
        let c = &self.change;
        let phase = self.observed_phase(backend)?;
        let pending_rows = if backend.column_exists(&c.table, &c.target.name)? {
            backend.count_pending(&c.table, &c.pending_filter())?
        } else {
            0
        };

        let (source_lifecycle, target_lifecycle) = match phase {
            None => (ColumnLifecycle::Active, None),
            Some(ChangePhase::ShadowCreate) => (ColumnLifecycle::Active, Some(ColumnLifecycle::Shadow)),
            Some(ChangePhase::DualWrite) | Some(ChangePhase::Backfilling) | Some(ChangePhase::Validated) => {
                (ColumnLifecycle::DualWrite, Some(ColumnLifecycle::DualWrite))
            }
            Some(ChangePhase::Cutover) => (ColumnLifecycle::Active, Some(ColumnLifecycle::Active)),
            Some(ChangePhase::Retiring) => (ColumnLifecycle::Retired, Some(ColumnLifecycle::Active)),
            Some(ChangePhase::Dropped) => (ColumnLifecycle::Dropped, Some(ColumnLifecycle::Active)),
        };

        Ok(ChangeReport {
            table: c.table.clone(),
            phase,
            pending_rows,
            source_lifecycle,
            target_lifecycle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SqlType, Value};
    use crate::backfill::WindowStrategy;
    use crate::memory::MemoryDb;

    fn change() -> ColumnChange {
        ColumnChange::new(
            "users",
            "source_id",
            ColumnDef::new("target_id", SqlType::BigInt),
            Transform::ToBigInt,
        )
        .with_backfill(BackfillConfig {
            batch_size: 2,
            strategy: WindowStrategy::Keyset,
            max_retries: 2,
            batch_delay_ms: 0,
        })
    }

    fn setup(rows: &[i64]) -> MemoryDb {
        let db = MemoryDb::new();
        db.create_table("users", vec![ColumnDef::new("source_id", SqlType::Integer)]);
        for id in rows {
            db.insert("users", *id, &[("source_id", Value::Int(*id * 7))])
                .unwrap();
        }
        db
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ChangePhase::ShadowCreate.to_string(), "shadow-create");
        assert_eq!(ChangePhase::DualWrite.to_string(), "dual-write");
        assert_eq!(ChangePhase::Dropped.to_string(), "dropped");
    }

    #[test]
    fn test_phases_are_ordered() {
        assert!(ChangePhase::ShadowCreate < ChangePhase::DualWrite);
        assert!(ChangePhase::Validated < ChangePhase::Cutover);
        assert!(ChangePhase::Retiring < ChangePhase::Dropped);
    }

    #[test]
    fn test_observed_phase_tracks_progress() {
        let db = setup(&[1, 2, 3]);
        let mut backend = db.clone();
        let change = change().with_index_swap(IndexSwap {
            temp: IndexDef::new("users_target_id_tmp", "users", vec!["target_id".into()]),
            final_name: "users_target_id_idx".into(),
            replaces: None,
        });
        let orch = MigrationOrchestrator::new(change, SafetyGuard::new());

        assert_eq!(orch.observed_phase(&mut backend).unwrap(), None);

        orch.create_shadow(&mut backend).unwrap();
        assert_eq!(
            orch.observed_phase(&mut backend).unwrap(),
            Some(ChangePhase::ShadowCreate)
        );

        orch.start_dual_write(&mut backend).unwrap();
        assert_eq!(
            orch.observed_phase(&mut backend).unwrap(),
            Some(ChangePhase::DualWrite)
        );

        orch.run_backfill(&mut backend).unwrap();
        assert_eq!(
            orch.observed_phase(&mut backend).unwrap(),
            Some(ChangePhase::Validated)
        );

        orch.build_indexes(&mut backend).unwrap();
        orch.cutover(&mut backend).unwrap();
        assert_eq!(
            orch.observed_phase(&mut backend).unwrap(),
            Some(ChangePhase::Cutover)
        );

        orch.retire_source(&mut backend).unwrap();
        assert_eq!(
            orch.observed_phase(&mut backend).unwrap(),
            Some(ChangePhase::Retiring)
        );
    }

    #[test]
    fn test_no_swap_change_without_mirror_reads_as_shadow_create() {
        let db = setup(&[]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());

        orch.create_shadow(&mut backend).unwrap();

        // Zero pending rows and no index swaps must not read as a completed
        // cutover; retiring from here would skip the mirror entirely.
        assert_eq!(
            orch.observed_phase(&mut backend).unwrap(),
            Some(ChangePhase::ShadowCreate)
        );
    }

    #[test]
    fn test_empty_table_lifecycle_converges() {
        let db = setup(&[]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());

        let reached = orch.run_to(&mut backend, ChangePhase::Retiring).unwrap();
        assert_eq!(reached, ChangePhase::Retiring);

        assert!(db.trigger_exists("users", "users_source_id_readonly").unwrap());
        assert!(!db.trigger_exists("users", "users_source_id_sync").unwrap());
        assert!(db.column_exists("users", "target_id").unwrap());
    }

    #[test]
    fn test_backfill_requires_mirror() {
        let db = setup(&[1]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());

        orch.create_shadow(&mut backend).unwrap();
        let err = orch.run_backfill(&mut backend).unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
    }

    #[test]
    fn test_validate_rejects_pending_rows() {
        let db = setup(&[1, 2]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());

        orch.create_shadow(&mut backend).unwrap();
        orch.start_dual_write(&mut backend).unwrap();

        let err = orch.validate(&mut backend).unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));

        orch.run_backfill(&mut backend).unwrap();
        orch.validate(&mut backend).unwrap();
    }

    #[test]
    fn test_retire_requires_cutover() {
        let db = setup(&[1]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());

        orch.create_shadow(&mut backend).unwrap();
        orch.start_dual_write(&mut backend).unwrap();
        orch.run_backfill(&mut backend).unwrap();

        // Mirror still installed: retiring now would strand live writes.
        let err = orch.retire_source(&mut backend).unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
    }

    #[test]
    fn test_drop_is_guarded() {
        let db = setup(&[1]);
        let mut backend = db.clone();
        let guard = SafetyGuard::new();
        let orch = MigrationOrchestrator::new(change(), guard.clone());

        orch.run_to(&mut backend, ChangePhase::Retiring).unwrap();

        let err = orch.drop_source(&mut backend).unwrap_err();
        assert!(matches!(err, Error::BlockedOperation { .. }));
        assert!(db.column_exists("users", "source_id").unwrap());

        guard
            .with_disabled(|| orch.drop_source(&mut backend))
            .unwrap();
        assert!(!db.column_exists("users", "source_id").unwrap());
        assert_eq!(
            orch.observed_phase(&mut backend).unwrap(),
            Some(ChangePhase::Dropped)
        );
    }

    #[test]
    fn test_drop_requires_retiring_phase() {
        let db = setup(&[1]);
        let mut backend = db.clone();
        let guard = SafetyGuard::new();
        let orch = MigrationOrchestrator::new(change(), guard.clone());

        orch.run_to(&mut backend, ChangePhase::Cutover).unwrap();

        let err = guard
            .with_disabled(|| orch.drop_source(&mut backend))
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
    }

    #[test]
    fn test_steps_are_idempotent() {
        let db = setup(&[1, 2]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());

        orch.create_shadow(&mut backend).unwrap();
        orch.create_shadow(&mut backend).unwrap();
        orch.start_dual_write(&mut backend).unwrap();
        orch.start_dual_write(&mut backend).unwrap();
        orch.run_backfill(&mut backend).unwrap();
        let second = orch.run_backfill(&mut backend).unwrap();
        assert_eq!(second.rows_written, 0);
        orch.cutover(&mut backend).unwrap();
        orch.cutover(&mut backend).unwrap();
        orch.retire_source(&mut backend).unwrap();
        orch.retire_source(&mut backend).unwrap();
    }

    #[test]
    fn test_report_serializes_for_operators() {
        let db = setup(&[1]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());
        orch.run_to(&mut backend, ChangePhase::DualWrite).unwrap();

        let report = orch.report(&mut backend).unwrap();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"table\":\"users\""));
        assert!(json.contains("\"pending_rows\":1"));
    }

    #[test]
    fn test_report_reflects_lifecycles() {
        let db = setup(&[1, 2]);
        let mut backend = db.clone();
        let orch = MigrationOrchestrator::new(change(), SafetyGuard::new());

        orch.run_to(&mut backend, ChangePhase::Retiring).unwrap();
        let report = orch.report(&mut backend).unwrap();

        assert_eq!(report.phase, Some(ChangePhase::Retiring));
        assert_eq!(report.pending_rows, 0);
        assert_eq!(report.source_lifecycle, ColumnLifecycle::Retired);
        assert_eq!(report.target_lifecycle, Some(ColumnLifecycle::Active));
    }
}
