//! Resumable batched backfill.
//!
//! Drives a bounded-size loop that populates rows not yet migrated, in
//! ascending id windows, each applied in its own short transaction so no
//! single step holds locks over the whole table. Progress is never persisted:
//! the pending predicate always excludes rows already populated, so an
//! interrupted run restarts from the beginning and skips completed work at
//! the cost of cheap empty batches.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, RowAction, RowFilter};
use crate::error::Error;

/// How batch windows are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowStrategy {
    /// Each batch takes the next `batch_size` pending rows by id order.
    Keyset,
    /// Each batch covers a fixed id span of `batch_size`, regardless of how
    /// many rows it contains. Preferred for tables with large contiguous id
    /// gaps from historical deletes, where keyset windows would be uneven.
    FixedRange,
}

/// Configuration for a backfill run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Maximum rows written per batch transaction.
    pub batch_size: usize,
    /// Windowing strategy.
    pub strategy: WindowStrategy,
    /// Retries per batch for transient failures before the run aborts.
    pub max_retries: u32,
    /// Delay between batches in milliseconds, yielding to live writes.
    pub batch_delay_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            strategy: WindowStrategy::Keyset,
            max_retries: 3,
            batch_delay_ms: 10,
        }
    }
}

/// Ephemeral position of a running backfill.
///
/// Owned exclusively by the running invocation and destroyed on completion;
/// it is never persisted and never trusted across a process restart. A fresh
/// run reconstructs it by re-querying the pending id bounds.
#[derive(Debug, Clone)]
pub struct BackfillCursor {
    /// Largest id written so far in this invocation.
    pub last_processed_id: Option<i64>,
    /// Maximum rows per batch.
    pub batch_size: usize,
    strategy: WindowStrategy,
    next_id: i64,
    end_id: i64,
    finished: bool,
}

impl BackfillCursor {
    /// Derive a cursor from the current pending id bounds.
    ///
    /// Returns a finished cursor when no rows match the filter.
    pub fn for_run(
        backend: &mut dyn Backend,
        table: &str,
        filter: &RowFilter,
        config: &BackfillConfig,
    ) -> Result<Self, Error> {
        let bounds = backend.id_bounds(table, filter)?;
        let (next_id, end_id, finished) = match bounds {
            Some((min, max)) => (min, max, false),
            None => (0, 0, true),
        };
        Ok(Self {
            last_processed_id: None,
            batch_size: config.batch_size,
            strategy: config.strategy,
            next_id,
            end_id,
            finished,
        })
    }

    /// Whether all windows have been processed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The half-open id window `[low, high)` of the next batch.
    fn window(&self) -> (i64, i64) {
        match self.strategy {
            WindowStrategy::Keyset => (self.next_id, i64::MAX),
            WindowStrategy::FixedRange => {
                let high = self.next_id.saturating_add(self.batch_size as i64);
                (self.next_id, high)
            }
        }
    }

    /// Advance past a completed batch.
    fn advance(&mut self, rows_written: u64, last_id: Option<i64>) {
        if let Some(id) = last_id {
            self.last_processed_id = Some(self.last_processed_id.map_or(id, |p| p.max(id)));
        }
        match self.strategy {
            WindowStrategy::Keyset => match last_id {
                Some(id) if rows_written > 0 => self.next_id = id.saturating_add(1),
                _ => self.finished = true,
            },
            WindowStrategy::FixedRange => {
                let (_, high) = self.window();
                self.next_id = high;
                if self.next_id > self.end_id {
                    self.finished = true;
                }
            }
        }
    }
}

/// Progress report for a completed backfill run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillProgress {
    /// Batches executed, including empty windows.
    pub batches: u64,
    /// Rows written across all batches.
    pub rows_written: u64,
    /// Transient failures retried.
    pub retries: u64,
}

/// Driver for bounded, resumable batch loops.
#[derive(Debug, Clone, Default)]
pub struct BatchedBackfill {
    config: BackfillConfig,
}

impl BatchedBackfill {
    /// Create a driver with the given configuration.
    pub fn new(config: BackfillConfig) -> Self {
        Self { config }
    }

    /// Run the backfill to completion.
    ///
    /// Safe to interrupt at any batch boundary and safe to re-run: a second
    /// run over a completed table performs zero writes. A transient failure
    /// is retried up to `max_retries` times per batch; exhaustion or any
    /// other error aborts the run, leaving completed batches committed.
    #[instrument(skip_all, fields(table = %table))]
    pub fn run(
        &self,
        backend: &mut dyn Backend,
        table: &str,
        filter: &RowFilter,
        action: &RowAction,
    ) -> Result<BackfillProgress, Error> {
        let mut cursor = BackfillCursor::for_run(backend, table, filter, &self.config)?;
        let mut progress = BackfillProgress::default();

        while !cursor.is_finished() {
            let mut attempts = 0u32;
            let rows = loop {
                match self.run_batch(backend, table, filter, action, &mut cursor) {
                    Ok(rows) => break rows,
                    Err(e) if e.is_transient() && attempts < self.config.max_retries => {
                        attempts += 1;
                        progress.retries += 1;
                        warn!(table, attempts, error = %e, "transient batch failure, retrying");
                    }
                    Err(e) if e.is_transient() => {
                        return Err(Error::BackfillFatal {
                            reason: format!(
                                "batch at id {} still failing after {} retries: {e}",
                                cursor.next_id, self.config.max_retries
                            ),
                        });
                    }
                    Err(e) => return Err(e),
                }
            };

            progress.batches += 1;
            progress.rows_written += rows;

            if !cursor.is_finished() && self.config.batch_delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.batch_delay_ms));
            }
        }

        info!(
            table,
            batches = progress.batches,
            rows = progress.rows_written,
            retries = progress.retries,
            "backfill complete"
        );
        Ok(progress)
    }

    /// Execute a single batch and advance the cursor.
    ///
    /// Exposed so callers can interleave other work at batch boundaries; the
    /// cursor is only advanced on success, so a failed batch retries in
    /// place. Returns the rows written by this batch.
    pub fn run_batch(
        &self,
        backend: &mut dyn Backend,
        table: &str,
        filter: &RowFilter,
        action: &RowAction,
        cursor: &mut BackfillCursor,
    ) -> Result<u64, Error> {
        if cursor.is_finished() {
            return Ok(0);
        }

        let (low, high) = cursor.window();
        let outcome = backend.apply_range(table, low, high, cursor.batch_size, filter, action)?;
        cursor.advance(outcome.rows_written, outcome.last_id);

        debug!(
            table,
            low,
            rows = outcome.rows_written,
            last_id = ?outcome.last_id,
            "batch applied"
        );
        Ok(outcome.rows_written)
    }

    /// The configuration this driver runs with.
    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }
}

/// Run a backfill with the given configuration. Convenience wrapper for
/// migration files calling the primitive once.
pub fn run_backfill(
    backend: &mut dyn Backend,
    table: &str,
    filter: &RowFilter,
    action: &RowAction,
    config: BackfillConfig,
) -> Result<BackfillProgress, Error> {
    BatchedBackfill::new(config).run(backend, table, filter, action)
}
