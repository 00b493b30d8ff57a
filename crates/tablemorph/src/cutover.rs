//! Concurrent index build and atomic cutover.
//!
//! Replacement indexes are built concurrently under temporary names, outside
//! any transaction, then swapped to their permanent name with a fast
//! metadata-only rename. The old index of the same role is dropped only after
//! the rename succeeds, so at every instant at least one valid index
//! supporting the role exists.

use tracing::{debug, info, warn};

use crate::backend::{Backend, IndexDef, IndexState};
use crate::error::Error;

/// Build an index concurrently under its (temporary) name.
///
/// Concurrent builds are incompatible with transactional DDL; a SQL backend
/// refuses to run this inside a transaction. A prior crashed attempt can
/// leave an index that exists but is invalid; that leftover is dropped before
/// retrying. Re-running against an already valid index is a no-op.
pub fn build_concurrent(backend: &mut dyn Backend, def: &IndexDef) -> Result<(), Error> {
    match backend.index_state(&def.name)? {
        IndexState::Valid => {
            debug!(index = %def.name, "index already built and valid");
            return Ok(());
        }
        IndexState::Invalid => {
            warn!(index = %def.name, "dropping invalid leftover from a prior build");
            backend.drop_index(&def.name)?;
        }
        IndexState::Absent => {}
    }

    backend.create_index(def, true)?;
    info!(index = %def.name, table = %def.table, "concurrent index build complete");
    Ok(())
}

/// Swap a validated temporary index into its final name.
///
/// Renames `temp_name` to `final_name`, then drops `replaces` (the old index
/// of the same role), never before. If the old index already holds
/// `final_name`, it is moved aside first so the rename cannot collide.
/// Idempotent: a re-run after the rename landed finishes the remaining
/// drops, so a crash anywhere in the swap recovers by running it again.
pub fn swap(
    backend: &mut dyn Backend,
    temp_name: &str,
    final_name: &str,
    replaces: Option<&str>,
) -> Result<(), Error> {
    match backend.index_state(temp_name)? {
        IndexState::Valid => {}
        IndexState::Invalid => {
            return Err(Error::IndexBuildInvalid {
                index: temp_name.to_string(),
            });
        }
        IndexState::Absent => {
            // A re-run after the rename landed. The old index may still be
            // around if the prior run died before its drop; finish that now.
            if backend.index_state(final_name)? == IndexState::Valid {
                if let Some(old) = replaces {
                    if old != final_name {
                        backend.drop_index(old)?;
                    }
                }
                backend.drop_index(&format!("{final_name}_retired"))?;
                debug!(index = final_name, "swap already complete");
                return Ok(());
            }
            return Err(Error::Schema {
                message: format!("neither {temp_name} nor a valid {final_name} exists"),
            });
        }
    }

    // If the retiring index occupies the final name, move it aside so the
    // role keeps a valid index through the whole swap.
    let old_name = match replaces {
        Some(old) if old == final_name => {
            let parked = format!("{old}_retired");
            if backend.index_state(old)? != IndexState::Absent {
                backend.rename_index(old, &parked)?;
            }
            Some(parked)
        }
        Some(old) => Some(old.to_string()),
        None => None,
    };

    backend.rename_index(temp_name, final_name)?;

    if let Some(old) = old_name {
        if backend.index_state(&old)? != IndexState::Absent {
            backend.drop_index(&old)?;
        }
    }

    info!(from = temp_name, to = final_name, "index cutover complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ColumnDef, SqlType};
    use crate::memory::MemoryDb;

    fn setup() -> MemoryDb {
        let db = MemoryDb::new();
        db.create_table("users", vec![ColumnDef::new("target_id", SqlType::BigInt)]);
        db
    }

    fn temp_def() -> IndexDef {
        IndexDef::new("users_target_id_tmp", "users", vec!["target_id".into()])
    }

    #[test]
    fn test_build_concurrent_is_idempotent() {
        let db = setup();
        let mut backend = db.clone();

        build_concurrent(&mut backend, &temp_def()).unwrap();
        assert_eq!(db.index_state("users_target_id_tmp").unwrap(), IndexState::Valid);

        // Re-running against the valid index is a no-op.
        build_concurrent(&mut backend, &temp_def()).unwrap();
    }

    #[test]
    fn test_build_concurrent_cleans_up_invalid_leftover() {
        let db = setup();
        db.poison_index(&temp_def());
        assert_eq!(db.index_state("users_target_id_tmp").unwrap(), IndexState::Invalid);

        let mut backend = db.clone();
        build_concurrent(&mut backend, &temp_def()).unwrap();
        assert_eq!(db.index_state("users_target_id_tmp").unwrap(), IndexState::Valid);
    }

    #[test]
    fn test_swap_renames_then_drops_old() {
        let db = setup();
        let mut backend = db.clone();

        // Old index of the same role under a distinct name.
        backend
            .create_index(
                &IndexDef::new("users_source_id_idx", "users", vec!["target_id".into()]),
                false,
            )
            .unwrap();
        build_concurrent(&mut backend, &temp_def()).unwrap();

        swap(
            &mut backend,
            "users_target_id_tmp",
            "users_target_id_idx",
            Some("users_source_id_idx"),
        )
        .unwrap();

        assert_eq!(db.index_state("users_target_id_idx").unwrap(), IndexState::Valid);
        assert_eq!(db.index_state("users_target_id_tmp").unwrap(), IndexState::Absent);
        assert_eq!(db.index_state("users_source_id_idx").unwrap(), IndexState::Absent);

        // The rename lands before the old index is dropped, so the role is
        // never left with zero valid indexes.
        let log = db.index_log();
        let rename_pos = log
            .iter()
            .position(|e| e == "rename users_target_id_tmp -> users_target_id_idx")
            .unwrap();
        let drop_pos = log.iter().position(|e| e == "drop users_source_id_idx").unwrap();
        assert!(rename_pos < drop_pos);
    }

    #[test]
    fn test_swap_when_old_index_holds_final_name() {
        let db = setup();
        let mut backend = db.clone();

        backend
            .create_index(
                &IndexDef::new("users_id_idx", "users", vec!["target_id".into()]),
                false,
            )
            .unwrap();
        build_concurrent(&mut backend, &temp_def()).unwrap();

        swap(&mut backend, "users_target_id_tmp", "users_id_idx", Some("users_id_idx")).unwrap();

        assert_eq!(db.index_state("users_id_idx").unwrap(), IndexState::Valid);
        assert_eq!(db.index_state("users_id_idx_retired").unwrap(), IndexState::Absent);
        assert_eq!(db.index_state("users_target_id_tmp").unwrap(), IndexState::Absent);
    }

    #[test]
    fn test_swap_rejects_invalid_temp() {
        let db = setup();
        db.poison_index(&temp_def());

        let mut backend = db.clone();
        let err = swap(&mut backend, "users_target_id_tmp", "users_id_idx", None).unwrap_err();
        assert!(matches!(err, Error::IndexBuildInvalid { .. }));
    }

    #[test]
    fn test_swap_rerun_finishes_interrupted_old_index_drop() {
        let db = setup();
        let mut backend = db.clone();

        backend
            .create_index(
                &IndexDef::new("users_source_id_idx", "users", vec!["target_id".into()]),
                false,
            )
            .unwrap();
        build_concurrent(&mut backend, &temp_def()).unwrap();
        // Crash window: the rename landed but the old index was never dropped.
        backend
            .rename_index("users_target_id_tmp", "users_target_id_idx")
            .unwrap();

        swap(
            &mut backend,
            "users_target_id_tmp",
            "users_target_id_idx",
            Some("users_source_id_idx"),
        )
        .unwrap();

        assert_eq!(db.index_state("users_target_id_idx").unwrap(), IndexState::Valid);
        assert_eq!(db.index_state("users_source_id_idx").unwrap(), IndexState::Absent);
    }

    #[test]
    fn test_swap_rerun_cleans_parked_leftover() {
        let db = setup();
        let mut backend = db.clone();

        backend
            .create_index(
                &IndexDef::new("users_id_idx", "users", vec!["target_id".into()]),
                false,
            )
            .unwrap();
        build_concurrent(&mut backend, &temp_def()).unwrap();
        // Crash window in the name-collision case: the old index was parked
        // and the rename landed, but the parked index was never dropped.
        backend
            .rename_index("users_id_idx", "users_id_idx_retired")
            .unwrap();
        backend
            .rename_index("users_target_id_tmp", "users_id_idx")
            .unwrap();

        swap(&mut backend, "users_target_id_tmp", "users_id_idx", Some("users_id_idx")).unwrap();

        assert_eq!(db.index_state("users_id_idx").unwrap(), IndexState::Valid);
        assert_eq!(db.index_state("users_id_idx_retired").unwrap(), IndexState::Absent);
    }

    #[test]
    fn test_swap_is_idempotent_after_completion() {
        let db = setup();
        let mut backend = db.clone();

        build_concurrent(&mut backend, &temp_def()).unwrap();
        swap(&mut backend, "users_target_id_tmp", "users_id_idx", None).unwrap();
        // Step re-run after a partial deploy failure.
        swap(&mut backend, "users_target_id_tmp", "users_id_idx", None).unwrap();

        assert_eq!(db.index_state("users_id_idx").unwrap(), IndexState::Valid);
    }
}
