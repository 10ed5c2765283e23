//! Generation-based compaction.
//!
//! Writing a snapshot and then truncating the log in place is not crash-safe:
//! a crash between the two replays mutations already in the snapshot, and a
//! crash during truncation corrupts the log. Instead:
//!
//! 1. Write `snapshot.<N+1>.json` with `log_generation = N+1`, `log_position = 0`
//! 2. Atomically update `generation` to N+1 (the commit point)
//! 3. Delete `snapshot.<N>.json` and `events.<N>.log`
//!
//! At any crash point, either generation N or N+1 is complete, and
//! [`cleanup_stale_generations`] picks the right one on the next start.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use super::generation::{
    GenerationError, GenerationFile, delete_generation, events_path, list_generation_files,
    read_generation, snapshot_path, write_generation,
};
use super::snapshot::{QueueSnapshot, SnapshotError, save_snapshot_atomic};

/// Errors that can occur during compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Result type for compaction operations.
pub type Result<T> = std::result::Result<T, CompactionError>;

/// Moves the state directory to a new generation whose snapshot is
/// `snapshot`, returning the new generation number.
///
/// `snapshot` is only updated (generation, position, timestamp) once the
/// generation file points at the new snapshot; on error it is left as it was
/// and the old generation stays live. Failing to delete the old generation
/// after that point is only logged, since startup cleanup removes it.
///
/// [`cleanup_stale_generations`] must have run since startup so the
/// generation file agrees with the snapshots on disk.
pub fn compact(state_dir: &Path, snapshot: &mut QueueSnapshot, now: DateTime<Utc>) -> Result<u64> {
    let old_gen = read_generation(state_dir)?;
    let new_gen = old_gen + 1;

    let mut staged = snapshot.clone();
    staged.log_generation = new_gen;
    staged.log_position = 0;
    staged.snapshot_at = now;

    save_snapshot_atomic(&snapshot_path(state_dir, new_gen), &staged)?;
    write_generation(state_dir, new_gen)?;
    if let Err(e) = delete_generation(state_dir, old_gen) {
        warn!(generation = old_gen, error = %e, "Failed to delete superseded generation");
    }

    *snapshot = staged;
    Ok(new_gen)
}

/// Reconciles the state directory after an interrupted compaction.
///
/// Snapshots are written atomically, so the highest-numbered snapshot on disk
/// is complete and newest. If it disagrees with the `generation` file
/// (missing, stale, or from a crash before the commit point), the file is
/// rewritten to match. Files of every other generation and orphaned `.tmp`
/// files are removed. Returns the live generation.
pub fn cleanup_stale_generations(state_dir: &Path) -> Result<u64> {
    let file_gen = read_generation(state_dir)?;
    let files = list_generation_files(state_dir)?;

    let max_snapshot_gen = files
        .iter()
        .filter(|(_, kind)| *kind == GenerationFile::Snapshot)
        .map(|(generation, _)| *generation)
        .max();

    let current_gen = match max_snapshot_gen {
        Some(max_gen) => {
            if max_gen != file_gen {
                write_generation(state_dir, max_gen)?;
            }
            max_gen
        }
        None => file_gen,
    };

    for (generation, _) in files {
        if generation != current_gen {
            delete_generation(state_dir, generation)?;
        }
    }

    cleanup_temp_files(state_dir)?;
    Ok(current_gen)
}

fn cleanup_temp_files(state_dir: &Path) -> io::Result<()> {
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(".tmp") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

/// Returns true once the live generation's log has reached `threshold_bytes`.
pub fn should_compact(state_dir: &Path, generation: u64, threshold_bytes: u64) -> io::Result<bool> {
    match std::fs::metadata(events_path(state_dir, generation)) {
        Ok(metadata) => Ok(metadata.len() >= threshold_bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
