//! Generation numbering for the state directory.
//!
//! The `generation` file holds a single integer N naming the live pair
//! `snapshot.N.json` + `events.N.log`. Compaction moves the store to N+1 and
//! only then deletes generation N; see `compaction.rs`.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::atomic::{fsync_dir, remove_if_exists, write_atomic};

/// Errors that can occur during generation file operations.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid generation number: {0:?}")]
    InvalidNumber(String),
}

/// Result type for generation file operations.
pub type Result<T> = std::result::Result<T, GenerationError>;

/// Which half of a generation a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GenerationFile {
    Snapshot,
    Events,
}

fn generation_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("generation")
}

/// Reads the current generation, `0` for a fresh (or empty) file.
pub fn read_generation(state_dir: &Path) -> Result<u64> {
    let content = match std::fs::read_to_string(generation_file_path(state_dir)) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let first = content.lines().next().unwrap_or("").trim();
    if first.is_empty() {
        return Ok(0);
    }
    first
        .parse()
        .map_err(|_| GenerationError::InvalidNumber(first.to_string()))
}

/// Writes the generation number atomically. This is the commit point of a
/// compaction.
pub fn write_generation(state_dir: &Path, generation: u64) -> Result<()> {
    write_atomic(
        &generation_file_path(state_dir),
        format!("{}\n", generation).as_bytes(),
    )?;
    Ok(())
}

pub fn snapshot_path(state_dir: &Path, generation: u64) -> PathBuf {
    state_dir.join(format!("snapshot.{}.json", generation))
}

pub fn events_path(state_dir: &Path, generation: u64) -> PathBuf {
    state_dir.join(format!("events.{}.log", generation))
}

/// Deletes both files of a generation. Missing files or a missing directory
/// are not errors.
pub fn delete_generation(state_dir: &Path, generation: u64) -> Result<()> {
    remove_if_exists(&snapshot_path(state_dir, generation))?;
    remove_if_exists(&events_path(state_dir, generation))?;

    match fsync_dir(state_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Lists generation files present in the state directory, sorted.
pub fn list_generation_files(state_dir: &Path) -> io::Result<Vec<(u64, GenerationFile)>> {
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let name = entry?.file_name();
        let name = name.to_string_lossy();

        if let Some(generation) = name
            .strip_prefix("snapshot.")
            .and_then(|s| s.strip_suffix(".json"))
            .and_then(|s| s.parse().ok())
        {
            files.push((generation, GenerationFile::Snapshot));
        } else if let Some(generation) = name
            .strip_prefix("events.")
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| s.parse().ok())
        {
            files.push((generation, GenerationFile::Events));
        }
    }

    files.sort();
    Ok(files)
}
