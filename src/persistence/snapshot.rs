//! Snapshots of the full queue state.
//!
//! A snapshot lets the store recover without replaying the log from the very
//! first mutation. It is stored as `snapshot.<gen>.json` and written with
//! [`write_atomic`], so a reader sees either the previous snapshot or the new
//! one.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::atomic::write_atomic;
use crate::types::{DeliveryId, EntityKey, Event, EventGroup, EventType};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Persisted queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,

    pub snapshot_at: DateTime<Utc>,

    /// The generation this snapshot belongs to (matches the filename suffix).
    pub log_generation: u64,

    /// Byte offset in `events.<log_generation>.log` covered by this snapshot.
    pub log_position: u64,

    /// Next log sequence number; globally monotonic across generations.
    pub next_seq: u64,

    /// Every retained event, in id order.
    pub events: Vec<Event>,

    /// Delivery ids of purged events, with the time they were purged.
    #[serde(default)]
    pub tombstones: HashMap<DeliveryId, DateTime<Utc>>,

    /// Last successful reconciliation run per category.
    #[serde(default)]
    pub watermarks: HashMap<EventGroup, DateTime<Utc>>,

    /// `(event type, entity)` pairs whose completed events have been purged.
    /// Prerequisites stay satisfied after the event itself is gone.
    #[serde(default)]
    pub retired_completions: Vec<(EventType, EntityKey)>,
}

impl QueueSnapshot {
    /// Creates an empty snapshot for a fresh state directory.
    pub fn empty(now: DateTime<Utc>) -> Self {
        QueueSnapshot {
            schema_version: SCHEMA_VERSION,
            snapshot_at: now,
            log_generation: 0,
            log_position: 0,
            next_seq: 0,
            events: Vec::new(),
            tombstones: HashMap::new(),
            watermarks: HashMap::new(),
            retired_completions: Vec::new(),
        }
    }
}

/// Saves a snapshot atomically, creating parent directories as needed.
pub fn save_snapshot_atomic(path: &Path, snapshot: &QueueSnapshot) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Loads a snapshot, rejecting incompatible schema versions.
pub fn load_snapshot(path: &Path) -> Result<QueueSnapshot> {
    let bytes = std::fs::read(path)?;
    let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)?;

    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }

    Ok(snapshot)
}

/// Loads a snapshot, returning `None` if the file doesn't exist.
pub fn try_load_snapshot(path: &Path) -> Result<Option<QueueSnapshot>> {
    match load_snapshot(path) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(SnapshotError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
