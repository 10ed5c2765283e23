//! Durable storage for the event queue.
//!
//! The store keeps its table in memory and makes it durable with a
//! write-ahead mutation log plus periodic snapshots.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   generation        # current generation number (single integer)
//!   snapshot.N.json   # full queue state for generation N
//!   events.N.log      # mutations since that snapshot (JSON Lines)
//! ```
//!
//! # Recovery
//!
//! On startup:
//! 1. `cleanup_stale_generations` settles on generation N and removes the rest
//! 2. Load `snapshot.N.json` (an empty state if it does not exist yet)
//! 3. Replay `events.N.log` from the snapshot's `log_position`
//!
//! # Crash Safety
//!
//! - Mutation log: partial trailing lines are truncated on replay
//! - Snapshots and the generation file: temp file + rename + directory fsync
//! - Compaction: the old generation is deleted only after the new one is live

pub mod atomic;
pub mod compaction;
pub mod generation;
pub mod log;
pub mod mutation;
pub mod snapshot;

pub use compaction::{CompactionError, cleanup_stale_generations, compact, should_compact};
pub use generation::{GenerationError, events_path, read_generation, snapshot_path};
pub use log::{EventLogError, MutationLog, Replay};
pub use mutation::{LogRecord, StoreMutation};
pub use snapshot::{
    QueueSnapshot, SCHEMA_VERSION, SnapshotError, load_snapshot, save_snapshot_atomic,
    try_load_snapshot,
};
