//! Records written to the store's mutation log.
//!
//! Every change to the event table is appended here before it is applied in
//! memory, so replaying the log over the last snapshot reproduces the table
//! exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryId, Event, EventGroup, EventId};

/// One line of the mutation log.
///
/// The mutation is flattened into the record:
/// ```json
/// {"seq":7,"ts":"2024-01-15T10:00:00Z","type":"watermark","group":"stock","at":"2024-01-15T09:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonic sequence number, preserved across generations.
    pub seq: u64,

    /// When the mutation was recorded.
    pub ts: DateTime<Utc>,

    #[serde(flatten)]
    pub mutation: StoreMutation,
}

impl LogRecord {
    /// Returns true if this record must reach disk before the caller proceeds.
    pub fn is_critical(&self) -> bool {
        self.mutation.is_critical()
    }
}

/// A change to the durable queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreMutation {
    /// Insert or replace an event record in full.
    ///
    /// Admission and every status transition are written this way; the last
    /// upsert for an id wins on replay.
    Upsert { event: Event },

    /// Drop an event after its retention window. The delivery id is kept as a
    /// tombstone stamped with the record's `ts`.
    Purge {
        id: EventId,
        delivery_id: DeliveryId,
    },

    /// Record the last successful reconciliation run for a category.
    Watermark {
        group: EventGroup,
        at: DateTime<Utc>,
    },

    /// Forget delivery tombstones recorded before `before`.
    TombstonesPruned { before: DateTime<Utc> },
}

impl StoreMutation {
    /// Event table changes are critical: an acknowledged webhook or a
    /// completed handler must survive a crash. Watermarks and tombstone
    /// pruning only cost some repeated work if lost, so they ride along with
    /// the next critical sync.
    pub fn is_critical(&self) -> bool {
        match self {
            StoreMutation::Upsert { .. } | StoreMutation::Purge { .. } => true,
            StoreMutation::Watermark { .. } | StoreMutation::TombstonesPruned { .. } => false,
        }
    }
}
