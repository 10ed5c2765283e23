//! The durable event store.
//!
//! `EventStore` owns the in-memory [`QueueTable`] and the mutation log behind
//! a single mutex. Every operation checks its precondition, appends the
//! resulting mutation to the log, and only then applies it to the table, so
//! an acknowledged change is never lost and a failed write changes nothing.
//!
//! The lock covers table access and log I/O only. Handlers run outside it,
//! between a [`EventStore::try_claim`] and the matching completion call.
//!
//! # Status Transitions
//!
//! | Operation | From | To |
//! |-----------|------|----|
//! | `admit` | (absent) | `pending` |
//! | `try_claim` | `pending` | `processing`, `attempts + 1` |
//! | `complete` | `processing` | `completed` |
//! | `reschedule` | `processing` | `pending` with `next_attempt_at` |
//! | `fail` | `processing`, `pending` | `failed` |
//! | `defer` | `pending` | `deferred` |
//! | `promote_ready` | `deferred` | `pending` |
//! | `expire_deferred` | `deferred` | `failed` |
//! | `retry_failed` | `failed` | `pending`, `attempts = 0` |

pub mod table;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::persistence::{
    CompactionError, EventLogError, MutationLog, QueueSnapshot, SnapshotError, StoreMutation,
    cleanup_stale_generations, compact, events_path, snapshot_path, try_load_snapshot,
};
use crate::queue::prerequisites;
use crate::types::{
    Clock, DeliveryId, EntityKey, Event, EventGroup, EventId, EventStatus, EventType, NewEvent,
};

pub use table::{QueueStats, QueueTable};

/// Errors returned by the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("mutation log error: {0}")]
    Log(#[from] EventLogError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("event not found: {0}")]
    NotFound(EventId),

    #[error("event {id} is {status}, cannot {operation}")]
    InvalidTransition {
        id: EventId,
        status: EventStatus,
        operation: &'static str,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Tunables for the store's on-disk footprint.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Compact once the live log reaches this many bytes.
    pub compact_threshold_bytes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            compact_threshold_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Retention windows applied by [`EventStore::purge`].
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub completed: Duration,
    pub failed: Duration,
    pub dedupe_ttl: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            completed: Duration::days(7),
            failed: Duration::days(30),
            dedupe_ttl: Duration::days(30),
        }
    }
}

/// What a purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub completed: usize,
    pub failed: usize,
    pub tombstones_pruned: bool,
}

struct Inner {
    table: QueueTable,
    log: MutationLog,
    generation: u64,
}

pub struct EventStore {
    inner: Mutex<Inner>,
    state_dir: PathBuf,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl EventStore {
    /// Opens the store in `state_dir`, recovering from any previous crash.
    ///
    /// Events a crashed process left in `processing` are returned to
    /// `pending` with their attempt count unchanged.
    pub fn open(
        state_dir: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&state_dir)?;

        let generation = cleanup_stale_generations(&state_dir)?;
        let snapshot = try_load_snapshot(&snapshot_path(&state_dir, generation))?
            .unwrap_or_else(|| QueueSnapshot::empty(clock.now()));

        let log_path = events_path(&state_dir, generation);
        let replay = MutationLog::replay_from(&log_path, snapshot.log_position)?;
        let next_seq = replay
            .next_seq
            .map_or(snapshot.next_seq, |seq| seq.max(snapshot.next_seq));

        let mut table = QueueTable::from_snapshot(snapshot);
        for record in &replay.records {
            table.apply(&record.mutation, record.ts);
        }
        let log = MutationLog::open(&log_path, next_seq)?;

        info!(
            state_dir = %state_dir.display(),
            generation,
            events = table.len(),
            replayed = replay.records.len(),
            "Opened event store"
        );

        let store = EventStore {
            inner: Mutex::new(Inner {
                table,
                log,
                generation,
            }),
            state_dir,
            clock,
            options,
        };
        store.recover_interrupted()?;
        Ok(store)
    }

    fn recover_interrupted(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let stuck: Vec<Event> = inner
            .table
            .with_status(EventStatus::Processing)
            .cloned()
            .collect();

        for mut event in stuck {
            warn!(
                event_id = %event.id,
                delivery_id = %event.delivery_id,
                attempts = event.attempts,
                "Returning interrupted event to pending"
            );
            event.status = EventStatus::Pending;
            event.updated_at = now;
            self.commit(&mut inner, StoreMutation::Upsert { event })?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Logs `mutation`, applies it, and compacts if the log has grown past
    /// the threshold.
    ///
    /// Once the append succeeds the mutation is durable, so a compaction
    /// failure is logged and retried on a later commit rather than returned.
    fn commit(&self, inner: &mut Inner, mutation: StoreMutation) -> Result<()> {
        let record = inner.log.append(mutation, self.clock.now())?;
        inner.table.apply(&record.mutation, record.ts);

        let due = match inner.log.position() {
            Ok(position) => position >= self.options.compact_threshold_bytes,
            Err(e) => {
                warn!(error = %e, "Failed to read mutation log position");
                false
            }
        };
        if due {
            if let Err(e) = self.compact_locked(inner) {
                error!(
                    generation = inner.generation,
                    error = %e,
                    "Compaction failed; keeping current generation"
                );
            }
        }
        Ok(())
    }

    /// Moves to the next generation. On error the current log and generation
    /// stay in use.
    fn compact_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.log.sync()?;
        let mut snapshot = inner.table.to_snapshot(self.clock.now());
        snapshot.log_generation = inner.generation;
        snapshot.next_seq = inner.log.next_seq();

        // Open the next log before the commit point so nothing can fail after it.
        let next_log = MutationLog::open(
            events_path(&self.state_dir, inner.generation + 1),
            snapshot.next_seq,
        )?;
        let generation = compact(&self.state_dir, &mut snapshot, self.clock.now())?;
        inner.log = if generation == inner.generation + 1 {
            next_log
        } else {
            MutationLog::open(events_path(&self.state_dir, generation), snapshot.next_seq)?
        };
        inner.generation = generation;

        debug!(generation, events = inner.table.len(), "Compacted event store");
        Ok(())
    }

    /// Writes a fresh snapshot generation now, regardless of log size.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.lock();
        self.compact_locked(&mut inner)
    }

    fn transition(
        &self,
        id: EventId,
        operation: &'static str,
        allowed: &[EventStatus],
        update: impl FnOnce(&mut Event),
    ) -> Result<Event> {
        let mut inner = self.lock();
        let mut event = inner
            .table
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        if !allowed.contains(&event.status) {
            return Err(StoreError::InvalidTransition {
                id,
                status: event.status,
                operation,
            });
        }
        update(&mut event);
        event.updated_at = self.clock.now();
        self.commit(
            &mut inner,
            StoreMutation::Upsert {
                event: event.clone(),
            },
        )?;
        Ok(event)
    }

    // ─── Admission ───

    /// Inserts `incoming` as a new `pending` event unless its delivery id is
    /// already known. Returns `None` for a duplicate.
    ///
    /// The check and the insert happen under one lock, so of any number of
    /// concurrent calls with the same delivery id exactly one succeeds.
    pub fn admit(&self, incoming: NewEvent) -> Result<Option<Event>> {
        let mut inner = self.lock();
        if inner.table.knows_delivery(&incoming.delivery_id) {
            return Ok(None);
        }
        let event = Event::admitted(incoming, self.clock.now());
        self.commit(
            &mut inner,
            StoreMutation::Upsert {
                event: event.clone(),
            },
        )?;
        Ok(Some(event))
    }

    // ─── Dispatch transitions ───

    /// Claims a `pending` event for processing and counts the attempt.
    ///
    /// Returns `None` if the event is missing or not `pending`, which is how
    /// racing dispatch paths learn that someone else got there first.
    pub fn try_claim(&self, id: EventId) -> Result<Option<Event>> {
        let mut inner = self.lock();
        let Some(mut event) = inner.table.get(&id).cloned() else {
            return Ok(None);
        };
        if event.status != EventStatus::Pending {
            return Ok(None);
        }
        event.status = EventStatus::Processing;
        event.attempts += 1;
        event.updated_at = self.clock.now();
        self.commit(
            &mut inner,
            StoreMutation::Upsert {
                event: event.clone(),
            },
        )?;
        Ok(Some(event))
    }

    pub fn complete(&self, id: EventId) -> Result<Event> {
        self.transition(id, "complete", &[EventStatus::Processing], |event| {
            event.status = EventStatus::Completed;
            event.next_attempt_at = None;
        })
    }

    /// Returns a failed attempt to `pending`, not before `next_attempt_at`.
    pub fn reschedule(
        &self,
        id: EventId,
        next_attempt_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<Event> {
        let error = error.into();
        self.transition(id, "reschedule", &[EventStatus::Processing], |event| {
            event.status = EventStatus::Pending;
            event.next_attempt_at = Some(next_attempt_at);
            event.error_message = Some(error);
        })
    }

    pub fn fail(&self, id: EventId, error: impl Into<String>) -> Result<Event> {
        let error = error.into();
        self.transition(
            id,
            "fail",
            &[EventStatus::Processing, EventStatus::Pending],
            |event| {
                event.status = EventStatus::Failed;
                event.next_attempt_at = None;
                event.error_message = Some(error);
            },
        )
    }

    pub fn defer(&self, id: EventId) -> Result<Event> {
        self.transition(id, "defer", &[EventStatus::Pending], |event| {
            event.status = EventStatus::Deferred;
        })
    }

    // ─── Periodic maintenance ───

    /// Moves every `deferred` event whose prerequisites are now complete back
    /// to `pending`. Returns the promoted ids.
    pub fn promote_ready(&self) -> Result<Vec<EventId>> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let ready: Vec<Event> = inner
            .table
            .with_status(EventStatus::Deferred)
            .filter(|e| prerequisites::is_ready(&inner.table, e))
            .cloned()
            .collect();

        let mut promoted = Vec::with_capacity(ready.len());
        for mut event in ready {
            event.status = EventStatus::Pending;
            event.updated_at = now;
            promoted.push(event.id);
            self.commit(&mut inner, StoreMutation::Upsert { event })?;
        }
        Ok(promoted)
    }

    /// Fails `deferred` events created more than `timeout` ago.
    pub fn expire_deferred(&self, timeout: Duration) -> Result<Vec<Event>> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let cutoff = now - timeout;
        let stale: Vec<Event> = inner
            .table
            .with_status(EventStatus::Deferred)
            .filter(|e| e.created_at <= cutoff)
            .cloned()
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for mut event in stale {
            event.status = EventStatus::Failed;
            event.error_message = Some("prerequisite timeout".to_string());
            event.updated_at = now;
            self.commit(
                &mut inner,
                StoreMutation::Upsert {
                    event: event.clone(),
                },
            )?;
            expired.push(event);
        }
        Ok(expired)
    }

    /// Ready, due `pending` events, most urgent first.
    pub fn select_batch(&self, max: usize) -> Vec<Event> {
        self.lock().table.ready_batch(self.clock.now(), max)
    }

    /// Drops terminal events past their retention window and prunes expired
    /// delivery tombstones.
    pub fn purge(&self, retention: Retention) -> Result<PurgeReport> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let completed_cutoff = now - retention.completed;
        let failed_cutoff = now - retention.failed;

        let expired: Vec<(EventId, DeliveryId, EventStatus)> = inner
            .table
            .iter()
            .filter(|e| match e.status {
                EventStatus::Completed => e.updated_at < completed_cutoff,
                EventStatus::Failed => e.updated_at < failed_cutoff,
                _ => false,
            })
            .map(|e| (e.id, e.delivery_id.clone(), e.status))
            .collect();

        let mut report = PurgeReport::default();
        for (id, delivery_id, status) in expired {
            match status {
                EventStatus::Completed => report.completed += 1,
                _ => report.failed += 1,
            }
            self.commit(&mut inner, StoreMutation::Purge { id, delivery_id })?;
        }

        let tombstone_cutoff = now - retention.dedupe_ttl;
        if inner.table.has_tombstones_before(tombstone_cutoff) {
            self.commit(
                &mut inner,
                StoreMutation::TombstonesPruned {
                    before: tombstone_cutoff,
                },
            )?;
            report.tombstones_pruned = true;
        }
        Ok(report)
    }

    // ─── Operational surface ───

    /// Resets `failed` events to `pending` with a fresh attempt budget.
    ///
    /// With `ids = None` every failed event is retried; otherwise only the
    /// listed ones that are currently failed. Returns the number reset.
    pub fn retry_failed(&self, ids: Option<&[EventId]>) -> Result<usize> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let targets: Vec<Event> = inner
            .table
            .with_status(EventStatus::Failed)
            .filter(|e| ids.is_none_or(|ids| ids.contains(&e.id)))
            .cloned()
            .collect();

        let count = targets.len();
        for mut event in targets {
            event.status = EventStatus::Pending;
            event.attempts = 0;
            event.next_attempt_at = None;
            event.error_message = None;
            event.updated_at = now;
            self.commit(&mut inner, StoreMutation::Upsert { event })?;
        }
        Ok(count)
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().table.stats(self.clock.now())
    }

    pub fn recent_activity(&self, limit: usize) -> Vec<Event> {
        self.lock().table.recent(limit)
    }

    pub fn get(&self, id: EventId) -> Option<Event> {
        self.lock().table.get(&id).cloned()
    }

    pub fn get_by_delivery(&self, delivery_id: &DeliveryId) -> Option<Event> {
        self.lock().table.by_delivery(delivery_id).cloned()
    }

    /// Re-evaluates prerequisites for `event` against the current table.
    pub fn is_ready(&self, event: &Event) -> bool {
        prerequisites::is_ready(&self.lock().table, event)
    }

    // ─── Reconciliation support ───

    /// True if a non-failed event of this type and entity was received at or
    /// after `since`.
    /// True if an event of this type and entity received at or after
    /// `since` has completed.
    pub fn has_completed_since(
        &self,
        event_type: EventType,
        entity_key: &EntityKey,
        since: DateTime<Utc>,
    ) -> bool {
        self.lock()
            .table
            .has_completed_since(event_type, entity_key, since)
    }

    pub fn watermark(&self, group: EventGroup) -> Option<DateTime<Utc>> {
        self.lock().table.watermark(group)
    }

    pub fn set_watermark(&self, group: EventGroup, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        self.commit(&mut inner, StoreMutation::Watermark { group, at })?;
        inner.log.sync()?;
        Ok(())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
