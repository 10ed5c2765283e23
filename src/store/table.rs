//! The in-memory event table.
//!
//! `QueueTable` is pure state: it applies [`StoreMutation`]s and answers
//! queries. Durability and transition preconditions live in
//! [`EventStore`](super::EventStore); this module is shared between live
//! operation and log replay so both produce the same table.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::persistence::{QueueSnapshot, SCHEMA_VERSION, StoreMutation};
use crate::queue::prerequisites::CompletionIndex;
use crate::types::{DeliveryId, EntityKey, Event, EventGroup, EventId, EventStatus, EventType};

/// Event counts by status, as reported on the operational surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub deferred: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending events whose `next_attempt_at` is in the future.
    pub waiting_retry: usize,
    pub total: usize,
}

#[derive(Debug, Default, Clone)]
pub struct QueueTable {
    events: HashMap<EventId, Event>,
    by_delivery: HashMap<DeliveryId, EventId>,
    completed: HashMap<(EventType, EntityKey), usize>,
    /// Completions whose events were purged; never dropped.
    retired: HashSet<(EventType, EntityKey)>,
    tombstones: HashMap<DeliveryId, DateTime<Utc>>,
    watermarks: HashMap<EventGroup, DateTime<Utc>>,
}

impl QueueTable {
    pub fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        let mut table = QueueTable {
            tombstones: snapshot.tombstones,
            watermarks: snapshot.watermarks,
            retired: snapshot.retired_completions.into_iter().collect(),
            ..QueueTable::default()
        };
        for event in snapshot.events {
            table.upsert(event);
        }
        table
    }

    /// Builds a snapshot of the table. Log bookkeeping fields are filled in by
    /// the caller.
    pub fn to_snapshot(&self, now: DateTime<Utc>) -> QueueSnapshot {
        let mut events: Vec<Event> = self.events.values().cloned().collect();
        events.sort_by_key(|e| e.id);
        let mut retired_completions: Vec<(EventType, EntityKey)> =
            self.retired.iter().cloned().collect();
        retired_completions.sort();
        QueueSnapshot {
            schema_version: SCHEMA_VERSION,
            snapshot_at: now,
            log_generation: 0,
            log_position: 0,
            next_seq: 0,
            events,
            tombstones: self.tombstones.clone(),
            watermarks: self.watermarks.clone(),
            retired_completions,
        }
    }

    /// Applies one mutation. `ts` is the time the mutation was recorded.
    pub fn apply(&mut self, mutation: &StoreMutation, ts: DateTime<Utc>) {
        match mutation {
            StoreMutation::Upsert { event } => self.upsert(event.clone()),
            StoreMutation::Purge { id, delivery_id } => {
                if let Some(event) = self.events.remove(id) {
                    self.unindex_completed(&event);
                    if event.status == EventStatus::Completed {
                        self.retired.insert((event.event_type, event.entity_key));
                    }
                }
                self.by_delivery.remove(delivery_id);
                self.tombstones.insert(delivery_id.clone(), ts);
            }
            StoreMutation::Watermark { group, at } => {
                self.watermarks.insert(*group, *at);
            }
            StoreMutation::TombstonesPruned { before } => {
                self.tombstones.retain(|_, purged_at| *purged_at >= *before);
            }
        }
    }

    fn upsert(&mut self, event: Event) {
        if let Some(previous) = self.events.get(&event.id).cloned() {
            self.unindex_completed(&previous);
        }
        if event.status == EventStatus::Completed {
            *self
                .completed
                .entry((event.event_type, event.entity_key.clone()))
                .or_default() += 1;
        }
        self.by_delivery.insert(event.delivery_id.clone(), event.id);
        self.events.insert(event.id, event);
    }

    fn unindex_completed(&mut self, event: &Event) {
        if event.status != EventStatus::Completed {
            return;
        }
        let key = (event.event_type, event.entity_key.clone());
        if let Some(count) = self.completed.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.completed.remove(&key);
            }
        }
    }

    pub fn get(&self, id: &EventId) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn by_delivery(&self, delivery_id: &DeliveryId) -> Option<&Event> {
        self.by_delivery
            .get(delivery_id)
            .and_then(|id| self.events.get(id))
    }

    /// True if the delivery id belongs to a stored event or a purged one
    /// still inside the dedupe window.
    pub fn knows_delivery(&self, delivery_id: &DeliveryId) -> bool {
        self.by_delivery.contains_key(delivery_id) || self.tombstones.contains_key(delivery_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    pub fn with_status(&self, status: EventStatus) -> impl Iterator<Item = &Event> {
        self.events.values().filter(move |e| e.status == status)
    }

    /// Pending events that are due at `now`, most urgent first, at most `max`.
    ///
    /// Order is `(priority, created_at, id)`.
    pub fn ready_batch(&self, now: DateTime<Utc>, max: usize) -> Vec<Event> {
        let mut ready: Vec<&Event> = self
            .with_status(EventStatus::Pending)
            .filter(|e| e.is_due(now))
            .collect();
        ready.sort_by_key(|e| (e.priority, e.created_at, e.id));
        ready.into_iter().take(max).cloned().collect()
    }

    /// True if an event of `event_type` for `entity_key` that has not failed
    /// was received at or after `since`.
    pub fn has_completed_since(
        &self,
        event_type: EventType,
        entity_key: &EntityKey,
        since: DateTime<Utc>,
    ) -> bool {
        self.events.values().any(|e| {
            e.event_type == event_type
                && e.entity_key == *entity_key
                && e.status == EventStatus::Completed
                && e.created_at >= since
        })
    }

    pub fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        let mut stats = QueueStats {
            total: self.events.len(),
            ..QueueStats::default()
        };
        for event in self.events.values() {
            match event.status {
                EventStatus::Pending => {
                    stats.pending += 1;
                    if !event.is_due(now) {
                        stats.waiting_retry += 1;
                    }
                }
                EventStatus::Processing => stats.processing += 1,
                EventStatus::Deferred => stats.deferred += 1,
                EventStatus::Completed => stats.completed += 1,
                EventStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Most recently touched events first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let mut events: Vec<&Event> = self.events.values().collect();
        events.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        events.into_iter().take(limit).cloned().collect()
    }

    pub fn watermark(&self, group: EventGroup) -> Option<DateTime<Utc>> {
        self.watermarks.get(&group).copied()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn has_tombstones_before(&self, before: DateTime<Utc>) -> bool {
        self.tombstones.values().any(|at| *at < before)
    }
}

impl CompletionIndex for QueueTable {
    fn has_completed(&self, event_type: EventType, entity_key: &EntityKey) -> bool {
        let key = (event_type, entity_key.clone());
        self.completed.contains_key(&key) || self.retired.contains(&key)
    }
}
