//! Shared test utilities and arbitrary generators for property-based testing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use crate::store::{EventStore, StoreOptions};
use crate::types::{
    Clock, Event, EventAction, EventGroup, EventId, EventType, ManualClock, NewEvent,
};

/// A fixed instant plus `secs` seconds, so tests never depend on wall time.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0)
        .expect("valid timestamp")
        + Duration::seconds(secs)
}

/// Parses a dotted event type.
pub fn t(s: &str) -> EventType {
    s.parse().expect("valid event type")
}

pub fn new_event(delivery_id: &str, event_type: &str, entity_key: &str) -> NewEvent {
    NewEvent::new(
        delivery_id,
        t(event_type),
        entity_key,
        json!({"entity": entity_key}),
    )
}

/// A pending event with a unique delivery id.
pub fn event_of(event_type: EventType, entity_key: &str, created_at: DateTime<Utc>) -> Event {
    let delivery = format!("d-{}", EventId::generate());
    Event::admitted(
        NewEvent::new(delivery, event_type, entity_key, json!({})),
        created_at,
    )
}

pub fn arb_event_type() -> impl Strategy<Value = EventType> {
    (
        prop::sample::select(EventGroup::ALL.to_vec()),
        prop::sample::select(EventAction::ALL.to_vec()),
    )
        .prop_map(|(g, a)| EventType::new(g, a))
}

/// Pending events created within the first few hours after [`at(0)`].
pub fn arb_event() -> impl Strategy<Value = Event> {
    (arb_event_type(), "[A-Z]-[0-9]{1,3}", 0i64..10_000)
        .prop_map(|(event_type, entity, secs)| event_of(event_type, &entity, at(secs)))
}

/// An event store in a temporary directory driven by a manual clock.
pub struct TestStore {
    pub dir: Arc<TempDir>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<EventStore>,
    options: StoreOptions,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    pub fn with_options(options: StoreOptions) -> Self {
        let dir = Arc::new(tempfile::tempdir().expect("tempdir"));
        let clock = Arc::new(ManualClock::new(at(0)));
        let store = EventStore::open(dir.path(), clock.clone(), options.clone())
            .map(Arc::new)
            .expect("open store");
        TestStore {
            dir,
            clock,
            store,
            options,
        }
    }

    /// Opens a second store over the same directory, as a restart would.
    pub fn reopen(&self) -> TestStore {
        let clock: Arc<dyn Clock> = self.clock.clone();
        TestStore {
            dir: Arc::clone(&self.dir),
            clock: Arc::clone(&self.clock),
            store: EventStore::open(self.dir.path(), clock, self.options.clone())
                .map(Arc::new)
                .expect("reopen store"),
            options: self.options.clone(),
        }
    }

    /// Admits a fresh event and returns it.
    pub fn admit(&self, delivery_id: &str, event_type: &str, entity_key: &str) -> Event {
        self.store
            .admit(new_event(delivery_id, event_type, entity_key))
            .expect("admit")
            .expect("not a duplicate")
    }
}
