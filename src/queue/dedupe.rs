//! Admission control by delivery id.
//!
//! The WMS retries webhooks it believes were not received, and the
//! reconciliation poller may synthesize an event that was in fact delivered.
//! Both are resolved here: a delivery id is admitted at most once, including
//! for a dedupe window after its event has been purged.

use std::sync::Arc;

use tracing::debug;

use crate::store::{EventStore, Result};
use crate::types::{Event, NewEvent};

/// Outcome of offering an event to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Stored as a new `pending` event.
    Accepted(Event),
    /// The delivery id was already known; nothing was stored.
    Duplicate,
}

impl Admission {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Admission::Duplicate)
    }
}

#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<EventStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<EventStore>) -> Self {
        Deduplicator { store }
    }

    /// Admits `incoming` unless its delivery id has been seen.
    ///
    /// Atomic with respect to concurrent calls: for a given delivery id
    /// exactly one caller receives `Accepted`.
    pub fn admit(&self, incoming: NewEvent) -> Result<Admission> {
        let delivery_id = incoming.delivery_id.clone();
        let event_type = incoming.event_type;
        match self.store.admit(incoming)? {
            Some(event) => {
                debug!(
                    event_id = %event.id,
                    delivery_id = %event.delivery_id,
                    event_type = %event.event_type,
                    entity_key = %event.entity_key,
                    priority = %event.priority,
                    source = ?event.source,
                    "Admitted event"
                );
                Ok(Admission::Accepted(event))
            }
            None => {
                debug!(
                    delivery_id = %delivery_id,
                    %event_type,
                    "Duplicate delivery, dropping"
                );
                Ok(Admission::Duplicate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestStore, new_event};
    use proptest::prelude::*;

    #[test]
    fn first_delivery_accepted_second_dropped() {
        let ts = TestStore::new();
        let dedup = Deduplicator::new(Arc::clone(&ts.store));

        let first = dedup
            .admit(new_event("d-1", "order.created", "O-100"))
            .unwrap();
        let second = dedup
            .admit(new_event("d-1", "order.created", "O-100"))
            .unwrap();

        assert!(matches!(first, Admission::Accepted(_)));
        assert!(second.is_duplicate());
        assert_eq!(ts.store.stats().total, 1);
    }

    proptest! {
        /// Admitting any sequence of deliveries stores one event per distinct id.
        #[test]
        fn admission_is_idempotent(ids in prop::collection::vec(0u8..10, 1..40)) {
            let ts = TestStore::new();
            let dedup = Deduplicator::new(Arc::clone(&ts.store));

            let mut accepted = 0;
            for id in &ids {
                let admission = dedup
                    .admit(new_event(&format!("d-{id}"), "stock.updated", "SKU-1"))
                    .unwrap();
                if !admission.is_duplicate() {
                    accepted += 1;
                }
            }

            let distinct: std::collections::HashSet<_> = ids.iter().collect();
            prop_assert_eq!(accepted, distinct.len());
            prop_assert_eq!(ts.store.stats().total, distinct.len());
        }
    }
}
