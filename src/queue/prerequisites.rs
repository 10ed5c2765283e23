//! Causal prerequisites between event types.
//!
//! The WMS delivers notifications in no particular order, so an update can
//! arrive before the create it refers to. Each rule below names the event
//! types that must already be `completed` for the same entity before an
//! event may be applied.
//!
//! | Event type | Requires |
//! |------------|----------|
//! | `order.updated`, `order.cancelled`, `order.shipped` | `order.created` |
//! | `shipment.updated` | `shipment.created` |
//! | `inbound.updated`, `inbound.completed` | `inbound.created` |
//! | `article.updated`, `article.deleted` | `article.created` |
//!
//! Rules are checked per `entity_key`; events of other entities never block
//! each other.

use crate::types::{EntityKey, Event, EventAction, EventGroup, EventType};

/// Read access to which `(event type, entity)` pairs have a completed event.
pub trait CompletionIndex {
    fn has_completed(&self, event_type: EventType, entity_key: &EntityKey) -> bool;
}

const ORDER_CREATED: EventType = EventType::new(EventGroup::Order, EventAction::Created);
const SHIPMENT_CREATED: EventType = EventType::new(EventGroup::Shipment, EventAction::Created);
const INBOUND_CREATED: EventType = EventType::new(EventGroup::Inbound, EventAction::Created);
const ARTICLE_CREATED: EventType = EventType::new(EventGroup::Article, EventAction::Created);

/// Returns the event types that must be completed before `event_type`.
pub fn requirements(event_type: EventType) -> &'static [EventType] {
    use EventAction::*;
    use EventGroup::*;

    match (event_type.group, event_type.action) {
        (Order, Updated | Cancelled | Shipped) => &[ORDER_CREATED],
        (Shipment, Updated) => &[SHIPMENT_CREATED],
        (Inbound, Updated | Completed) => &[INBOUND_CREATED],
        (Article, Updated | Deleted) => &[ARTICLE_CREATED],
        _ => &[],
    }
}

/// True if every prerequisite of `event` has completed for its entity.
pub fn is_ready(index: &impl CompletionIndex, event: &Event) -> bool {
    requirements(event.event_type)
        .iter()
        .all(|required| index.has_completed(*required, &event.entity_key))
}
