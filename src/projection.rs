//! Default handlers: project WMS events into the local record store.
//!
//! Each entity is kept as one JSON record under `<group>:<entity_key>`:
//!
//! | Event | Effect |
//! |-------|--------|
//! | `*.created`, `*.updated` | merge `data` into the record |
//! | `order.cancelled`, `order.shipped`, `inbound.completed`, `shipment.shipped` | set `state`; record must exist |
//! | `stock.*` | set `quantity` from `data.quantity` (integer, required) |
//! | `article.deleted` | remove the record; record must exist |
//!
//! Data problems (a missing record, a missing or non-integer quantity) are
//! permanent errors: retrying cannot fix the payload.

use serde_json::{Map, Value, json};

use crate::queue::{HandlerError, HandlerRegistry, HandlerRegistryBuilder, UnitOfWork};
use crate::types::{Event, EventAction, EventGroup, EventType};

/// Local record key for an event's entity.
pub fn record_key(event: &Event) -> String {
    format!("{}:{}", event.event_type.group, event.entity_key)
}

/// A registry with a projection handler for every known event type.
pub fn default_registry() -> HandlerRegistry {
    register_defaults(HandlerRegistry::builder()).build()
}

/// Adds the projection handlers to `builder`.
pub fn register_defaults(builder: HandlerRegistryBuilder) -> HandlerRegistryBuilder {
    let mut builder = builder;
    for group in EventGroup::ALL {
        for action in EventAction::ALL {
            builder = builder.register(EventType::new(group, action), project);
        }
    }
    builder
}

fn project(event: &Event, work: &mut UnitOfWork) -> Result<(), HandlerError> {
    let key = record_key(event);
    let existing = work.get(&key);

    match (event.event_type.group, event.event_type.action) {
        (EventGroup::Stock, _) => {
            let quantity = event
                .payload
                .get("quantity")
                .and_then(Value::as_i64)
                .ok_or_else(|| HandlerError::permanent("stock event without integer quantity"))?;
            let mut record = as_object(existing);
            record.insert("quantity".to_string(), json!(quantity));
            work.put(key, Value::Object(record));
        }
        (EventGroup::Article, EventAction::Deleted) => {
            if existing.is_none() {
                return Err(HandlerError::permanent(format!("no local record for {}", key)));
            }
            work.delete(key);
        }
        (_, EventAction::Created | EventAction::Updated) => {
            let mut record = as_object(existing);
            if let Value::Object(data) = &event.payload {
                record.extend(data.clone());
            }
            record.insert("state".to_string(), json!(event.event_type.action.as_str()));
            work.put(key, Value::Object(record));
        }
        (_, action) => {
            let Some(existing) = existing else {
                return Err(HandlerError::permanent(format!("no local record for {}", key)));
            };
            let mut record = as_object(Some(existing));
            record.insert("state".to_string(), json!(action.as_str()));
            work.put(key, Value::Object(record));
        }
    }
    Ok(())
}

fn as_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
