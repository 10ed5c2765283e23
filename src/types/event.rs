//! The queued event record and its typed classification.
//!
//! Event types are a closed `(group, action)` pair rather than free-form
//! strings, so handler lookup and prerequisite rules are resolved against the
//! same enum the ingestion parser produces.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{DeliveryId, EntityKey, EventId};
use super::priority::EventPriority;

/// The business area an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventGroup {
    Order,
    Stock,
    Shipment,
    Inbound,
    Article,
}

impl EventGroup {
    pub const ALL: [EventGroup; 5] = [
        EventGroup::Order,
        EventGroup::Stock,
        EventGroup::Shipment,
        EventGroup::Inbound,
        EventGroup::Article,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventGroup::Order => "order",
            EventGroup::Stock => "stock",
            EventGroup::Shipment => "shipment",
            EventGroup::Inbound => "inbound",
            EventGroup::Article => "article",
        }
    }
}

impl fmt::Display for EventGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventGroup {
    type Err = InvalidEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventGroup::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| InvalidEventType(s.to_string()))
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    Updated,
    Cancelled,
    Shipped,
    Completed,
    Deleted,
}

impl EventAction {
    pub const ALL: [EventAction; 6] = [
        EventAction::Created,
        EventAction::Updated,
        EventAction::Cancelled,
        EventAction::Shipped,
        EventAction::Completed,
        EventAction::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Cancelled => "cancelled",
            EventAction::Shipped => "shipped",
            EventAction::Completed => "completed",
            EventAction::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventAction {
    type Err = InvalidEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| InvalidEventType(s.to_string()))
    }
}

/// Error returned when an event type string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0}")]
pub struct InvalidEventType(pub String);

/// An event type: a `(group, action)` pair such as `order.created`.
///
/// Serialized as the dotted string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EventType {
    pub group: EventGroup,
    pub action: EventAction,
}

impl EventType {
    pub const fn new(group: EventGroup, action: EventAction) -> Self {
        EventType { group, action }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.action)
    }
}

impl FromStr for EventType {
    type Err = InvalidEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, action) = s
            .split_once('.')
            .ok_or_else(|| InvalidEventType(s.to_string()))?;
        let group = group
            .parse()
            .map_err(|_| InvalidEventType(s.to_string()))?;
        let action = action
            .parse()
            .map_err(|_| InvalidEventType(s.to_string()))?;
        Ok(EventType { group, action })
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for EventType {
    type Error = InvalidEventType;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Processing status of a queued event.
///
/// ```text
/// pending ──(dispatch ok)──────────────► completed
///    │  ▲
///    │  └──(prerequisites satisfied)──── deferred ──(timeout)──► failed
///    ├──(not ready)──────────────────────► deferred
///    ├──(error, attempts < max)──► pending (next_attempt_at set)
///    └──(error, attempts ≥ max / permanent / no handler)──► failed
/// failed ──(manual retry)──► pending
/// ```
///
/// `processing` is held only for the duration of a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Deferred,
    Failed,
}

impl EventStatus {
    /// Returns true for states that are never left automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Deferred => "deferred",
            EventStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the event entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Delivered by the WMS as a webhook.
    #[default]
    Webhook,
    /// Synthesized by the reconciliation poller.
    Reconciliation,
}

/// An incoming event before it has been admitted to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub delivery_id: DeliveryId,
    pub event_type: EventType,
    pub entity_key: EntityKey,
    pub payload: serde_json::Value,
    pub source: EventSource,
}

impl NewEvent {
    pub fn new(
        delivery_id: impl Into<DeliveryId>,
        event_type: EventType,
        entity_key: impl Into<EntityKey>,
        payload: serde_json::Value,
    ) -> Self {
        NewEvent {
            delivery_id: delivery_id.into(),
            event_type,
            entity_key: entity_key.into(),
            payload,
            source: EventSource::Webhook,
        }
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }
}

/// A stored event: the unit of work of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub delivery_id: DeliveryId,
    pub event_type: EventType,
    pub entity_key: EntityKey,
    pub payload: serde_json::Value,
    pub priority: EventPriority,
    pub status: EventStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub source: EventSource,
}

impl Event {
    /// Materializes a newly admitted event in the `pending` state.
    pub fn admitted(incoming: NewEvent, now: DateTime<Utc>) -> Self {
        Event {
            id: EventId::generate(),
            priority: EventPriority::classify(&incoming.event_type),
            delivery_id: incoming.delivery_id,
            event_type: incoming.event_type,
            entity_key: incoming.entity_key,
            payload: incoming.payload,
            status: EventStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
            error_message: None,
            source: incoming.source,
        }
    }

    /// Returns true if the event may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn arb_event_type() -> impl Strategy<Value = EventType> {
        (
            prop::sample::select(EventGroup::ALL.to_vec()),
            prop::sample::select(EventAction::ALL.to_vec()),
        )
            .prop_map(|(g, a)| EventType::new(g, a))
    }

    proptest! {
        /// The dotted form parses back to the same type.
        #[test]
        fn event_type_display_parses_back(t in arb_event_type()) {
            let parsed: EventType = t.to_string().parse().unwrap();
            prop_assert_eq!(parsed, t);
        }
    }

    #[test]
    fn event_type_parse_known() {
        let t: EventType = "order.created".parse().unwrap();
        assert_eq!(t, EventType::new(EventGroup::Order, EventAction::Created));
    }

    #[test]
    fn event_type_parse_rejects_unknown_group() {
        assert!("invoice.created".parse::<EventType>().is_err());
    }

    #[test]
    fn event_type_parse_rejects_missing_dot() {
        assert!("order".parse::<EventType>().is_err());
    }

    #[test]
    fn event_type_parse_rejects_unknown_action() {
        assert!("order.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn event_type_serializes_as_dotted_string() {
        let t = EventType::new(EventGroup::Stock, EventAction::Updated);
        assert_eq!(serde_json::to_value(t).unwrap(), json!("stock.updated"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Deferred.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
    }

    #[test]
    fn admitted_event_starts_pending_and_due() {
        let now = Utc::now();
        let event = Event::admitted(
            NewEvent::new(
                "d-1",
                EventType::new(EventGroup::Order, EventAction::Created),
                "O-100",
                json!({}),
            ),
            now,
        );
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert!(event.is_due(now));
        assert_eq!(event.priority, EventPriority::OrderLifecycle);
    }

    #[test]
    fn future_next_attempt_is_not_due() {
        let now = Utc::now();
        let mut event = Event::admitted(
            NewEvent::new(
                "d-1",
                EventType::new(EventGroup::Stock, EventAction::Updated),
                "SKU-1",
                json!({}),
            ),
            now,
        );
        event.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!event.is_due(now));
        assert!(event.is_due(now + chrono::Duration::seconds(30)));
    }
}
