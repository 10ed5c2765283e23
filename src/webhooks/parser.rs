//! WMS webhook envelope parser.
//!
//! Every delivery shares one envelope:
//!
//! ```json
//! {
//!   "delivery_id": "7d1c...",
//!   "event": "order.updated",
//!   "entity_key": "O-100",
//!   "data": { ... }
//! }
//! ```
//!
//! # Headers
//!
//! - `X-WMS-Delivery` - delivery id, used when the body has none
//! - `X-WMS-Event` - event type, used when the body has none
//! - `X-WMS-Signature` - HMAC-SHA256 signature (verified before parsing)
//!
//! Unknown fields are ignored. Unknown event types are rejected, since the
//! queue could never dispatch them.

use serde::Deserialize;
use thiserror::Error;

use crate::types::{EventType, InvalidEventType, NewEvent};

pub const DELIVERY_HEADER: &str = "x-wms-delivery";
pub const EVENT_HEADER: &str = "x-wms-event";

/// Error type for malformed deliveries.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    UnknownEventType(#[from] InvalidEventType),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Envelope values carried in request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeHeaders {
    pub delivery_id: Option<String>,
    pub event: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    delivery_id: Option<String>,
    event: Option<String>,
    entity_key: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parses a delivery body into an event ready for admission.
///
/// ```
/// use wms_sync::webhooks::{EnvelopeHeaders, parse_delivery};
///
/// let body = br#"{"event": "stock.updated", "entity_key": "SKU-1", "data": {"qty": 4}}"#;
/// let headers = EnvelopeHeaders {
///     delivery_id: Some("d-42".to_string()),
///     event: None,
/// };
///
/// let event = parse_delivery(&headers, body).unwrap();
/// assert_eq!(event.delivery_id.as_str(), "d-42");
/// assert_eq!(event.event_type.to_string(), "stock.updated");
/// ```
pub fn parse_delivery(headers: &EnvelopeHeaders, body: &[u8]) -> Result<NewEvent> {
    let raw: RawEnvelope = serde_json::from_slice(body)?;

    let delivery_id = present(raw.delivery_id)
        .or_else(|| present(headers.delivery_id.clone()))
        .ok_or(IngestError::MissingField("delivery_id"))?;
    let event = present(raw.event)
        .or_else(|| present(headers.event.clone()))
        .ok_or(IngestError::MissingField("event"))?;
    let entity_key = present(raw.entity_key).ok_or(IngestError::MissingField("entity_key"))?;

    let event_type: EventType = event.parse()?;
    Ok(NewEvent::new(delivery_id, event_type, entity_key, raw.data))
}

/// Treats blank strings as absent.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
