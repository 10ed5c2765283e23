//! Event priority classification for queue scheduling.
//!
//! The scheduler orders ready events by priority tier, then by arrival time.
//! Tiers are derived from the event type once, at ingestion, and stored with
//! the event.
//!
//! # Priority Tiers
//!
//! Lower values are more urgent:
//!
//! | Tier | Value | Event groups |
//! |------|-------|--------------|
//! | `OrderLifecycle` | 10 | `order.*` |
//! | `Stock` | 20 | `stock.*` |
//! | `Shipment` | 30 | `shipment.*` |
//! | `Catalog` | 40 | `inbound.*`, `article.*` |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::{EventGroup, EventType};

/// Event priority tier.
///
/// Ordering follows urgency: `OrderLifecycle < Stock < Shipment < Catalog`,
/// so sorting ascending yields the most urgent events first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventPriority {
    /// Order lifecycle events; customers are waiting on these.
    OrderLifecycle = 10,
    /// Stock level changes.
    Stock = 20,
    /// Shipment tracking updates.
    Shipment = 30,
    /// Inbound receipts and article master data.
    Catalog = 40,
}

impl EventPriority {
    /// Classifies the priority tier of an event type.
    ///
    /// # Examples
    ///
    /// ```
    /// use wms_sync::types::{EventAction, EventGroup, EventPriority, EventType};
    ///
    /// let created = EventType::new(EventGroup::Order, EventAction::Created);
    /// let stock = EventType::new(EventGroup::Stock, EventAction::Updated);
    ///
    /// assert_eq!(EventPriority::classify(&created), EventPriority::OrderLifecycle);
    /// assert!(EventPriority::classify(&created) < EventPriority::classify(&stock));
    /// ```
    pub fn classify(event_type: &EventType) -> EventPriority {
        match event_type.group {
            EventGroup::Order => EventPriority::OrderLifecycle,
            EventGroup::Stock => EventPriority::Stock,
            EventGroup::Shipment => EventPriority::Shipment,
            EventGroup::Inbound | EventGroup::Article => EventPriority::Catalog,
        }
    }

    /// Returns the numeric tier value.
    pub fn tier(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tier())
    }
}

impl From<EventPriority> for u8 {
    fn from(p: EventPriority) -> Self {
        p.tier()
    }
}

/// Error returned when a stored tier value does not match a known tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown priority tier: {0}")]
pub struct InvalidPriority(pub u8);

impl TryFrom<u8> for EventPriority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(EventPriority::OrderLifecycle),
            20 => Ok(EventPriority::Stock),
            30 => Ok(EventPriority::Shipment),
            40 => Ok(EventPriority::Catalog),
            other => Err(InvalidPriority(other)),
        }
    }
}
