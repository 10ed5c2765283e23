//! Core domain types for the WMS event queue.
//!
//! This module contains the fundamental types used throughout the application,
//! designed to encode invariants via the type system.

pub mod clock;
pub mod event;
pub mod ids;
pub mod priority;

// Re-export commonly used types at the module level
pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{
    Event, EventAction, EventGroup, EventSource, EventStatus, EventType, InvalidEventType,
    NewEvent,
};
pub use ids::{DeliveryId, EntityKey, EventId};
pub use priority::EventPriority;
