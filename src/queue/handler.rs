//! The handler seam: how one event type is applied to local state.
//!
//! Handlers are registered per [`EventType`] into a [`HandlerRegistry`] that is
//! frozen once built; the dispatcher looks them up by the event's type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use super::local::UnitOfWork;
use crate::types::{Event, EventType};

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// The attempt may succeed later (timeouts, unavailable collaborators).
    Transient,
    /// The event can never be applied as-is (invalid data). Fails the event
    /// immediately regardless of remaining attempts.
    Permanent,
}

impl fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerErrorKind::Transient => f.write_str("transient"),
            HandlerErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// A handler failure, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == HandlerErrorKind::Transient
    }
}

/// Applies one event to local state.
///
/// Handlers run on the blocking thread pool and must bound their own
/// running time. Writes go through `work` and are kept only if the handler
/// returns `Ok`. Delivery is at-least-once: a crash after the writes commit
/// but before the event is marked completed replays the event, so handlers
/// should be idempotent per event.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &Event, work: &mut UnitOfWork) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event, &mut UnitOfWork) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, event: &Event, work: &mut UnitOfWork) -> Result<(), HandlerError> {
        self(event, work)
    }
}

/// Collects handlers before the registry is frozen.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`, replacing any earlier one.
    pub fn register(mut self, event_type: EventType, handler: impl EventHandler) -> Self {
        if self
            .handlers
            .insert(event_type, Arc::new(handler))
            .is_some()
        {
            warn!(%event_type, "Replacing previously registered handler");
        }
        self
    }

    /// Registers a closure; spelled out so closure argument types infer.
    pub fn register_fn<F>(self, event_type: EventType, handler: F) -> Self
    where
        F: Fn(&Event, &mut UnitOfWork) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(event_type, handler)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable map from event type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    pub fn get(&self, event_type: EventType) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&event_type)
    }

    pub fn contains(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    /// Registered types, sorted.
    pub fn event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
