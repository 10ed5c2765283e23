//! Routing one event through its handler.
//!
//! # Dispatch Steps
//!
//! 1. Re-check prerequisites; if unmet the event is `deferred`
//! 2. Claim `pending → processing` (counts the attempt); losing the claim
//!    race is a no-op
//! 3. No registered handler: terminal `failed`, never retried
//! 4. Run the handler on the blocking pool inside a [`UnitOfWork`]
//! 5. `Ok`: commit the unit of work, mark `completed`
//! 6. `Err` or panic: hand over to the [`RetryController`]
//!
//! Handler errors never escape this module; they become status transitions.
//! Only store failures are returned to the caller.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinError;
use tracing::{debug, instrument, warn};

use super::handler::{HandlerError, HandlerRegistry};
use super::local::{LocalStore, UnitOfWork};
use super::retry::{FailureOutcome, RetryController, RetryPolicy};
use crate::store::{EventStore, Result, StoreError};
use crate::types::{EventId, EventStatus};

/// What happened to an event handed to [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// Prerequisites unmet; not counted as an attempt.
    Deferred,
    Retrying {
        next_attempt_at: DateTime<Utc>,
    },
    Failed,
    /// Someone else holds or already finished the event, or it is not due.
    NotClaimed,
}

pub struct Dispatcher {
    store: Arc<EventStore>,
    registry: Arc<HandlerRegistry>,
    local: Arc<LocalStore>,
    retry: RetryController,
}

impl Dispatcher {
    pub fn new(
        store: Arc<EventStore>,
        registry: Arc<HandlerRegistry>,
        local: Arc<LocalStore>,
        policy: RetryPolicy,
    ) -> Self {
        Dispatcher {
            store,
            registry,
            local,
            retry: RetryController::new(policy),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn retry(&self) -> &RetryController {
        &self.retry
    }

    /// Dispatches the event with the given id.
    #[instrument(skip(self), fields(event_id = %id))]
    pub async fn dispatch(&self, id: EventId) -> Result<DispatchOutcome> {
        let Some(event) = self.store.get(id) else {
            return Ok(DispatchOutcome::NotClaimed);
        };
        if event.status != EventStatus::Pending || !event.is_due(self.store.now()) {
            return Ok(DispatchOutcome::NotClaimed);
        }

        if !self.store.is_ready(&event) {
            return match self.store.defer(id) {
                Ok(_) => {
                    debug!(
                        delivery_id = %event.delivery_id,
                        event_type = %event.event_type,
                        entity_key = %event.entity_key,
                        "Prerequisites not met, deferring"
                    );
                    Ok(DispatchOutcome::Deferred)
                }
                Err(StoreError::InvalidTransition { .. }) => Ok(DispatchOutcome::NotClaimed),
                Err(e) => Err(e),
            };
        }

        let Some(claimed) = self.store.try_claim(id)? else {
            return Ok(DispatchOutcome::NotClaimed);
        };

        let Some(handler) = self.registry.get(claimed.event_type) else {
            let reason = format!("no handler registered for {}", claimed.event_type);
            self.retry.fail_terminally(&self.store, &claimed, &reason)?;
            return Ok(DispatchOutcome::Failed);
        };

        let handler = Arc::clone(handler);
        let work = self.local.begin();
        let handler_event = claimed.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut work: UnitOfWork = work;
            let result = handler.handle(&handler_event, &mut work);
            (result, work)
        })
        .await;

        let result = match joined {
            Ok((Ok(()), work)) => {
                self.local.commit(work);
                Ok(())
            }
            Ok((Err(e), _discarded)) => Err(e),
            Err(join_error) => Err(handler_crashed(join_error)),
        };

        match result {
            Ok(()) => {
                self.store.complete(id)?;
                debug!(
                    delivery_id = %claimed.delivery_id,
                    event_type = %claimed.event_type,
                    attempts = claimed.attempts,
                    "Event completed"
                );
                Ok(DispatchOutcome::Completed)
            }
            Err(err) => match self.retry.handle_failure(&self.store, &claimed, &err)? {
                FailureOutcome::Retrying { next_attempt_at } => {
                    Ok(DispatchOutcome::Retrying { next_attempt_at })
                }
                FailureOutcome::Failed => Ok(DispatchOutcome::Failed),
            },
        }
    }
}

/// A handler that panicked (or whose task was cancelled) counts as a
/// transient failure.
fn handler_crashed(join_error: JoinError) -> HandlerError {
    if join_error.is_panic() {
        let message = panic_message(join_error.into_panic());
        warn!(panic = %message, "Event handler panicked");
        HandlerError::transient(format!("handler panicked: {}", message))
    } else {
        HandlerError::transient("handler task cancelled")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}
