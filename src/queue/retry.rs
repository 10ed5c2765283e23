//! Bounded retries with escalating delays.
//!
//! A failed attempt is either rescheduled or, once the attempt budget is
//! spent, moved to the terminal `failed` state. The delay before attempt
//! `n + 1` is `delays[min(n - 1, len - 1)]`, so the last entry repeats once
//! the table is exhausted.
//!
//! Default table (with the default budget of 3 attempts only the first two
//! entries are ever used):
//!
//! | After attempt | Delay |
//! |---------------|-------|
//! | 1 | 30 s |
//! | 2 | 2 min |
//! | 3 | 5 min |
//! | 4 | 15 min |
//! | 5+ | 1 h |

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::handler::{HandlerError, HandlerErrorKind};
use crate::store::{EventStore, Result};
use crate::types::{DeliveryId, EntityKey, Event, EventId, EventType};

/// Longest a retry is ever pushed out; larger backoff entries are clamped.
const MAX_RETRY_DELAY: TimeDelta = TimeDelta::days(3650);

/// Capacity of the terminal-failure broadcast channel. Slow subscribers miss
/// the oldest notices rather than blocking dispatch.
const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Delay table indexed by completed attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// Creates a schedule; an empty table means "retry immediately".
    pub fn new(delays: Vec<Duration>) -> Self {
        BackoffSchedule { delays }
    }

    /// Delay to wait after `attempts` attempts have been made.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let Some(last) = self.delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempts.saturating_sub(1) as usize).min(last);
        self.delays[index]
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        BackoffSchedule::new(vec![
            Duration::from_secs(30),
            Duration::from_secs(2 * 60),
            Duration::from_secs(5 * 60),
            Duration::from_secs(15 * 60),
            Duration::from_secs(60 * 60),
        ])
    }
}

/// Attempt budget plus delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffSchedule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: BackoffSchedule::default(),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Decides the fate of an event that has failed its `attempts`-th attempt.
    pub fn decide(&self, attempts: u32, kind: HandlerErrorKind) -> RetryDecision {
        if kind == HandlerErrorKind::Permanent || attempts >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.backoff.delay_after(attempts))
        }
    }
}

/// Notice published when an event reaches terminal `failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalFailure {
    pub event_id: EventId,
    pub delivery_id: DeliveryId,
    pub event_type: EventType,
    pub entity_key: EntityKey,
    pub attempts: u32,
    pub error: String,
}

impl TerminalFailure {
    fn of(event: &Event, error: &str) -> Self {
        TerminalFailure {
            event_id: event.id,
            delivery_id: event.delivery_id.clone(),
            event_type: event.event_type,
            entity_key: event.entity_key.clone(),
            attempts: event.attempts,
            error: error.to_string(),
        }
    }
}

/// Result of handling a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_attempt_at: DateTime<Utc> },
    Failed,
}

/// Converts handler failures into store transitions.
pub struct RetryController {
    policy: RetryPolicy,
    failures: broadcast::Sender<TerminalFailure>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        RetryController { policy, failures }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Subscribes to terminal-failure notices.
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalFailure> {
        self.failures.subscribe()
    }

    /// Handles a failed attempt of a claimed (`processing`) event.
    pub fn handle_failure(
        &self,
        store: &EventStore,
        event: &Event,
        err: &HandlerError,
    ) -> Result<FailureOutcome> {
        match self.policy.decide(event.attempts, err.kind) {
            RetryDecision::RetryAfter(delay) => {
                let delay = TimeDelta::from_std(delay)
                    .unwrap_or(MAX_RETRY_DELAY)
                    .min(MAX_RETRY_DELAY);
                let now = store.now();
                let next_attempt_at = now.checked_add_signed(delay).unwrap_or(now);
                store.reschedule(event.id, next_attempt_at, err.to_string())?;
                info!(
                    event_id = %event.id,
                    delivery_id = %event.delivery_id,
                    event_type = %event.event_type,
                    attempts = event.attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %err,
                    "Event failed, retry scheduled"
                );
                Ok(FailureOutcome::Retrying { next_attempt_at })
            }
            RetryDecision::GiveUp => {
                self.fail_terminally(store, event, &err.to_string())?;
                Ok(FailureOutcome::Failed)
            }
        }
    }

    /// Marks an event `failed` without consulting the attempt budget and
    /// publishes the notice.
    pub fn fail_terminally(&self, store: &EventStore, event: &Event, reason: &str) -> Result<()> {
        let failed = store.fail(event.id, reason)?;
        error!(
            event_id = %failed.id,
            delivery_id = %failed.delivery_id,
            event_type = %failed.event_type,
            entity_key = %failed.entity_key,
            attempts = failed.attempts,
            error = reason,
            "Event failed terminally"
        );
        // No subscribers is fine.
        let _ = self.failures.send(TerminalFailure::of(&failed, reason));
        Ok(())
    }

    /// Publishes a notice for an event some other path already failed.
    pub fn notify(&self, event: &Event) {
        let reason = event.error_message.as_deref().unwrap_or("");
        error!(
            event_id = %event.id,
            delivery_id = %event.delivery_id,
            event_type = %event.event_type,
            entity_key = %event.entity_key,
            error = reason,
            "Event failed terminally"
        );
        let _ = self.failures.send(TerminalFailure::of(event, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestStore;
    use crate::types::{Clock, EventStatus};
    use proptest::prelude::*;

    #[test]
    fn default_delays_match_table() {
        let backoff = BackoffSchedule::default();
        let secs: Vec<u64> = (1..=6).map(|n| backoff.delay_after(n).as_secs()).collect();
        assert_eq!(secs, vec![30, 120, 300, 900, 3600, 3600]);
    }

    #[test]
    fn empty_table_retries_immediately() {
        assert_eq!(BackoffSchedule::new(vec![]).delay_after(2), Duration::ZERO);
    }

    #[test]
    fn permanent_errors_give_up_at_once() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, HandlerErrorKind::Permanent),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn budget_exhaustion_gives_up() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(2, HandlerErrorKind::Transient),
            RetryDecision::RetryAfter(Duration::from_secs(120))
        );
        assert_eq!(
            policy.decide(3, HandlerErrorKind::Transient),
            RetryDecision::GiveUp
        );
    }

    proptest! {
        /// Delays never shrink as attempts grow, for any non-decreasing table.
        #[test]
        fn backoff_is_monotonic(
            mut table in prop::collection::vec(0u64..100_000, 1..8),
            a in 1u32..20,
            b in 1u32..20,
        ) {
            table.sort_unstable();
            let backoff = BackoffSchedule::new(table.into_iter().map(Duration::from_secs).collect());
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(backoff.delay_after(lo) <= backoff.delay_after(hi));
        }
    }

    #[test]
    fn handle_failure_reschedules_then_fails_and_broadcasts() {
        let ts = TestStore::new();
        let controller = RetryController::new(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        let mut failures = controller.subscribe();
        let event = ts.admit("d-1", "stock.updated", "SKU-1");
        let err = HandlerError::transient("WMS timeout");

        let claimed = ts.store.try_claim(event.id).unwrap().unwrap();
        let outcome = controller.handle_failure(&ts.store, &claimed, &err).unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                next_attempt_at: ts.clock.now() + TimeDelta::seconds(30)
            }
        );

        ts.clock.advance(TimeDelta::seconds(30));
        let claimed = ts.store.try_claim(event.id).unwrap().unwrap();
        let outcome = controller.handle_failure(&ts.store, &claimed, &err).unwrap();
        assert_eq!(outcome, FailureOutcome::Failed);

        let stored = ts.store.get(event.id).unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.attempts, 2);
        let notice = failures.try_recv().unwrap();
        assert_eq!(notice.event_id, event.id);
        assert_eq!(notice.attempts, 2);
        assert!(notice.error.contains("WMS timeout"));
    }

    #[test]
    fn oversized_backoff_saturates_instead_of_overflowing() {
        let ts = TestStore::new();
        let controller = RetryController::new(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffSchedule::new(vec![Duration::MAX]),
        });
        let event = ts.admit("d-1", "stock.updated", "SKU-1");

        let claimed = ts.store.try_claim(event.id).unwrap().unwrap();
        let outcome = controller
            .handle_failure(&ts.store, &claimed, &HandlerError::transient("busy"))
            .unwrap();

        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                next_attempt_at: ts.clock.now() + MAX_RETRY_DELAY
            }
        );
        assert_eq!(ts.store.get(event.id).unwrap().status, EventStatus::Pending);
    }
}
