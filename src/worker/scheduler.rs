//! The scheduler loop: immediate dispatch at ingestion plus a periodic drain.
//!
//! # Periodic Pass
//!
//! Each pass runs, in order:
//! 1. Fail `deferred` events older than the deferred timeout
//! 2. Promote `deferred` events whose prerequisites have completed
//! 3. Select a batch of ready, due `pending` events (most urgent first)
//! 4. Dispatch them one at a time
//! 5. Purge terminal events past retention
//!
//! The immediate path and a pass may race for the same event; the store's
//! `pending → processing` claim decides the winner and the loser sees
//! [`DispatchOutcome::NotClaimed`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::queue::{DispatchOutcome, Dispatcher};
use crate::store::{EventStore, Result, Retention};
use crate::types::EventId;

/// Floor for the pass interval; `tokio::time::interval` rejects zero.
const MIN_PASS_INTERVAL: Duration = Duration::from_millis(100);

/// Whether the queue may dispatch events.
///
/// While `Paused` (for example before the initial catalogue sync has run),
/// events are still admitted and stored but never handed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationGate {
    Enabled,
    Paused,
}

impl AutomationGate {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            AutomationGate::Enabled
        } else {
            AutomationGate::Paused
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self == AutomationGate::Enabled
    }
}

impl fmt::Display for AutomationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationGate::Enabled => f.write_str("enabled"),
            AutomationGate::Paused => f.write_str("paused"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum events dispatched per pass.
    pub batch_size: usize,
    /// Time between periodic passes.
    pub interval: Duration,
    /// Age (from `created_at`) at which a deferred event is given up on.
    pub deferred_timeout: chrono::Duration,
    pub retention: Retention,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            batch_size: 20,
            interval: Duration::from_secs(60),
            deferred_timeout: chrono::Duration::hours(24),
            retention: Retention::default(),
        }
    }
}

/// Counts from one periodic pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub completed: usize,
    pub retried: usize,
    pub deferred: usize,
    /// Dispatch failures plus deferred events that timed out.
    pub failed: usize,
    pub promoted: usize,
    pub purged: usize,
    /// Events whose dispatch hit a store error; they stay queued.
    pub errors: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Completed => self.completed += 1,
            DispatchOutcome::Retrying { .. } => self.retried += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::NotClaimed => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == PassSummary::default()
    }
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SchedulerConfig) -> Self {
        Scheduler { dispatcher, config }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<EventStore> {
        self.dispatcher.store()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Immediate path: dispatch a just-admitted event.
    ///
    /// Returns `None` when the gate is paused.
    pub async fn process_now(
        &self,
        id: EventId,
        gate: AutomationGate,
    ) -> Result<Option<DispatchOutcome>> {
        if !gate.is_enabled() {
            debug!(event_id = %id, "Automation paused, leaving event queued");
            return Ok(None);
        }
        self.dispatcher.dispatch(id).await.map(Some)
    }

    /// Runs one periodic pass. Does nothing while the gate is paused.
    #[instrument(skip(self))]
    pub async fn run_pass(&self, gate: AutomationGate) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        if !gate.is_enabled() {
            return Ok(summary);
        }
        let store = self.store();

        for expired in store.expire_deferred(self.config.deferred_timeout)? {
            self.dispatcher.retry().notify(&expired);
            summary.failed += 1;
        }
        summary.promoted = store.promote_ready()?.len();

        for event in store.select_batch(self.config.batch_size) {
            match self.dispatcher.dispatch(event.id).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        delivery_id = %event.delivery_id,
                        event_type = %event.event_type,
                        error = %e,
                        "Dispatch failed, continuing with batch"
                    );
                    summary.errors += 1;
                }
            }
        }

        let purged = store.purge(self.config.retention)?;
        summary.purged = purged.completed + purged.failed;

        if !summary.is_empty() {
            info!(
                completed = summary.completed,
                retried = summary.retried,
                deferred = summary.deferred,
                failed = summary.failed,
                promoted = summary.promoted,
                purged = summary.purged,
                errors = summary.errors,
                "Queue pass finished"
            );
        }
        Ok(summary)
    }

    /// Runs periodic passes until `shutdown` is cancelled. The first pass
    /// runs immediately to drain any backlog left from before a restart.
    pub async fn run(&self, gate: AutomationGate, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            %gate,
            "Scheduler loop started"
        );

        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_PASS_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_pass(gate).await {
                        error!(error = %e, "Error during queue pass");
                    }
                }
            }
        }

        info!("Scheduler loop stopped");
    }
}
