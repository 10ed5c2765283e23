//! HTTP surface of the queue.
//!
//! # Endpoints
//!
//! - `POST /webhook` - Accepts WMS deliveries (returns 202 Accepted)
//! - `GET /api/v1/queue/stats` - Event counts per status
//! - `GET /api/v1/queue/recent?limit=N` - Recently updated events
//! - `POST /api/v1/queue/retry-failed` - Manual retry of failed events
//! - `GET /health` - Returns 200 if server is running

use std::sync::Arc;

use tracing::{debug, error};

pub mod health;
pub mod queue;
pub mod webhook;

pub use health::health_handler;
pub use queue::{recent_handler, retry_failed_handler, stats_handler};
pub use webhook::webhook_handler;

use crate::queue::Deduplicator;
use crate::store::EventStore;
use crate::types::EventId;
use crate::worker::{AutomationGate, Scheduler};

/// Shared application state, passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: Arc<Scheduler>,
    dedup: Deduplicator,
    webhook_secret: Vec<u8>,
    gate: AutomationGate,
}

impl AppState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        webhook_secret: impl Into<Vec<u8>>,
        gate: AutomationGate,
    ) -> Self {
        let dedup = Deduplicator::new(Arc::clone(scheduler.store()));
        AppState {
            inner: Arc::new(AppStateInner {
                scheduler,
                dedup,
                webhook_secret: webhook_secret.into(),
                gate,
            }),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        self.inner.scheduler.store()
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.inner.dedup
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.inner.webhook_secret
    }

    pub fn gate(&self) -> AutomationGate {
        self.inner.gate
    }

    /// Immediate path for a just-admitted event.
    ///
    /// The event is already durable, so a failure here only delays it until
    /// the next periodic pass.
    pub async fn dispatch_now(&self, id: EventId) {
        match self.inner.scheduler.process_now(id, self.inner.gate).await {
            Ok(Some(outcome)) => debug!(event_id = %id, ?outcome, "Immediate dispatch"),
            Ok(None) => {}
            Err(e) => error!(event_id = %id, error = %e, "Immediate dispatch failed"),
        }
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/api/v1/queue/stats", get(stats_handler))
        .route("/api/v1/queue/recent", get(recent_handler))
        .route("/api/v1/queue/retry-failed", post(retry_failed_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
