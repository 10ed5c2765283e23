//! Reconciliation: recovering notifications the WMS never delivered.
//!
//! For each category the poller asks the WMS what changed since the
//! category's watermark and synthesizes a corrective event for every change
//! the queue has not already applied. Only a `completed` event received at or
//! after the change counts as applied: a pending or deferred one may still
//! fail, and the watermark will have moved past the change by then.
//! Synthesized events carry a deterministic delivery id, so overlapping
//! lookbacks and repeated runs admit each change at most once.
//!
//! ```text
//! since = watermark - overlap        (or now - window on the first run)
//! fetch_recent(category, since) ──► for each change:
//!     completed since changed_at? ──yes──► skip
//!            │ no
//!            ▼
//!     admit "reconcile:<type>:<entity>:<changed_at>"
//! watermark = start of this run
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::poll::PollConfig;
use crate::queue::{Admission, Deduplicator};
use crate::store::{EventStore, StoreError};
use crate::types::{DeliveryId, EntityKey, EventGroup, EventSource, EventType, NewEvent};

/// One change reported by the WMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub event_type: EventType,
    pub entity_key: EntityKey,
    pub changed_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RemoteChange {
    /// The delivery id used when this change is synthesized as an event.
    pub fn delivery_id(&self) -> DeliveryId {
        DeliveryId(format!(
            "reconcile:{}:{}:{}",
            self.event_type,
            self.entity_key,
            self.changed_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ))
    }

    fn into_new_event(self) -> NewEvent {
        NewEvent::new(
            self.delivery_id(),
            self.event_type,
            self.entity_key,
            self.payload,
        )
        .with_source(EventSource::Reconciliation)
    }
}

/// Errors from querying the WMS.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Something that can list recent changes per category.
pub trait ReconciliationSource: Send + Sync {
    fn fetch_recent(
        &self,
        group: EventGroup,
        since: DateTime<Utc>,
    ) -> impl Future<Output = std::result::Result<Vec<RemoteChange>, SourceError>> + Send;
}

/// Counts from reconciling one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub fetched: usize,
    /// Changes already reflected by an event in the queue.
    pub skipped: usize,
    pub admitted: usize,
    /// Synthesized delivery ids that had been admitted by an earlier run.
    pub duplicates: usize,
}

pub struct Reconciler<S> {
    source: S,
    store: Arc<EventStore>,
    dedup: Deduplicator,
    config: PollConfig,
}

impl<S: ReconciliationSource> Reconciler<S> {
    pub fn new(source: S, store: Arc<EventStore>, config: PollConfig) -> Self {
        let dedup = Deduplicator::new(Arc::clone(&store));
        Reconciler {
            source,
            store,
            dedup,
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start of the lookback for the next run of `group`.
    pub fn since(&self, group: EventGroup) -> DateTime<Utc> {
        match self.store.watermark(group) {
            Some(watermark) => watermark - to_delta(self.config.overlap),
            None => self.store.now() - to_delta(self.config.window),
        }
    }

    /// Runs one reconciliation of `group`.
    ///
    /// The watermark only advances when every change has been offered to the
    /// queue; a failed run is repeated from the same point next time.
    #[instrument(skip(self), fields(category = %group))]
    pub async fn reconcile_group(&self, group: EventGroup) -> Result<ReconcileSummary> {
        let started = self.store.now();
        let since = self.since(group);
        let changes = self.source.fetch_recent(group, since).await?;

        let mut summary = ReconcileSummary {
            fetched: changes.len(),
            ..ReconcileSummary::default()
        };

        for change in changes {
            if change.event_type.group != group {
                warn!(
                    event_type = %change.event_type,
                    entity_key = %change.entity_key,
                    "Change reported under the wrong category, ignoring"
                );
                continue;
            }
            if self
                .store
                .has_completed_since(change.event_type, &change.entity_key, change.changed_at)
            {
                summary.skipped += 1;
                continue;
            }
            match self.dedup.admit(change.into_new_event())? {
                Admission::Accepted(event) => {
                    info!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        entity_key = %event.entity_key,
                        "Synthesized missed event"
                    );
                    summary.admitted += 1;
                }
                Admission::Duplicate => summary.duplicates += 1,
            }
        }

        self.store.set_watermark(group, started)?;
        debug!(
            %since,
            fetched = summary.fetched,
            skipped = summary.skipped,
            admitted = summary.admitted,
            duplicates = summary.duplicates,
            "Reconciliation run finished"
        );
        Ok(summary)
    }

    /// Polls every category on its own schedule until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let start = Instant::now();
        let mut next_due: HashMap<EventGroup, Instant> = EventGroup::ALL
            .into_iter()
            .map(|g| (g, deadline(start, self.config.initial_delay(g))))
            .collect();

        info!("Reconciliation poller started");

        loop {
            let Some((&group, &due)) = next_due.iter().min_by_key(|(_, due)| **due) else {
                break;
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping reconciliation poller");
                    break;
                }
                _ = tokio::time::sleep_until(due) => {
                    if let Err(e) = self.reconcile_group(group).await {
                        warn!(category = %group, error = %e, "Reconciliation run failed");
                    }
                    next_due.insert(group, deadline(Instant::now(), self.config.interval_with_jitter(group)));
                }
            }
        }

        info!("Reconciliation poller stopped");
    }
}

/// `from + after`, saturating at roughly a year out for absurd intervals.
fn deadline(from: Instant, after: std::time::Duration) -> Instant {
    from.checked_add(after)
        .unwrap_or_else(|| from + std::time::Duration::from_secs(365 * 24 * 3600))
}

fn to_delta(d: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestStore, t};
    use crate::types::{Clock, EventStatus};
    use serde_json::json;
    use std::sync::Mutex;

    /// A source serving fixed changes and recording every query.
    #[derive(Default)]
    struct FakeSource {
        changes: Mutex<HashMap<EventGroup, Vec<RemoteChange>>>,
        queries: Mutex<Vec<(EventGroup, DateTime<Utc>)>>,
        fail: Mutex<bool>,
    }

    impl FakeSource {
        fn with(changes: Vec<RemoteChange>) -> Self {
            let source = FakeSource::default();
            {
                let mut map = source.changes.lock().unwrap();
                for change in changes {
                    map.entry(change.event_type.group).or_default().push(change);
                }
            }
            source
        }
    }

    impl ReconciliationSource for Arc<FakeSource> {
        async fn fetch_recent(
            &self,
            group: EventGroup,
            since: DateTime<Utc>,
        ) -> std::result::Result<Vec<RemoteChange>, SourceError> {
            self.queries.lock().unwrap().push((group, since));
            if *self.fail.lock().unwrap() {
                return Err(SourceError::Invalid("WMS unavailable".to_string()));
            }
            Ok(self
                .changes
                .lock()
                .unwrap()
                .get(&group)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|c| c.changed_at >= since)
                .collect())
        }
    }

    fn change(event_type: &str, entity: &str, changed_at: DateTime<Utc>) -> RemoteChange {
        RemoteChange {
            event_type: t(event_type),
            entity_key: EntityKey::new(entity),
            changed_at,
            payload: json!({"entity": entity}),
        }
    }

    fn reconciler(ts: &TestStore, source: &Arc<FakeSource>) -> Reconciler<Arc<FakeSource>> {
        Reconciler::new(Arc::clone(source), Arc::clone(&ts.store), PollConfig::default())
    }

    #[test]
    fn delivery_id_is_deterministic() {
        let c = change("stock.updated", "SKU-1", crate::test_utils::at(0));
        assert_eq!(c.delivery_id(), c.clone().delivery_id());
        assert_eq!(
            c.delivery_id().as_str(),
            "reconcile:stock.updated:SKU-1:2023-11-14T22:13:20.000Z"
        );
    }

    #[tokio::test]
    async fn first_run_looks_back_one_window() {
        let ts = TestStore::new();
        let source = Arc::new(FakeSource::default());
        let r = reconciler(&ts, &source);

        r.reconcile_group(EventGroup::Stock).await.unwrap();

        let queries = source.queries.lock().unwrap().clone();
        assert_eq!(queries, vec![(EventGroup::Stock, ts.clock.now() - TimeDelta::hours(24))]);
        assert_eq!(ts.store.watermark(EventGroup::Stock), Some(ts.clock.now()));
    }

    #[tokio::test]
    async fn later_runs_start_overlap_before_previous_run() {
        let ts = TestStore::new();
        let source = Arc::new(FakeSource::default());
        let r = reconciler(&ts, &source);
        let first = ts.clock.now();

        r.reconcile_group(EventGroup::Order).await.unwrap();
        ts.clock.advance(TimeDelta::hours(4));
        r.reconcile_group(EventGroup::Order).await.unwrap();

        let queries = source.queries.lock().unwrap().clone();
        assert_eq!(queries[1].1, first - TimeDelta::minutes(10));
    }

    #[tokio::test]
    async fn missed_change_is_synthesized_once() {
        let ts = TestStore::new();
        let changed_at = ts.clock.now() - TimeDelta::minutes(5);
        let source = Arc::new(FakeSource::with(vec![change("stock.updated", "SKU-9", changed_at)]));
        let r = reconciler(&ts, &source);

        let first = r.reconcile_group(EventGroup::Stock).await.unwrap();
        assert_eq!(first.admitted, 1);

        let stored = ts
            .store
            .get_by_delivery(&source.changes.lock().unwrap()[&EventGroup::Stock][0].delivery_id())
            .unwrap();
        assert_eq!(stored.source, EventSource::Reconciliation);
        assert_eq!(stored.status, EventStatus::Pending);

        // Overlapping lookback sees the same change again.
        ts.clock.advance(TimeDelta::minutes(1));
        let second = r.reconcile_group(EventGroup::Stock).await.unwrap();
        assert_eq!(second.admitted, 0);
        assert_eq!(second.skipped + second.duplicates, 1);
        assert_eq!(ts.store.stats().total, 1);
    }

    #[tokio::test]
    async fn change_already_delivered_by_webhook_is_skipped() {
        let ts = TestStore::new();
        let changed_at = ts.clock.now();
        ts.clock.advance(TimeDelta::seconds(2));
        let delivered = ts.admit("wh-1", "order.updated", "O-7");
        ts.store.try_claim(delivered.id).unwrap();
        ts.store.complete(delivered.id).unwrap();
        let source = Arc::new(FakeSource::with(vec![change("order.updated", "O-7", changed_at)]));
        let r = reconciler(&ts, &source);

        let summary = r.reconcile_group(EventGroup::Order).await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.admitted, 0);
        assert_eq!(ts.store.stats().total, 1);
    }

    #[tokio::test]
    async fn failed_event_does_not_count_as_seen() {
        let ts = TestStore::new();
        let changed_at = ts.clock.now();
        let event = ts.admit("wh-1", "stock.updated", "SKU-3");
        ts.store.fail(event.id, "boom").unwrap();
        let source = Arc::new(FakeSource::with(vec![change("stock.updated", "SKU-3", changed_at)]));
        let r = reconciler(&ts, &source);

        let summary = r.reconcile_group(EventGroup::Stock).await.unwrap();

        assert_eq!(summary.admitted, 1);
    }

    #[tokio::test]
    async fn unfinished_event_does_not_count_as_seen() {
        let ts = TestStore::new();
        let changed_at = ts.clock.now();
        let pending = ts.admit("wh-1", "stock.updated", "SKU-4");
        let source = Arc::new(FakeSource::with(vec![change("stock.updated", "SKU-4", changed_at)]));
        let r = reconciler(&ts, &source);

        let summary = r.reconcile_group(EventGroup::Stock).await.unwrap();
        assert_eq!(summary.admitted, 1);

        // The webhook event failing later does not lose the change.
        ts.store.fail(pending.id, "boom").unwrap();
        assert_eq!(ts.store.stats().pending, 1);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_watermark() {
        let ts = TestStore::new();
        let source = Arc::new(FakeSource::default());
        let r = reconciler(&ts, &source);
        r.reconcile_group(EventGroup::Stock).await.unwrap();
        let watermark = ts.store.watermark(EventGroup::Stock);

        *source.fail.lock().unwrap() = true;
        ts.clock.advance(TimeDelta::hours(1));
        let err = r.reconcile_group(EventGroup::Stock).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Source(_)));
        assert_eq!(ts.store.watermark(EventGroup::Stock), watermark);
    }

    #[tokio::test]
    async fn watermark_survives_reopen() {
        let ts = TestStore::new();
        let source = Arc::new(FakeSource::default());
        reconciler(&ts, &source)
            .reconcile_group(EventGroup::Article)
            .await
            .unwrap();
        let watermark = ts.store.watermark(EventGroup::Article);

        let reopened = ts.reopen();
        assert_eq!(reopened.store.watermark(EventGroup::Article), watermark);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_each_category_and_stops_on_shutdown() {
        let ts = TestStore::new();
        let source = Arc::new(FakeSource::default());
        let r = Arc::new(reconciler(&ts, &source));
        let shutdown = CancellationToken::new();

        let task = {
            let r = Arc::clone(&r);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { r.run(shutdown).await })
        };

        // Every initial delay is under half a day.
        tokio::time::sleep(std::time::Duration::from_secs(12 * 3600)).await;
        shutdown.cancel();
        task.await.unwrap();

        let queries = source.queries.lock().unwrap().clone();
        for group in EventGroup::ALL {
            assert!(queries.iter().any(|(g, _)| *g == group), "{group} never polled");
        }
    }
}
