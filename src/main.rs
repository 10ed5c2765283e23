//! `wms-sync` server binary.
//!
//! Projections go into an in-memory [`LocalStore`], a stand-in for the
//! storefront integration. Projected records do not survive a restart while
//! their events stay `completed`; a deployment swaps in a durable store.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wms_sync::config::Config;
use wms_sync::queue::{Dispatcher, LocalStore};
use wms_sync::server::{AppState, build_router};
use wms_sync::store::EventStore;
use wms_sync::types::SystemClock;
use wms_sync::wms::WmsClient;
use wms_sync::worker::{Reconciler, Scheduler};
use wms_sync::projection;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wms_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let store = EventStore::open(&config.state_dir, Arc::new(SystemClock), config.store.clone())
        .map(Arc::new)
        .with_context(|| format!("opening event store in {}", config.state_dir.display()))?;
    let stats = store.stats();
    info!(
        state_dir = %config.state_dir.display(),
        pending = stats.pending,
        deferred = stats.deferred,
        failed = stats.failed,
        "Event store opened"
    );

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::new(projection::default_registry()),
        // In-memory stand-in; see the module docs.
        Arc::new(LocalStore::new()),
        config.retry.clone(),
    );
    let scheduler = Arc::new(Scheduler::new(Arc::new(dispatcher), config.scheduler.clone()));

    if !config.gate.is_enabled() {
        warn!("Initial sync not completed; events will be stored but not dispatched");
    }

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        let gate = config.gate;
        tasks.spawn(async move { scheduler.run(gate, shutdown).await });
    }

    match &config.wms {
        Some(wms) => {
            let client = WmsClient::new(&wms.base_url, &wms.token, wms.timeout)
                .context("building WMS client")?;
            let reconciler = Reconciler::new(client, Arc::clone(&store), config.poll.clone());
            let shutdown = shutdown.clone();
            tasks.spawn(async move { reconciler.run(shutdown).await });
        }
        None => warn!("WMS_SYNC_WMS_BASE_URL not set; reconciliation disabled"),
    }

    let app = build_router(AppState::new(
        Arc::clone(&scheduler),
        config.webhook_secret.clone(),
        config.gate,
    ));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("listening on {}", config.bind);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
