//! Background loops that drive the queue.
//!
//! # Architecture
//!
//! Two independent tokio tasks, both stopped by one `CancellationToken`:
//!
//! - **Scheduler**: drains the queue in capped batches on a fixed interval,
//!   and serves the immediate path for freshly admitted events
//! - **Reconciler**: polls the WMS per category and admits corrective events
//!   for notifications that never arrived
//!
//! # Module Structure
//!
//! - [`scheduler`]: periodic pass and the automation gate
//! - [`reconcile`]: change-feed polling and event synthesis
//! - [`poll`]: per-category polling intervals and jitter

mod poll;
mod reconcile;
mod scheduler;

pub use poll::PollConfig;
pub use reconcile::{
    ReconcileError, ReconcileSummary, Reconciler, ReconciliationSource, RemoteChange, SourceError,
};
pub use scheduler::{AutomationGate, PassSummary, Scheduler, SchedulerConfig};
