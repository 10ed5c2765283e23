//! The ordered, retrying event queue.
//!
//! Events flow through these pieces in order:
//!
//! ```text
//! NewEvent ─► Deduplicator ─► EventStore (pending)
//!                                 │
//!        prerequisites::is_ready ─┤
//!                                 ▼
//!                            Dispatcher ─► handler (UnitOfWork) ─► LocalStore
//!                                 │
//!                                 ▼
//!                          RetryController ─► reschedule / failed + TerminalFailure
//! ```

pub mod dedupe;
pub mod dispatch;
pub mod handler;
pub mod local;
pub mod prerequisites;
pub mod retry;

pub use dedupe::{Admission, Deduplicator};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use handler::{
    EventHandler, HandlerError, HandlerErrorKind, HandlerRegistry, HandlerRegistryBuilder,
};
pub use local::{LocalStore, UnitOfWork};
pub use prerequisites::CompletionIndex;
pub use retry::{BackoffSchedule, RetryController, RetryPolicy, TerminalFailure};
