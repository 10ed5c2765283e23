//! Operational endpoints over the event queue.
//!
//! - `GET /api/v1/queue/stats` - counts per status
//! - `GET /api/v1/queue/recent?limit=N` - most recently updated events
//! - `POST /api/v1/queue/retry-failed` - reset failed events to `pending`
//!
//! The retry body is optional: `{"ids": ["<event id>", ...]}` restricts the
//! reset to those events; an empty body retries every failed event.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::AppState;
use crate::store::{QueueStats, StoreError};
use crate::types::{Event, EventId};

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum QueueApiError {
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for QueueApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueueApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            QueueApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub async fn stats_handler(State(app_state): State<AppState>) -> Json<QueueStats> {
    Json(app_state.store().stats())
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

pub async fn recent_handler(
    State(app_state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Json<Vec<Event>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    Json(app_state.store().recent_activity(limit))
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    ids: Option<Vec<EventId>>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryResponse {
    pub retried: usize,
}

pub async fn retry_failed_handler(
    State(app_state): State<AppState>,
    body: Bytes,
) -> Result<Json<RetryResponse>, QueueApiError> {
    let ids = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<RetryRequest>(&body)?.ids
    };

    let retried = app_state.store().retry_failed(ids.as_deref())?;
    info!(retried, selected = ids.as_ref().map(Vec::len), "Manual retry of failed events");
    Ok(Json(RetryResponse { retried }))
}
