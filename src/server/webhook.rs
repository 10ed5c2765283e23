//! Webhook endpoint handler.
//!
//! Verifies the delivery signature, parses the envelope, and admits the event
//! through the [`Deduplicator`](crate::queue::Deduplicator). Once the event
//! is durably stored it is dispatched inline; the dispatch outcome never
//! affects the status code.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, info, warn};

use super::AppState;
use crate::queue::Admission;
use crate::store::StoreError;
use crate::webhooks::{
    DELIVERY_HEADER, EVENT_HEADER, EnvelopeHeaders, IngestError, SIGNATURE_HEADER, parse_delivery,
    verify,
};

/// Errors that can occur when accepting a delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed delivery: {0}")]
    Malformed(#[from] IngestError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Malformed(_) => StatusCode::BAD_REQUEST,
            WebhookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `POST /webhook`
///
/// # Response
///
/// - 202 `Accepted`: stored as a new event
/// - 202 `Accepted (duplicate)`: delivery id already known, nothing stored
/// - 400 Bad Request: malformed envelope or unknown event type
/// - 401 Unauthorized: missing or invalid `X-WMS-Signature`
/// - 500 Internal Server Error: the store could not persist the event
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let envelope_headers = EnvelopeHeaders {
        delivery_id: header(&headers, DELIVERY_HEADER),
        event: header(&headers, EVENT_HEADER),
    };

    // Nothing is parsed or stored before the signature checks out.
    let signature = header(&headers, SIGNATURE_HEADER);
    if !verify(&body, signature.as_deref(), app_state.webhook_secret()) {
        warn!(
            delivery_id = envelope_headers.delivery_id.as_deref().unwrap_or("-"),
            "Invalid webhook signature"
        );
        return Err(WebhookError::InvalidSignature);
    }

    let incoming = parse_delivery(&envelope_headers, &body).inspect_err(|e| {
        warn!(
            delivery_id = envelope_headers.delivery_id.as_deref().unwrap_or("-"),
            error = %e,
            "Rejected malformed delivery"
        );
    })?;

    let admission = app_state.dedup().admit(incoming).inspect_err(|e| {
        error!(error = %e, "Failed to store delivery");
    })?;

    match admission {
        Admission::Accepted(event) => {
            info!(
                event_id = %event.id,
                delivery_id = %event.delivery_id,
                event_type = %event.event_type,
                entity_key = %event.entity_key,
                "Webhook accepted"
            );
            app_state.dispatch_now(event.id).await;
            Ok((StatusCode::ACCEPTED, "Accepted"))
        }
        Admission::Duplicate => Ok((StatusCode::ACCEPTED, "Accepted (duplicate)")),
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
