//! Liveness endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::AppState;
use crate::worker::AutomationGate;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub automation: AutomationGate,
}

/// `GET /health`: always 200 while the server is accepting connections.
pub async fn health_handler(State(app_state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        automation: app_state.gate(),
    })
}
