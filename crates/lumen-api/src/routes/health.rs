use axum::{extract::State, Json};
use lumen_client::CircuitState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Circuit state per downstream base URL contacted so far.
    pub services: BTreeMap<String, ServiceHealth>,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub circuit: &'static str,
    pub failure_count: u32,
}

/// Health check endpoint
///
/// Reports `degraded` while any downstream circuit is not closed.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut degraded = false;
    let services = state
        .gateway
        .breaker_snapshots()
        .into_iter()
        .map(|(service, snapshot)| {
            degraded |= snapshot.state != CircuitState::Closed;
            let health = ServiceHealth {
                circuit: snapshot.state.as_str(),
                failure_count: snapshot.failure_count,
            };
            (service, health)
        })
        .collect();

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services,
    })
}
