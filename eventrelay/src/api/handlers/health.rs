use axum::{Json, extract::State};

use crate::AppState;
use crate::api::models::HealthResponse;

/// Liveness. Stays 200 while the channel is down; `connected` reports its state.
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connected: state.publisher.is_connected(),
        queue_depth: state.publisher.queue_depth(),
    })
}
