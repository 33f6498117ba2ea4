//! Event ingress.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};

use crate::AppState;
use crate::api::models::AcceptedResponse;
use crate::errors::{Error, Result};
use crate::events::Event;

/// Accept one event and fan it out. Delivery happens in the background.
#[tracing::instrument(skip_all)]
pub async fn publish_event(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Event>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>)> {
    let Json(event) = payload.map_err(|e| Error::BadRequest {
        message: format!("Invalid event: {}", e.body_text()),
    })?;

    tracing::debug!(event_type = %event.event_type, session = %event.session, "Accepted event");
    state.publisher.publish(event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
        }),
    ))
}
