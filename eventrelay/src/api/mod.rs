//! HTTP ingress.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Response bodies
//!
//! Routes:
//!
//! - `POST /v1/events`: hand one event to the dispatcher (rate limited when enabled)
//! - `GET /healthz`: liveness plus channel status

pub mod handlers;
pub mod models;
