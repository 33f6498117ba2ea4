//! Axum route handlers.

pub mod events;
pub mod health;
