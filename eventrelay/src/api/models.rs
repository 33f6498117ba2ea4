use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Whether the persistent channel is currently connected
    pub connected: bool,
    /// Events waiting in the outbound queue
    pub queue_depth: usize,
}
