//! Persistent, authenticated WebSocket transport.
//!
//! - [`protocol`]: auth frame exchange
//! - [`queue`]: drop-oldest outbound buffer
//! - [`publisher`]: connection lifecycle, write/heartbeat/reconnect loops

pub mod protocol;
pub mod publisher;
pub mod queue;

pub use publisher::ChannelPublisher;
pub use queue::OutboundQueue;

use serde::Serialize;

/// Lifecycle of the channel connection.
///
/// `Disconnected → Connecting → Authenticating → Connected`; any failure drops back to
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}
