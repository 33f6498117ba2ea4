//! Domain event model shared by every transport.
//!
//! Events are produced by the upstream session client and consumed read-only here.
//! On the wire they are JSON objects:
//!
//! ```json
//! {"type":"message.received","session":"alice","timestamp":"2024-01-01T00:00:00Z","payload":{...}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types emitted by the upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.delivered")]
    MessageDelivered,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "presence.updated")]
    PresenceUpdated,
    /// Session finished logging in and is online
    #[serde(rename = "session.connected")]
    SessionConnected,
    /// Session lost its upstream connection (may come back)
    #[serde(rename = "session.disconnected")]
    SessionDisconnected,
    /// Session was logged out and needs re-pairing
    #[serde(rename = "session.logged_out")]
    SessionLoggedOut,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        Self::MessageReceived,
        Self::MessageSent,
        Self::MessageDelivered,
        Self::MessageRead,
        Self::PresenceUpdated,
        Self::SessionConnected,
        Self::SessionDisconnected,
        Self::SessionLoggedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message.received",
            Self::MessageSent => "message.sent",
            Self::MessageDelivered => "message.delivered",
            Self::MessageRead => "message.read",
            Self::PresenceUpdated => "presence.updated",
            Self::SessionConnected => "session.connected",
            Self::SessionDisconnected => "session.disconnected",
            Self::SessionLoggedOut => "session.logged_out",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// A single domain occurrence to deliver to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Upstream session the event belongs to
    pub session: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque, producer-defined body
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: EventType, session: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            session: session.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
