use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;
use tokio_tungstenite::tungstenite;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Dial or handshake attempts were exhausted, or the caller's deadline passed
    #[error("Failed to connect to event channel after {attempts} attempt(s)")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The peer rejected the credential or answered with something other than an auth acknowledgement
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    /// Transport-level WebSocket failure
    #[error(transparent)]
    WebSocket(Box<tungstenite::Error>),

    /// Operation needs a live connection and there is none
    #[error("Event channel is not connected")]
    Disconnected,

    /// Event could not be encoded; never retried
    #[error("Failed to serialize event")]
    Serialization(#[from] serde_json::Error),

    /// Webhook endpoint answered with a 4xx; treated as permanent
    #[error("Webhook endpoint rejected delivery with HTTP {status}")]
    DeliveryRejected { status: u16 },

    /// Webhook retries ran out
    #[error("Webhook delivery failed after {attempts} attempt(s): {error}")]
    DeliveryExhausted {
        attempts: u32,
        status: Option<u16>,
        error: String,
    },

    /// Aborted by shutdown or by the caller's deadline
    #[error("Operation cancelled")]
    Cancelled,

    /// Ingress request refused by the rate limiter
    #[error("Rate limit exceeded, retry in {retry_after}s")]
    RateLimited { retry_after: u64 },

    /// Invalid ingress payload
    #[error("{message}")]
    BadRequest { message: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Error::Disconnected,
            err => Error::WebSocket(Box::new(err)),
        }
    }
}

impl Error {
    /// Whether the operation that produced this error may be retried. For a channel write
    /// that means the event is kept and the connection is re-established.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Serialization(_) | Error::DeliveryRejected { .. } | Error::Cancelled | Error::BadRequest { .. }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::BadRequest { .. } | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::Disconnected | Error::ConnectionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DeliveryRejected { .. } | Error::DeliveryExhausted { .. } => StatusCode::BAD_GATEWAY,
            Error::Handshake { .. } | Error::WebSocket(_) | Error::Cancelled | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::RateLimited { retry_after } => {
                format!("Rate limit exceeded. Try again in {retry_after} seconds.")
            }
            Error::BadRequest { message } => message.clone(),
            Error::Serialization(e) => format!("Invalid event payload: {e}"),
            Error::Disconnected | Error::ConnectionFailed { .. } => "Event channel unavailable".to_string(),
            Error::DeliveryRejected { .. } | Error::DeliveryExhausted { .. } => "Upstream delivery failed".to_string(),
            Error::Handshake { .. } | Error::WebSocket(_) | Error::Cancelled | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Other(_) | Error::WebSocket(_) | Error::Handshake { .. } | Error::Cancelled => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Disconnected | Error::ConnectionFailed { .. } | Error::DeliveryRejected { .. } | Error::DeliveryExhausted { .. } => {
                tracing::warn!("Delivery error: {}", self);
            }
            Error::RateLimited { .. } => {
                tracing::debug!("Rate limited: {}", self);
            }
            Error::BadRequest { .. } | Error::Serialization(_) => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let body = json!({ "message": self.user_message() });
        let mut response = (status, axum::response::Json(body)).into_response();

        if let Error::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }

        response
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = Error::RateLimited { retry_after: 3 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }

    #[test]
    fn test_retry_classification() {
        assert!(!Error::DeliveryRejected { status: 404 }.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::Disconnected.is_retryable());
        assert!(
            Error::DeliveryExhausted {
                attempts: 3,
                status: Some(500),
                error: "HTTP 500".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_closed_socket_maps_to_disconnected() {
        assert!(matches!(Error::from(tungstenite::Error::ConnectionClosed), Error::Disconnected));
        assert!(matches!(Error::from(tungstenite::Error::AlreadyClosed), Error::Disconnected));
        assert!(matches!(
            Error::from(tungstenite::Error::Io(std::io::ErrorKind::BrokenPipe.into())),
            Error::WebSocket(_)
        ));

        let encode = serde_json::from_str::<u8>("not json").unwrap_err();
        assert!(!Error::from(encode).is_retryable());
    }

    #[test]
    fn test_connection_failed_keeps_source() {
        let err = Error::ConnectionFailed {
            attempts: 2,
            source: Box::new(Error::Handshake {
                message: "bad key".to_string(),
            }),
        };
        let source = std::error::Error::source(&err).expect("source should be kept");
        assert!(source.to_string().contains("bad key"));
    }
}
