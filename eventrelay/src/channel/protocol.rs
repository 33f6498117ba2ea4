//! Wire protocol of the persistent channel.
//!
//! After the socket opens the client sends exactly one auth frame and reads exactly one
//! data frame back:
//!
//! ```text
//! → {"type":"auth","api_key":"<credential>"}
//! ← {"type":"auth_response","success":true,"message":"..."}
//! ```
//!
//! Everything after that is JSON-encoded events as text frames, plus ping/pong control
//! frames.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::errors::{Error, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const AUTH_TYPE: &str = "auth";
pub const AUTH_RESPONSE_TYPE: &str = "auth_response";

#[derive(Debug, Serialize)]
pub struct AuthRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub api_key: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Run the auth exchange on a freshly opened socket.
///
/// Control frames that arrive before the response are skipped. Any other frame, a
/// negative acknowledgement, or no answer within `timeout` fails the handshake.
pub async fn authenticate<S>(ws: &mut S, api_key: &str, timeout: Duration) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let request = serde_json::to_string(&AuthRequest {
        kind: AUTH_TYPE,
        api_key,
    })?;
    ws.send(Message::text(request)).await?;

    let response = tokio::time::timeout(timeout, read_response(ws))
        .await
        .map_err(|_| Error::Handshake {
            message: format!("no auth response within {timeout:?}"),
        })??;

    if response.kind != AUTH_RESPONSE_TYPE {
        return Err(Error::Handshake {
            message: format!("unexpected response type '{}'", response.kind),
        });
    }
    if !response.success {
        let message = if response.message.is_empty() {
            "authentication rejected".to_string()
        } else {
            response.message
        };
        return Err(Error::Handshake { message });
    }

    Ok(())
}

async fn read_response<S>(ws: &mut S) -> Result<AuthResponse>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = match ws.next().await {
            Some(frame) => frame?,
            None => {
                return Err(Error::Handshake {
                    message: "connection closed before auth response".to_string(),
                });
            }
        };

        let text = match frame {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            Message::Close(frame) => {
                return Err(Error::Handshake {
                    message: format!("connection closed during auth: {frame:?}"),
                });
            }
        };

        return serde_json::from_str(&text).map_err(|e| Error::Handshake {
            message: format!("malformed auth response: {e}"),
        });
    }
}
