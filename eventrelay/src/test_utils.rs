//! Shared helpers for unit tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use crate::dispatcher::Publisher;
use crate::errors::{Error, Result};
use crate::events::Event;

/// reqwest is built without a bundled crypto provider.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Records published events; optionally fails or stalls.
#[derive(Default)]
pub struct FakePublisher {
    pub published: Mutex<Vec<Event>>,
    pub fail: bool,
    pub stall: Option<Duration>,
    pub connected: AtomicBool,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        self.published.lock().push(event);
        if self.fail {
            return Err(Error::DeliveryRejected { status: 410 });
        }
        Ok(())
    }

    async fn connect(&self, _timeout: Duration) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn queue_depth(&self) -> usize {
        self.published.lock().len()
    }
}

/// How the mock peer treats one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Accept auth, record every data frame, answer pings
    Serve,
    /// Answer auth with `success: false`
    RejectAuth,
    /// Accept auth, then drop the socket without a close frame
    DropAfterAuth,
    /// Accept auth, then never read again (no pongs)
    Stall,
}

#[derive(Default)]
struct Recorded {
    api_keys: Mutex<Vec<String>>,
    received: Mutex<Vec<String>>,
    close_codes: Mutex<Vec<Option<CloseCode>>>,
    connections: AtomicUsize,
}

/// In-process WebSocket peer speaking the channel auth protocol.
pub struct MockChannelServer {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
}

impl MockChannelServer {
    /// Start on an ephemeral port. Connections take behaviors from `script` in order,
    /// then `fallback`.
    pub async fn start(script: Vec<PeerBehavior>, fallback: PeerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Recorded::default());
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let server_recorded = recorded.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server_recorded.connections.fetch_add(1, Ordering::SeqCst);
                let behavior = script.lock().pop_front().unwrap_or(fallback);
                tokio::spawn(serve_connection(stream, behavior, server_recorded.clone()));
            }
        });

        Self { addr, recorded }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/events", self.addr)).unwrap()
    }

    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    pub fn api_keys(&self) -> Vec<String> {
        self.recorded.api_keys.lock().clone()
    }

    /// Data frames received after authentication
    pub fn received(&self) -> Vec<String> {
        self.recorded.received.lock().clone()
    }

    pub fn close_codes(&self) -> Vec<Option<CloseCode>> {
        self.recorded.close_codes.lock().clone()
    }
}

async fn serve_connection(stream: TcpStream, behavior: PeerBehavior, recorded: Arc<Recorded>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    let Some(Ok(Message::Text(auth))) = ws.next().await else {
        return;
    };
    let auth: serde_json::Value = serde_json::from_str(auth.as_str()).unwrap_or_default();
    recorded
        .api_keys
        .lock()
        .push(auth["api_key"].as_str().unwrap_or_default().to_string());

    let response = match behavior {
        PeerBehavior::RejectAuth => serde_json::json!({"type": "auth_response", "success": false, "message": "bad key"}),
        _ => serde_json::json!({"type": "auth_response", "success": true, "message": "ok"}),
    };
    if ws.send(Message::text(response.to_string())).await.is_err() {
        return;
    }

    match behavior {
        PeerBehavior::RejectAuth => {
            let _ = ws.close(None).await;
        }
        PeerBehavior::DropAfterAuth => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(ws);
        }
        PeerBehavior::Stall => {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        PeerBehavior::Serve => {
            while let Some(frame) = ws.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        recorded.received.lock().push(text.as_str().to_string());
                    }
                    Ok(Message::Close(frame)) => {
                        recorded.close_codes.lock().push(frame.map(|f| f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }
}
