//! Persistent channel publisher.
//!
//! ```text
//! connect(timeout)
//!   └─ establish()                       // backoff: reconnect_delay, ×2, capped
//!        ├─ Connecting:     connect_async(url)
//!        ├─ Authenticating: protocol::authenticate()
//!        └─ install()                    // Connected, generation += 1
//!             ├─ spawn write_loop        // queue → sink
//!             └─ spawn heartbeat_loop    // ping, read deadline, owns the stream half
//!
//! write/heartbeat failure → mark_lost(generation)
//!   └─ spawn reconnect loop (at most one) → establish() → install()
//! ```
//!
//! All bookkeeping lives in one `parking_lot::Mutex<State>` that is only held for
//! short, non-async sections. Socket writes are serialized by the sink's own async
//! mutex. Every live connection gets a child of the publisher's shutdown token, so
//! cancelling the publisher stops every loop, and losing a connection stops only
//! that connection's loops.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::channel::ConnectionState;
use crate::channel::protocol::{self, WsStream};
use crate::channel::queue::OutboundQueue;
use crate::config::ChannelConfig;
use crate::errors::{Error, Result};
use crate::events::Event;

/// Publishes events over one long-lived authenticated WebSocket.
///
/// Cheap to clone; clones share the same connection and queue.
#[derive(Clone)]
pub struct ChannelPublisher {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    api_key: String,
    config: ChannelConfig,
    queue: OutboundQueue,
    state: Mutex<State>,
}

struct State {
    status: ConnectionState,
    connection: Option<Arc<Connection>>,
    /// Bumped on every successful install, so stale loops can't tear down a newer connection
    generation: u64,
    reconnecting: bool,
    /// Caller-driven `connect` calls still running
    connecting: usize,
    shutdown: CancellationToken,
    /// Bumped by every `disconnect`; reconnect loops from an earlier epoch leave the flags alone
    epoch: u64,
    loops: Vec<JoinHandle<()>>,
}

impl State {
    /// Bookkeeping when a reconnect cycle started in `epoch` ends. Returns true if the
    /// connection was lost again meanwhile and the loop has to go round once more.
    fn reconnect_finished(&mut self, epoch: u64, established: bool) -> bool {
        if epoch != self.epoch {
            return false;
        }
        let lost = established && self.status != ConnectionState::Connected && !self.shutdown.is_cancelled();
        if !lost {
            self.reconnecting = false;
        }
        lost
    }
}

/// Marks a `connect` call in flight so `disconnect` knows to cancel it.
struct InFlight<'a>(&'a Inner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.connecting = state.connecting.saturating_sub(1);
    }
}

struct Connection {
    generation: u64,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    /// Stops this connection's loops
    cancel: CancellationToken,
    /// Publisher shutdown token this connection was opened under
    shutdown: CancellationToken,
}

/// Attempt bookkeeping for one connect/reconnect cycle.
#[derive(Default)]
struct Progress {
    attempts: u32,
    last_error: Option<Error>,
}

impl Progress {
    fn into_error(self) -> Error {
        Error::ConnectionFailed {
            attempts: self.attempts,
            source: Box::new(self.last_error.unwrap_or(Error::Cancelled)),
        }
    }

    fn cancelled(self) -> Error {
        Error::ConnectionFailed {
            attempts: self.attempts,
            source: Box::new(Error::Cancelled),
        }
    }
}

impl ChannelPublisher {
    pub fn new(url: Url, api_key: impl Into<String>, config: ChannelConfig) -> Self {
        let queue = OutboundQueue::new(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                url,
                api_key: api_key.into(),
                config,
                queue,
                state: Mutex::new(State {
                    status: ConnectionState::Disconnected,
                    connection: None,
                    generation: 0,
                    reconnecting: false,
                    connecting: 0,
                    shutdown: CancellationToken::new(),
                    epoch: 0,
                    loops: Vec::new(),
                }),
            }),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("channel.url is not configured"))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("channel.api_key is not configured"))?;
        Ok(Self::new(url, api_key, config.clone()))
    }

    /// Connect and authenticate, retrying with exponential backoff.
    ///
    /// Returns immediately if already connected. Fails with [`Error::ConnectionFailed`]
    /// once the attempt budget is spent, `timeout` passes, or the publisher is shut down.
    /// Calling this after [`disconnect`](Self::disconnect) starts the publisher again.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        let shutdown = {
            let mut state = self.inner.state.lock();
            if state.status == ConnectionState::Connected {
                return Ok(());
            }
            if state.shutdown.is_cancelled() {
                state.shutdown = CancellationToken::new();
            }
            state.connecting += 1;
            state.shutdown.clone()
        };
        let _in_flight = InFlight(&self.inner);

        let mut progress = Progress::default();
        let result = tokio::time::timeout(timeout, self.inner.establish(&shutdown, &mut progress)).await;

        match result {
            Ok(result) => result,
            Err(_) => {
                self.inner.transition(ConnectionState::Disconnected);
                warn!(url = %self.inner.url, attempts = progress.attempts, ?timeout, "Timed out connecting to event channel");
                Err(progress.into_error())
            }
        }
    }

    /// Enqueue an event for delivery. Never blocks; evicts the oldest queued event when full.
    pub fn enqueue(&self, event: Event) {
        if let Some(dropped) = self.inner.queue.push(event) {
            counter!("eventrelay_channel_events_dropped_total", "reason" => "overflow").increment(1);
            debug!(
                event_type = %dropped.event_type,
                session = %dropped.session,
                capacity = self.inner.queue.capacity(),
                "Outbound queue full, dropped oldest event"
            );
        }
    }

    /// Stop all loops, give the write loop until `timeout` to flush, then close the socket.
    pub async fn disconnect(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        let (connection, mut loops) = {
            let mut state = self.inner.state.lock();
            if state.status == ConnectionState::Disconnected && !state.reconnecting && state.connecting == 0 {
                return Ok(());
            }
            state.shutdown.cancel();
            state.epoch += 1;
            state.status = ConnectionState::Disconnected;
            state.reconnecting = false;
            (state.connection.take(), std::mem::take(&mut state.loops))
        };

        if tokio::time::timeout_at(deadline, futures::future::join_all(loops.iter_mut()))
            .await
            .is_err()
        {
            warn!("Timed out waiting for event channel loops to stop");
            for handle in &loops {
                handle.abort();
            }
        }

        if let Some(connection) = connection {
            let close = async {
                let mut sink = connection.sink.lock().await;
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "Close frame not sent, connection already gone");
                }
                let _ = sink.close().await;
            };
            if tokio::time::timeout_at(deadline, close).await.is_err() {
                debug!("Timed out closing event channel socket");
            }
        }

        info!(url = %self.inner.url, pending = self.inner.queue.len(), "Event channel disconnected");
        Ok(())
    }

    /// Keep trying to connect in the background after a failed initial `connect`.
    pub fn reconnect_in_background(&self) {
        let (shutdown, epoch) = {
            let mut state = self.inner.state.lock();
            if state.status == ConnectionState::Connected || state.reconnecting {
                return;
            }
            if state.shutdown.is_cancelled() {
                state.shutdown = CancellationToken::new();
            }
            state.reconnecting = true;
            (state.shutdown.clone(), state.epoch)
        };
        self.inner.spawn_reconnect(shutdown, epoch);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().status == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().status
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }
}

impl Inner {
    /// Move to `to` unless a connection is live. Only `install`, `mark_lost` and
    /// `disconnect` move in or out of `Connected`.
    fn transition(&self, to: ConnectionState) {
        let mut state = self.state.lock();
        if state.status != ConnectionState::Connected {
            state.status = to;
        }
    }

    async fn establish(self: &Arc<Self>, shutdown: &CancellationToken, progress: &mut Progress) -> Result<()> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut delay = self.config.reconnect_delay;

        loop {
            if shutdown.is_cancelled() {
                return Err(std::mem::take(progress).cancelled());
            }
            if self.state.lock().status == ConnectionState::Connected {
                return Ok(());
            }

            progress.attempts += 1;
            counter!("eventrelay_channel_connect_attempts_total").increment(1);
            self.transition(ConnectionState::Connecting);
            debug!(url = %self.url, attempt = progress.attempts, "Connecting to event channel");

            let attempt = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.transition(ConnectionState::Disconnected);
                    return Err(std::mem::take(progress).cancelled());
                }
                result = self.open() => result,
            };

            match attempt {
                Ok(ws) => {
                    if let Some(mut rejected) = self.install(ws, shutdown) {
                        let _ = tokio::time::timeout(self.config.handshake_timeout, rejected.close(None)).await;
                        if shutdown.is_cancelled() {
                            return Err(std::mem::take(progress).cancelled());
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.transition(ConnectionState::Disconnected);
                    warn!(url = %self.url, attempt = progress.attempts, error = %e, "Event channel connection attempt failed");
                    progress.last_error = Some(e);

                    if max_attempts > 0 && progress.attempts >= max_attempts {
                        error!(url = %self.url, attempts = progress.attempts, "Giving up on event channel connection");
                        return Err(std::mem::take(progress).into_error());
                    }
                }
            }

            debug!(?delay, "Waiting before next event channel connection attempt");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    return Err(std::mem::take(progress).cancelled());
                }
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }
    }

    /// Dial and authenticate one socket.
    async fn open(&self) -> Result<WsStream> {
        let timeout = self.config.handshake_timeout;

        let (mut ws, _response) = tokio::time::timeout(timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::Handshake {
                message: format!("websocket open timed out after {timeout:?}"),
            })??;

        self.transition(ConnectionState::Authenticating);

        if let Err(e) = protocol::authenticate(&mut ws, &self.api_key, timeout).await {
            let _ = tokio::time::timeout(timeout, ws.close(None)).await;
            return Err(e);
        }

        Ok(ws)
    }

    /// Make `ws` the live connection and start its loops.
    ///
    /// Hands the socket back if another connection won the race or the publisher is
    /// shutting down.
    fn install(self: &Arc<Self>, ws: WsStream, shutdown: &CancellationToken) -> Option<WsStream> {
        let mut state = self.state.lock();
        if state.status == ConnectionState::Connected || shutdown.is_cancelled() {
            return Some(ws);
        }

        state.generation += 1;
        let (sink, stream) = ws.split();
        let connection = Arc::new(Connection {
            generation: state.generation,
            sink: tokio::sync::Mutex::new(sink),
            cancel: shutdown.child_token(),
            shutdown: shutdown.clone(),
        });

        state.connection = Some(connection.clone());
        state.status = ConnectionState::Connected;
        state.loops = vec![
            tokio::spawn(write_loop(self.clone(), connection.clone())),
            tokio::spawn(heartbeat_loop(self.clone(), connection, stream)),
        ];

        info!(url = %self.url, generation = state.generation, "Event channel connected");
        None
    }

    /// Tear down connection `generation` and start reconnecting. Stale generations are ignored.
    fn mark_lost(self: &Arc<Self>, generation: u64) {
        let (connection, reconnect) = {
            let mut state = self.state.lock();
            if !matches!(&state.connection, Some(c) if c.generation == generation) {
                return;
            }
            let connection = state.connection.take();
            state.status = ConnectionState::Disconnected;

            let reconnect = !state.shutdown.is_cancelled() && !state.reconnecting;
            if reconnect {
                state.reconnecting = true;
            }
            (connection, reconnect.then(|| (state.shutdown.clone(), state.epoch)))
        };

        if let Some(connection) = connection {
            connection.cancel.cancel();
        }
        counter!("eventrelay_channel_disconnects_total").increment(1);
        warn!(url = %self.url, generation, "Event channel connection lost");

        if let Some((shutdown, epoch)) = reconnect {
            self.spawn_reconnect(shutdown, epoch);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, shutdown: CancellationToken, epoch: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                let mut progress = Progress::default();
                let result = inner.establish(&shutdown, &mut progress).await;
                if let Err(e) = &result {
                    error!(url = %inner.url, error = %e, "Event channel reconnect stopped");
                }

                let again = inner.state.lock().reconnect_finished(epoch, result.is_ok());
                if !again {
                    return;
                }
            }
        });
    }

    /// Send one event.
    ///
    /// A retryable error means the socket is unusable; the event has been put back (if
    /// there is room). Any other error means the event itself was bad and is dropped.
    async fn send_event(&self, connection: &Connection, event: Event) -> Result<()> {
        let result = match event.to_json() {
            Ok(text) => connection
                .sink
                .lock()
                .await
                .send(Message::text(text))
                .await
                .map_err(Error::from),
            Err(e) => Err(Error::from(e)),
        };

        match result {
            Ok(()) => {
                counter!("eventrelay_channel_events_sent_total").increment(1);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, generation = connection.generation, "Failed to write event to channel");
                if !self.queue.requeue(event) {
                    counter!("eventrelay_channel_events_dropped_total", "reason" => "requeue").increment(1);
                }
                Err(e)
            }
            Err(e) => {
                counter!("eventrelay_channel_events_dropped_total", "reason" => "invalid").increment(1);
                error!(error = %e, event_type = %event.event_type, "Dropping event that cannot be sent");
                Err(e)
            }
        }
    }
}

async fn write_loop(inner: Arc<Inner>, connection: Arc<Connection>) {
    trace!(generation = connection.generation, "Write loop started");

    loop {
        while let Some(event) = inner.queue.pop() {
            match inner.send_event(&connection, event).await {
                Err(e) if e.is_retryable() => {
                    inner.mark_lost(connection.generation);
                    return;
                }
                _ => {}
            }
        }

        tokio::select! {
            biased;
            _ = connection.cancel.cancelled() => break,
            _ = inner.queue.notified() => {}
        }
    }

    // Cancelled. Only flush when the whole publisher is shutting down.
    if connection.shutdown.is_cancelled() {
        let pending = inner.queue.len();
        let mut flushed = 0;
        for _ in 0..pending {
            let Some(event) = inner.queue.pop() else { break };
            match inner.send_event(&connection, event).await {
                Ok(()) => flushed += 1,
                Err(e) if e.is_retryable() => break,
                Err(_) => {}
            }
        }
        debug!(flushed, pending, "Flushed outbound queue on shutdown");
    }

    trace!(generation = connection.generation, "Write loop exited");
}

async fn heartbeat_loop(inner: Arc<Inner>, connection: Arc<Connection>, mut stream: SplitStream<WsStream>) {
    let ping_interval = inner.config.ping_interval;
    let pong_timeout = inner.config.pong_timeout;

    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let read_deadline = tokio::time::sleep(ping_interval + pong_timeout);
    tokio::pin!(read_deadline);

    loop {
        tokio::select! {
            biased;
            _ = connection.cancel.cancelled() => return,

            _ = ticker.tick() => {
                let ping = async { connection.sink.lock().await.send(Message::Ping(Default::default())).await };
                match tokio::time::timeout(pong_timeout, ping).await {
                    Ok(Ok(())) => trace!(generation = connection.generation, "Sent ping"),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Failed to send ping");
                        break;
                    }
                    Err(_) => {
                        warn!(?pong_timeout, "Ping write timed out");
                        break;
                    }
                }
            }

            _ = &mut read_deadline => {
                warn!(?pong_timeout, "No pong received from event channel");
                break;
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Pong(_))) => {
                    read_deadline.as_mut().reset(Instant::now() + pong_timeout + ping_interval);
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Event channel closed by peer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Event channel read failed");
                    break;
                }
                None => {
                    warn!("Event channel stream ended");
                    break;
                }
            },
        }
    }

    inner.mark_lost(connection.generation);
}
