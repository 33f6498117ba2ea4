//! # eventrelay: reliable event fan-out with ingress rate limiting
//!
//! `eventrelay` takes domain events produced by an upstream session client (messages
//! received and sent, receipts, presence, session lifecycle) and delivers them to external
//! subscribers over two independent transports, while shielding its own ingress from
//! overload.
//!
//! ## Transports
//!
//! The **persistent channel** ([`channel`]) is one long-lived WebSocket to a downstream
//! consumer. It authenticates with an API key, keeps the connection alive with pings, and
//! reconnects with exponential backoff when the connection drops. Events are buffered in a
//! bounded queue that drops the oldest entry when full, so a slow or absent consumer costs
//! memory proportional to the queue capacity and nothing more.
//!
//! The **webhook** ([`webhooks`]) POSTs each event as JSON, signed with HMAC-SHA256 when a
//! secret is configured. Server errors and network failures are retried on a fixed
//! schedule; client errors are not. Every terminal outcome is written to an audit sink.
//!
//! The [`dispatcher`] fans each event out to both. The channel enqueue is synchronous;
//! each webhook delivery runs detached, so webhook latency never reaches the caller.
//!
//! ## Ingress
//!
//! Producers hand events in over HTTP (`POST /v1/events`). The route is guarded by a
//! per-key token bucket limiter ([`limits`]) when `rate_limit.enabled` is set.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use eventrelay::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = eventrelay::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     eventrelay::telemetry::init_telemetry(config.log_format)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod limits;
pub mod telemetry;
pub mod webhooks;

#[cfg(test)]
mod test_utils;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, warn};

pub use channel::{ChannelPublisher, ConnectionState};
pub use config::Config;
pub use dispatcher::{EventDispatcher, Publisher};
pub use errors::{Error, Result};
pub use events::{Event, EventType};
pub use limits::{Limiters, RateLimiter, Reservation};
pub use webhooks::{AuditSink, DeliveryRecord, TracingAuditSink, WebhookPublisher};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Where accepted events go; the dispatcher in production
    pub publisher: Arc<dyn Publisher>,
    pub limiters: Limiters,
}

/// Build the ingress router.
pub fn build_router(state: AppState) -> Router {
    let mut ingress = Router::new().route("/v1/events", post(api::handlers::events::publish_event));
    if let Some(limiter) = state.limiters.ingress.clone() {
        ingress = ingress.layer(from_fn_with_state(limiter, limits::rate_limit_middleware));
    }

    Router::new()
        .merge(ingress)
        .route("/healthz", get(api::handlers::health::healthz))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// The assembled service: ingress router, dispatcher and both transports.
pub struct Application {
    router: Router,
    config: Config,
    channel: ChannelPublisher,
    limiters: Limiters,
    shutdown: CancellationToken,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting eventrelay with configuration: {:#?}", config);

        // Cancelled on shutdown; stops webhook retries in flight
        let shutdown = CancellationToken::new();

        let channel = ChannelPublisher::from_config(&config.channel)?;
        let webhook = WebhookPublisher::from_config(&config.webhook, Arc::new(TracingAuditSink), shutdown.clone())?;
        match &webhook {
            Some(webhook) => info!(url = %webhook.url(), "Webhook delivery enabled"),
            None => info!("Webhook delivery disabled"),
        }

        let dispatcher = EventDispatcher::with_transports(channel.clone(), webhook);
        let limiters = Limiters::new(&config.rate_limit)?;

        let router = build_router(AppState {
            publisher: Arc::new(dispatcher),
            limiters: limiters.clone(),
        });

        Ok(Self {
            router,
            config,
            channel,
            limiters,
            shutdown,
        })
    }

    /// Connect the channel in the background. If the first attempt cycle fails, keep
    /// retrying until shutdown.
    fn start_channel(&self) {
        let channel = self.channel.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.config.channel.connect_timeout;

        tokio::spawn(async move {
            if let Err(e) = channel.connect(timeout).await {
                if shutdown.is_cancelled() {
                    return;
                }
                warn!(error = %e, "Initial event channel connection failed, retrying in background");
                channel.reconnect_in_background();
            }
        });
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, ChannelPublisher) {
        self.start_channel();
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.channel)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("eventrelay listening on http://{}", bind_addr);

        self.start_channel();

        // Run the server with graceful shutdown
        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Stopping event delivery...");
        self.shutdown.cancel();
        if let Err(e) = self.channel.disconnect(self.config.channel.shutdown_timeout).await {
            warn!(error = %e, "Failed to disconnect event channel cleanly");
        }
        self.limiters.stop();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::test_utils::{MockChannelServer, PeerBehavior, install_crypto_provider, wait_until};

    fn config(channel: &MockChannelServer, webhook: &MockServer) -> Config {
        let mut config = Config::default();
        config.channel.url = Some(channel.url());
        config.channel.api_key = Some("sk-relay".to_string());
        config.channel.ping_interval = Duration::from_millis(200);
        config.channel.pong_timeout = Duration::from_millis(200);
        config.webhook.url = Some(format!("{}/hooks/events", webhook.uri()).parse().unwrap());
        config.webhook.secret = Some("whsec".to_string());
        config.webhook.events = vec![EventType::MessageReceived];
        config
    }

    /// Full stack: ingress → dispatcher → channel and webhook
    #[test_log::test(tokio::test)]
    async fn test_event_reaches_both_transports() {
        install_crypto_provider();
        let channel_server = MockChannelServer::start(vec![], PeerBehavior::Serve).await;
        let webhook_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("x-webhook-signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&webhook_server)
            .await;

        let app = Application::new(config(&channel_server, &webhook_server)).await.unwrap();
        let (server, channel) = app.into_test_server();
        assert!(wait_until(Duration::from_secs(5), || channel.is_connected()).await);

        let event = json!({
            "type": "message.received",
            "session": "alice",
            "timestamp": "2024-05-01T12:00:00Z",
            "payload": {"text": "hi"}
        });
        server.post("/v1/events").json(&event).await.assert_status(StatusCode::ACCEPTED);

        // Filtered out of the webhook by the allow-list, still sent on the channel
        let presence = json!({
            "type": "presence.updated",
            "session": "alice",
            "timestamp": "2024-05-01T12:00:01Z",
            "payload": {"available": true}
        });
        server.post("/v1/events").json(&presence).await.assert_status(StatusCode::ACCEPTED);

        assert!(wait_until(Duration::from_secs(2), || channel_server.received().len() == 2).await);
        let first: Event = serde_json::from_str(&channel_server.received()[0]).unwrap();
        assert_eq!(first.event_type, EventType::MessageReceived);

        let mut delivered = Vec::new();
        for _ in 0..200 {
            delivered = webhook_server.received_requests().await.unwrap_or_default();
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered.len(), 1);
        let body: Event = serde_json::from_slice(&delivered[0].body).unwrap();
        assert_eq!(body.event_type, EventType::MessageReceived);

        let health: serde_json::Value = server.get("/healthz").await.json();
        assert_eq!(health["connected"], true);
        assert_eq!(health["queue_depth"], 0);

        channel.disconnect(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_requires_channel_url() {
        let err = Application::new(Config::default()).await.err().expect("should fail");
        assert!(err.to_string().contains("channel.url"));
    }
}
