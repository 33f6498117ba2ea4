//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `EVENTRELAY_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `EVENTRELAY_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `EVENTRELAY_CHANNEL__API_KEY=secret` sets the `channel.api_key` field.
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port` - ingress HTTP binding
//! - **Logging**: `log_format` - `pretty` or `json`
//! - **Channel**: `channel.*` - persistent WebSocket publisher (url, credential, heartbeat, reconnect, queue)
//! - **Webhook**: `webhook.*` - signed HTTP delivery (url, secret, event allow-list, retry)
//! - **Rate limit**: `rate_limit.*` - ingress token buckets
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! EVENTRELAY_PORT=8080
//! EVENTRELAY_CHANNEL__URL=wss://events.example.com/ws
//! EVENTRELAY_WEBHOOK__SECRET=whsec
//! EVENTRELAY_RATE_LIMIT__ENABLED=true
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::errors::Error;
use crate::events::EventType;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "EVENTRELAY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Ingress HTTP host to bind to
    pub host: String,
    /// Ingress HTTP port to bind to
    pub port: u16,
    /// Log output format
    pub log_format: LogFormat,
    /// Persistent channel publisher
    pub channel: ChannelConfig,
    /// Webhook publisher
    pub webhook: WebhookConfig,
    /// Ingress rate limiting
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Persistent WebSocket channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// WebSocket URL of the downstream event consumer (`ws://` or `wss://`)
    pub url: Option<Url>,
    /// Credential sent in the auth frame
    pub api_key: Option<String>,
    /// Interval between keepalive pings (default: 30s)
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// How long to wait for a pong, also the ping write deadline (default: 10s)
    #[serde(with = "humantime_serde")]
    pub pong_timeout: Duration,
    /// Deadline for opening the socket, and separately for the auth acknowledgement (default: 10s)
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Initial delay between connection attempts, doubled after each failure (default: 1s)
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Ceiling for the reconnect delay (default: 10m)
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
    /// Maximum connection attempts per connect/reconnect cycle, 0 = unlimited (default: 0)
    pub max_reconnect_attempts: u32,
    /// Outbound queue capacity; the oldest event is dropped when full (default: 1000)
    pub queue_capacity: usize,
    /// Deadline for the initial connect at startup (default: 30s)
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Deadline for draining and closing on shutdown (default: 5s)
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(600),
            max_reconnect_attempts: 0,
            queue_capacity: 1000,
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Webhook delivery configuration.
///
/// Events are POSTed as JSON; when `secret` is set the body is signed with
/// HMAC-SHA256 and the hex digest is sent in `X-Webhook-Signature`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Endpoint to deliver to. Webhook delivery is disabled when unset.
    pub url: Option<Url>,
    /// Shared signing secret
    pub secret: Option<String>,
    /// Event types to deliver; empty means all
    pub events: Vec<EventType>,
    /// HTTP timeout per attempt (default: 30s)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Delay in seconds before each retry. The last entry is reused if there are
    /// more retries than entries.
    ///
    /// Default: [1, 2, 4]
    pub retry_schedule_secs: Vec<u64>,
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            events: Vec::new(),
            timeout: Duration::from_secs(30),
            retry_schedule_secs: vec![1, 2, 4],
            max_attempts: 3,
        }
    }
}

impl WebhookConfig {
    pub fn retry_schedule(&self) -> Vec<Duration> {
        self.retry_schedule_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }
}

/// Ingress rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Enable rate limiting of ingress requests (default: false)
    pub enabled: bool,
    /// Sustained requests per second per key (default: 10)
    pub requests_per_second: f64,
    /// Bucket capacity (default: 20)
    pub burst: u32,
    /// One bucket per client key; when false all clients share one bucket (default: true)
    pub per_key: bool,
    /// How often idle buckets are swept (default: 1m)
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Buckets unused for longer than this are removed (default: 3m)
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 10.0,
            burst: 20,
            per_key: true,
            cleanup_interval: Duration::from_secs(60),
            max_age: Duration::from_secs(180),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_format: LogFormat::default(),
            channel: ChannelConfig::default(),
            webhook: WebhookConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Error::BadRequest {
            message: format!("Config validation: {message}"),
        };

        let Some(url) = &self.channel.url else {
            return Err(invalid(
                "channel.url is not configured. Set EVENTRELAY_CHANNEL__URL or add channel.url to the config file.".to_string(),
            ));
        };
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid(format!("channel.url must use ws:// or wss://, got {}://", url.scheme())));
        }
        if self.channel.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(invalid("channel.api_key is not configured".to_string()));
        }
        if self.channel.queue_capacity == 0 {
            return Err(invalid("channel.queue_capacity must be greater than 0".to_string()));
        }
        if self.channel.ping_interval.is_zero() || self.channel.pong_timeout.is_zero() {
            return Err(invalid("channel.ping_interval and channel.pong_timeout must be non-zero".to_string()));
        }
        if self.channel.reconnect_delay > self.channel.max_reconnect_delay {
            return Err(invalid(format!(
                "channel.reconnect_delay ({:?}) cannot be greater than channel.max_reconnect_delay ({:?})",
                self.channel.reconnect_delay, self.channel.max_reconnect_delay
            )));
        }

        if let Some(url) = &self.webhook.url
            && !matches!(url.scheme(), "http" | "https")
        {
            return Err(invalid(format!("webhook.url must use http:// or https://, got {}://", url.scheme())));
        }
        if self.webhook.max_attempts == 0 {
            return Err(invalid("webhook.max_attempts must be at least 1".to_string()));
        }
        if self.webhook.max_attempts > 1 && self.webhook.retry_schedule_secs.is_empty() {
            return Err(invalid("webhook.retry_schedule_secs cannot be empty when retries are enabled".to_string()));
        }

        if self.rate_limit.enabled {
            if !(self.rate_limit.requests_per_second.is_finite() && self.rate_limit.requests_per_second > 0.0) {
                return Err(invalid(format!(
                    "rate_limit.requests_per_second must be a positive number, got {}",
                    self.rate_limit.requests_per_second
                )));
            }
            if Duration::try_from_secs_f64(1.0 / self.rate_limit.requests_per_second).is_err() {
                return Err(invalid(format!(
                    "rate_limit.requests_per_second is too small, got {}",
                    self.rate_limit.requests_per_second
                )));
            }
            if self.rate_limit.burst == 0 {
                return Err(invalid("rate_limit.burst must be at least 1".to_string()));
            }
            if self.rate_limit.cleanup_interval.is_zero() {
                return Err(invalid("rate_limit.cleanup_interval must be non-zero".to_string()));
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("EVENTRELAY_").split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args() -> Args {
        Args {
            config: "test.yaml".to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_channel_config_from_yaml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
channel:
  url: ws://localhost:9000/events
  api_key: sk-test
  ping_interval: 15s
  max_reconnect_delay: 2m
  max_reconnect_attempts: 5
webhook:
  url: https://hooks.example.com/in
  events: ["message.received", "session.connected"]
"#,
            )?;

            let config = Config::load(&args())?;

            assert_eq!(config.channel.url.as_ref().unwrap().as_str(), "ws://localhost:9000/events");
            assert_eq!(config.channel.ping_interval, Duration::from_secs(15));
            assert_eq!(config.channel.max_reconnect_delay, Duration::from_secs(120));
            assert_eq!(config.channel.max_reconnect_attempts, 5);
            // defaults
            assert_eq!(config.channel.pong_timeout, Duration::from_secs(10));
            assert_eq!(config.channel.queue_capacity, 1000);

            assert_eq!(
                config.webhook.events,
                vec![EventType::MessageReceived, EventType::SessionConnected]
            );
            assert_eq!(
                config.webhook.retry_schedule(),
                vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
            );
            assert!(!config.rate_limit.enabled);

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
channel:
  url: ws://localhost:9000/events
  api_key: from-file
"#,
            )?;

            jail.set_env("EVENTRELAY_PORT", "8080");
            jail.set_env("EVENTRELAY_CHANNEL__API_KEY", "from-env");
            jail.set_env("EVENTRELAY_RATE_LIMIT__ENABLED", "true");
            jail.set_env("EVENTRELAY_RATE_LIMIT__REQUESTS_PER_SECOND", "2.5");

            let config = Config::load(&args())?;

            assert_eq!(config.port, 8080);
            assert_eq!(config.channel.api_key.as_deref(), Some("from-env"));
            assert!(config.rate_limit.enabled);
            assert_eq!(config.rate_limit.requests_per_second, 2.5);

            Ok(())
        });
    }

    #[test]
    fn test_missing_channel_url_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "port: 3001\n")?;

            let err = Config::load(&args()).unwrap_err();
            assert!(err.to_string().contains("channel.url"));

            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
channel:
  url: ws://localhost:9000/events
  api_key: k
  queue_size: 10
"#,
            )?;

            assert!(Config::load(&args()).is_err());

            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.channel.url = Some(Url::parse("http://localhost:9000").unwrap());
        config.channel.api_key = Some("k".to_string());
        assert!(config.validate().is_err(), "http scheme is not a websocket");

        config.channel.url = Some(Url::parse("ws://localhost:9000").unwrap());
        assert!(config.validate().is_ok());

        config.channel.reconnect_delay = Duration::from_secs(700);
        assert!(config.validate().is_err());
        config.channel.reconnect_delay = Duration::from_secs(1);

        config.rate_limit.enabled = true;
        config.rate_limit.requests_per_second = 0.0;
        assert!(config.validate().is_err());
        config.rate_limit.requests_per_second = 1e-300;
        assert!(config.validate().is_err());
        config.rate_limit.requests_per_second = 5.0;
        config.rate_limit.burst = 0;
        assert!(config.validate().is_err());
        config.rate_limit.burst = 1;
        assert!(config.validate().is_ok());

        config.webhook.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
