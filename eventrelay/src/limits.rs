//! Ingress rate limiting.
//!
//! Each client key gets its own token bucket, created on first use with the shared
//! quota and swept away once idle for longer than `max_age`. Buckets are `governor`
//! direct limiters, so checks are lock-free; the key map is a `DashMap`.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::errors::{Error, Result};

/// Key used for every request when limiting globally.
const GLOBAL_KEY: &str = "*";

/// Container for all resource limiters.
#[derive(Debug, Default, Clone)]
pub struct Limiters {
    /// Limiter for `POST /v1/events`. None means unlimited.
    pub ingress: Option<Arc<RateLimiter>>,
}

impl Limiters {
    /// Creates all limiters from configuration. Must be called inside a Tokio runtime.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let ingress = if config.enabled { Some(RateLimiter::spawn(config)?) } else { None };
        Ok(Self { ingress })
    }

    pub fn stop(&self) {
        if let Some(limiter) = &self.ingress {
            limiter.stop();
        }
    }
}

struct LimiterEntry {
    bucket: Arc<DefaultDirectRateLimiter>,
    last_seen: Instant,
}

/// Outcome of [`RateLimiter::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Zero when a token was taken; otherwise how long until one is available
    pub delay: Duration,
}

impl Reservation {
    pub fn is_ready(&self) -> bool {
        self.delay.is_zero()
    }
}

/// Per-key token-bucket limiter with idle eviction.
pub struct RateLimiter {
    buckets: Arc<DashMap<String, LimiterEntry>>,
    quota: Quota,
    per_key: bool,
    clock: DefaultClock,
    stop: CancellationToken,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.buckets.len())
            .field("quota", &self.quota)
            .field("per_key", &self.per_key)
            .finish()
    }
}

impl RateLimiter {
    /// Build a limiter and start its sweep task.
    pub fn spawn(config: &RateLimitConfig) -> Result<Arc<Self>> {
        if !(config.requests_per_second.is_finite() && config.requests_per_second > 0.0) {
            return Err(anyhow::anyhow!("rate_limit.requests_per_second must be positive").into());
        }
        let period = Duration::try_from_secs_f64(1.0 / config.requests_per_second)
            .context("rate_limit.requests_per_second is too small")?;
        let burst = NonZeroU32::new(config.burst).context("rate_limit.burst must be at least 1")?;
        let quota = Quota::with_period(period)
            .context("rate_limit.requests_per_second is too high")?
            .allow_burst(burst);

        let limiter = Arc::new(Self {
            buckets: Arc::new(DashMap::new()),
            quota,
            per_key: config.per_key,
            clock: DefaultClock::default(),
            stop: CancellationToken::new(),
        });

        tokio::spawn(sweep_loop(
            limiter.buckets.clone(),
            config.cleanup_interval,
            config.max_age,
            limiter.stop.clone(),
        ));

        tracing::debug!(
            requests_per_second = config.requests_per_second,
            burst = config.burst,
            per_key = config.per_key,
            "Rate limiter started"
        );
        Ok(limiter)
    }

    /// Take a token for `key` if one is available. Never blocks.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_ok()
    }

    /// Wait until a token for `key` is available and take it.
    ///
    /// Cancel by dropping the future, e.g. with `tokio::time::timeout`.
    pub async fn wait(&self, key: &str) {
        let bucket = self.bucket(key);
        bucket.until_ready().await;
    }

    /// Take a token if one is available now; otherwise report how long until one is,
    /// without taking anything.
    pub fn reserve(&self, key: &str) -> Reservation {
        match self.check(key) {
            Ok(()) => Reservation { delay: Duration::ZERO },
            Err(delay) => Reservation { delay },
        }
    }

    /// Stop the sweep task. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(self.map_key(key))
    }

    fn check(&self, key: &str) -> std::result::Result<(), Duration> {
        self.bucket(key)
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    fn map_key<'a>(&self, key: &'a str) -> &'a str {
        if self.per_key { key } else { GLOBAL_KEY }
    }

    /// Fetch or lazily create the bucket for `key`, refreshing its last-seen time.
    fn bucket(&self, key: &str) -> Arc<DefaultDirectRateLimiter> {
        let key = self.map_key(key);
        let now = Instant::now();

        if let Some(mut entry) = self.buckets.get_mut(key) {
            entry.last_seen = now;
            return entry.bucket.clone();
        }

        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| LimiterEntry {
            bucket: Arc::new(governor::RateLimiter::direct(self.quota)),
            last_seen: now,
        });
        entry.last_seen = now;
        entry.bucket.clone()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn sweep_loop(buckets: Arc<DashMap<String, LimiterEntry>>, interval: Duration, max_age: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let before = buckets.len();
                buckets.retain(|_, entry| entry.last_seen.elapsed() <= max_age);
                let evicted = before.saturating_sub(buckets.len());
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = buckets.len(), "Evicted idle rate limit buckets");
                }
            }
        }
    }

    tracing::debug!("Rate limiter sweep stopped");
}

/// Derive the client key: `X-API-Key`, then the first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(api_key) = header("x-api-key") {
        return format!("key:{api_key}");
    }
    if let Some(hop) = header("x-forwarded-for").and_then(|v| v.split(',').next()).map(str::trim) {
        return format!("ip:{hop}");
    }
    if let Some(ip) = header("x-real-ip") {
        return format!("ip:{ip}");
    }
    match peer {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "unknown".to_string(),
    }
}

/// Reject requests over the limit with 429 and a `Retry-After` header.
pub async fn rate_limit_middleware(State(limiter): State<Arc<RateLimiter>>, request: Request, next: Next) -> Result<Response> {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ci| ci.0);
    let key = client_key(request.headers(), peer);

    if let Err(delay) = limiter.check(&key) {
        counter!("eventrelay_rate_limited_total").increment(1);
        tracing::debug!(%key, ?delay, "Request rate limited");
        return Err(Error::RateLimited {
            retry_after: delay.as_secs_f64().ceil().max(1.0) as u64,
        });
    }

    Ok(next.run(request).await)
}
