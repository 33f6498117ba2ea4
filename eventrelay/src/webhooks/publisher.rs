//! Webhook delivery: filter, sign, send, retry, audit.
//!
//! ```text
//! deliver(event)
//!   ├─ accepts(event.type)?            // allow-list, empty = everything
//!   ├─ serde_json::to_vec(event)       // exact bytes that get signed and sent
//!   ├─ sign_payload(secret, body)      // only when a secret is configured
//!   └─ for attempt in 1..=max_attempts:
//!        ├─ sleep(retry_schedule[attempt - 2])   // skipped on the first attempt
//!        ├─ POST body
//!        ├─ 2xx  → audit(success), done
//!        ├─ 4xx  → audit(failure), DeliveryRejected (not retried)
//!        └─ else → try again
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use metrics::counter;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::errors::{Error, Result};
use crate::events::{Event, EventType};
use crate::webhooks::audit::{AuditSink, DeliveryRecord};
use crate::webhooks::signing::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Outcome of a single HTTP send attempt.
#[derive(Debug)]
enum SendOutcome {
    Success { status_code: u16 },
    Failure { status_code: Option<u16>, error: String },
}

impl SendOutcome {
    fn is_permanent(&self) -> bool {
        matches!(self, SendOutcome::Failure { status_code: Some(code), .. } if (400..500).contains(code))
    }
}

pub struct WebhookPublisher {
    client: reqwest::Client,
    url: Url,
    secret: Option<String>,
    /// Allowed event types; empty accepts everything
    events: HashSet<EventType>,
    retry_schedule: Vec<Duration>,
    max_attempts: u32,
    audit: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
}

impl WebhookPublisher {
    pub fn new(url: Url, config: &WebhookConfig, audit: Arc<dyn AuditSink>, shutdown: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("eventrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create webhook HTTP client")?;

        Ok(Self {
            client,
            url,
            secret: config.secret.clone().filter(|s| !s.is_empty()),
            events: config.events.iter().copied().collect(),
            retry_schedule: config.retry_schedule(),
            max_attempts: config.max_attempts.max(1),
            audit,
            shutdown,
        })
    }

    /// Build a publisher if a webhook URL is configured.
    pub fn from_config(config: &WebhookConfig, audit: Arc<dyn AuditSink>, shutdown: CancellationToken) -> Result<Option<Self>> {
        match &config.url {
            Some(url) => Ok(Some(Self::new(url.clone(), config, audit, shutdown)?)),
            None => Ok(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn accepts(&self, event_type: EventType) -> bool {
        self.events.is_empty() || self.events.contains(&event_type)
    }

    /// Deliver one event, retrying transient failures.
    ///
    /// Events outside the allow-list are skipped and reported as delivered. Returns
    /// [`Error::DeliveryRejected`] on a 4xx, [`Error::DeliveryExhausted`] when every
    /// attempt failed, and [`Error::Cancelled`] if shutdown interrupts a backoff.
    pub async fn deliver(&self, event: &Event) -> Result<()> {
        if !self.accepts(event.event_type) {
            tracing::trace!(event_type = %event.event_type, "Event type not subscribed, skipping webhook");
            return Ok(());
        }

        let body = serde_json::to_vec(event)?;
        let signature = match &self.secret {
            Some(secret) => Some(signing::sign_payload(secret, &body).context("Failed to sign webhook payload")?),
            None => None,
        };

        let delivery_id = Uuid::new_v4();
        let mut attempts = 0;
        let mut last_outcome = None;

        while attempts < self.max_attempts {
            if attempts > 0 {
                let delay = self.backoff(attempts);
                tracing::debug!(%delivery_id, attempt = attempts + 1, ?delay, "Retrying webhook delivery");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => {
                        let record = self.record(delivery_id, event, attempts, last_outcome.as_ref(), Some("cancelled by shutdown"));
                        self.finish(record).await;
                        return Err(Error::Cancelled);
                    }
                }
            }

            attempts += 1;
            let outcome = self.send(delivery_id, attempts, &body, signature.as_deref()).await;

            match outcome {
                SendOutcome::Success { status_code } => {
                    tracing::debug!(%delivery_id, status_code, attempts, "Webhook delivered");
                    let record = self.record(delivery_id, event, attempts, Some(&outcome), None);
                    self.finish(record).await;
                    return Ok(());
                }
                SendOutcome::Failure { status_code, ref error } => {
                    tracing::warn!(%delivery_id, ?status_code, attempt = attempts, error = %error, "Webhook attempt failed");

                    if outcome.is_permanent() {
                        let record = self.record(delivery_id, event, attempts, Some(&outcome), None);
                        self.finish(record).await;
                        return Err(Error::DeliveryRejected {
                            status: status_code.unwrap_or_default(),
                        });
                    }
                }
            }

            last_outcome = Some(outcome);
        }

        let record = self.record(delivery_id, event, attempts, last_outcome.as_ref(), None);
        let (status, error) = (record.status_code, record.error.clone().unwrap_or_default());
        self.finish(record).await;

        Err(Error::DeliveryExhausted { attempts, status, error })
    }

    /// Delay before the attempt following `completed` attempts. The last schedule entry repeats.
    fn backoff(&self, completed: u32) -> Duration {
        let idx = (completed as usize).saturating_sub(1);
        self.retry_schedule
            .get(idx)
            .or(self.retry_schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    async fn send(&self, delivery_id: Uuid, attempt: u32, body: &[u8], signature: Option<&str>) -> SendOutcome {
        tracing::debug!(%delivery_id, url = %self.url, attempt, "Sending webhook HTTP request");

        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, Utc::now().timestamp().to_string())
            .body(body.to_vec());
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        match request.send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                if response.status().is_success() {
                    SendOutcome::Success { status_code }
                } else {
                    SendOutcome::Failure {
                        status_code: Some(status_code),
                        error: format!("HTTP {}", status_code),
                    }
                }
            }
            Err(e) => SendOutcome::Failure {
                status_code: None,
                error: e.to_string(),
            },
        }
    }

    fn record(
        &self,
        delivery_id: Uuid,
        event: &Event,
        attempts: u32,
        outcome: Option<&SendOutcome>,
        note: Option<&str>,
    ) -> DeliveryRecord {
        let (success, status_code, error) = match outcome {
            Some(SendOutcome::Success { status_code }) => (true, Some(*status_code), None),
            Some(SendOutcome::Failure { status_code, error }) => (false, *status_code, Some(error.clone())),
            None => (false, None, None),
        };

        DeliveryRecord {
            delivery_id,
            event_type: event.event_type,
            session: event.session.clone(),
            url: self.url.to_string(),
            status_code,
            success,
            attempts,
            error: note.map(str::to_string).or(error),
            timestamp: Utc::now(),
        }
    }

    async fn finish(&self, record: DeliveryRecord) {
        let outcome = if record.success { "success" } else { "failure" };
        counter!("eventrelay_webhook_deliveries_total", "outcome" => outcome).increment(1);
        self.audit.record_delivery(record).await;
    }
}
