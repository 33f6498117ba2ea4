//! Audit trail for webhook deliveries.
//!
//! Every terminal delivery outcome (delivered, rejected, exhausted, cancelled) is
//! handed to an [`AuditSink`]. Where the records end up is the sink's business;
//! the default [`TracingAuditSink`] writes them as structured events on the
//! `audit` tracing target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::events::EventType;

/// Terminal outcome of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    pub delivery_id: Uuid,
    pub event_type: EventType,
    pub session: String,
    pub url: String,
    /// Last HTTP status observed, if any response was received
    pub status_code: Option<u16>,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_delivery(&self, record: DeliveryRecord);
}

/// Writes delivery records to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_delivery(&self, record: DeliveryRecord) {
        if record.success {
            tracing::info!(
                target: "audit",
                delivery_id = %record.delivery_id,
                event_type = %record.event_type,
                session = %record.session,
                url = %record.url,
                status_code = ?record.status_code,
                attempts = record.attempts,
                "Webhook delivered"
            );
        } else {
            tracing::warn!(
                target: "audit",
                delivery_id = %record.delivery_id,
                event_type = %record.event_type,
                session = %record.session,
                url = %record.url,
                status_code = ?record.status_code,
                attempts = record.attempts,
                error = record.error.as_deref().unwrap_or_default(),
                "Webhook delivery failed"
            );
        }
    }
}
