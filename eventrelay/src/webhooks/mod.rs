//! Signed HTTP webhook delivery.
//!
//! - [`signing`]: HMAC-SHA256 body signatures
//! - [`publisher`]: allow-list filter, retry schedule and outcome classification
//! - [`audit`]: terminal delivery records

pub mod audit;
pub mod publisher;
pub mod signing;

pub use audit::{AuditSink, DeliveryRecord, TracingAuditSink};
pub use publisher::WebhookPublisher;
pub use signing::{sign_payload, verify_signature};
