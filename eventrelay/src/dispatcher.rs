//! Fan-out of events to every configured transport.
//!
//! The persistent channel is the primary transport: events are enqueued on it
//! synchronously and it owns connection lifecycle. The webhook is secondary: each
//! delivery runs as its own detached task, so a slow or failing endpoint never holds
//! up the caller or the channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::ChannelPublisher;
use crate::errors::{Error, Result};
use crate::events::Event;
use crate::webhooks::WebhookPublisher;

/// A transport that events can be handed to.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;

    async fn connect(&self, timeout: Duration) -> Result<()>;

    async fn disconnect(&self, timeout: Duration) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn queue_depth(&self) -> usize;
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        self.enqueue(event);
        Ok(())
    }

    async fn connect(&self, timeout: Duration) -> Result<()> {
        ChannelPublisher::connect(self, timeout).await
    }

    async fn disconnect(&self, timeout: Duration) -> Result<()> {
        ChannelPublisher::disconnect(self, timeout).await
    }

    fn is_connected(&self) -> bool {
        ChannelPublisher::is_connected(self)
    }

    fn queue_depth(&self) -> usize {
        ChannelPublisher::queue_depth(self)
    }
}

/// Webhooks are connectionless; only `publish` does anything.
#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        self.deliver(&event).await
    }

    async fn connect(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn queue_depth(&self) -> usize {
        0
    }
}

pub struct EventDispatcher {
    primary: Arc<dyn Publisher>,
    secondary: Option<Arc<dyn Publisher>>,
}

impl EventDispatcher {
    pub fn new(primary: Arc<dyn Publisher>, secondary: Option<Arc<dyn Publisher>>) -> Self {
        Self { primary, secondary }
    }

    pub fn with_transports(channel: ChannelPublisher, webhook: Option<WebhookPublisher>) -> Self {
        Self::new(
            Arc::new(channel),
            webhook.map(|w| Arc::new(w) as Arc<dyn Publisher>),
        )
    }
}

#[async_trait]
impl Publisher for EventDispatcher {
    /// Hand the event to every transport. Transport failures are logged, never returned.
    async fn publish(&self, event: Event) -> Result<()> {
        if let Some(secondary) = &self.secondary {
            let secondary = secondary.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let event_type = event.event_type;
                match secondary.publish(event).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => {
                        tracing::debug!(%event_type, "Webhook delivery cancelled by shutdown");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, %event_type, "Webhook delivery failed");
                    }
                }
            });
        }

        if let Err(e) = self.primary.publish(event).await {
            tracing::warn!(error = %e, "Failed to enqueue event on channel");
        }

        Ok(())
    }

    async fn connect(&self, timeout: Duration) -> Result<()> {
        self.primary.connect(timeout).await
    }

    async fn disconnect(&self, timeout: Duration) -> Result<()> {
        self.primary.disconnect(timeout).await
    }

    fn is_connected(&self) -> bool {
        self.primary.is_connected()
    }

    fn queue_depth(&self) -> usize {
        self.primary.queue_depth()
    }
}
