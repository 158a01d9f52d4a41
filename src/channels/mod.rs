//! Outbound messaging: the channel seam and bounded-retry delivery.

pub mod whatsapp;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::DeliveryConfig;
use crate::error::ChannelError;
use crate::format::{MAX_MESSAGE_CHARS, split_message};
use crate::metrics::delivery as delivery_metrics;

pub use whatsapp::WhatsAppChannel;

/// Sends a single text message to a recipient.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Channel name for logs and errors.
    fn name(&self) -> &str;

    /// Longest text accepted by one `send`, in characters.
    fn max_message_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError>;
}

/// Splits text to the channel's limit and sends each chunk with bounded retries.
///
/// Failures end here: they are logged and counted, and the caller only
/// learns whether the text went out.
#[derive(Clone)]
pub struct Delivery {
    channel: Arc<dyn OutboundChannel>,
    config: DeliveryConfig,
}

impl Delivery {
    pub fn new(channel: Arc<dyn OutboundChannel>, config: DeliveryConfig) -> Self {
        Self { channel, config }
    }

    /// Deliver `text`. Stops at the first chunk that cannot be sent.
    pub async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        let chunks = split_message(text, self.channel.max_message_chars());
        for (index, chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.send_chunk(recipient, chunk).await {
                metrics::counter!(delivery_metrics::FAILURES_TOTAL, "channel" => self.channel.name().to_string())
                    .increment(1);
                error!(
                    channel = self.channel.name(),
                    recipient,
                    chunk = index + 1,
                    chunks = chunks.len(),
                    error = %e,
                    "Permanent delivery failure"
                );
                return Err(e);
            }
        }
        metrics::counter!(delivery_metrics::SENT_TOTAL, "channel" => self.channel.name().to_string())
            .increment(1);
        debug!(channel = self.channel.name(), recipient, chunks = chunks.len(), "Message delivered");
        Ok(())
    }

    async fn send_chunk(&self, recipient: &str, chunk: &str) -> Result<(), ChannelError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.channel.send(recipient, chunk).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if matches!(err, ChannelError::AuthFailed { .. }) || attempt > self.config.max_retries
            {
                return Err(err);
            }

            warn!(
                channel = self.channel.name(),
                recipient,
                attempt,
                error = %err,
                "Send failed, retrying"
            );
            tokio::time::sleep(self.config.retry_delay * attempt).await;
        }
    }
}
