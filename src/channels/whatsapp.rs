//! WhatsApp Cloud API channel.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::debug;

use crate::channels::OutboundChannel;
use crate::config::WhatsAppConfig;
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "whatsapp";
const GRAPH_BASE_URL: &str = "https://graph.facebook.com";

/// Sends text messages through the Graph API `/{phone_number_id}/messages` endpoint.
pub struct WhatsAppChannel {
    config: WhatsAppConfig,
    base_url: String,
    client: reqwest::Client,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self::with_base_url(config, GRAPH_BASE_URL)
    }

    /// Point the channel at a different Graph API host (used by tests).
    pub fn with_base_url(config: WhatsAppConfig, base_url: impl Into<String>) -> Self {
        Self {
            config,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url, self.config.api_version, self.config.phone_number_id
        )
    }

    fn text_body(recipient: &str, text: &str) -> Value {
        json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient.trim_start_matches('+'),
            "type": "text",
            "text": { "preview_url": false, "body": text }
        })
    }

    async fn post(&self, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.config.access_token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await.unwrap_or(Value::Null));
        }

        let detail = resp.text().await.unwrap_or_default();
        Err(map_status(status, &detail))
    }
}

fn map_status(status: StatusCode, detail: &str) -> ChannelError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChannelError::AuthFailed {
            name: CHANNEL_NAME.into(),
            reason: format!("HTTP {status}: {detail}"),
        },
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited {
            name: CHANNEL_NAME.into(),
        },
        _ => ChannelError::SendFailed {
            name: CHANNEL_NAME.into(),
            reason: format!("HTTP {status}: {detail}"),
        },
    }
}

#[async_trait]
impl OutboundChannel for WhatsAppChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        let resp = self.post(&Self::text_body(recipient, text)).await?;
        let message_id = resp
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        debug!(recipient, message_id, chars = text.chars().count(), "WhatsApp message sent");
        Ok(())
    }
}
