//! WhatsApp Business webhook payloads.

use serde::Deserialize;
use tracing::debug;

use crate::error::WebhookError;

pub const BUSINESS_ACCOUNT_OBJECT: &str = "whatsapp_business_account";

#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    pub field: String,
    pub value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messaging_product: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub statuses: Vec<StatusUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub from: String,
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub interactive: Option<Interactive>,
}

#[derive(Debug, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct Interactive {
    #[serde(rename = "type")]
    pub interactive_type: String,
    #[serde(default)]
    pub button_reply: Option<Reply>,
    #[serde(default)]
    pub list_reply: Option<Reply>,
}

#[derive(Debug, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub id: String,
    pub title: String,
}

/// Delivery receipt for a message we sent.
#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
}

impl Message {
    /// User-visible text: the text body, or the title of a tapped button or list row.
    pub fn text(&self) -> Option<&str> {
        let text = match self.message_type.as_str() {
            "text" => self.text.as_ref().map(|t| t.body.as_str()),
            "interactive" => self.interactive.as_ref().and_then(|i| {
                i.button_reply
                    .as_ref()
                    .or(i.list_reply.as_ref())
                    .map(|r| r.title.as_str())
            }),
            _ => None,
        }?;
        let text = text.trim();
        (!text.is_empty()).then_some(text)
    }
}

/// A message ready for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    /// Normalized E.164 sender.
    pub sender: String,
    pub text: String,
}

impl Envelope {
    /// Parse and check the envelope object type.
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidEnvelope(e.to_string()))?;
        if envelope.object != BUSINESS_ACCOUNT_OBJECT {
            return Err(WebhookError::InvalidEnvelope(format!(
                "unexpected object type {}",
                envelope.object
            )));
        }
        Ok(envelope)
    }

    /// Text messages in envelope order. Non-message changes and messages
    /// without text are skipped.
    pub fn messages(&self) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        for change in self.entry.iter().flat_map(|e| &e.changes) {
            if change.field != "messages" {
                debug!(field = %change.field, "Ignoring non-message change");
                continue;
            }
            for status in &change.value.statuses {
                debug!(message_id = %status.id, status = %status.status, "Delivery status");
            }
            for message in &change.value.messages {
                match message.text() {
                    Some(text) => out.push(InboundMessage {
                        message_id: message.id.clone(),
                        sender: sanitize_phone_number(&message.from),
                        text: text.to_string(),
                    }),
                    None => debug!(
                        message_id = %message.id,
                        message_type = %message.message_type,
                        "Ignoring message without text"
                    ),
                }
            }
        }
        out
    }
}

/// Normalize a phone number to E.164, assuming Kenya when no country code is given.
pub fn sanitize_phone_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.starts_with("254") {
        format!("+{digits}")
    } else if digits.starts_with('0') && digits.len() == 10 {
        format!("+254{}", &digits[1..])
    } else if digits.len() == 9 {
        format!("+254{digits}")
    } else {
        format!("+{digits}")
    }
}
