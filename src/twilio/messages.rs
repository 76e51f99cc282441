use serde::{Deserialize, Serialize};

use super::TwilioClient;
use crate::provider::{execute, ProviderError, Safety};

const PROVIDER: &str = "messaging";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Sms,
    Whatsapp,
}

impl Channel {
    /// Apply the channel's address prefix if it is missing.
    pub fn address(self, number: &str) -> String {
        match self {
            Channel::Sms => number.to_string(),
            Channel::Whatsapp if number.starts_with("whatsapp:") => number.to_string(),
            Channel::Whatsapp => format!("whatsapp:{number}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage<'a> {
    pub to: &'a str,
    pub body: &'a str,
    pub channel: Channel,
    pub from: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

impl TwilioClient {
    /// Send one SMS or WhatsApp message; returns the message sid. Twilio
    /// has no idempotency key for messages, so a failure is never retried here.
    pub async fn send_message(&self, message: &OutboundMessage<'_>) -> Result<String, ProviderError> {
        self.ensure_configured(PROVIDER)?;
        let default_from = match message.channel {
            Channel::Sms => self.messaging_from.as_str(),
            Channel::Whatsapp => self.whatsapp_from.as_str(),
        };
        let from = message
            .from
            .filter(|f| !f.is_empty())
            .unwrap_or(default_from);
        if from.is_empty() {
            return Err(ProviderError::invalid(PROVIDER, "no sender number configured"));
        }

        let to = message.channel.address(message.to);
        let from = message.channel.address(from);
        let params = [("To", to.as_str()), ("From", from.as_str()), ("Body", message.body)];

        let sent: MessageResource = execute(PROVIDER, Safety::Write, || {
            self.post("Messages.json").form(&params)
        })
        .await?;
        tracing::info!(
            message_sid = %sent.sid,
            status = sent.status.as_deref().unwrap_or("unknown"),
            channel = ?message.channel,
            "Message sent"
        );
        Ok(sent.sid)
    }
}
