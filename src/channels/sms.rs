// =============================================================================
// channels/sms.rs — THE POCKET BUZZER
// =============================================================================
//
// There is no portable, SDK-free way to send a text message, so this
// adapter does the honest thing: it POSTs a small JSON batch to a
// configured provider webhook and lets the provider integration (Twilio,
// a gateway appliance, an intern with a burner phone) live on the other
// side of the HTTP boundary, swappable at will.
//
// SMS bodies are the rendered title only — 160 characters of "a judge did
// a thing" is the whole point of the medium.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{delivery_error, is_phone_number, validated_url, Notifier};
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent};

const MAX_SMS_CHARS: usize = 160;

pub struct SmsChannel {
    provider_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
pub struct SmsMessage {
    pub to: Vec<String>,
    pub body: String,
}

#[derive(Serialize)]
struct SmsPayload {
    messages: Vec<SmsMessage>,
}

impl SmsChannel {
    pub fn new(provider_url: &str) -> Result<Self, MonitorError> {
        Ok(Self {
            provider_url: validated_url(provider_url)?,
            client: reqwest::Client::new(),
        })
    }

    fn build_messages(events: &[NotificationEvent]) -> Vec<SmsMessage> {
        events
            .iter()
            .filter_map(|event| {
                let to: Vec<String> = event
                    .recipients
                    .iter()
                    .filter(|r| is_phone_number(r))
                    .cloned()
                    .collect();
                if to.is_empty() {
                    return None;
                }
                let mut body = event.title.clone();
                if body.chars().count() > MAX_SMS_CHARS {
                    body = body.chars().take(MAX_SMS_CHARS - 1).collect();
                    body.push('…');
                }
                Some(SmsMessage { to, body })
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for SmsChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Sms
    }

    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
        let messages = Self::build_messages(events);
        if messages.is_empty() {
            debug!("No SMS recipients in batch");
            return Ok(());
        }
        let count = messages.len();
        let response = self
            .client
            .post(&self.provider_url)
            .json(&SmsPayload { messages })
            .send()
            .await
            .map_err(|e| delivery_error(NotificationChannel::Sms, e.to_string()))?;

        if !response.status().is_success() {
            return Err(delivery_error(
                NotificationChannel::Sms,
                format!("SMS provider returned HTTP {}", response.status()),
            ));
        }
        info!(messages = count, "SMS batch handed to provider");
        Ok(())
    }
}
