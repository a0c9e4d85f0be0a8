// =============================================================================
// channels/webhook.rs — THE GENERIC FIREHOSE
// =============================================================================
//
// The all-purpose integration channel: any recipient that parses as an
// http(s) URL gets a JSON POST. Events are grouped by target URL so each
// endpoint sees one request per flush, carrying every alert destined for
// it — the batch contract, honored at the HTTP layer.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{delivery_error, is_http_url, Notifier};
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent};

/// The wire shape posted to each endpoint.
#[derive(Debug, Serialize)]
pub struct WebhookAlert {
    pub event_id: uuid::Uuid,
    pub change_id: uuid::Uuid,
    pub severity: String,
    pub title: String,
    pub body: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    alerts: Vec<WebhookAlert>,
}

pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Group a batch's alerts by destination URL. Events without a URL
    /// recipient simply contribute nothing here.
    fn collect_by_url(events: &[NotificationEvent]) -> HashMap<String, Vec<WebhookAlert>> {
        let mut by_url: HashMap<String, Vec<WebhookAlert>> = HashMap::new();
        for event in events {
            for recipient in event.recipients.iter().filter(|r| is_http_url(r)) {
                by_url.entry(recipient.clone()).or_default().push(WebhookAlert {
                    event_id: event.event_id,
                    change_id: event.change_id,
                    severity: event.severity.to_string(),
                    title: event.title.clone(),
                    body: event.body.clone(),
                    created_at: event.created_at,
                });
            }
        }
        by_url
    }
}

impl Default for WebhookChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Webhook
    }

    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
        let by_url = Self::collect_by_url(events);
        if by_url.is_empty() {
            debug!("No webhook recipients in batch — nothing to post");
            return Ok(());
        }

        for (url, alerts) in by_url {
            let count = alerts.len();
            let response = self
                .client
                .post(&url)
                .json(&WebhookPayload { alerts })
                .send()
                .await
                .map_err(|e| delivery_error(NotificationChannel::Webhook, e.to_string()))?;

            if !response.status().is_success() {
                return Err(delivery_error(
                    NotificationChannel::Webhook,
                    format!("{url} returned HTTP {}", response.status()),
                ));
            }
            info!(url = %url, alerts = count, "Webhook batch posted");
        }
        Ok(())
    }
}
