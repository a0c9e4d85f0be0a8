// =============================================================================
// channels/push.rs — THE LOCK-SCREEN HERALD
// =============================================================================
//
// Mobile push, same architectural dodge as SMS: the provider SDK (APNs,
// FCM, whatever the firm's app uses this quarter) lives behind a webhook
// endpoint we POST to. Targets are the internal user IDs from the rule's
// recipient list; the provider resolves users to device tokens, because
// device tokens have no business living in monitoring config.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{delivery_error, is_user_id, validated_url, Notifier};
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent};

pub struct PushChannel {
    provider_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub severity: String,
    pub targets: Vec<String>,
}

#[derive(Serialize)]
struct PushPayload {
    notifications: Vec<PushNotification>,
}

impl PushChannel {
    pub fn new(provider_url: &str) -> Result<Self, MonitorError> {
        Ok(Self {
            provider_url: validated_url(provider_url)?,
            client: reqwest::Client::new(),
        })
    }

    fn build_notifications(events: &[NotificationEvent]) -> Vec<PushNotification> {
        events
            .iter()
            .filter_map(|event| {
                let targets: Vec<String> = event
                    .recipients
                    .iter()
                    .filter(|r| is_user_id(r))
                    .cloned()
                    .collect();
                if targets.is_empty() {
                    return None;
                }
                Some(PushNotification {
                    title: event.title.clone(),
                    body: event.body.clone(),
                    severity: event.severity.to_string(),
                    targets,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for PushChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Push
    }

    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
        let notifications = Self::build_notifications(events);
        if notifications.is_empty() {
            debug!("No push targets in batch");
            return Ok(());
        }
        let count = notifications.len();
        let response = self
            .client
            .post(&self.provider_url)
            .json(&PushPayload { notifications })
            .send()
            .await
            .map_err(|e| delivery_error(NotificationChannel::Push, e.to_string()))?;

        if !response.status().is_success() {
            return Err(delivery_error(
                NotificationChannel::Push,
                format!("push provider returned HTTP {}", response.status()),
            ));
        }
        info!(notifications = count, "Push batch handed to provider");
        Ok(())
    }
}
