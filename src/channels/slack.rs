// =============================================================================
// channels/slack.rs — THE WAR ROOM TICKER
// =============================================================================
//
// One incoming-webhook URL, one POST per flush, mrkdwn formatting, and a
// severity emoji so the channel scroll can be triaged at squint distance.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::{delivery_error, validated_url, Notifier};
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent, Severity};

pub struct SlackChannel {
    webhook_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SlackPayload {
    text: String,
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Urgent => "🚨",
        Severity::Critical => "🔴",
        Severity::High => "🟠",
        Severity::Medium => "🟡",
        Severity::Low => "⚪",
    }
}

impl SlackChannel {
    pub fn new(webhook_url: &str) -> Result<Self, MonitorError> {
        Ok(Self {
            webhook_url: validated_url(webhook_url)?,
            client: reqwest::Client::new(),
        })
    }

    /// One mrkdwn message per flush: bold titles, indented bodies, emoji
    /// triage markers.
    fn build_text(events: &[NotificationEvent]) -> String {
        events
            .iter()
            .map(|e| {
                format!(
                    "{} *{}*\n{}",
                    severity_emoji(e.severity),
                    e.title,
                    e.body.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
impl Notifier for SlackChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Slack
    }

    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
        if events.is_empty() {
            return Ok(());
        }
        let payload = SlackPayload {
            text: Self::build_text(events),
        };
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| delivery_error(NotificationChannel::Slack, e.to_string()))?;

        if !response.status().is_success() {
            return Err(delivery_error(
                NotificationChannel::Slack,
                format!("Slack returned HTTP {}", response.status()),
            ));
        }
        info!(alerts = events.len(), "Slack batch posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn event(title: &str, severity: Severity) -> NotificationEvent {
        NotificationEvent {
            event_id: Uuid::new_v4(),
            change_id: Uuid::new_v4(),
            rule_id: Uuid::new_v4(),
            monitor_id: Uuid::new_v4(),
            channels: vec![NotificationChannel::Slack],
            recipients: vec![],
            title: title.into(),
            body: "Case 2:24-cv-0001\ndetails".into(),
            severity,
            delivery: HashMap::new(),
            retry_count: 0,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_new_validates_url() {
        assert!(SlackChannel::new("https://hooks.slack.example/T/B/x").is_ok());
        assert!(SlackChannel::new("nope").is_err());
    }

    #[test]
    fn test_text_carries_titles_and_triage_emoji() {
        let text = SlackChannel::build_text(&[
            event("[URGENT] JUDGMENT_ENTERED — 2:24-cv-0001", Severity::Urgent),
            event("[HIGH] MOTION_FILED — 2:24-cv-0002", Severity::High),
        ]);
        assert!(text.contains("🚨 *[URGENT] JUDGMENT_ENTERED — 2:24-cv-0001*"));
        assert!(text.contains("🟠 *[HIGH] MOTION_FILED — 2:24-cv-0002*"));
        assert_eq!(text.matches("\n\n").count(), 1, "events separated by blank line");
    }
}
