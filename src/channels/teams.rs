// =============================================================================
// channels/teams.rs — THE OTHER CORPORATE CHAT
// =============================================================================
//
// Microsoft Teams incoming webhook, MessageCard format. The card's theme
// color tracks the worst severity in the batch, because somewhere a
// litigation-support manager is triaging by color alone.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::{delivery_error, validated_url, Notifier};
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent, Severity};

pub struct TeamsChannel {
    webhook_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct MessageCard {
    #[serde(rename = "@type")]
    card_type: &'static str,
    #[serde(rename = "@context")]
    context: &'static str,
    #[serde(rename = "themeColor")]
    theme_color: &'static str,
    summary: String,
    title: String,
    text: String,
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Urgent => "FF0000",
        Severity::Critical => "D93025",
        Severity::High => "F29900",
        Severity::Medium => "FBBC04",
        Severity::Low => "9AA0A6",
    }
}

impl TeamsChannel {
    pub fn new(webhook_url: &str) -> Result<Self, MonitorError> {
        Ok(Self {
            webhook_url: validated_url(webhook_url)?,
            client: reqwest::Client::new(),
        })
    }

    fn build_card(events: &[NotificationEvent]) -> MessageCard {
        let worst = events
            .iter()
            .map(|e| e.severity)
            .max()
            .unwrap_or(Severity::Medium);
        let title = if events.len() == 1 {
            events[0].title.clone()
        } else {
            format!("{} docket alerts", events.len())
        };
        let text = events
            .iter()
            .map(|e| format!("**{}**\n\n{}", e.title, e.body.trim()))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        MessageCard {
            card_type: "MessageCard",
            context: "http://schema.org/extensions",
            theme_color: severity_color(worst),
            summary: title.clone(),
            title,
            text,
        }
    }
}

#[async_trait]
impl Notifier for TeamsChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Teams
    }

    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
        if events.is_empty() {
            return Ok(());
        }
        let card = Self::build_card(events);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&card)
            .send()
            .await
            .map_err(|e| delivery_error(NotificationChannel::Teams, e.to_string()))?;

        if !response.status().is_success() {
            return Err(delivery_error(
                NotificationChannel::Teams,
                format!("Teams returned HTTP {}", response.status()),
            ));
        }
        info!(alerts = events.len(), "Teams card posted");
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
            channels: vec![NotificationChannel::Teams],
            recipients: vec![],
            title: title.into(),
            body: "body".into(),
            severity,
            delivery: HashMap::new(),
            retry_count: 0,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_single_event_card_uses_its_title() {
        let card = TeamsChannel::build_card(&[event("[HIGH] MOTION_FILED", Severity::High)]);
        assert_eq!(card.title, "[HIGH] MOTION_FILED");
        assert_eq!(card.theme_color, "F29900");
    }

    #[test]
    fn test_batch_card_uses_worst_severity_color() {
        let card = TeamsChannel::build_card(&[
            event("a", Severity::Medium),
            event("b", Severity::Urgent),
            event("c", Severity::High),
        ]);
        assert_eq!(card.title, "3 docket alerts");
        assert_eq!(card.theme_color, "FF0000");
    }

    #[test]
    fn test_card_serializes_with_at_keys() {
        let card = TeamsChannel::build_card(&[event("x", Severity::Low)]);
        let json = serde_json::to_string(&card).expect("serializable");
        assert!(json.contains("\"@type\":\"MessageCard\""));
        assert!(json.contains("\"themeColor\":\"9AA0A6\""));
    }
}
