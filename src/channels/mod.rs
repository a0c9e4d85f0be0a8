// =============================================================================
// channels/ — THE MEGAPHONE RACK
// =============================================================================
//
// Seven ways to interrupt a lawyer's dinner, one trait. Each adapter owns
// exactly one transport (SMTP, HTTP POST, Redis) and one opinion about
// message formatting; the dispatcher neither knows nor cares which is
// which. Delivery is batched — the dispatcher hands over everything that
// accumulated for a channel and gets one verdict back.
//
// Recipient routing: a rule's recipient list is a grab bag of email
// addresses, webhook URLs, phone numbers, and internal user IDs. Each
// adapter picks out the recipients it understands and ignores the rest,
// so one rule can say "email the partners, ping the war-room webhook,
// text the associate on call" in a single list.
// =============================================================================

pub mod email;
pub mod in_app;
pub mod push;
pub mod slack;
pub mod sms;
pub mod teams;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent};

/// One delivery capability per channel. The transport lives behind this
/// seam; the dispatcher only ever sees the verdict.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    /// Deliver a batch of rendered events. All-or-nothing per batch: an
    /// error means the dispatcher records a failure (and schedules a
    /// retry) for every event in it.
    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError>;
}

/// Build the adapter registry from configuration. Channels with missing
/// or invalid endpoints are skipped with a warning rather than taking the
/// engine down — a bad Slack URL should not silence email.
pub fn build_registry(config: &Config) -> HashMap<NotificationChannel, Arc<dyn Notifier>> {
    let mut registry: HashMap<NotificationChannel, Arc<dyn Notifier>> = HashMap::new();

    match email::EmailChannel::from_config(config) {
        Ok(channel) => {
            registry.insert(NotificationChannel::Email, Arc::new(channel));
        }
        Err(e) => warn!(error = %e, "Email channel disabled"),
    }

    registry.insert(
        NotificationChannel::Webhook,
        Arc::new(webhook::WebhookChannel::new()),
    );

    if !config.slack_webhook_url.is_empty() {
        match slack::SlackChannel::new(&config.slack_webhook_url) {
            Ok(channel) => {
                registry.insert(NotificationChannel::Slack, Arc::new(channel));
            }
            Err(e) => warn!(error = %e, "Slack channel disabled"),
        }
    }

    if !config.teams_webhook_url.is_empty() {
        match teams::TeamsChannel::new(&config.teams_webhook_url) {
            Ok(channel) => {
                registry.insert(NotificationChannel::Teams, Arc::new(channel));
            }
            Err(e) => warn!(error = %e, "Teams channel disabled"),
        }
    }

    if !config.sms_provider_url.is_empty() {
        match sms::SmsChannel::new(&config.sms_provider_url) {
            Ok(channel) => {
                registry.insert(NotificationChannel::Sms, Arc::new(channel));
            }
            Err(e) => warn!(error = %e, "SMS channel disabled"),
        }
    }

    if !config.push_provider_url.is_empty() {
        match push::PushChannel::new(&config.push_provider_url) {
            Ok(channel) => {
                registry.insert(NotificationChannel::Push, Arc::new(channel));
            }
            Err(e) => warn!(error = %e, "Push channel disabled"),
        }
    }

    match in_app::InAppChannel::new(config) {
        Ok(channel) => {
            registry.insert(NotificationChannel::InApp, Arc::new(channel));
        }
        Err(e) => warn!(error = %e, "In-app channel disabled"),
    }

    info!(
        channels = registry.len(),
        "Notification channel registry built"
    );
    registry
}

/// Shorthand for the per-channel error variant.
pub(crate) fn delivery_error(
    channel: NotificationChannel,
    reason: impl Into<String>,
) -> MonitorError {
    MonitorError::NotificationDelivery {
        channel,
        reason: reason.into(),
    }
}

/// Validate an endpoint URL at construction time, so a typo in an env var
/// surfaces at boot instead of at 2 AM when the first Urgent alert fires.
pub(crate) fn validated_url(raw: &str) -> Result<String, MonitorError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| MonitorError::Configuration(format!("bad endpoint URL '{raw}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(MonitorError::Configuration(format!(
            "endpoint URL '{raw}' must be http(s)"
        )));
    }
    Ok(parsed.to_string())
}

// ---------------------------------------------------------------------------
// Recipient routing predicates. Intentionally dumb: the recipient list is
// human-authored config and these just have to sort it into piles.
// ---------------------------------------------------------------------------

pub(crate) fn is_http_url(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

pub(crate) fn is_email_address(s: &str) -> bool {
    !is_http_url(s) && s.contains('@')
}

pub(crate) fn is_phone_number(s: &str) -> bool {
    s.starts_with('+') && s.len() > 1 && s[1..].chars().all(|c| c.is_ascii_digit())
}

/// Internal user IDs: whatever is left after the other piles are taken.
pub(crate) fn is_user_id(s: &str) -> bool {
    !is_http_url(s) && !is_email_address(s) && !is_phone_number(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_routing_predicates() {
        assert!(is_http_url("https://hooks.example.com/alert"));
        assert!(!is_http_url("partner@firm.example"));

        assert!(is_email_address("partner@firm.example"));
        assert!(!is_email_address("https://x.example/a@b"));

        assert!(is_phone_number("+15551234567"));
        assert!(!is_phone_number("15551234567"));
        assert!(!is_phone_number("+"));
        assert!(!is_phone_number("+1555-123"));

        assert!(is_user_id("associate-on-call"));
        assert!(!is_user_id("partner@firm.example"));
        assert!(!is_user_id("+15551234567"));
    }

    #[test]
    fn test_validated_url_rejects_garbage() {
        assert!(validated_url("https://hooks.example.com/x").is_ok());
        assert!(validated_url("not a url").is_err());
        assert!(validated_url("ftp://hooks.example.com/x").is_err());
    }

    #[test]
    fn test_registry_skips_unconfigured_optional_channels() {
        let mut config = Config::from_env();
        config.slack_webhook_url = String::new();
        config.teams_webhook_url = String::new();
        config.sms_provider_url = String::new();
        config.push_provider_url = String::new();
        let registry = build_registry(&config);

        assert!(registry.contains_key(&NotificationChannel::Webhook));
        assert!(!registry.contains_key(&NotificationChannel::Slack));
        assert!(!registry.contains_key(&NotificationChannel::Teams));
        assert!(!registry.contains_key(&NotificationChannel::Sms));
        assert!(!registry.contains_key(&NotificationChannel::Push));
    }

    #[test]
    fn test_registry_includes_configured_webhook_family() {
        let mut config = Config::from_env();
        config.slack_webhook_url = "https://hooks.slack.example/T000/B000/x".into();
        config.teams_webhook_url = "https://firm.webhook.office.example/hook".into();
        let registry = build_registry(&config);
        assert!(registry.contains_key(&NotificationChannel::Slack));
        assert!(registry.contains_key(&NotificationChannel::Teams));
    }
}
