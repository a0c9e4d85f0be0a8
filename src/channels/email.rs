// =============================================================================
// channels/email.rs — THE CHANNEL PARTNERS ACTUALLY READ
// =============================================================================
//
// SMTP via lettre's async transport. Credentials come from the
// DOCKET_SENTINEL_SMTP_USERNAME / DOCKET_SENTINEL_SMTP_PASSWORD env vars
// when present; an unauthenticated relay is assumed otherwise (hello,
// localhost postfix).
// =============================================================================

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use super::{delivery_error, is_email_address, Notifier};
use crate::config::Config;
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent};

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    /// Build the SMTP transport once at startup. A bad sender address or
    /// relay hostname is a configuration error, caught at boot.
    pub fn from_config(config: &Config) -> Result<Self, MonitorError> {
        let from: Mailbox = config
            .smtp_from
            .parse()
            .map_err(|e: lettre::address::AddressError| {
                MonitorError::Configuration(format!("bad smtp_from '{}': {e}", config.smtp_from))
            })?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| MonitorError::Configuration(format!("smtp relay: {e}")))?
            .port(config.smtp_port);

        if let (Ok(username), Ok(password)) = (
            std::env::var("DOCKET_SENTINEL_SMTP_USERNAME"),
            std::env::var("DOCKET_SENTINEL_SMTP_PASSWORD"),
        ) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    /// Parse the event's email-shaped recipients. Anything that doesn't
    /// parse as a mailbox is some other channel's problem.
    fn mailboxes(event: &NotificationEvent) -> Vec<Mailbox> {
        event
            .recipients
            .iter()
            .filter(|r| is_email_address(r))
            .filter_map(|r| r.parse::<Mailbox>().ok())
            .collect()
    }
}

#[async_trait]
impl Notifier for EmailChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }

    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
        let mut sent = 0usize;
        for event in events {
            let recipients = Self::mailboxes(event);
            if recipients.is_empty() {
                debug!(event_id = %event.event_id, "No email recipients on event — nothing to send");
                continue;
            }

            let mut builder = Message::builder().from(self.from.clone());
            for recipient in &recipients {
                builder = builder.to(recipient.clone());
            }
            let message = builder
                .subject(&event.title)
                .body(event.body.clone())
                .map_err(|e| delivery_error(NotificationChannel::Email, e.to_string()))?;

            self.transport
                .send(message)
                .await
                .map_err(|e| delivery_error(NotificationChannel::Email, e.to_string()))?;
            sent += 1;
        }

        if sent > 0 {
            info!(sent, "Email batch delivered");
        }
        Ok(())
    }
}
