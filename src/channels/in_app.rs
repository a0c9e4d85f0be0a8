// =============================================================================
// channels/in_app.rs — THE REDIS TOWN CRIER
// =============================================================================
//
// In-app alerts ride Redis twice:
//
// 1. PUBLISH to a pub/sub channel for whoever has the dashboard open
//    right now.
// 2. ZADD into a sorted set scored by timestamp, because pub/sub is
//    fire-and-forget and lawyers close their laptops. The sorted set is
//    the catch-up log an offline consumer replays when it reconnects.
//
// The connection is established lazily and kept on a multiplexed handle;
// a dropped connection is re-dialed on the next flush instead of taking
// the whole dispatcher hostage.
// =============================================================================

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{delivery_error, Notifier};
use crate::config::Config;
use crate::error::MonitorError;
use crate::models::{NotificationChannel, NotificationEvent};

pub struct InAppChannel {
    client: redis::Client,
    channel_name: String,
    sorted_set: String,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl InAppChannel {
    /// Validate the Redis URL at boot; actual dialing waits for the first
    /// delivery.
    pub fn new(config: &Config) -> Result<Self, MonitorError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| MonitorError::Configuration(format!("bad redis url: {e}")))?;
        Ok(Self {
            client,
            channel_name: config.redis_channel.clone(),
            sorted_set: config.redis_sorted_set.clone(),
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, MonitorError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| delivery_error(NotificationChannel::InApp, format!("redis connect: {e}")))?;
        debug!("Redis connection established for in-app alerts");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        *self.connection.lock().await = None;
    }
}

#[async_trait]
impl Notifier for InAppChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::InApp
    }

    async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        for event in events {
            let json = serde_json::to_string(event)
                .map_err(|e| delivery_error(NotificationChannel::InApp, e.to_string()))?;

            let publish: Result<(), redis::RedisError> =
                conn.publish(&self.channel_name, &json).await;
            if let Err(e) = publish {
                warn!(error = %e, "Redis PUBLISH failed — dropping connection for re-dial");
                self.drop_connection().await;
                return Err(delivery_error(NotificationChannel::InApp, e.to_string()));
            }

            // Chronological score so the dashboard can ZRANGEBYSCORE its
            // way through anything it missed.
            let score = event.created_at.timestamp() as f64;
            let persist: Result<(), redis::RedisError> =
                conn.zadd(&self.sorted_set, &json, score).await;
            if let Err(e) = persist {
                warn!(error = %e, "Redis ZADD failed — dropping connection for re-dial");
                self.drop_connection().await;
                return Err(delivery_error(NotificationChannel::InApp, e.to_string()));
            }
        }

        info!(alerts = events.len(), "In-app batch published to Redis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryStatus, Severity};
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_new_validates_redis_url() {
        let mut config = Config::from_env();
        assert!(InAppChannel::new(&config).is_ok());
        config.redis_url = "definitely not a redis url".into();
        assert!(InAppChannel::new(&config).is_err());
    }

    #[test]
    fn test_event_payload_shape_survives_serde() {
        // The dashboard deserializes what we publish; make sure the wire
        // shape round-trips with per-channel statuses intact.
        let mut event = NotificationEvent {
            event_id: Uuid::new_v4(),
            change_id: Uuid::new_v4(),
            rule_id: Uuid::new_v4(),
            monitor_id: Uuid::new_v4(),
            channels: vec![NotificationChannel::InApp],
            recipients: vec!["war-room".into()],
            title: "[HIGH] MOTION_FILED — 2:24-cv-0001".into(),
            body: "Motion to Dismiss filed".into(),
            severity: Severity::High,
            delivery: HashMap::new(),
            retry_count: 0,
            created_at: chrono::Utc::now(),
        };
        event
            .delivery
            .insert(NotificationChannel::InApp, DeliveryStatus::Pending);

        let json = serde_json::to_string(&event).expect("serialize");
        let back: NotificationEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.title, event.title);
        assert_eq!(
            back.delivery.get(&NotificationChannel::InApp),
            Some(&DeliveryStatus::Pending)
        );
    }
}
