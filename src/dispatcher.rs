// =============================================================================
// dispatcher.rs — THE ALERT SWITCHBOARD
// =============================================================================
//
// Changes come off the conveyor belt from the check workers; rendered,
// addressed, rate-limited, batched notifications go out the other side.
//
// The pipeline per change:
//   1. Archive the change (consumed exactly once, then it's history).
//   2. Look up the case's subscribed rules and keep the ones whose
//      type/severity/condition filters match.
//   3. For each surviving rule: clear the global rolling-hour rate
//      limiter — the (N+1)-th event in a window is DROPPED, not queued,
//      because an unbounded queue of stale alerts is worse than no alert.
//   4. Render title/body from the fixed templates, resolve recipients,
//      mint one NotificationEvent per (change, rule) pair.
//   5. Sort the event into per-channel batches. A batch flushes when it
//      fills up or its window expires, one call per channel adapter.
//
// Failures are isolated per channel per event. Email bouncing does not
// delay Slack; a webhook endpoint having a bad day costs that endpoint
// its retries and nobody else anything.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::Notifier;
use crate::config::Config;
use crate::error::MonitorError;
use crate::metrics::MetricsCollector;
use crate::models::{
    ChangeDetection, DeliveryStatus, MonitoringRule, NotificationChannel, NotificationEvent,
};
use crate::monitor::CaseRegistry;
use crate::store::{keys, KeyValueStore, TypedStore};

// =============================================================================
// RULE REGISTRY
// =============================================================================

/// Shared rule storage. Rules are referenced by ID from many cases and
/// owned by nobody; matching reads a point-in-time clone, so a rule is
/// effectively immutable once matched.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    inner: Arc<RwLock<HashMap<Uuid, MonitoringRule>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, rule: MonitoringRule) {
        self.inner.write().insert(rule.rule_id, rule);
    }

    pub fn remove(&self, rule_id: Uuid) -> bool {
        self.inner.write().remove(&rule_id).is_some()
    }

    pub fn get(&self, rule_id: Uuid) -> Option<MonitoringRule> {
        self.inner.read().get(&rule_id).cloned()
    }

    pub fn contains(&self, rule_id: Uuid) -> bool {
        self.inner.read().contains_key(&rule_id)
    }

    pub fn get_many(&self, rule_ids: &[Uuid]) -> Vec<MonitoringRule> {
        let rules = self.inner.read();
        rule_ids
            .iter()
            .filter_map(|id| rules.get(id).cloned())
            .collect()
    }

    pub fn all(&self) -> Vec<MonitoringRule> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// =============================================================================
// TEMPLATES
// =============================================================================

const TITLE_TEMPLATE: &str = "[{{ severity }}] {{ change_type }} — {{ case_number }}";

const BODY_TEMPLATE: &str = "\
Case {{ case_number }}{% if court %} ({{ court }}){% endif %}
Severity: {{ severity }}
Change: {{ change_type }}{% if entry_number %}
Entry: #{{ entry_number }}{% endif %}

{{ description }}";

/// What the templates see. Deliberately small: case number, court,
/// severity, change type, description, entry number — the fixed alert
/// vocabulary, nothing free-form.
#[derive(Serialize)]
struct AlertContext<'a> {
    case_number: &'a str,
    court: Option<&'a str>,
    severity: String,
    change_type: String,
    description: &'a str,
    entry_number: Option<u32>,
}

/// Renders alert titles and bodies from the fixed minijinja templates.
/// Templates are compiled once at construction; a render failure after
/// that means the context shape changed, which is a programming error
/// surfaced as a configuration error rather than a panic.
pub struct AlertRenderer {
    env: minijinja::Environment<'static>,
}

impl AlertRenderer {
    pub fn new() -> Result<Self, MonitorError> {
        let mut env = minijinja::Environment::new();
        env.add_template("title", TITLE_TEMPLATE)
            .map_err(|e| MonitorError::Configuration(format!("title template: {e}")))?;
        env.add_template("body", BODY_TEMPLATE)
            .map_err(|e| MonitorError::Configuration(format!("body template: {e}")))?;
        Ok(Self { env })
    }

    pub fn render(&self, change: &ChangeDetection) -> Result<(String, String), MonitorError> {
        let ctx = AlertContext {
            case_number: &change.case_number,
            court: change.court.as_deref(),
            severity: change.severity.to_string(),
            change_type: change.change_type.to_string(),
            description: &change.description,
            entry_number: change.entry_number,
        };
        let title = self
            .env
            .get_template("title")
            .and_then(|t| t.render(&ctx))
            .map_err(|e| MonitorError::Configuration(format!("title render: {e}")))?;
        let body = self
            .env
            .get_template("body")
            .and_then(|t| t.render(&ctx))
            .map_err(|e| MonitorError::Configuration(format!("body render: {e}")))?;
        Ok((title, body))
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

/// Global rolling-hour notification cap. Timestamps in, verdicts out; the
/// window slides continuously rather than resetting on the hour, so a
/// burst at :59 doesn't get a fresh allowance at :00.
pub struct HourlyRateLimiter {
    max_per_hour: usize,
    window: Mutex<std::collections::VecDeque<DateTime<Utc>>>,
}

impl HourlyRateLimiter {
    pub fn new(max_per_hour: usize) -> Self {
        Self {
            max_per_hour,
            window: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Admit one notification, or refuse. Refused means dropped — the
    /// caller records the drop and moves on.
    pub fn try_admit(&self) -> bool {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::hours(1);
        let mut window = self.window.lock();
        while window.front().map(|t| *t < cutoff).unwrap_or(false) {
            window.pop_front();
        }
        if window.len() >= self.max_per_hour {
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn admitted_this_hour(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        self.window.lock().iter().filter(|t| **t >= cutoff).count()
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

struct ChannelBatch {
    event_ids: Vec<Uuid>,
    opened_at: Instant,
}

impl ChannelBatch {
    fn new() -> Self {
        Self {
            event_ids: Vec::new(),
            opened_at: Instant::now(),
        }
    }
}

pub struct Dispatcher {
    receiver: Receiver<ChangeDetection>,
    registry: CaseRegistry,
    rules: RuleRegistry,
    store: Arc<dyn KeyValueStore>,
    channels: HashMap<NotificationChannel, Arc<dyn Notifier>>,
    renderer: AlertRenderer,
    limiter: HourlyRateLimiter,
    metrics: Arc<MetricsCollector>,

    /// Events awaiting delivery or retry, by ID. The per-channel batches
    /// below hold IDs into this map.
    events: HashMap<Uuid, NotificationEvent>,
    batches: HashMap<NotificationChannel, ChannelBatch>,

    batch_size: usize,
    batch_window: Duration,
    max_retries: u32,
    store_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        receiver: Receiver<ChangeDetection>,
        registry: CaseRegistry,
        rules: RuleRegistry,
        store: Arc<dyn KeyValueStore>,
        channels: HashMap<NotificationChannel, Arc<dyn Notifier>>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, MonitorError> {
        info!(
            max_per_hour = config.max_notifications_per_hour,
            batch_size = config.notification_batch_size,
            batch_window_secs = config.notification_batch_window.as_secs(),
            channels = channels.len(),
            "Dispatcher initializing — the switchboard is live"
        );
        Ok(Self {
            receiver,
            registry,
            rules,
            store,
            channels,
            renderer: AlertRenderer::new()?,
            limiter: HourlyRateLimiter::new(config.max_notifications_per_hour),
            metrics,
            events: HashMap::new(),
            batches: HashMap::new(),
            batch_size: config.notification_batch_size,
            batch_window: config.notification_batch_window,
            max_retries: config.max_delivery_retries,
            store_ttl: config.store_ttl,
        })
    }

    /// Consume the change channel until shutdown, flushing batches as
    /// they fill or their windows lapse. On shutdown the channel is
    /// drained and everything pending flushes once, ready or not.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received — draining remaining changes");
                while let Ok(change) = self.receiver.try_recv() {
                    self.process_change(change).await;
                }
                self.flush_ready(true).await;
                info!("Dispatcher shutting down");
                return Ok(());
            }

            let mut processed = 0usize;
            while processed < 100 {
                match self.receiver.try_recv() {
                    Ok(change) => {
                        self.process_change(change).await;
                        processed += 1;
                    }
                    Err(crossbeam_channel::TryRecvError::Empty) => break,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        info!("Change channel disconnected — dispatcher shutting down");
                        self.flush_ready(true).await;
                        return Ok(());
                    }
                }
            }

            self.flush_ready(false).await;

            if processed == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    /// Turn one detected change into zero or more enqueued notification
    /// events: archive, match, rate-limit, render, address, batch.
    pub async fn process_change(&mut self, change: ChangeDetection) {
        // Archive first. The change is consumed exactly once; after this,
        // the store is its biography.
        if let Err(e) = self
            .store
            .set_json(&keys::change(change.change_id), &change, Some(self.store_ttl))
            .await
        {
            warn!(error = %e, change_id = %change.change_id, "Failed to archive change");
        }

        let Some(case) = self.registry.get(change.monitor_id) else {
            debug!(monitor_id = %change.monitor_id, "Change for unknown monitor — dropped");
            return;
        };

        let matching: Vec<MonitoringRule> = self
            .rules
            .get_many(&case.rule_ids)
            .into_iter()
            .filter(|rule| rule.matches(&change))
            .collect();

        if matching.is_empty() {
            debug!(
                change_id = %change.change_id,
                rules_checked = case.rule_ids.len(),
                "No rule matched — change archived, nobody paged"
            );
            return;
        }

        let (title, body) = match self.renderer.render(&change) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, change_id = %change.change_id, "Template render failed");
                return;
            }
        };

        for rule in matching {
            // The global cap. Refusal means the alert dies here, loudly.
            if !self.limiter.try_admit() {
                self.metrics.increment_notifications_rate_limited();
                warn!(
                    change_id = %change.change_id,
                    rule = %rule.name,
                    "Notification rate cap reached — alert dropped, not queued"
                );
                continue;
            }

            let mut event = NotificationEvent {
                event_id: Uuid::new_v4(),
                change_id: change.change_id,
                rule_id: rule.rule_id,
                monitor_id: change.monitor_id,
                channels: rule.channels.clone(),
                recipients: rule.recipients.clone(),
                title: title.clone(),
                body: body.clone(),
                severity: change.severity,
                delivery: HashMap::new(),
                retry_count: 0,
                created_at: Utc::now(),
            };

            for channel in &event.channels {
                if self.channels.contains_key(channel) {
                    event.delivery.insert(*channel, DeliveryStatus::Pending);
                } else {
                    event.delivery.insert(
                        *channel,
                        DeliveryStatus::Skipped("channel not configured".into()),
                    );
                }
            }

            self.metrics.increment_notifications_enqueued();
            debug!(
                event_id = %event.event_id,
                rule = %rule.name,
                channels = event.channels.len(),
                "Notification event enqueued"
            );

            let event_id = event.event_id;
            let pending: Vec<NotificationChannel> = event
                .delivery
                .iter()
                .filter(|(_, s)| matches!(s, DeliveryStatus::Pending))
                .map(|(c, _)| *c)
                .collect();

            if pending.is_empty() {
                // Every channel was unconfigured. The event is already
                // settled; record it and let it go.
                self.metrics.increment_notifications_skipped();
                continue;
            }

            self.events.insert(event_id, event);
            for channel in pending {
                self.batches
                    .entry(channel)
                    .or_insert_with(ChannelBatch::new)
                    .event_ids
                    .push(event_id);
            }
        }
    }

    /// Flush every channel batch that is full, stale, or (with `force`)
    /// merely non-empty. Deliveries run concurrently across channels;
    /// results are applied when all of them are in.
    pub async fn flush_ready(&mut self, force: bool) {
        let mut to_flush: Vec<(NotificationChannel, Vec<Uuid>)> = Vec::new();
        for (channel, batch) in self.batches.iter_mut() {
            if batch.event_ids.is_empty() {
                batch.opened_at = Instant::now();
                continue;
            }
            let full = batch.event_ids.len() >= self.batch_size;
            let stale = batch.opened_at.elapsed() >= self.batch_window;
            if force || full || stale {
                let ids = std::mem::take(&mut batch.event_ids);
                batch.opened_at = Instant::now();
                to_flush.push((*channel, ids));
            }
        }
        if to_flush.is_empty() {
            return;
        }

        let mut calls = Vec::with_capacity(to_flush.len());
        for (channel, ids) in to_flush {
            let adapter = self.channels.get(&channel).cloned();
            let batch_events: Vec<NotificationEvent> = ids
                .iter()
                .filter_map(|id| self.events.get(id).cloned())
                .collect();
            calls.push(async move {
                let result = match adapter {
                    Some(adapter) if !batch_events.is_empty() => {
                        adapter.deliver_batch(&batch_events).await
                    }
                    _ => Ok(()),
                };
                (channel, ids, result)
            });
        }

        let results = futures::future::join_all(calls).await;
        for (channel, ids, result) in results {
            self.apply_delivery(channel, &ids, result);
        }
    }

    /// Record a batch verdict against every event in it, schedule retries
    /// for failures, and retire events with nothing left to deliver.
    fn apply_delivery(
        &mut self,
        channel: NotificationChannel,
        ids: &[Uuid],
        result: Result<(), MonitorError>,
    ) {
        let mut retry_ids: Vec<Uuid> = Vec::new();

        for id in ids {
            let Some(event) = self.events.get_mut(id) else {
                continue;
            };
            match &result {
                Ok(()) => {
                    event.delivery.insert(channel, DeliveryStatus::Delivered);
                    self.metrics.increment_notifications_delivered();
                }
                Err(e) => {
                    event
                        .delivery
                        .insert(channel, DeliveryStatus::Failed(e.to_string()));
                    event.retry_count += 1;
                    if event.retry_count < self.max_retries {
                        retry_ids.push(*id);
                    } else {
                        self.metrics.increment_notifications_failed();
                        warn!(
                            event_id = %id,
                            channel = %channel,
                            retries = event.retry_count,
                            "Delivery retries exhausted — event marked failed"
                        );
                    }
                }
            }
        }

        if let Err(e) = result {
            debug!(channel = %channel, error = %e, retrying = retry_ids.len(), "Channel batch failed");
        }

        for id in retry_ids {
            self.batches
                .entry(channel)
                .or_insert_with(ChannelBatch::new)
                .event_ids
                .push(id);
        }

        // Retire settled events: every channel Delivered/Skipped, or
        // Failed with retries exhausted. Unsettled events stay for their
        // retry flush.
        let max_retries = self.max_retries;
        self.events.retain(|id, event| {
            let settled = event.channels.iter().all(|c| {
                match event.delivery.get(c) {
                    Some(DeliveryStatus::Delivered) | Some(DeliveryStatus::Skipped(_)) => true,
                    Some(DeliveryStatus::Failed(_)) => event.retry_count >= max_retries,
                    Some(DeliveryStatus::Pending) | None => false,
                }
            });
            if settled {
                debug!(event_id = %id, "Notification event settled");
            }
            !settled
        });
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeType, MonitoredCase, PollFrequency, Severity};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use portable_atomic::{AtomicU64, Ordering};

    /// Records batch sizes; fails the first `fail_first` calls.
    struct MemoryNotifier {
        channel: NotificationChannel,
        batches: Mutex<Vec<usize>>,
        fail_first: AtomicU64,
    }

    impl MemoryNotifier {
        fn new(channel: NotificationChannel) -> Arc<Self> {
            Arc::new(Self {
                channel,
                batches: Mutex::new(Vec::new()),
                fail_first: AtomicU64::new(0),
            })
        }

        fn failing(channel: NotificationChannel, failures: u64) -> Arc<Self> {
            let notifier = Self::new(channel);
            notifier.fail_first.store(failures, Ordering::Relaxed);
            notifier
        }

        fn delivered_batches(&self) -> Vec<usize> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl Notifier for MemoryNotifier {
        fn channel(&self) -> NotificationChannel {
            self.channel
        }

        async fn deliver_batch(&self, events: &[NotificationEvent]) -> Result<(), MonitorError> {
            let remaining = self.fail_first.load(Ordering::Relaxed);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::Relaxed);
                return Err(MonitorError::NotificationDelivery {
                    channel: self.channel,
                    reason: "scripted failure".into(),
                });
            }
            self.batches.lock().push(events.len());
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        registry: CaseRegistry,
        rules: RuleRegistry,
        monitor_id: Uuid,
    }

    fn config_with(max_per_hour: usize, batch_size: usize, window: Duration) -> Config {
        let mut config = Config::from_env();
        config.max_notifications_per_hour = max_per_hour;
        config.notification_batch_size = batch_size;
        config.notification_batch_window = window;
        config.max_delivery_retries = 3;
        config
    }

    fn harness(
        config: Config,
        adapters: Vec<Arc<dyn Notifier>>,
        rule_channels: Vec<NotificationChannel>,
    ) -> Harness {
        let registry = CaseRegistry::new();
        let rules = RuleRegistry::new();

        let mut rule = MonitoringRule::new("everything", rule_channels);
        rule.recipients = vec!["partner@firm.example".into()];
        let rule_id = rule.rule_id;
        rules.upsert(rule);

        let mut case = MonitoredCase::new("2:24-cv-0001", "pacer", PollFrequency::Every15Min, 3);
        case.rule_ids = vec![rule_id];
        let monitor_id = case.monitor_id;
        registry.insert(case);

        let (_tx, rx) = crossbeam_channel::bounded(16);
        let channels: HashMap<NotificationChannel, Arc<dyn Notifier>> = adapters
            .into_iter()
            .map(|a| (a.channel(), a))
            .collect();
        let dispatcher = Dispatcher::new(
            &config,
            rx,
            registry.clone(),
            rules.clone(),
            Arc::new(MemoryStore::new()),
            channels,
            Arc::new(MetricsCollector::new()),
        )
        .expect("dispatcher builds");

        Harness {
            dispatcher,
            registry,
            rules,
            monitor_id,
        }
    }

    fn change(h: &Harness, description: &str) -> ChangeDetection {
        ChangeDetection::new(
            h.monitor_id,
            "2:24-cv-0001",
            "pacer",
            ChangeType::MotionFiled,
            Severity::High,
            description,
        )
    }

    #[test]
    fn test_renderer_fills_fixed_fields() {
        let renderer = AlertRenderer::new().expect("templates compile");
        let mut change = ChangeDetection::new(
            Uuid::new_v4(),
            "2:24-cv-0001",
            "pacer",
            ChangeType::OrderEntered,
            Severity::Critical,
            "ORDER granting motion to compel",
        );
        change.entry_number = Some(7);
        change.court = Some("D. Example".into());

        let (title, body) = renderer.render(&change).expect("render");
        assert_eq!(title, "[CRITICAL] ORDER_ENTERED — 2:24-cv-0001");
        assert!(body.contains("Case 2:24-cv-0001 (D. Example)"));
        assert!(body.contains("Entry: #7"));
        assert!(body.contains("ORDER granting motion to compel"));
    }

    #[test]
    fn test_renderer_omits_absent_fields() {
        let renderer = AlertRenderer::new().expect("templates compile");
        let change = ChangeDetection::new(
            Uuid::new_v4(),
            "2:24-cv-0001",
            "pacer",
            ChangeType::NewEntry,
            Severity::Medium,
            "Certificate of service",
        );
        let (_, body) = renderer.render(&change).expect("render");
        assert!(!body.contains("Entry:"));
        assert!(!body.contains('('));
    }

    #[test]
    fn test_rate_limiter_refuses_past_cap() {
        let limiter = HourlyRateLimiter::new(2);
        assert!(limiter.try_admit());
        assert!(limiter.try_admit());
        assert!(!limiter.try_admit(), "third event in the hour must be refused");
        assert_eq!(limiter.admitted_this_hour(), 2);
    }

    #[tokio::test]
    async fn test_matching_rule_produces_one_event() {
        let notifier = MemoryNotifier::new(NotificationChannel::Email);
        let mut h = harness(
            config_with(100, 10, Duration::from_secs(30)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );

        let c = change(&h, "Motion to Dismiss filed");
        h.dispatcher.process_change(c).await;

        assert_eq!(h.dispatcher.pending_events(), 1);
        h.dispatcher.flush_ready(true).await;
        assert_eq!(h.dispatcher.pending_events(), 0);
        assert_eq!(notifier.delivered_batches(), vec![1]);
    }

    #[tokio::test]
    async fn test_non_matching_rule_produces_nothing() {
        let notifier = MemoryNotifier::new(NotificationChannel::Email);
        let mut h = harness(
            config_with(100, 10, Duration::from_secs(30)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );
        // Narrow the rule to judgments only.
        let rule_id = h.registry.get(h.monitor_id).expect("case").rule_ids[0];
        let mut rule = h.rules.get(rule_id).expect("rule");
        rule.change_types = vec![ChangeType::JudgmentEntered];
        h.rules.upsert(rule);

        h.dispatcher
            .process_change(change(&h, "Motion to Dismiss filed"))
            .await;
        assert_eq!(h.dispatcher.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_rate_cap_drops_excess_events() {
        let notifier = MemoryNotifier::new(NotificationChannel::Email);
        let mut h = harness(
            config_with(2, 10, Duration::from_secs(30)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );

        for i in 0..3 {
            h.dispatcher
                .process_change(change(&h, &format!("Motion number {i}")))
                .await;
        }
        // The third was dropped outright, not queued.
        assert_eq!(h.dispatcher.pending_events(), 2);
    }

    #[tokio::test]
    async fn test_batch_flushes_when_full() {
        let notifier = MemoryNotifier::new(NotificationChannel::Email);
        let mut h = harness(
            config_with(100, 2, Duration::from_secs(3600)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );

        h.dispatcher.process_change(change(&h, "Motion one")).await;
        h.dispatcher.flush_ready(false).await;
        assert!(notifier.delivered_batches().is_empty(), "batch of 1 must wait");

        h.dispatcher.process_change(change(&h, "Motion two")).await;
        h.dispatcher.flush_ready(false).await;
        assert_eq!(notifier.delivered_batches(), vec![2], "full batch flushes");
    }

    #[tokio::test]
    async fn test_batch_flushes_when_window_lapses() {
        let notifier = MemoryNotifier::new(NotificationChannel::Email);
        let mut h = harness(
            config_with(100, 100, Duration::from_millis(20)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );

        h.dispatcher.process_change(change(&h, "Motion one")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        h.dispatcher.flush_ready(false).await;
        assert_eq!(notifier.delivered_batches(), vec![1]);
    }

    #[tokio::test]
    async fn test_failed_delivery_retries_then_succeeds() {
        let notifier = MemoryNotifier::failing(NotificationChannel::Email, 2);
        let mut h = harness(
            config_with(100, 10, Duration::from_secs(30)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );

        h.dispatcher.process_change(change(&h, "Motion one")).await;
        h.dispatcher.flush_ready(true).await; // fail #1
        assert_eq!(h.dispatcher.pending_events(), 1);
        h.dispatcher.flush_ready(true).await; // fail #2
        h.dispatcher.flush_ready(true).await; // success
        assert_eq!(h.dispatcher.pending_events(), 0);
        assert_eq!(notifier.delivered_batches(), vec![1]);
    }

    #[tokio::test]
    async fn test_retries_exhaust_and_event_settles_failed() {
        let notifier = MemoryNotifier::failing(NotificationChannel::Email, u64::MAX);
        let mut h = harness(
            config_with(100, 10, Duration::from_secs(30)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );

        h.dispatcher.process_change(change(&h, "Motion one")).await;
        for _ in 0..3 {
            h.dispatcher.flush_ready(true).await;
        }
        // max_delivery_retries = 3: the event gave up and retired.
        assert_eq!(h.dispatcher.pending_events(), 0);
        assert!(notifier.delivered_batches().is_empty());
    }

    #[tokio::test]
    async fn test_channel_failures_are_isolated() {
        let good = MemoryNotifier::new(NotificationChannel::Slack);
        let bad = MemoryNotifier::failing(NotificationChannel::Email, u64::MAX);
        let mut h = harness(
            config_with(100, 10, Duration::from_secs(30)),
            vec![good.clone() as Arc<dyn Notifier>, bad.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Email, NotificationChannel::Slack],
        );

        h.dispatcher.process_change(change(&h, "Motion one")).await;
        h.dispatcher.flush_ready(true).await;

        // Slack delivered on the first flush; email keeps failing alone.
        assert_eq!(good.delivered_batches(), vec![1]);
        assert_eq!(h.dispatcher.pending_events(), 1, "email retry still owed");
    }

    #[tokio::test]
    async fn test_unconfigured_channel_is_skipped_not_retried() {
        // The rule asks for Teams but only Email has an adapter.
        let notifier = MemoryNotifier::new(NotificationChannel::Email);
        let mut h = harness(
            config_with(100, 10, Duration::from_secs(30)),
            vec![notifier.clone() as Arc<dyn Notifier>],
            vec![NotificationChannel::Teams],
        );

        h.dispatcher.process_change(change(&h, "Motion one")).await;
        // All channels skipped at enqueue time: nothing pending.
        assert_eq!(h.dispatcher.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_change_for_unknown_monitor_is_dropped() {
        let notifier = MemoryNotifier::new(NotificationChannel::Email);
        let mut h = harness(
            config_with(100, 10, Duration::from_secs(30)),
            vec![notifier as Arc<dyn Notifier>],
            vec![NotificationChannel::Email],
        );
        let orphan = ChangeDetection::new(
            Uuid::new_v4(), // not in the registry
            "9:99-cv-9999",
            "pacer",
            ChangeType::MotionFiled,
            Severity::High,
            "Motion from nowhere",
        );
        h.dispatcher.process_change(orphan).await;
        assert_eq!(h.dispatcher.pending_events(), 0);
    }
}
