// =============================================================================
// metrics.rs — THE SCOREBOARD
// =============================================================================
//
// Atomic counters for everything. Lock-free because five check workers
// and a dispatcher all finish at once and the scoreboard must not become
// the bottleneck it exists to detect. Exposes a tiny HTTP server so the
// case dashboard (and the on-call engineer's curl habit) can check engine
// health without asking the engine to do any real work.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

/// The serialized view: what `GET /metrics` returns.
#[derive(Debug, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub cases_registered: u64,
    pub checks_started: u64,
    pub checks_succeeded: u64,
    pub checks_failed: u64,
    pub checks_timed_out: u64,
    pub checks_deferred_cost: u64,
    pub checks_deferred_rate: u64,
    pub changes_detected: u64,
    pub changes_suppressed: u64,
    pub changes_dropped: u64,
    pub notifications_enqueued: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub notifications_skipped: u64,
    pub notifications_rate_limited: u64,
    pub budget_threshold_alerts: u64,
    pub stuck_monitors_flagged: u64,
    pub uptime_seconds: u64,
    pub checks_per_minute: f64,
    pub status: String,
}

/// Thread-safe atomic metrics collector. Incremented from the scheduler
/// loop, check workers, the dispatcher, and maintenance — concurrently,
/// without a single lock.
pub struct MetricsCollector {
    cases_registered: AtomicU64,
    checks_started: AtomicU64,
    checks_succeeded: AtomicU64,
    checks_failed: AtomicU64,
    checks_timed_out: AtomicU64,
    checks_deferred_cost: AtomicU64,
    checks_deferred_rate: AtomicU64,
    changes_detected: AtomicU64,
    changes_suppressed: AtomicU64,
    changes_dropped: AtomicU64,
    notifications_enqueued: AtomicU64,
    notifications_delivered: AtomicU64,
    notifications_failed: AtomicU64,
    notifications_skipped: AtomicU64,
    notifications_rate_limited: AtomicU64,
    budget_threshold_alerts: AtomicU64,
    stuck_monitors_flagged: AtomicU64,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            cases_registered: AtomicU64::new(0),
            checks_started: AtomicU64::new(0),
            checks_succeeded: AtomicU64::new(0),
            checks_failed: AtomicU64::new(0),
            checks_timed_out: AtomicU64::new(0),
            checks_deferred_cost: AtomicU64::new(0),
            checks_deferred_rate: AtomicU64::new(0),
            changes_detected: AtomicU64::new(0),
            changes_suppressed: AtomicU64::new(0),
            changes_dropped: AtomicU64::new(0),
            notifications_enqueued: AtomicU64::new(0),
            notifications_delivered: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            notifications_skipped: AtomicU64::new(0),
            notifications_rate_limited: AtomicU64::new(0),
            budget_threshold_alerts: AtomicU64::new(0),
            stuck_monitors_flagged: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn increment_cases_registered(&self) {
        self.cases_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checks_started(&self) {
        self.checks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checks_succeeded(&self) {
        self.checks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checks_failed(&self) {
        self.checks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checks_timed_out(&self) {
        self.checks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checks_deferred_cost(&self) {
        self.checks_deferred_cost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checks_deferred_rate(&self) {
        self.checks_deferred_rate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_changes_detected(&self, count: u64) {
        self.changes_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_changes_suppressed(&self) {
        self.changes_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_changes_dropped(&self) {
        self.changes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_notifications_enqueued(&self) {
        self.notifications_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_notifications_delivered(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_notifications_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_notifications_skipped(&self) {
        self.notifications_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_notifications_rate_limited(&self) {
        self.notifications_rate_limited
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_budget_alerts(&self, count: u64) {
        self.budget_threshold_alerts
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_stuck_flagged(&self, count: u64) {
        self.stuck_monitors_flagged
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Lock-free snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let started = self.checks_started.load(Ordering::Relaxed);
        let checks_per_minute = if uptime > 0 {
            (started as f64 / uptime as f64) * 60.0
        } else {
            0.0
        };

        MetricsSnapshot {
            cases_registered: self.cases_registered.load(Ordering::Relaxed),
            checks_started: started,
            checks_succeeded: self.checks_succeeded.load(Ordering::Relaxed),
            checks_failed: self.checks_failed.load(Ordering::Relaxed),
            checks_timed_out: self.checks_timed_out.load(Ordering::Relaxed),
            checks_deferred_cost: self.checks_deferred_cost.load(Ordering::Relaxed),
            checks_deferred_rate: self.checks_deferred_rate.load(Ordering::Relaxed),
            changes_detected: self.changes_detected.load(Ordering::Relaxed),
            changes_suppressed: self.changes_suppressed.load(Ordering::Relaxed),
            changes_dropped: self.changes_dropped.load(Ordering::Relaxed),
            notifications_enqueued: self.notifications_enqueued.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notifications_skipped: self.notifications_skipped.load(Ordering::Relaxed),
            notifications_rate_limited: self.notifications_rate_limited.load(Ordering::Relaxed),
            budget_threshold_alerts: self.budget_threshold_alerts.load(Ordering::Relaxed),
            stuck_monitors_flagged: self.stuck_monitors_flagged.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            checks_per_minute,
            status: "operational".to_string(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A tiny HTTP server serving the snapshot as JSON. One endpoint, no
/// router, no framework — a raw TcpListener and a hand-written response,
/// because bringing a web framework to serve one JSON blob is overkill
/// even by this codebase's standards.
pub async fn run_metrics_server(
    metrics: Arc<MetricsCollector>,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    info!(port, "📊 Metrics server listening");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((mut stream, _addr)) => {
                        let snapshot = metrics.snapshot();
                        let json = serde_json::to_string_pretty(&snapshot)
                            .unwrap_or_else(|_| "{}".to_string());

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
                            json.len(),
                            json,
                        );

                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Metrics server accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Metrics server shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_into_snapshot() {
        let metrics = MetricsCollector::new();
        metrics.increment_checks_started();
        metrics.increment_checks_started();
        metrics.increment_checks_succeeded();
        metrics.increment_checks_failed();
        metrics.add_changes_detected(5);
        metrics.increment_changes_suppressed();
        metrics.increment_notifications_enqueued();
        metrics.increment_notifications_rate_limited();
        metrics.add_budget_alerts(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.checks_started, 2);
        assert_eq!(snapshot.checks_succeeded, 1);
        assert_eq!(snapshot.checks_failed, 1);
        assert_eq!(snapshot.changes_detected, 5);
        assert_eq!(snapshot.changes_suppressed, 1);
        assert_eq!(snapshot.notifications_enqueued, 1);
        assert_eq!(snapshot.notifications_rate_limited, 1);
        assert_eq!(snapshot.budget_threshold_alerts, 2);
        assert_eq!(snapshot.status, "operational");
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::new();
        let json = serde_json::to_string(&metrics.snapshot()).expect("serializable");
        assert!(json.contains("\"checks_started\":0"));
        assert!(json.contains("\"status\":\"operational\""));
    }
}
