// =============================================================================
// config.rs — THE GRAND CONFIGURATION CATHEDRAL
// =============================================================================
//
// Every system needs configuration, but not every system needs THIS MUCH
// configuration. We have knobs for knobs. Budgets for budgets. Keyword
// lists that control which other keyword lists matter.
//
// All values can be overridden via environment variables, because hardcoding
// configuration is how you end up on the front page of Hacker News for the
// wrong reasons.
//
// Default values have been carefully chosen through a rigorous process of
// "that seems about right" and "the court portal will definitely rate-limit
// us if we go faster than this."
// =============================================================================

use std::env;
use std::time::Duration;

/// The Grand Configuration Struct. Every tunable parameter in the entire
/// engine lives here. Think of it as the cockpit of a fighter jet, except
/// instead of controlling weapons systems, you're controlling how
/// aggressively we poll a court portal for signs of litigation activity —
/// and how much money we're allowed to burn doing it.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // SCHEDULER
    // =========================================================================
    /// How often the driver loop wakes up to drain due checks.
    /// Default: 10 seconds. The loop is cooperative, never blocking.
    pub scheduler_tick: Duration,

    /// Maximum checks popped from the queue per tick. Keeps a backlog from
    /// turning one tick into a stampede.
    pub scheduler_batch_size: usize,

    /// The worker-pool semaphore size. Default: 5 concurrent checks.
    /// The portal is a shared public resource and we are, legally speaking,
    /// guests.
    pub max_concurrent_checks: usize,

    /// Consecutive failures before a case is parked in Error status.
    pub max_check_retries: u32,

    /// Base retry delay. Actual backoff is `retry_delay * retry_count`,
    /// so failure number three waits three times as long as failure one.
    pub retry_delay: Duration,

    /// Hard per-check timeout. On expiry the check counts as a failure and
    /// the worker slot is released no matter what the gateway is doing.
    pub check_timeout: Duration,

    /// Rolling-hour spending cap across ALL checks, in cents. When the
    /// projected hour total would cross this, due checks are deferred —
    /// left in the queue, never dropped.
    pub cost_limit_per_hour_cents: u64,

    /// How often the maintenance pass runs (stuck-monitor detection,
    /// store expiry sweep).
    pub maintenance_interval: Duration,

    /// A case is "stuck" when `last_checked_at` is more than this many
    /// expected intervals in the past. A monitoring signal, not an
    /// automatic fix.
    pub stuck_interval_multiplier: u32,

    // =========================================================================
    // ORCHESTRATOR
    // =========================================================================
    /// Global ceiling on monitored cases. The portal's fee schedule is the
    /// real ceiling; this one just fails faster.
    pub max_monitored_cases: usize,

    // =========================================================================
    // GATEWAY
    // =========================================================================
    /// Base URL of the court records portal feed.
    pub portal_base_url: String,

    /// HTTP timeout for a single portal request. Distinct from the overall
    /// check timeout, which also covers diffing and classification.
    pub portal_http_timeout: Duration,

    /// How we introduce ourselves. Honestly, because portal administrators
    /// have enough problems without wondering who's scraping their feeds.
    pub portal_user_agent: String,

    // =========================================================================
    // COST MODEL
    // Because the portal charges by the page, like it's 1987 and this is a
    // fax machine.
    // =========================================================================
    /// Fee per billable page, in cents.
    pub page_fee_cents: u64,

    /// Pages per document that don't bill. The portal's one act of mercy.
    pub free_pages_per_document: u32,

    /// Flat fee per search query, in cents.
    pub search_fee_cents: u64,

    /// The recurring free-spend allowance consumed before real charges
    /// accrue, reset every calendar quarter.
    pub quarterly_exemption_cents: u64,

    /// Usage percentages (of daily/monthly limits) at which threshold
    /// alerts fire. Non-blocking — the check that crossed the line still
    /// completes.
    pub budget_alert_thresholds: Vec<f64>,

    /// When set, crossing the LAST threshold in the list auto-suspends the
    /// account. The nuclear option, armed by default at 95%.
    pub auto_suspend_at_hard_threshold: bool,

    /// Account pool selection strategy: "round_robin" or "lru".
    pub account_strategy: String,

    /// Maximum concurrent sessions across the whole credential pool.
    pub max_concurrent_sessions: usize,

    // =========================================================================
    // NOTIFICATION DISPATCHER
    // =========================================================================
    /// Global ceiling on notifications per rolling hour. The (N+1)-th event
    /// in the window is dropped with a Skipped status, not queued forever.
    pub max_notifications_per_hour: usize,

    /// Per-channel batch size. A full batch flushes immediately.
    pub notification_batch_size: usize,

    /// A partial batch flushes when this window elapses.
    pub notification_batch_window: Duration,

    /// Delivery retries per event before we stop trying.
    pub max_delivery_retries: u32,

    // =========================================================================
    // CHANNEL ENDPOINTS
    // Where each adapter points its firehose.
    // =========================================================================
    pub redis_url: String,
    /// Redis pub/sub channel for in-app alerts.
    pub redis_channel: String,
    /// Redis sorted set holding alert history (scored by timestamp),
    /// because pub/sub is fire-and-forget and we don't want to forget.
    pub redis_sorted_set: String,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_from: String,

    pub slack_webhook_url: String,
    pub teams_webhook_url: String,
    /// SMS and push both delegate to provider webhook endpoints — the
    /// concrete provider SDK lives on the other side of an HTTP POST.
    pub sms_provider_url: String,
    pub push_provider_url: String,

    // =========================================================================
    // CHANGE DEDUP (Bloom + LRU hybrid)
    // =========================================================================
    pub bloom_expected_items: u64,
    pub bloom_false_positive_rate: f64,
    pub bloom_rotation_interval: Duration,
    pub lru_cache_size: usize,

    // =========================================================================
    // SNAPSHOT STORE
    // =========================================================================
    /// TTL for archived snapshots and change records.
    pub store_ttl: Duration,

    // =========================================================================
    // METRICS
    // =========================================================================
    /// Port for the metrics HTTP server.
    pub metrics_port: u16,

    // =========================================================================
    // CLASSIFICATION KEYWORDS
    // These are configuration data, not logic. Legal terminology is an
    // ocean and these lists are buckets; override them per deployment
    // rather than pretending any fixed list is exhaustive.
    // =========================================================================
    /// Five disjoint sets mapping docket text to a change type.
    pub motion_keywords: Vec<String>,
    pub order_keywords: Vec<String>,
    pub judgment_keywords: Vec<String>,
    pub hearing_keywords: Vec<String>,
    pub deadline_keywords: Vec<String>,

    /// Any of these forces severity to Urgent, full stop.
    pub urgent_keywords: Vec<String>,

    /// Any of these bumps severity one level (capped at Critical).
    pub decisive_keywords: Vec<String>,

    /// Markers scanned against a case's title/tags; a hit knocks 2 off the
    /// priority score so the case gets re-checked sooner.
    pub urgent_case_markers: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    /// "Sensible" here meaning "will run out of the box without any env vars
    /// but will also respect your wishes if you set them."
    ///
    /// Every parameter can be overridden via environment variables prefixed
    /// with DOCKET_SENTINEL_. Because namespacing your env vars is what
    /// separates the professionals from the amateurs.
    pub fn from_env() -> Self {
        // Try to load .env if it exists. Fail silently if it doesn't,
        // because not everyone has their life together enough to create
        // a .env file.
        let _ = dotenvy::dotenv();

        Config {
            // Scheduler
            scheduler_tick: secs_or("DOCKET_SENTINEL_TICK_SECS", 10),
            scheduler_batch_size: env_or_default("DOCKET_SENTINEL_TICK_BATCH", "50")
                .parse()
                .unwrap_or(50),
            max_concurrent_checks: env_or_default("DOCKET_SENTINEL_MAX_CONCURRENT_CHECKS", "5")
                .parse()
                .unwrap_or(5),
            max_check_retries: env_or_default("DOCKET_SENTINEL_MAX_RETRIES", "3")
                .parse()
                .unwrap_or(3),
            retry_delay: secs_or("DOCKET_SENTINEL_RETRY_DELAY_SECS", 300),
            check_timeout: secs_or("DOCKET_SENTINEL_CHECK_TIMEOUT_SECS", 120),
            cost_limit_per_hour_cents: env_or_default("DOCKET_SENTINEL_HOURLY_COST_CAP_CENTS", "5000")
                .parse()
                .unwrap_or(5000),
            maintenance_interval: secs_or("DOCKET_SENTINEL_MAINTENANCE_SECS", 300),
            stuck_interval_multiplier: env_or_default("DOCKET_SENTINEL_STUCK_MULTIPLIER", "3")
                .parse()
                .unwrap_or(3),

            // Orchestrator
            max_monitored_cases: env_or_default("DOCKET_SENTINEL_MAX_CASES", "500")
                .parse()
                .unwrap_or(500),

            // Gateway
            portal_base_url: env_or_default(
                "DOCKET_SENTINEL_PORTAL_BASE_URL",
                "https://records.example-court.gov/feed",
            ),
            portal_http_timeout: secs_or("DOCKET_SENTINEL_PORTAL_TIMEOUT_SECS", 15),
            portal_user_agent: env_or_default(
                "DOCKET_SENTINEL_USER_AGENT",
                "DocketSentinel/1.0 (docket-monitoring; legal-operations)",
            ),

            // Cost model
            page_fee_cents: env_or_default("DOCKET_SENTINEL_PAGE_FEE_CENTS", "10")
                .parse()
                .unwrap_or(10),
            free_pages_per_document: env_or_default("DOCKET_SENTINEL_FREE_PAGES_PER_DOC", "1")
                .parse()
                .unwrap_or(1),
            search_fee_cents: env_or_default("DOCKET_SENTINEL_SEARCH_FEE_CENTS", "30")
                .parse()
                .unwrap_or(30),
            quarterly_exemption_cents: env_or_default(
                "DOCKET_SENTINEL_QUARTERLY_EXEMPTION_CENTS",
                "3000",
            )
            .parse()
            .unwrap_or(3000),
            budget_alert_thresholds: env_list("DOCKET_SENTINEL_BUDGET_THRESHOLDS", "0.80,0.95")
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            auto_suspend_at_hard_threshold: env_or_default(
                "DOCKET_SENTINEL_AUTO_SUSPEND",
                "true",
            )
            .parse()
            .unwrap_or(true),
            account_strategy: env_or_default("DOCKET_SENTINEL_ACCOUNT_STRATEGY", "round_robin"),
            max_concurrent_sessions: env_or_default("DOCKET_SENTINEL_MAX_SESSIONS", "10")
                .parse()
                .unwrap_or(10),

            // Dispatcher
            max_notifications_per_hour: env_or_default(
                "DOCKET_SENTINEL_MAX_NOTIFICATIONS_PER_HOUR",
                "200",
            )
            .parse()
            .unwrap_or(200),
            notification_batch_size: env_or_default("DOCKET_SENTINEL_NOTIFY_BATCH_SIZE", "10")
                .parse()
                .unwrap_or(10),
            notification_batch_window: secs_or("DOCKET_SENTINEL_NOTIFY_BATCH_WINDOW_SECS", 30),
            max_delivery_retries: env_or_default("DOCKET_SENTINEL_MAX_DELIVERY_RETRIES", "3")
                .parse()
                .unwrap_or(3),

            // Channel endpoints
            redis_url: env_or_default("DOCKET_SENTINEL_REDIS_URL", "redis://127.0.0.1:6379"),
            redis_channel: env_or_default("DOCKET_SENTINEL_REDIS_CHANNEL", "docket:alerts"),
            redis_sorted_set: env_or_default(
                "DOCKET_SENTINEL_REDIS_SORTED_SET",
                "docket:alerts:history",
            ),
            smtp_host: env_or_default("DOCKET_SENTINEL_SMTP_HOST", "localhost"),
            smtp_port: env_or_default("DOCKET_SENTINEL_SMTP_PORT", "587")
                .parse()
                .unwrap_or(587),
            smtp_from: env_or_default(
                "DOCKET_SENTINEL_SMTP_FROM",
                "Docket Sentinel <alerts@localhost>",
            ),
            slack_webhook_url: env_or_default("DOCKET_SENTINEL_SLACK_WEBHOOK", ""),
            teams_webhook_url: env_or_default("DOCKET_SENTINEL_TEAMS_WEBHOOK", ""),
            sms_provider_url: env_or_default("DOCKET_SENTINEL_SMS_PROVIDER_URL", ""),
            push_provider_url: env_or_default("DOCKET_SENTINEL_PUSH_PROVIDER_URL", ""),

            // Dedup
            bloom_expected_items: env_or_default("DOCKET_SENTINEL_BLOOM_ITEMS", "100000")
                .parse()
                .unwrap_or(100_000),
            bloom_false_positive_rate: env_or_default("DOCKET_SENTINEL_BLOOM_FP_RATE", "0.01")
                .parse()
                .unwrap_or(0.01),
            bloom_rotation_interval: secs_or("DOCKET_SENTINEL_BLOOM_ROTATION_SECS", 86_400),
            lru_cache_size: env_or_default("DOCKET_SENTINEL_LRU_CACHE_SIZE", "10000")
                .parse()
                .unwrap_or(10_000),

            // Store
            store_ttl: secs_or("DOCKET_SENTINEL_STORE_TTL_SECS", 7 * 86_400),

            // Metrics
            metrics_port: env_or_default("DOCKET_SENTINEL_METRICS_PORT", "9090")
                .parse()
                .unwrap_or(9090),

            // Keywords. Disjoint at the phrase level on purpose: "summary
            // judgment" in an order's text must not ALSO classify the entry
            // as a judgment, or the severity model turns into soup.
            motion_keywords: env_list(
                "DOCKET_SENTINEL_MOTION_KEYWORDS",
                "motion,moves the court,memorandum in support,notice of motion",
            ),
            order_keywords: env_list(
                "DOCKET_SENTINEL_ORDER_KEYWORDS",
                "order,ordered that,minute order,so ordered",
            ),
            judgment_keywords: env_list(
                "DOCKET_SENTINEL_JUDGMENT_KEYWORDS",
                "judgment entered,final judgment,default judgment,judgment in favor,decree",
            ),
            hearing_keywords: env_list(
                "DOCKET_SENTINEL_HEARING_KEYWORDS",
                "hearing,oral argument,status conference,trial set,scheduling conference",
            ),
            deadline_keywords: env_list(
                "DOCKET_SENTINEL_DEADLINE_KEYWORDS",
                "deadline,due by,response due,must file,on or before",
            ),
            urgent_keywords: env_list(
                "DOCKET_SENTINEL_URGENT_KEYWORDS",
                "emergency,tro,temporary restraining order,preliminary injunction,contempt,sanctions,default",
            ),
            decisive_keywords: env_list(
                "DOCKET_SENTINEL_DECISIVE_KEYWORDS",
                "granted,denied,dismissed,summary judgment",
            ),
            urgent_case_markers: env_list(
                "DOCKET_SENTINEL_URGENT_CASE_MARKERS",
                "urgent,expedited,injunction,class action",
            ),
        }
    }
}

/// Helper to read an environment variable with a default fallback.
/// Because unwrap_or on env::var is ugly and we have standards.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper for Duration-in-seconds knobs.
fn secs_or(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env_or_default(key, &default.to_string())
            .parse()
            .unwrap_or(default),
    )
}

/// Helper for comma-separated list knobs. Entries are trimmed and
/// lowercased; empty entries are dropped.
fn env_list(key: &str, default: &str) -> Vec<String> {
    env_or_default(key, default)
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_env() {
        let config = Config::from_env();
        assert_eq!(config.max_concurrent_checks, 5);
        assert_eq!(config.max_check_retries, 3);
        assert_eq!(config.check_timeout, Duration::from_secs(120));
        assert!(!config.motion_keywords.is_empty());
        assert!(!config.urgent_keywords.is_empty());
    }

    #[test]
    fn test_keyword_sets_are_phrase_disjoint() {
        let config = Config::from_env();
        let sets = [
            &config.motion_keywords,
            &config.order_keywords,
            &config.judgment_keywords,
            &config.hearing_keywords,
            &config.deadline_keywords,
        ];
        for (i, a) in sets.iter().enumerate() {
            for b in sets.iter().skip(i + 1) {
                for kw in a.iter() {
                    assert!(!b.contains(kw), "keyword '{kw}' appears in two type sets");
                }
            }
        }
    }

    #[test]
    fn test_budget_thresholds_parse_sorted() {
        let config = Config::from_env();
        assert_eq!(config.budget_alert_thresholds, vec![0.80, 0.95]);
    }
}
