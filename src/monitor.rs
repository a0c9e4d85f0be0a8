// =============================================================================
// monitor.rs — THE FRONT DESK
// =============================================================================
//
// The public face of the engine. Everything a human (or the HTTP layer
// that fronts for humans) is allowed to do goes through the CaseMonitor:
// register a case, pause it, resume it, retire it, rewire its rules, and
// ask uncomfortable questions about what all of this is costing.
//
// Registration does one synchronous fetch before the case ever reaches
// the scheduler. This is not optional politeness: an empty cached
// snapshot is indistinguishable from "everything on this docket is new",
// and the first scheduled check of a 400-entry case would otherwise fire
// 400 alerts at once and end several careers, possibly ours.
//
// Removal is logical. The status flips to Stopped, the tombstone stays in
// the registry, and any in-flight check finishes into the void. Search
// pretends Stopped cases don't exist, which for all practical purposes
// they don't.
//
// The registry itself lives here too: one RwLock'd map, shared by clone,
// read constantly, written only at registration time and by the scheduler
// loop after each check.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountPool;
use crate::config::Config;
use crate::cost::{BudgetService, HourlyLedger};
use crate::dispatcher::RuleRegistry;
use crate::error::MonitorError;
use crate::gateway::RecordsGateway;
use crate::metrics::MetricsCollector;
use crate::models::{
    identity_key, CaseStatus, MonitoredCase, MonitoringRule, OperationKind, PollFrequency,
};
use crate::scheduler::SchedulerHandle;
use crate::store::{keys, KeyValueStore, TypedStore};
use crate::detector::compute_snapshot_hash;

// =============================================================================
// CASE REGISTRY
// =============================================================================

/// The in-memory case registry. Cheap to clone; every component that
/// needs case state holds one.
#[derive(Clone, Default)]
pub struct CaseRegistry {
    inner: Arc<RwLock<HashMap<Uuid, MonitoredCase>>>,
}

impl CaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, case: MonitoredCase) {
        self.inner.write().insert(case.monitor_id, case);
    }

    pub fn get(&self, monitor_id: Uuid) -> Option<MonitoredCase> {
        self.inner.read().get(&monitor_id).cloned()
    }

    /// Mutate one case in place under the write lock. Returns None if the
    /// case isn't registered.
    pub fn with_case_mut<R>(
        &self,
        monitor_id: Uuid,
        f: impl FnOnce(&mut MonitoredCase) -> R,
    ) -> Option<R> {
        self.inner.write().get_mut(&monitor_id).map(f)
    }

    pub fn all(&self) -> Vec<MonitoredCase> {
        self.inner.read().values().cloned().collect()
    }

    /// Find a live (non-Stopped) case by its (case number, source) identity.
    pub fn find_live_by_identity(&self, key: &str) -> Option<MonitoredCase> {
        self.inner
            .read()
            .values()
            .find(|c| c.status != CaseStatus::Stopped && c.identity_key() == key)
            .cloned()
    }

    /// How many cases count against the global ceiling (Stopped ones don't).
    pub fn monitored_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|c| c.status != CaseStatus::Stopped)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// =============================================================================
// PUBLIC REQUEST/RESPONSE SHAPES
// =============================================================================

/// Everything needed to put a case under surveillance.
#[derive(Debug, Clone)]
pub struct AddCaseRequest {
    pub case_number: String,
    pub source_id: String,
    pub frequency: PollFrequency,
    pub priority: u8,
    pub cost_limit_cents: u64,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub rule_ids: Vec<Uuid>,
}

impl AddCaseRequest {
    pub fn new(
        case_number: impl Into<String>,
        source_id: impl Into<String>,
        frequency: PollFrequency,
        priority: u8,
    ) -> Self {
        Self {
            case_number: case_number.into(),
            source_id: source_id.into(),
            frequency,
            priority,
            cost_limit_cents: 0,
            title: None,
            tags: Vec::new(),
            rule_ids: Vec::new(),
        }
    }
}

/// Search filters. All optional, all ANDed. Stopped cases are invisible
/// unless explicitly requested.
#[derive(Debug, Clone, Default)]
pub struct CaseFilters {
    pub status: Option<CaseStatus>,
    pub source_id: Option<String>,
    pub case_number_contains: Option<String>,
    pub priority: Option<u8>,
    pub tag: Option<String>,
    pub include_stopped: bool,
}

/// The aggregate numbers behind "how is monitoring going?"
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatistics {
    pub total_cases: usize,
    pub monitored_cases: usize,
    pub by_status: HashMap<String, usize>,
    pub total_checks: u64,
    pub total_changes: u64,
    pub total_errors: u64,
    pub total_cost_cents: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseActivity {
    pub monitor_id: Uuid,
    pub case_number: String,
    pub title: Option<String>,
    pub change_count: u64,
    pub check_count: u64,
    pub total_cost_cents: u64,
    pub last_change_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSpend {
    pub account_id: Uuid,
    pub label: String,
    pub spent_cents: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostAnalysis {
    pub total_cost_cents: u64,
    pub current_hour_cents: u64,
    pub remaining_exemption_cents: u64,
    pub by_account: Vec<AccountSpend>,
}

/// The structured report. Rendering it into something with a letterhead
/// is somebody else's department.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringReport {
    pub generated_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub statistics: MonitoringStatistics,
    pub top_active_cases: Vec<CaseActivity>,
    pub cost_analysis: CostAnalysis,
    pub insights: Vec<String>,
}

// =============================================================================
// THE ORCHESTRATOR
// =============================================================================

pub struct CaseMonitor {
    registry: CaseRegistry,
    rules: RuleRegistry,
    gateway: Arc<dyn RecordsGateway>,
    store: Arc<dyn KeyValueStore>,
    pool: AccountPool,
    budget: Arc<BudgetService>,
    hourly: Arc<HourlyLedger>,
    scheduler: SchedulerHandle,
    metrics: Arc<MetricsCollector>,

    max_monitored_cases: usize,
    store_ttl: Duration,
    stuck_interval_multiplier: u32,
    maintenance_interval: Duration,
}

impl CaseMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        registry: CaseRegistry,
        rules: RuleRegistry,
        gateway: Arc<dyn RecordsGateway>,
        store: Arc<dyn KeyValueStore>,
        pool: AccountPool,
        budget: Arc<BudgetService>,
        hourly: Arc<HourlyLedger>,
        scheduler: SchedulerHandle,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        info!(
            max_cases = config.max_monitored_cases,
            "Case monitor online — the front desk is staffed"
        );
        Self {
            registry,
            rules,
            gateway,
            store,
            pool,
            budget,
            hourly,
            scheduler,
            metrics,
            max_monitored_cases: config.max_monitored_cases,
            store_ttl: config.store_ttl,
            stuck_interval_multiplier: config.stuck_interval_multiplier,
            maintenance_interval: config.maintenance_interval,
        }
    }

    /// Register a case for monitoring. Rejects duplicates and enforces the
    /// global ceiling, then performs the seeding fetch — through admission
    /// control like any other spend — before the scheduler ever hears
    /// about the case.
    pub async fn add_case(&self, request: AddCaseRequest) -> Result<MonitoredCase, MonitorError> {
        let identity = identity_key(&request.case_number, &request.source_id);
        if let Some(existing) = self.registry.find_live_by_identity(&identity) {
            return Err(MonitorError::Configuration(format!(
                "case {} on {} is already monitored ({})",
                request.case_number, request.source_id, existing.monitor_id
            )));
        }
        if self.registry.monitored_count() >= self.max_monitored_cases {
            return Err(MonitorError::Configuration(format!(
                "monitored-case ceiling reached ({})",
                self.max_monitored_cases
            )));
        }
        for rule_id in &request.rule_ids {
            if !self.rules.contains(*rule_id) {
                return Err(MonitorError::Configuration(format!(
                    "unknown rule {rule_id}"
                )));
            }
        }

        // The seeding fetch. Same admission discipline as a scheduled
        // check; being new buys no budget exemptions.
        let estimate = self.budget.estimate_cost(OperationKind::DocketFetch, 0, 0, 0);
        let lease = self.pool.acquire(&request.source_id).ok_or_else(|| {
            MonitorError::RateLimit {
                source_id: request.source_id.clone(),
                retry_after: None,
            }
        })?;
        let approval = self.budget.check_approval(lease.account.account_id, estimate);
        if !approval.approved {
            return Err(MonitorError::CostLimitExceeded {
                estimated_cents: estimate,
                reason: approval.reason.unwrap_or_else(|| "budget denied".into()),
            });
        }

        let snapshot = self
            .gateway
            .fetch_snapshot(&request.case_number, &request.source_id)
            .await?;
        self.budget
            .record_usage(lease.account.account_id, snapshot.cost_cents);
        self.hourly.record(snapshot.cost_cents);
        drop(lease);

        let now = Utc::now();
        let mut case = MonitoredCase::new(
            request.case_number,
            request.source_id,
            request.frequency,
            request.priority,
        );
        case.cost_limit_cents = request.cost_limit_cents;
        case.title = request.title;
        case.tags = request.tags;
        case.rule_ids = request.rule_ids;
        case.cached_hash = compute_snapshot_hash(&snapshot.entries);
        case.cached_entries = snapshot.entries;
        case.cached_case_info = snapshot.case_info;
        case.total_cost_cents = snapshot.cost_cents;
        case.next_check_at = case.next_check_from(now);

        info!(
            monitor_id = %case.monitor_id,
            case_number = %case.case_number,
            source = %case.source_id,
            frequency = %case.frequency,
            priority = case.priority,
            entries = case.cached_entries.len(),
            "Case registered and snapshot seeded"
        );

        self.persist_case(&case).await;
        self.registry.insert(case.clone());
        self.scheduler.schedule(case.monitor_id);
        self.metrics.increment_cases_registered();
        Ok(case)
    }

    /// Logical removal: the status flips to Stopped and scheduling stops.
    /// An in-flight check, if any, completes and discards its result.
    pub async fn remove_case(&self, monitor_id: Uuid) -> Result<(), MonitorError> {
        self.registry
            .with_case_mut(monitor_id, |case| {
                case.status = CaseStatus::Stopped;
            })
            .ok_or_else(|| MonitorError::Configuration(format!("unknown case {monitor_id}")))?;
        info!(monitor_id = %monitor_id, "Case removed (logically) — monitoring stopped");
        self.persist_registered(monitor_id).await;
        Ok(())
    }

    pub async fn pause(&self, monitor_id: Uuid) -> Result<(), MonitorError> {
        self.transition(monitor_id, |case| match case.status {
            CaseStatus::Stopped => Err("cannot pause a stopped case"),
            _ => {
                case.status = CaseStatus::Paused;
                Ok(())
            }
        })
        .await?;
        info!(monitor_id = %monitor_id, "Case paused");
        Ok(())
    }

    /// Resume a Paused case — or an Error one, which is the documented way
    /// out of the terminal failure state.
    pub async fn resume(&self, monitor_id: Uuid) -> Result<(), MonitorError> {
        self.transition(monitor_id, |case| match case.status {
            CaseStatus::Paused | CaseStatus::Error => {
                case.status = CaseStatus::Active;
                case.error_count = 0;
                // Check soon, not a full interval from now.
                case.next_check_at = Utc::now();
                Ok(())
            }
            CaseStatus::Stopped => Err("cannot resume a stopped case"),
            _ => Err("case is not paused"),
        })
        .await?;
        self.scheduler.schedule(monitor_id);
        info!(monitor_id = %monitor_id, "Case resumed");
        Ok(())
    }

    async fn transition(
        &self,
        monitor_id: Uuid,
        f: impl FnOnce(&mut MonitoredCase) -> Result<(), &'static str>,
    ) -> Result<(), MonitorError> {
        let result = self
            .registry
            .with_case_mut(monitor_id, f)
            .ok_or_else(|| MonitorError::Configuration(format!("unknown case {monitor_id}")))?;
        result.map_err(|msg| MonitorError::Configuration(msg.to_string()))?;
        self.persist_registered(monitor_id).await;
        Ok(())
    }

    /// Register or update a rule in the shared registry.
    pub async fn upsert_rule(&self, rule: MonitoringRule) {
        if let Err(e) = self
            .store
            .set_json(&keys::rule(rule.rule_id), &rule, Some(self.store_ttl))
            .await
        {
            warn!(error = %e, rule_id = %rule.rule_id, "Failed to persist rule");
        }
        self.rules.upsert(rule);
    }

    /// Replace a case's rule subscriptions. Every referenced rule must
    /// already exist — dangling rule IDs are how alerts silently stop.
    pub async fn update_rules(
        &self,
        monitor_id: Uuid,
        rule_ids: Vec<Uuid>,
    ) -> Result<(), MonitorError> {
        for rule_id in &rule_ids {
            if !self.rules.contains(*rule_id) {
                return Err(MonitorError::Configuration(format!(
                    "unknown rule {rule_id}"
                )));
            }
        }
        self.registry
            .with_case_mut(monitor_id, |case| {
                case.rule_ids = rule_ids;
            })
            .ok_or_else(|| MonitorError::Configuration(format!("unknown case {monitor_id}")))?;
        self.persist_registered(monitor_id).await;
        Ok(())
    }

    /// Search the registry. Stopped cases are invisible unless asked for.
    pub fn search(&self, filters: &CaseFilters) -> Vec<MonitoredCase> {
        let mut matches: Vec<MonitoredCase> = self
            .registry
            .all()
            .into_iter()
            .filter(|case| {
                if case.status == CaseStatus::Stopped && !filters.include_stopped {
                    return false;
                }
                if let Some(status) = filters.status {
                    if case.status != status {
                        return false;
                    }
                }
                if let Some(source) = &filters.source_id {
                    if !case.source_id.eq_ignore_ascii_case(source) {
                        return false;
                    }
                }
                if let Some(fragment) = &filters.case_number_contains {
                    if !case
                        .case_number
                        .to_lowercase()
                        .contains(&fragment.to_lowercase())
                    {
                        return false;
                    }
                }
                if let Some(priority) = filters.priority {
                    if case.priority != priority {
                        return false;
                    }
                }
                if let Some(tag) = &filters.tag {
                    if !case.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                        return false;
                    }
                }
                true
            })
            .collect();
        matches.sort_by_key(|c| (c.priority, c.case_number.clone()));
        matches
    }

    pub fn statistics(&self) -> MonitoringStatistics {
        let cases = self.registry.all();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut total_checks = 0u64;
        let mut total_changes = 0u64;
        let mut total_errors = 0u64;
        let mut total_cost_cents = 0u64;
        for case in &cases {
            *by_status.entry(case.status.to_string()).or_insert(0) += 1;
            total_checks += case.check_count;
            total_changes += case.change_count;
            total_errors += case.error_count;
            total_cost_cents += case.total_cost_cents;
        }
        MonitoringStatistics {
            total_cases: cases.len(),
            monitored_cases: self.registry.monitored_count(),
            by_status,
            total_checks,
            total_changes,
            total_errors,
            total_cost_cents,
            active_sessions: self.pool.active_sessions(),
        }
    }

    /// Build the structured report for a period: aggregate statistics,
    /// the busiest cases, the money trail, and a few pre-chewed insights
    /// for whoever reads the numbers last.
    pub fn generate_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MonitoringReport {
        let statistics = self.statistics();
        let cases = self.registry.all();

        let mut top_active_cases: Vec<CaseActivity> = cases
            .iter()
            .filter(|c| {
                c.last_change_at
                    .map(|t| t >= start && t < end)
                    .unwrap_or(false)
            })
            .map(|c| CaseActivity {
                monitor_id: c.monitor_id,
                case_number: c.case_number.clone(),
                title: c.title.clone(),
                change_count: c.change_count,
                check_count: c.check_count,
                total_cost_cents: c.total_cost_cents,
                last_change_at: c.last_change_at,
            })
            .collect();
        top_active_cases.sort_by(|a, b| b.change_count.cmp(&a.change_count));
        top_active_cases.truncate(10);

        let accounts = self.pool.accounts();
        let spend = self.budget.spend_by_account(start, end);
        let by_account: Vec<AccountSpend> = accounts
            .iter()
            .map(|account| AccountSpend {
                account_id: account.account_id,
                label: account.label.clone(),
                spent_cents: spend.get(&account.account_id).copied().unwrap_or(0),
            })
            .collect();

        let cost_analysis = CostAnalysis {
            total_cost_cents: statistics.total_cost_cents,
            current_hour_cents: self.hourly.current_hour_cents(),
            remaining_exemption_cents: self.budget.remaining_exemption_cents(),
            by_account,
        };

        let insights = self.build_insights(&statistics, &top_active_cases, &cases);

        MonitoringReport {
            generated_at: Utc::now(),
            period_start: start,
            period_end: end,
            statistics,
            top_active_cases,
            cost_analysis,
            insights,
        }
    }

    fn build_insights(
        &self,
        statistics: &MonitoringStatistics,
        top: &[CaseActivity],
        cases: &[MonitoredCase],
    ) -> Vec<String> {
        let mut insights = Vec::new();

        let errored = statistics.by_status.get("ERROR").copied().unwrap_or(0);
        if errored > 0 {
            insights.push(format!(
                "{errored} case(s) in Error status — monitoring is silent until manually resumed"
            ));
        }
        let cost_limited = statistics.by_status.get("COST_LIMITED").copied().unwrap_or(0);
        if cost_limited > 0 {
            insights.push(format!(
                "{cost_limited} case(s) deferred by budget limits — consider raising caps or lowering frequency"
            ));
        }
        let stuck = self.find_stuck(Utc::now());
        if !stuck.is_empty() {
            insights.push(format!(
                "{} monitor(s) overdue by 3x their expected interval — investigate the scheduler backlog",
                stuck.len()
            ));
        }
        let suspended = self
            .pool
            .accounts()
            .iter()
            .filter(|a| a.status != crate::models::AccountStatus::Active)
            .count();
        if suspended > 0 {
            insights.push(format!("{suspended} credential(s) not active in the pool"));
        }
        if let Some(busiest) = top.first() {
            insights.push(format!(
                "Most active case: {} with {} detected change(s)",
                busiest.case_number, busiest.change_count
            ));
        }
        let never_changed = cases
            .iter()
            .filter(|c| c.status == CaseStatus::Active && c.check_count > 20 && c.change_count == 0)
            .count();
        if never_changed > 0 {
            insights.push(format!(
                "{never_changed} active case(s) checked 20+ times with zero changes — candidates for a slower frequency"
            ));
        }
        if insights.is_empty() {
            insights.push("All quiet on the docket front".to_string());
        }
        insights
    }

    /// Flag Active cases whose last check is more than N expected
    /// intervals in the past. A monitoring signal, never an automatic fix:
    /// the stuck case keeps its status and a human decides what happened.
    pub fn find_stuck(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let multiplier = i64::from(self.stuck_interval_multiplier);
        let stuck: Vec<Uuid> = self
            .registry
            .all()
            .into_iter()
            .filter(|case| {
                if case.status != CaseStatus::Active {
                    return false;
                }
                let reference = case.last_checked_at.unwrap_or(case.created_at);
                let expected = chrono::Duration::from_std(case.frequency.interval())
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
                now.signed_duration_since(reference) > expected * multiplier as i32
            })
            .map(|case| case.monitor_id)
            .collect();
        for monitor_id in &stuck {
            warn!(monitor_id = %monitor_id, "Stuck monitor detected — last check is long overdue");
        }
        self.metrics.add_stuck_flagged(stuck.len() as u64);
        stuck
    }

    /// The periodic maintenance pass: stuck-monitor detection plus a store
    /// expiry sweep. Runs until shutdown.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stuck = self.find_stuck(Utc::now());
                    let swept = self.store.purge_expired().await;
                    debug!(stuck = stuck.len(), swept, "Maintenance pass complete");
                }
                _ = shutdown.changed() => {
                    info!("Maintenance loop shutting down");
                    return;
                }
            }
        }
    }

    async fn persist_case(&self, case: &MonitoredCase) {
        if let Err(e) = self
            .store
            .set_json(&keys::case(case.monitor_id), case, Some(self.store_ttl))
            .await
        {
            warn!(error = %e, monitor_id = %case.monitor_id, "Failed to persist case");
        }
    }

    async fn persist_registered(&self, monitor_id: Uuid) {
        if let Some(case) = self.registry.get(monitor_id) {
            self.persist_case(&case).await;
        }
    }
}
