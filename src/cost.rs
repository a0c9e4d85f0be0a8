// =============================================================================
// cost.rs — THE BUDGET IRON DOME
// =============================================================================
//
// The court portal charges real money for public records, because of
// course it does. This module is the admission-control half of the engine:
// nothing hits the portal until the budget math says it can, and every
// cent that does get spent is recorded before anyone asks where it went.
//
// Three pieces live here:
//
// 1. The estimator — a deterministic fee model (per-page fee above a
//    free-pages-per-document allowance, flat per-search fee) with a
//    quarterly free-spend exemption consumed before real charges accrue.
//
// 2. The budget ledger — per-account usage records with calendar-day and
//    calendar-month window sums. `check_approval` is all-or-nothing: a
//    check is fully approved or fully denied BEFORE it runs. Limits are
//    enforced pre-check, never "corrected" post-hoc, because you can't
//    un-spend money on a government website.
//
// 3. The hourly ledger — the scheduler's rolling spend cap, keyed by hour
//    bucket.
//
// The usage map and the hourly ledger are THE two pieces of explicitly
// shared mutable state in this entire design. Both sit behind parking_lot
// Mutexes and every update happens in one critical section — concurrent
// check completions serialize here and nowhere else.
// =============================================================================

use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountPool;
use crate::config::Config;
use crate::models::{AccountStatus, OperationKind};

/// The verdict on a proposed spend. Shaped as data, not as an error —
/// a denial is a normal scheduling decision.
#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub approved: bool,
    pub reason: Option<String>,
}

impl Approval {
    fn approved() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

/// A budget threshold crossing. Fired (without blocking the recording
/// call) whenever usage crosses a configured percentage of a limit.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub account_id: Uuid,
    pub period: BudgetPeriod,
    pub threshold: f64,
    pub spent_cents: u64,
    pub limit_cents: u64,
    /// Whether this crossing tripped the auto-suspend wire.
    pub suspended: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

/// One recorded spend. Gross cents went to the portal; charged cents are
/// what remained after the quarterly exemption ate its share.
#[derive(Debug, Clone)]
struct UsageRecord {
    at: DateTime<Utc>,
    charged_cents: u64,
}

/// Rolling exemption state: (year, quarter) plus how much of the free
/// allowance this quarter has been consumed.
struct ExemptionState {
    quarter_key: (i32, u32),
    consumed_cents: u64,
}

struct LedgerState {
    usage: HashMap<Uuid, Vec<UsageRecord>>,
    exemption: ExemptionState,
}

/// The budget service: estimator + per-account ledger + threshold alerts.
pub struct BudgetService {
    state: Mutex<LedgerState>,
    pool: AccountPool,
    page_fee_cents: u64,
    free_pages_per_document: u32,
    search_fee_cents: u64,
    quarterly_exemption_cents: u64,
    alert_thresholds: Vec<f64>,
    auto_suspend_at_hard_threshold: bool,
}

impl BudgetService {
    pub fn new(config: &Config, pool: AccountPool) -> Self {
        let mut thresholds = config.budget_alert_thresholds.clone();
        thresholds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        info!(
            page_fee = config.page_fee_cents,
            search_fee = config.search_fee_cents,
            exemption = config.quarterly_exemption_cents,
            ?thresholds,
            "Budget service online — the money only flows where the ledger says"
        );
        Self {
            state: Mutex::new(LedgerState {
                usage: HashMap::new(),
                exemption: ExemptionState {
                    quarter_key: quarter_key(Utc::now()),
                    consumed_cents: 0,
                },
            }),
            pool,
            page_fee_cents: config.page_fee_cents,
            free_pages_per_document: config.free_pages_per_document,
            search_fee_cents: config.search_fee_cents,
            quarterly_exemption_cents: config.quarterly_exemption_cents,
            alert_thresholds: thresholds,
            auto_suspend_at_hard_threshold: config.auto_suspend_at_hard_threshold,
        }
    }

    /// Estimate what an operation will actually charge, in cents.
    ///
    /// Fee model: every page past the free-pages-per-document allowance
    /// bills at the page fee, searches bill flat — then the quarterly
    /// exemption's remaining allowance comes off the top. The result is
    /// the projected *charged* amount, which is what the budget windows
    /// care about.
    pub fn estimate_cost(
        &self,
        kind: OperationKind,
        page_count: u32,
        document_count: u32,
        search_count: u32,
    ) -> u64 {
        let free_pages = u64::from(document_count) * u64::from(self.free_pages_per_document);
        let billable_pages = u64::from(page_count).saturating_sub(free_pages);
        let mut gross = billable_pages * self.page_fee_cents
            + u64::from(search_count) * self.search_fee_cents;

        // A bare docket fetch always costs at least one page. The portal
        // has never once been free out of generosity.
        if gross == 0 && matches!(kind, OperationKind::DocketFetch) {
            gross = self.page_fee_cents;
        }

        let state = self.state.lock();
        let remaining = self.remaining_exemption(&state);
        gross.saturating_sub(remaining.min(gross))
    }

    /// All-or-nothing pre-check approval. Sums already-recorded usage for
    /// the daily and monthly windows, checks the account's hourly rate,
    /// and denies if any projected total would exceed its limit. There is
    /// no partial spend: approved means the whole estimate fits.
    pub fn check_approval(&self, account_id: Uuid, estimated_cents: u64) -> Approval {
        let Some(account) = self.pool.get(account_id) else {
            return Approval::denied(format!("unknown account {account_id}"));
        };

        if account.status != AccountStatus::Active {
            return Approval::denied(format!("account is {}", account.status));
        }

        let now = Utc::now();
        let state = self.state.lock();
        let records = state.usage.get(&account_id);

        let daily = sum_where(records, |r| same_day(r.at, now));
        if account.daily_limit_cents > 0 && daily + estimated_cents > account.daily_limit_cents {
            return Approval::denied(format!(
                "daily limit: {}¢ spent + {}¢ estimated > {}¢",
                daily, estimated_cents, account.daily_limit_cents
            ));
        }

        let monthly = sum_where(records, |r| same_month(r.at, now));
        if account.monthly_limit_cents > 0 && monthly + estimated_cents > account.monthly_limit_cents
        {
            return Approval::denied(format!(
                "monthly limit: {}¢ spent + {}¢ estimated > {}¢",
                monthly, estimated_cents, account.monthly_limit_cents
            ));
        }

        Approval::approved()
    }

    /// Record what a completed check actually cost. Called only after a
    /// real check finishes; the whole update — exemption consumption,
    /// ledger append, window sums, threshold detection — happens in one
    /// critical section so concurrent recorders can't interleave halves.
    ///
    /// Threshold alerts are returned (and logged), never awaited — the
    /// recording path must not block on anyone's pager.
    pub fn record_usage(&self, account_id: Uuid, gross_cents: u64) -> Vec<BudgetAlert> {
        let now = Utc::now();
        let mut alerts = Vec::new();

        let (daily_before, daily_after, monthly_before, monthly_after) = {
            let mut state = self.state.lock();
            self.roll_exemption_quarter(&mut state, now);

            let remaining = self.remaining_exemption(&state);
            let exempted = remaining.min(gross_cents);
            let charged = gross_cents - exempted;
            state.exemption.consumed_cents += exempted;

            let records = state.usage.entry(account_id).or_default();
            let daily_before = records
                .iter()
                .filter(|r| same_day(r.at, now))
                .map(|r| r.charged_cents)
                .sum::<u64>();
            let monthly_before = records
                .iter()
                .filter(|r| same_month(r.at, now))
                .map(|r| r.charged_cents)
                .sum::<u64>();

            records.push(UsageRecord {
                at: now,
                charged_cents: charged,
            });
            // Keep ~1 month plus slack; older records can't affect any window.
            let cutoff = now - chrono::Duration::days(35);
            records.retain(|r| r.at >= cutoff);

            debug!(
                account_id = %account_id,
                gross = gross_cents,
                exempted,
                charged,
                "Usage recorded"
            );

            (
                daily_before,
                daily_before + charged,
                monthly_before,
                monthly_before + charged,
            )
        };

        let Some(account) = self.pool.get(account_id) else {
            return alerts;
        };

        alerts.extend(self.threshold_crossings(
            &account,
            BudgetPeriod::Daily,
            account.daily_limit_cents,
            daily_before,
            daily_after,
        ));
        alerts.extend(self.threshold_crossings(
            &account,
            BudgetPeriod::Monthly,
            account.monthly_limit_cents,
            monthly_before,
            monthly_after,
        ));

        for alert in &alerts {
            warn!(
                account_id = %alert.account_id,
                period = ?alert.period,
                threshold = alert.threshold,
                spent = alert.spent_cents,
                limit = alert.limit_cents,
                suspended = alert.suspended,
                "Budget threshold crossed"
            );
            if alert.suspended {
                self.pool
                    .set_status(alert.account_id, AccountStatus::Suspended);
            }
        }

        alerts
    }

    /// Spend recorded today for one account, in (charged) cents.
    pub fn daily_spend(&self, account_id: Uuid) -> u64 {
        let now = Utc::now();
        let state = self.state.lock();
        sum_where(state.usage.get(&account_id), |r| same_day(r.at, now))
    }

    /// Per-account charged totals between two instants — report fodder.
    pub fn spend_by_account(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> HashMap<Uuid, u64> {
        let state = self.state.lock();
        state
            .usage
            .iter()
            .map(|(id, records)| {
                let total = records
                    .iter()
                    .filter(|r| r.at >= start && r.at < end)
                    .map(|r| r.charged_cents)
                    .sum();
                (*id, total)
            })
            .collect()
    }

    pub fn remaining_exemption_cents(&self) -> u64 {
        let state = self.state.lock();
        self.remaining_exemption(&state)
    }

    fn remaining_exemption(&self, state: &LedgerState) -> u64 {
        self.quarterly_exemption_cents
            .saturating_sub(state.exemption.consumed_cents)
    }

    fn roll_exemption_quarter(&self, state: &mut LedgerState, now: DateTime<Utc>) {
        let key = quarter_key(now);
        if state.exemption.quarter_key != key {
            info!(
                ?key,
                "New calendar quarter — exemption allowance refreshed"
            );
            state.exemption.quarter_key = key;
            state.exemption.consumed_cents = 0;
        }
    }

    fn threshold_crossings(
        &self,
        account: &crate::models::Account,
        period: BudgetPeriod,
        limit: u64,
        before: u64,
        after: u64,
    ) -> Vec<BudgetAlert> {
        if limit == 0 {
            return Vec::new();
        }
        let hard = self.alert_thresholds.last().copied();
        self.alert_thresholds
            .iter()
            .filter(|t| {
                let line = (**t * limit as f64) as u64;
                before < line && after >= line
            })
            .map(|t| BudgetAlert {
                account_id: account.account_id,
                period,
                threshold: *t,
                spent_cents: after,
                limit_cents: limit,
                suspended: self.auto_suspend_at_hard_threshold && Some(*t) == hard,
            })
            .collect()
    }
}

/// The scheduler's rolling spend cap, keyed by hour bucket. Consulted
/// before a check launches; a projected overage defers the check (leaves
/// it queued), never drops it.
pub struct HourlyLedger {
    buckets: Mutex<HashMap<i64, u64>>,
    cap_cents: u64,
}

impl HourlyLedger {
    pub fn new(cap_cents: u64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            cap_cents,
        }
    }

    /// Would spending `estimated_cents` this hour blow the cap?
    pub fn would_exceed(&self, estimated_cents: u64) -> bool {
        if self.cap_cents == 0 {
            return false; // uncapped, money printer go brrr
        }
        let bucket = hour_bucket(Utc::now());
        let buckets = self.buckets.lock();
        let current = buckets.get(&bucket).copied().unwrap_or(0);
        current + estimated_cents > self.cap_cents
    }

    /// Record actual spend into the current hour bucket.
    pub fn record(&self, cents: u64) {
        let bucket = hour_bucket(Utc::now());
        let mut buckets = self.buckets.lock();
        *buckets.entry(bucket).or_insert(0) += cents;
        // Buckets two days old can't matter to anyone; drop them.
        buckets.retain(|b, _| bucket - *b < 48);
    }

    pub fn current_hour_cents(&self) -> u64 {
        let bucket = hour_bucket(Utc::now());
        self.buckets.lock().get(&bucket).copied().unwrap_or(0)
    }
}

fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp() / 3600
}

fn quarter_key(at: DateTime<Utc>) -> (i32, u32) {
    (at.year(), (at.month() - 1) / 3 + 1)
}

fn same_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}

fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

fn sum_where(records: Option<&Vec<UsageRecord>>, pred: impl Fn(&UsageRecord) -> bool) -> u64 {
    records
        .map(|rs| rs.iter().filter(|r| pred(r)).map(|r| r.charged_cents).sum())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::SelectionStrategy;
    use crate::models::Account;

    fn service_with(
        exemption_cents: u64,
        thresholds: Vec<f64>,
        auto_suspend: bool,
    ) -> (BudgetService, AccountPool) {
        let pool = AccountPool::new(SelectionStrategy::RoundRobin, 10);
        let mut config = Config::from_env();
        config.quarterly_exemption_cents = exemption_cents;
        config.budget_alert_thresholds = thresholds;
        config.auto_suspend_at_hard_threshold = auto_suspend;
        let service = BudgetService::new(&config, pool.clone());
        (service, pool)
    }

    fn add_account(pool: &AccountPool, daily: u64, monthly: u64) -> Uuid {
        let mut account = Account::new("test-credential");
        account.daily_limit_cents = daily;
        account.monthly_limit_cents = monthly;
        let id = account.account_id;
        pool.add_account(account);
        id
    }

    #[test]
    fn test_estimate_page_and_search_fees() {
        let (service, _pool) = service_with(0, vec![], false);
        // 12 pages across 2 documents, 1 free page each -> 10 billable
        // pages at 10¢ + one search at 30¢.
        let estimate = service.estimate_cost(OperationKind::DocumentDownload, 12, 2, 1);
        assert_eq!(estimate, 10 * 10 + 30);
    }

    #[test]
    fn test_docket_fetch_never_free() {
        let (service, _pool) = service_with(0, vec![], false);
        assert_eq!(
            service.estimate_cost(OperationKind::DocketFetch, 0, 0, 0),
            10
        );
    }

    #[test]
    fn test_exemption_consumed_before_charges() {
        let (service, pool) = service_with(100, vec![], false);
        let id = add_account(&pool, 10_000, 100_000);

        // Estimate inside the exemption: projected charge is zero.
        assert_eq!(service.estimate_cost(OperationKind::DocketFetch, 5, 0, 0), 0);

        // 60¢ gross: all exempted. 80¢ more: 40¢ exempted, 40¢ charged.
        service.record_usage(id, 60);
        assert_eq!(service.daily_spend(id), 0);
        assert_eq!(service.remaining_exemption_cents(), 40);

        service.record_usage(id, 80);
        assert_eq!(service.daily_spend(id), 40);
        assert_eq!(service.remaining_exemption_cents(), 0);
    }

    #[test]
    fn test_approval_denied_at_daily_limit() {
        // The canonical scenario: $100 daily limit, $95 recorded, $10 check.
        let (service, pool) = service_with(0, vec![], false);
        let id = add_account(&pool, 10_000, 1_000_000);

        service.record_usage(id, 9_500);
        let approval = service.check_approval(id, 1_000);
        assert!(!approval.approved);
        assert!(approval.reason.expect("reason").contains("daily limit"));

        // A smaller check still fits — all-or-nothing, per check.
        assert!(service.check_approval(id, 500).approved);
    }

    #[test]
    fn test_approval_denied_for_monthly_and_unknown() {
        let (service, pool) = service_with(0, vec![], false);
        let id = add_account(&pool, 1_000_000, 5_000);
        service.record_usage(id, 4_900);
        assert!(!service.check_approval(id, 200).approved);

        assert!(!service.check_approval(Uuid::new_v4(), 1).approved);
    }

    #[test]
    fn test_threshold_alerts_fire_once_per_crossing() {
        let (service, pool) = service_with(0, vec![0.80, 0.95], false);
        let id = add_account(&pool, 1_000, 1_000_000);

        // 0 -> 790¢: no crossing.
        assert!(service.record_usage(id, 790).is_empty());
        // 790 -> 810: crosses 80%.
        let alerts = service.record_usage(id, 20);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].threshold, 0.80);
        assert!(!alerts[0].suspended);
        // 810 -> 820: no new crossing.
        assert!(service.record_usage(id, 10).is_empty());
    }

    #[test]
    fn test_hard_threshold_auto_suspends() {
        let (service, pool) = service_with(0, vec![0.80, 0.95], true);
        let id = add_account(&pool, 1_000, 1_000_000);

        let alerts = service.record_usage(id, 960);
        // Crossed both 80% and 95% in one jump; the hard one suspends.
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().any(|a| a.suspended));
        assert_eq!(
            pool.get(id).expect("account").status,
            AccountStatus::Suspended
        );
        // A suspended account can't get approval either.
        assert!(!service.check_approval(id, 1).approved);
    }

    #[test]
    fn test_hourly_ledger_caps_projected_spend() {
        let ledger = HourlyLedger::new(100);
        assert!(!ledger.would_exceed(100));
        ledger.record(60);
        assert_eq!(ledger.current_hour_cents(), 60);
        assert!(!ledger.would_exceed(40));
        assert!(ledger.would_exceed(41));

        let uncapped = HourlyLedger::new(0);
        uncapped.record(1_000_000);
        assert!(!uncapped.would_exceed(u64::MAX / 2));
    }
}
