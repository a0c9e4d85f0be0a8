// =============================================================================
// scheduler.rs — THE POLLING WAR ROOM
// =============================================================================
//
// One loop owns the priority queue. Not "mostly one loop". ONE. Check
// workers run concurrently under a semaphore, but the only thing they're
// allowed to do with scheduling state is mail a CheckOutcome back to the
// loop and mind their own business.
//
// The queue is a min-heap over an immutable key (priority_score,
// scheduled_time, seq). Entries are never compared by their payload and
// never mutated in place — rescheduling means popping and pushing a fresh
// entry, the way nature intended.
//
// Every tick (ten seconds of wall-clock humility) the loop:
//   1. Pops everything due, up to a batch cap.
//   2. Skips monitors already in flight, and anything paused or stopped.
//   3. Asks the hourly ledger whether the projected spend fits. If not,
//      the check goes BACK in the queue. Deferred, never dropped.
//   4. Tries the semaphore. No permit, no launch — back in the queue.
//   5. Spawns the worker and moves on with its life.
//
// Workers do the actual dirty work: lease a credential, clear admission
// control, fetch, hash, diff, classify, dedup, and hand fresh changes to
// the dispatcher's conveyor belt. Then they report back and die.
// =============================================================================

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountPool;
use crate::classifier::Classifier;
use crate::config::Config;
use crate::cost::{BudgetService, HourlyLedger};
use crate::dedup::ChangeDedup;
use crate::detector;
use crate::error::MonitorError;
use crate::gateway::RecordsGateway;
use crate::metrics::MetricsCollector;
use crate::models::{
    CaseStatus, ChangeDetection, MonitoredCase, OperationKind, ScheduledCheck, Snapshot,
};
use crate::monitor::CaseRegistry;

// =============================================================================
// THE QUEUE
// =============================================================================

/// The immutable heap key. Lower sorts sooner; `seq` breaks ties so two
/// checks scheduled for the same instant still have a total order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    priority_score: u8,
    scheduled_millis: i64,
    seq: u64,
}

struct HeapEntry {
    key: HeapKey,
    check: ScheduledCheck,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Min-heap of scheduled checks. The payload rides along; only the key is
/// ever compared.
pub struct CheckQueue {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    seq: u64,
}

impl CheckQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn push(&mut self, check: ScheduledCheck) {
        self.seq += 1;
        self.heap.push(Reverse(HeapEntry {
            key: HeapKey {
                priority_score: check.priority_score,
                scheduled_millis: check.scheduled_time.timestamp_millis(),
                seq: self.seq,
            },
            check,
        }));
    }

    /// Remove and return every due entry (up to `max`), in
    /// (priority_score, scheduled_time, seq) order — the property every
    /// "who goes first" guarantee in this system rests on. Entries that
    /// aren't due yet go straight back in the heap.
    ///
    /// The whole heap gets walked: a high-priority entry scheduled for
    /// next Tuesday sits at the top of this ordering, and peeking only at
    /// it would starve every due check beneath. A few hundred pops every
    /// tick is a price we pay gladly.
    pub fn drain_due(&mut self, now: DateTime<Utc>, max: usize) -> Vec<ScheduledCheck> {
        let now_millis = now.timestamp_millis();
        let mut due = Vec::new();
        let mut keep = Vec::new();
        while let Some(Reverse(entry)) = self.heap.pop() {
            if entry.key.scheduled_millis <= now_millis && due.len() < max {
                due.push(entry.check);
            } else {
                keep.push(entry.check);
            }
        }
        for check in keep {
            self.push(check);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for CheckQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a case's priority score: base priority, minus 1 if it changed
/// within the last 24 hours (active cases get rechecked sooner), minus 2
/// if the title or tags carry an urgent marker. Floor is 1 — nobody gets
/// a score of zero, not even the class action with the screaming partner.
pub fn priority_score(case: &MonitoredCase, classifier: &Classifier, now: DateTime<Utc>) -> u8 {
    let mut score = i16::from(case.priority);
    let recently_active = case
        .last_change_at
        .map(|t| now.signed_duration_since(t) <= chrono::Duration::hours(24))
        .unwrap_or(false);
    if recently_active {
        score -= 1;
    }
    if classifier.is_urgent_case(case.title.as_deref(), &case.tags) {
        score -= 2;
    }
    score.max(1) as u8
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Why a check didn't run. Deferrals reschedule at the next natural slot
/// and never burn a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferKind {
    Cost,
    Rate,
}

/// What a check worker reports back to the loop. The worker never touches
/// the case record or the queue — this is its entire vocabulary.
#[derive(Debug)]
pub enum CheckResult {
    Success {
        snapshot: Snapshot,
        new_hash: String,
        /// Changes that survived dedup and went to the dispatcher.
        fresh_changes: u64,
    },
    Deferred {
        kind: DeferKind,
        reason: String,
    },
    Failed {
        reason: String,
    },
    /// The case vanished or went unschedulable between pop and execution.
    Discarded,
}

struct OutcomeReport {
    check: ScheduledCheck,
    result: CheckResult,
}

/// Commands the outside world may send the loop. The orchestrator talks
/// to the scheduler exclusively through these — the queue has one owner.
pub enum SchedulerCommand {
    /// (Re)schedule a case at its current `next_check_at`.
    Schedule(Uuid),
}

/// Cloneable sender half for the orchestrator.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn schedule(&self, monitor_id: Uuid) {
        let _ = self.tx.send(SchedulerCommand::Schedule(monitor_id));
    }

    /// A detached handle whose commands land in the returned receiver.
    /// For orchestrator tests that don't want a whole scheduler running.
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SchedulerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

// =============================================================================
// WORKER CONTEXT
// =============================================================================

/// Everything a check worker needs, bundled once and shared via Arc.
pub struct CheckContext {
    pub gateway: Arc<dyn RecordsGateway>,
    pub pool: AccountPool,
    pub budget: Arc<BudgetService>,
    pub hourly: Arc<HourlyLedger>,
    pub classifier: Arc<Classifier>,
    pub dedup: Arc<ChangeDedup>,
    pub registry: CaseRegistry,
    pub change_tx: Sender<ChangeDetection>,
    pub metrics: Arc<MetricsCollector>,
    pub check_timeout: Duration,
}

/// Execute one check end to end. Admission control first, money second,
/// diffing last. Every early return maps to a CheckResult the loop knows
/// how to reschedule.
async fn execute_check(ctx: &CheckContext, check: &ScheduledCheck) -> CheckResult {
    let Some(case) = ctx.registry.get(check.monitor_id) else {
        return CheckResult::Discarded;
    };
    if !case.status.is_schedulable() {
        return CheckResult::Discarded;
    }

    let estimate = ctx.budget.estimate_cost(OperationKind::DocketFetch, 0, 0, 0);

    // Per-case spending cap. Zero means uncapped.
    if case.cost_limit_cents > 0 && case.total_cost_cents + estimate > case.cost_limit_cents {
        return CheckResult::Deferred {
            kind: DeferKind::Cost,
            reason: format!(
                "case cost limit: {}¢ spent + {}¢ estimated > {}¢",
                case.total_cost_cents, estimate, case.cost_limit_cents
            ),
        };
    }

    // Lease a credential. Saturation or rate exhaustion is "later", not "no".
    let Some(lease) = ctx.pool.acquire(&case.source_id) else {
        return CheckResult::Deferred {
            kind: DeferKind::Rate,
            reason: "no eligible account (pool saturated or rate-exhausted)".to_string(),
        };
    };

    // All-or-nothing budget approval BEFORE the fetch. You can't un-spend
    // money on a government website.
    let approval = ctx
        .budget
        .check_approval(lease.account.account_id, estimate);
    if !approval.approved {
        return CheckResult::Deferred {
            kind: DeferKind::Cost,
            reason: approval.reason.unwrap_or_else(|| "budget denied".into()),
        };
    }

    // The fetch, under the hard timeout. The lease drops (and frees its
    // session slot) on every path out of this function.
    let fetched = tokio::time::timeout(
        ctx.check_timeout,
        ctx.gateway.fetch_snapshot(&case.case_number, &case.source_id),
    )
    .await;

    let snapshot = match fetched {
        Err(_elapsed) => {
            ctx.metrics.increment_checks_timed_out();
            return CheckResult::Failed {
                reason: MonitorError::Timeout(ctx.check_timeout).to_string(),
            };
        }
        Ok(Err(err)) if err.is_deferral() => {
            return CheckResult::Deferred {
                kind: DeferKind::Rate,
                reason: err.to_string(),
            };
        }
        Ok(Err(err)) => {
            return CheckResult::Failed {
                reason: err.to_string(),
            };
        }
        Ok(Ok(snapshot)) => snapshot,
    };

    // The money is spent whether or not anything changed. Settle the tab
    // in both ledgers before looking at the docket.
    let alerts = ctx
        .budget
        .record_usage(lease.account.account_id, snapshot.cost_cents);
    ctx.metrics.add_budget_alerts(alerts.len() as u64);
    ctx.hourly.record(snapshot.cost_cents);

    // The cheap short-circuit. Never skipped — a false negative here is a
    // silently dropped change.
    if !detector::quick_check(&case, &snapshot.entries) {
        debug!(
            monitor_id = %case.monitor_id,
            case_number = %case.case_number,
            "Snapshot hash unchanged — nothing new on the docket"
        );
        let new_hash = case.cached_hash.clone();
        return CheckResult::Success {
            snapshot,
            new_hash,
            fresh_changes: 0,
        };
    }

    let analysis = detector::analyze(&case, &snapshot, &ctx.classifier);
    ctx.metrics.add_changes_detected(analysis.changes.len() as u64);

    let mut fresh_changes = 0u64;
    for change in analysis.changes {
        if !ctx.dedup.check_and_insert(&change.fingerprint()) {
            ctx.metrics.increment_changes_suppressed();
            continue;
        }
        match ctx.change_tx.try_send(change) {
            Ok(()) => fresh_changes += 1,
            Err(e) => {
                // A full conveyor belt means the dispatcher is drowning.
                // Dropping here is the bounded-queue contract; the dedup
                // engine already marked the fingerprint, so this exact
                // change will not re-alert.
                warn!(error = %e, "Change channel full — alert dropped");
                ctx.metrics.increment_changes_dropped();
            }
        }
    }

    CheckResult::Success {
        snapshot,
        new_hash: analysis.new_hash,
        fresh_changes,
    }
}

// =============================================================================
// THE LOOP
// =============================================================================

enum Step {
    Tick,
    Outcome(OutcomeReport),
    Command(SchedulerCommand),
    Shutdown,
}

/// The scheduler: sole owner of the check queue and the in-flight set.
pub struct Scheduler {
    queue: CheckQueue,
    in_flight: HashSet<Uuid>,
    ctx: Arc<CheckContext>,
    semaphore: Arc<Semaphore>,

    outcome_tx: mpsc::UnboundedSender<OutcomeReport>,
    outcome_rx: mpsc::UnboundedReceiver<OutcomeReport>,
    command_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    // Held so the command channel never reads as disconnected even if the
    // orchestrator drops every handle.
    _command_tx: mpsc::UnboundedSender<SchedulerCommand>,

    tick_interval: Duration,
    batch_size: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl Scheduler {
    pub fn new(config: &Config, ctx: CheckContext) -> (Self, SchedulerHandle) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            tx: command_tx.clone(),
        };
        info!(
            tick_secs = config.scheduler_tick.as_secs(),
            batch = config.scheduler_batch_size,
            max_concurrent = config.max_concurrent_checks,
            max_retries = config.max_check_retries,
            "Scheduler initializing — the war room is staffed"
        );
        (
            Self {
                queue: CheckQueue::new(),
                in_flight: HashSet::new(),
                semaphore: Arc::new(Semaphore::new(config.max_concurrent_checks)),
                ctx: Arc::new(ctx),
                outcome_tx,
                outcome_rx,
                command_rx,
                _command_tx: command_tx,
                tick_interval: config.scheduler_tick,
                batch_size: config.scheduler_batch_size,
                max_retries: config.max_check_retries,
                retry_delay: config.retry_delay,
            },
            handle,
        )
    }

    /// Run until shutdown. Cooperative: the loop never blocks on a check —
    /// workers run on their own tasks and report back over the channel.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                _ = ticker.tick() => Step::Tick,
                report = self.outcome_rx.recv() => match report {
                    Some(r) => Step::Outcome(r),
                    None => Step::Shutdown,
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(c) => Step::Command(c),
                    None => Step::Shutdown,
                },
                _ = shutdown.changed() => Step::Shutdown,
            };

            match step {
                Step::Tick => self.drain_due(),
                Step::Outcome(report) => self.handle_outcome(report),
                Step::Command(cmd) => self.handle_command(cmd),
                Step::Shutdown => break,
            }
        }

        // Let in-flight workers finish reporting so their results aren't
        // lost mid-air; their reschedules still land in the (now doomed)
        // queue, which is fine — we're not persisting it.
        info!(
            in_flight = self.in_flight.len(),
            queued = self.queue.len(),
            "Scheduler shutting down"
        );
        while !self.in_flight.is_empty() {
            match tokio::time::timeout(Duration::from_secs(5), self.outcome_rx.recv()).await {
                Ok(Some(report)) => self.handle_outcome(report),
                _ => break,
            }
        }
    }

    /// One scheduling tick: drain everything due (up to the batch cap) in
    /// priority order and launch what admission allows.
    fn drain_due(&mut self) {
        let now = Utc::now();
        let due = self.queue.drain_due(now, self.batch_size);
        let mut put_back: Vec<ScheduledCheck> = Vec::new();
        let mut blocked = false;

        for check in due {
            // Once the cost cap or the worker pool says stop, everything
            // else due this tick just goes back in the queue. Deferred,
            // never dropped.
            if blocked {
                put_back.push(check);
                continue;
            }

            // Lazy deletion: paused/stopped/errored cases simply evaporate
            // from the queue here. Removal never has to hunt heap entries.
            let Some(case) = self.ctx.registry.get(check.monitor_id) else {
                continue;
            };
            if !case.status.is_schedulable() {
                debug!(
                    monitor_id = %check.monitor_id,
                    status = %case.status,
                    "Dropping queued check for unschedulable case"
                );
                continue;
            }

            // One check per monitor at a time. A duplicate entry (double
            // schedule command, resume race) dies here; the in-flight
            // check's own reschedule keeps the case in rotation.
            if self.in_flight.contains(&check.monitor_id) {
                debug!(monitor_id = %check.monitor_id, "Monitor already in flight — skipping duplicate");
                continue;
            }

            // The rolling hourly spend cap. Projected overage defers this
            // check and everything behind it — if this one doesn't fit,
            // nothing cheaper is hiding back there (estimates are uniform).
            let estimate = self
                .ctx
                .budget
                .estimate_cost(OperationKind::DocketFetch, 0, 0, 0);
            if self.ctx.hourly.would_exceed(estimate) {
                debug!(
                    monitor_id = %check.monitor_id,
                    current = self.ctx.hourly.current_hour_cents(),
                    "Hourly cost cap reached — deferring due checks to next tick"
                );
                self.ctx.metrics.increment_checks_deferred_cost();
                put_back.push(check);
                blocked = true;
                continue;
            }

            // Bounded concurrency. No permit means the worker pool is full;
            // the check waits its turn in the queue.
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    self.in_flight.insert(check.monitor_id);
                    self.ctx.metrics.increment_checks_started();

                    let ctx = Arc::clone(&self.ctx);
                    let tx = self.outcome_tx.clone();
                    tokio::spawn(async move {
                        let result = execute_check(&ctx, &check).await;
                        let _ = tx.send(OutcomeReport { check, result });
                        drop(permit);
                    });
                }
                Err(_) => {
                    put_back.push(check);
                    blocked = true;
                }
            }
        }

        for check in put_back {
            self.queue.push(check);
        }
    }

    /// Absorb a worker's report. This is the only place case counters,
    /// cached snapshots, and the queue get updated after a check.
    fn handle_outcome(&mut self, report: OutcomeReport) {
        let OutcomeReport { check, result } = report;
        self.in_flight.remove(&check.monitor_id);
        let now = Utc::now();

        let Some(case) = self.ctx.registry.get(check.monitor_id) else {
            return;
        };
        // Removed or paused while in flight: the check completed, its
        // result goes to the shredder, and nothing reschedules. This is
        // the whole cancellation model.
        if !case.status.is_schedulable() {
            debug!(
                monitor_id = %check.monitor_id,
                status = %case.status,
                "In-flight check finished for inactive case — result discarded"
            );
            return;
        }

        match result {
            CheckResult::Success {
                snapshot,
                new_hash,
                fresh_changes,
            } => {
                self.ctx.metrics.increment_checks_succeeded();
                let changed = new_hash != case.cached_hash;
                let cost = snapshot.cost_cents;
                self.ctx.registry.with_case_mut(check.monitor_id, |c| {
                    c.check_count += 1;
                    c.error_count = 0;
                    c.total_cost_cents += cost;
                    c.last_checked_at = Some(now);
                    if changed {
                        c.change_count += fresh_changes;
                        c.last_change_at = Some(now);
                        c.cached_entries = snapshot.entries;
                        c.cached_case_info = snapshot.case_info;
                        c.cached_hash = new_hash;
                    }
                    c.status = CaseStatus::Active;
                    c.next_check_at = c.next_check_from(now);
                });
                self.reschedule(check.monitor_id, 0);
            }
            CheckResult::Deferred { kind, reason } => {
                let status = match kind {
                    DeferKind::Cost => {
                        self.ctx.metrics.increment_checks_deferred_cost();
                        CaseStatus::CostLimited
                    }
                    DeferKind::Rate => {
                        self.ctx.metrics.increment_checks_deferred_rate();
                        CaseStatus::RateLimited
                    }
                };
                info!(
                    monitor_id = %check.monitor_id,
                    case_number = %case.case_number,
                    %reason,
                    "Check deferred to next natural slot"
                );
                self.ctx.registry.with_case_mut(check.monitor_id, |c| {
                    c.status = status;
                    c.next_check_at = c.next_check_from(now);
                });
                // Deferrals never burn a retry.
                self.reschedule(check.monitor_id, check.retry_count);
            }
            CheckResult::Failed { reason } => {
                self.ctx.metrics.increment_checks_failed();
                let retries = check.retry_count + 1;
                self.ctx.registry.with_case_mut(check.monitor_id, |c| {
                    c.error_count += 1;
                    c.last_checked_at = Some(now);
                });

                if retries >= self.max_retries {
                    warn!(
                        monitor_id = %check.monitor_id,
                        case_number = %case.case_number,
                        retries,
                        %reason,
                        "Check failed terminally — case parked in Error status until a human resumes it"
                    );
                    self.ctx.registry.with_case_mut(check.monitor_id, |c| {
                        c.status = CaseStatus::Error;
                    });
                    return; // no reschedule: monitoring goes silent, visibly
                }

                // Linear backoff: failure N waits N × retry_delay.
                let delay = self.retry_delay * retries;
                let retry_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                warn!(
                    monitor_id = %check.monitor_id,
                    case_number = %case.case_number,
                    retries,
                    retry_in_secs = delay.as_secs(),
                    %reason,
                    "Check failed — retrying with backoff"
                );
                let score = priority_score(&case, &self.ctx.classifier, now);
                self.queue.push(ScheduledCheck {
                    monitor_id: check.monitor_id,
                    scheduled_time: retry_at,
                    priority_score: score,
                    retry_count: retries,
                });
            }
            CheckResult::Discarded => {}
        }
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Schedule(monitor_id) => self.reschedule(monitor_id, 0),
        }
    }

    /// Push a fresh queue entry for a case at its current `next_check_at`,
    /// with a freshly computed priority score.
    fn reschedule(&mut self, monitor_id: Uuid, retry_count: u32) {
        let Some(case) = self.ctx.registry.get(monitor_id) else {
            return;
        };
        if !case.status.is_schedulable() {
            return;
        }
        if self.in_flight.contains(&monitor_id) {
            return;
        }
        let score = priority_score(&case, &self.ctx.classifier, Utc::now());
        self.queue.push(ScheduledCheck {
            monitor_id,
            scheduled_time: case.next_check_at,
            priority_score: score,
            retry_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::SelectionStrategy;
    use crate::gateway::{ScriptedGateway, ScriptedResponse};
    use crate::models::{Account, CaseInfo, DocketEntry, PollFrequency};

    fn entry(number: u32, description: &str) -> DocketEntry {
        DocketEntry {
            entry_number: number,
            description: description.to_string(),
            filed_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 15),
            document_links: vec![],
        }
    }

    fn snapshot(entries: Vec<DocketEntry>, cost: u64) -> Snapshot {
        Snapshot {
            entries,
            case_info: CaseInfo {
                judge: Some("Hon. A. Example".into()),
                status: Some("Open".into()),
                parties: vec!["Smith".into()],
                court: Some("D. Example".into()),
            },
            cost_cents: cost,
            fetched_at: Utc::now(),
        }
    }

    struct Harness {
        scheduler: Scheduler,
        handle: SchedulerHandle,
        gateway: Arc<ScriptedGateway>,
        registry: CaseRegistry,
        hourly: Arc<HourlyLedger>,
        change_rx: crossbeam_channel::Receiver<ChangeDetection>,
    }

    fn harness_with(config: Config, daily_limit_cents: u64) -> Harness {
        let gateway = Arc::new(ScriptedGateway::new());
        let pool = AccountPool::new(SelectionStrategy::RoundRobin, config.max_concurrent_sessions);
        let mut account = Account::new("test-credential");
        account.daily_limit_cents = daily_limit_cents;
        account.monthly_limit_cents = 0;
        account.rate_limit_per_hour = 10_000;
        pool.add_account(account);

        let budget = Arc::new(BudgetService::new(&config, pool.clone()));
        let hourly = Arc::new(HourlyLedger::new(config.cost_limit_per_hour_cents));
        let classifier =
            Arc::new(Classifier::from_config(&config).expect("default config must compile"));
        let dedup = Arc::new(ChangeDedup::new(1000, 0.01, 1000, 3600));
        let registry = CaseRegistry::new();
        let (change_tx, change_rx) = crossbeam_channel::bounded(64);
        let metrics = Arc::new(MetricsCollector::new());

        let ctx = CheckContext {
            gateway: gateway.clone() as Arc<dyn RecordsGateway>,
            pool,
            budget,
            hourly: hourly.clone(),
            classifier,
            dedup,
            registry: registry.clone(),
            change_tx,
            metrics,
            check_timeout: config.check_timeout,
        };
        let (scheduler, handle) = Scheduler::new(&config, ctx);
        Harness {
            scheduler,
            handle,
            gateway,
            registry,
            hourly,
            change_rx,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.retry_delay = Duration::ZERO;
        config.check_timeout = Duration::from_millis(200);
        config.quarterly_exemption_cents = 0;
        config
    }

    fn harness() -> Harness {
        harness_with(test_config(), 0)
    }

    /// Seed a case with a cached snapshot and a due queue entry.
    fn seed_case(h: &mut Harness, cached: Vec<DocketEntry>) -> Uuid {
        let mut case = MonitoredCase::new("2:24-cv-0001", "pacer", PollFrequency::Every15Min, 3);
        case.cached_hash = detector::compute_snapshot_hash(&cached);
        case.cached_entries = cached;
        case.next_check_at = Utc::now() - chrono::Duration::seconds(1);
        let id = case.monitor_id;
        h.registry.insert(case);
        h.scheduler.queue.push(ScheduledCheck {
            monitor_id: id,
            scheduled_time: Utc::now() - chrono::Duration::seconds(1),
            priority_score: 3,
            retry_count: 0,
        });
        id
    }

    async fn run_one_check(h: &mut Harness) {
        h.scheduler.drain_due();
        let report = h
            .scheduler
            .outcome_rx
            .recv()
            .await
            .expect("worker must report");
        h.scheduler.handle_outcome(report);
    }

    #[test]
    fn test_queue_orders_by_score_then_time_then_seq() {
        let mut queue = CheckQueue::new();
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(60);

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        // Higher score, earlier time.
        queue.push(ScheduledCheck {
            monitor_id: a,
            scheduled_time: earlier,
            priority_score: 3,
            retry_count: 0,
        });
        // Lower score, later time — still wins.
        queue.push(ScheduledCheck {
            monitor_id: b,
            scheduled_time: now,
            priority_score: 1,
            retry_count: 0,
        });
        // Same score as b, later insert, earlier time.
        queue.push(ScheduledCheck {
            monitor_id: c,
            scheduled_time: earlier,
            priority_score: 1,
            retry_count: 0,
        });

        let order: Vec<Uuid> = queue
            .drain_due(now, usize::MAX)
            .into_iter()
            .map(|s| s.monitor_id)
            .collect();
        assert_eq!(order, vec![c, b, a], "score beats time, time breaks score ties");
    }

    #[test]
    fn test_queue_holds_future_entries() {
        let mut queue = CheckQueue::new();
        queue.push(ScheduledCheck {
            monitor_id: Uuid::new_v4(),
            scheduled_time: Utc::now() + chrono::Duration::minutes(5),
            priority_score: 1,
            retry_count: 0,
        });
        assert!(queue.drain_due(Utc::now(), usize::MAX).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_future_high_priority_entry_does_not_starve_due_work() {
        let mut queue = CheckQueue::new();
        let now = Utc::now();
        let due_id = Uuid::new_v4();
        // A score-1 check for later sits "above" everything in key order.
        queue.push(ScheduledCheck {
            monitor_id: Uuid::new_v4(),
            scheduled_time: now + chrono::Duration::minutes(10),
            priority_score: 1,
            retry_count: 0,
        });
        // A humble score-5 check that is due right now.
        queue.push(ScheduledCheck {
            monitor_id: due_id,
            scheduled_time: now - chrono::Duration::seconds(1),
            priority_score: 5,
            retry_count: 0,
        });

        let due = queue.drain_due(now, usize::MAX);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].monitor_id, due_id);
        assert_eq!(queue.len(), 1, "the future entry went back in the heap");
    }

    #[test]
    fn test_drain_respects_batch_cap() {
        let mut queue = CheckQueue::new();
        let now = Utc::now();
        for _ in 0..5 {
            queue.push(ScheduledCheck {
                monitor_id: Uuid::new_v4(),
                scheduled_time: now - chrono::Duration::seconds(1),
                priority_score: 3,
                retry_count: 0,
            });
        }
        let due = queue.drain_due(now, 2);
        assert_eq!(due.len(), 2);
        assert_eq!(queue.len(), 3, "overflow due entries stay queued");
    }

    #[test]
    fn test_priority_score_modifiers() {
        let config = Config::from_env();
        let classifier = Classifier::from_config(&config).expect("classifier");
        let now = Utc::now();

        let mut case = MonitoredCase::new("2:24-cv-0001", "pacer", PollFrequency::Hourly, 4);
        assert_eq!(priority_score(&case, &classifier, now), 4);

        // Recent change: −1.
        case.last_change_at = Some(now - chrono::Duration::hours(2));
        assert_eq!(priority_score(&case, &classifier, now), 3);

        // Stale change: no discount.
        case.last_change_at = Some(now - chrono::Duration::hours(48));
        assert_eq!(priority_score(&case, &classifier, now), 4);

        // Urgent marker in tags: −2.
        case.tags = vec!["expedited".to_string()];
        assert_eq!(priority_score(&case, &classifier, now), 2);

        // Everything at once on a priority-1 case: floored at 1.
        case.priority = 1;
        case.last_change_at = Some(now - chrono::Duration::hours(1));
        assert_eq!(priority_score(&case, &classifier, now), 1);
    }

    #[tokio::test]
    async fn test_successful_check_updates_cache_and_reschedules() {
        let mut h = harness();
        let cached = vec![entry(1, "Complaint"), entry(2, "Summons issued")];
        let id = seed_case(&mut h, cached.clone());

        let mut fresh = cached;
        fresh.push(entry(3, "Motion to Dismiss filed"));
        h.gateway.push(ScriptedResponse::Ok(snapshot(fresh, 30)));

        run_one_check(&mut h).await;

        let case = h.registry.get(id).expect("case");
        assert_eq!(case.check_count, 1);
        assert_eq!(case.change_count, 1);
        assert_eq!(case.total_cost_cents, 30);
        assert_eq!(case.cached_entries.len(), 3);
        assert!(case.last_change_at.is_some());
        assert!(case.next_check_at > Utc::now());
        assert_eq!(case.status, CaseStatus::Active);

        // The fresh change went down the conveyor belt.
        let change = h.change_rx.try_recv().expect("one change dispatched");
        assert_eq!(change.monitor_id, id);
        assert_eq!(change.entry_number, Some(3));

        // Rescheduled at the next natural slot.
        assert_eq!(h.scheduler.queue.len(), 1);
        assert!(h.scheduler.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_spends_money_but_emits_nothing() {
        let mut h = harness();
        let cached = vec![entry(1, "Complaint")];
        let id = seed_case(&mut h, cached.clone());
        h.gateway.push(ScriptedResponse::Ok(snapshot(cached, 10)));

        run_one_check(&mut h).await;

        let case = h.registry.get(id).expect("case");
        assert_eq!(case.check_count, 1);
        assert_eq!(case.change_count, 0);
        assert_eq!(case.total_cost_cents, 10);
        assert!(case.last_change_at.is_none());
        assert!(h.change_rx.try_recv().is_err());
        assert_eq!(h.hourly.current_hour_cents(), 10);
    }

    #[tokio::test]
    async fn test_paused_case_is_never_dispatched() {
        let mut h = harness();
        let id = seed_case(&mut h, vec![entry(1, "Complaint")]);
        h.registry
            .with_case_mut(id, |c| c.status = CaseStatus::Paused);

        h.scheduler.drain_due();

        assert_eq!(h.gateway.fetch_count.load(portable_atomic::Ordering::Relaxed), 0);
        assert!(h.scheduler.in_flight.is_empty());
        // Lazy-deleted from the queue entirely.
        assert!(h.scheduler.queue.is_empty());
    }

    #[tokio::test]
    async fn test_hourly_cap_defers_instead_of_dropping() {
        let mut config = test_config();
        config.cost_limit_per_hour_cents = 15;
        let mut h = harness_with(config, 0);
        seed_case(&mut h, vec![entry(1, "Complaint")]);

        // Burn the hour's budget; the projected 10¢ fetch no longer fits.
        h.hourly.record(10);
        h.scheduler.drain_due();

        assert_eq!(h.gateway.fetch_count.load(portable_atomic::Ordering::Relaxed), 0);
        assert_eq!(h.scheduler.queue.len(), 1, "deferred check stays queued");
    }

    #[tokio::test]
    async fn test_in_flight_monitor_is_not_double_dispatched() {
        let mut h = harness();
        let id = seed_case(&mut h, vec![entry(1, "Complaint")]);
        // A duplicate queue entry for the same monitor.
        h.scheduler.queue.push(ScheduledCheck {
            monitor_id: id,
            scheduled_time: Utc::now() - chrono::Duration::seconds(1),
            priority_score: 3,
            retry_count: 0,
        });
        h.gateway.set_fallback(snapshot(vec![entry(1, "Complaint")], 10));

        h.scheduler.drain_due();

        assert_eq!(h.scheduler.in_flight.len(), 1);
        assert!(h.scheduler.queue.is_empty(), "duplicate entry dropped");
    }

    #[tokio::test]
    async fn test_failures_back_off_then_park_in_error() {
        let mut h = harness();
        let id = seed_case(&mut h, vec![entry(1, "Complaint")]);
        for _ in 0..3 {
            h.gateway.push(ScriptedResponse::Err("portal on fire".into()));
        }

        // max_retries = 3: two retried failures, then the terminal one.
        run_one_check(&mut h).await;
        assert_eq!(h.registry.get(id).expect("case").status, CaseStatus::Active);
        assert_eq!(h.scheduler.queue.len(), 1);

        run_one_check(&mut h).await;
        assert_eq!(h.scheduler.queue.len(), 1);

        run_one_check(&mut h).await;
        let case = h.registry.get(id).expect("case");
        assert_eq!(case.status, CaseStatus::Error);
        assert_eq!(case.error_count, 3);
        assert!(h.scheduler.queue.is_empty(), "Error status stops scheduling");
        assert_eq!(h.gateway.fetch_count.load(portable_atomic::Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_success_resets_the_retry_clock() {
        let mut h = harness();
        let id = seed_case(&mut h, vec![entry(1, "Complaint")]);
        h.gateway.push(ScriptedResponse::Err("hiccup".into()));
        h.gateway.set_fallback(snapshot(vec![entry(1, "Complaint")], 10));

        run_one_check(&mut h).await; // failure #1
        run_one_check(&mut h).await; // success — consecutive counter resets

        let case = h.registry.get(id).expect("case");
        assert_eq!(case.status, CaseStatus::Active);
        assert_eq!(case.error_count, 0, "success clears the consecutive-failure count");
        // The queued retry entry carries retry_count 0 again.
        assert_eq!(h.scheduler.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut h = harness();
        seed_case(&mut h, vec![entry(1, "Complaint")]);
        h.gateway.push(ScriptedResponse::Hang);

        h.scheduler.drain_due();
        let report = h
            .scheduler
            .outcome_rx
            .recv()
            .await
            .expect("timeout must still report");
        match &report.result {
            CheckResult::Failed { reason } => assert!(reason.contains("timed out"), "got: {reason}"),
            other => panic!("expected Failed, got {other:?}"),
        }
        h.scheduler.handle_outcome(report);
        assert!(h.scheduler.in_flight.is_empty(), "slot released after timeout");
    }

    #[tokio::test]
    async fn test_rate_limit_defers_without_burning_a_retry() {
        let mut h = harness();
        let id = seed_case(&mut h, vec![entry(1, "Complaint")]);
        h.gateway.push(ScriptedResponse::RateLimited);

        run_one_check(&mut h).await;

        let case = h.registry.get(id).expect("case");
        assert_eq!(case.status, CaseStatus::RateLimited);
        assert_eq!(case.error_count, 0);
        assert_eq!(h.scheduler.queue.len(), 1, "deferred to next natural slot");
        assert!(case.next_check_at > Utc::now());
    }

    #[tokio::test]
    async fn test_budget_denial_defers_as_cost_limited() {
        // Daily limit of 5¢ vs a 10¢ docket fetch: denied before any fetch.
        let mut h = harness_with(test_config(), 5);
        let id = seed_case(&mut h, vec![entry(1, "Complaint")]);

        run_one_check(&mut h).await;

        let case = h.registry.get(id).expect("case");
        assert_eq!(case.status, CaseStatus::CostLimited);
        assert_eq!(h.gateway.fetch_count.load(portable_atomic::Ordering::Relaxed), 0);
        assert_eq!(h.scheduler.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_removal_mid_flight_discards_the_result() {
        let mut h = harness();
        let cached = vec![entry(1, "Complaint")];
        let id = seed_case(&mut h, cached.clone());
        let mut fresh = cached;
        fresh.push(entry(2, "ORDER granting motion"));
        h.gateway.push(ScriptedResponse::Ok(snapshot(fresh, 30)));

        h.scheduler.drain_due();
        // Case is removed while the check is in flight.
        h.registry
            .with_case_mut(id, |c| c.status = CaseStatus::Stopped);

        let report = h.scheduler.outcome_rx.recv().await.expect("report");
        h.scheduler.handle_outcome(report);

        // The check completed (the fetch happened) but wrote nothing.
        assert_eq!(h.gateway.fetch_count.load(portable_atomic::Ordering::Relaxed), 1);
        let case = h.registry.get(id).expect("tombstone remains");
        assert_eq!(case.check_count, 0);
        assert_eq!(case.status, CaseStatus::Stopped);
        assert!(h.scheduler.queue.is_empty(), "no reschedule for a stopped case");
    }

    #[tokio::test]
    async fn test_schedule_command_enqueues_active_case() {
        let mut h = harness();
        let mut case = MonitoredCase::new("2:24-cv-0002", "pacer", PollFrequency::Hourly, 2);
        case.next_check_at = Utc::now() + chrono::Duration::minutes(30);
        let id = case.monitor_id;
        h.registry.insert(case);

        h.handle.schedule(id);
        let cmd = h.scheduler.command_rx.recv().await.expect("command");
        h.scheduler.handle_command(cmd);

        assert_eq!(h.scheduler.queue.len(), 1);
        // Not due yet — the queue holds it.
        assert!(h.scheduler.queue.drain_due(Utc::now(), usize::MAX).is_empty());
    }
}
