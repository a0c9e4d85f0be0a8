// =============================================================================
// models.rs — THE SACRED DATA STRUCTURES OF DOCKET SURVEILLANCE
// =============================================================================
//
// These structs represent the fundamental building blocks of our case
// monitoring system. Each field has been carefully chosen to capture every
// conceivable piece of information about a lawsuit's journey through the
// court system, and about our journey through the court portal's fee
// schedule.
//
// Is it overkill to track five separate counters on a monitored case?
// Yes. Do we care? Absolutely not.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// The lifecycle status of a monitored case.
///
/// A case starts Active and, with luck, stays there. Everything else in
/// this enum is a different flavor of "we are not currently checking it."
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CaseStatus {
    /// Being checked on schedule. The happy path.
    Active,
    /// A human pressed pause. We remember everything, we check nothing.
    Paused,
    /// Logically removed. The tombstone state — in-flight checks may still
    /// finish, but their results go straight to the shredder.
    Stopped,
    /// The check failed `max_retries` times in a row. Monitoring has gone
    /// silent and will stay silent until a human resumes the case.
    /// This is a terminal, operator-visible state, not a hidden retry loop.
    Error,
    /// The source told us to slow down (or every credential is at its hourly
    /// ceiling). Checks defer to their next natural slot.
    RateLimited,
    /// Admission control said "not with that budget you don't."
    /// Also a deferral, not a failure.
    CostLimited,
}

impl CaseStatus {
    /// Whether the scheduler is allowed to keep this case in rotation.
    /// RateLimited/CostLimited cases still schedule — they just keep getting
    /// deferred until the budget window rolls over.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self,
            CaseStatus::Active | CaseStatus::RateLimited | CaseStatus::CostLimited
        )
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseStatus::Active => write!(f, "ACTIVE"),
            CaseStatus::Paused => write!(f, "PAUSED"),
            CaseStatus::Stopped => write!(f, "STOPPED"),
            CaseStatus::Error => write!(f, "ERROR"),
            CaseStatus::RateLimited => write!(f, "RATE_LIMITED"),
            CaseStatus::CostLimited => write!(f, "COST_LIMITED"),
        }
    }
}

/// How often a case gets re-checked. A fixed menu, not a free-form duration,
/// because "poll every 250ms" is how you get your firm's IP range banned
/// from the court portal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PollFrequency {
    /// For the case the managing partner asks about twice a day.
    Every5Min,
    /// The default for anything actively litigated.
    Every15Min,
    Every30Min,
    Hourly,
    Every6Hours,
    /// For cases in that special procedural purgatory between filings.
    Daily,
    /// For the zombie cases nobody has the heart to stop monitoring.
    Weekly,
}

impl PollFrequency {
    /// The nominal interval between checks. Jitter gets added on top —
    /// see `MonitoredCase::next_check_from` for the thundering-herd math.
    pub fn interval(&self) -> Duration {
        match self {
            PollFrequency::Every5Min => Duration::from_secs(5 * 60),
            PollFrequency::Every15Min => Duration::from_secs(15 * 60),
            PollFrequency::Every30Min => Duration::from_secs(30 * 60),
            PollFrequency::Hourly => Duration::from_secs(60 * 60),
            PollFrequency::Every6Hours => Duration::from_secs(6 * 60 * 60),
            PollFrequency::Daily => Duration::from_secs(24 * 60 * 60),
            PollFrequency::Weekly => Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Parse a frequency from its config spelling ("15m", "6h", "daily"...).
    /// Unknown spellings get None; callers decide how loudly to complain.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "5m" | "5min" => Some(PollFrequency::Every5Min),
            "15m" | "15min" => Some(PollFrequency::Every15Min),
            "30m" | "30min" => Some(PollFrequency::Every30Min),
            "1h" | "hourly" => Some(PollFrequency::Hourly),
            "6h" => Some(PollFrequency::Every6Hours),
            "daily" | "24h" => Some(PollFrequency::Daily),
            "weekly" | "7d" => Some(PollFrequency::Weekly),
            _ => None,
        }
    }
}

impl fmt::Display for PollFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollFrequency::Every5Min => write!(f, "5m"),
            PollFrequency::Every15Min => write!(f, "15m"),
            PollFrequency::Every30Min => write!(f, "30m"),
            PollFrequency::Hourly => write!(f, "1h"),
            PollFrequency::Every6Hours => write!(f, "6h"),
            PollFrequency::Daily => write!(f, "daily"),
            PollFrequency::Weekly => write!(f, "weekly"),
        }
    }
}

/// One chronological record in a case's public filing history.
/// The atom of our entire existence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocketEntry {
    /// The court's sequence number for this entry. Stable, unique within a
    /// case, and the key we diff on.
    pub entry_number: u32,
    /// The free-text docket description. Where all the legal drama lives,
    /// and where our keyword automatons go hunting.
    pub description: String,
    /// When the entry was filed, if the portal deigned to tell us.
    pub filed_date: Option<NaiveDate>,
    /// Links to attached documents. The count matters more than the URLs —
    /// a new attachment on an old entry is its own change type.
    pub document_links: Vec<String>,
}

/// Case-level metadata as of one snapshot. Judges rotate, parties get
/// added, cases close and — more often than you'd hope — reopen.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseInfo {
    pub judge: Option<String>,
    pub status: Option<String>,
    pub parties: Vec<String>,
    pub court: Option<String>,
}

impl CaseInfo {
    /// Whether a portal status string means "this case is over."
    /// Court status vocabulary is a choose-your-own-adventure book,
    /// so we accept the common spellings.
    pub fn is_closed_status(status: &str) -> bool {
        let lower = status.to_lowercase();
        lower.contains("closed") || lower.contains("terminated") || lower.contains("disposed")
    }
}

/// The full picture of a case at one point in time: every docket entry plus
/// the case metadata, and what the portal charged us for the privilege.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: Vec<DocketEntry>,
    pub case_info: CaseInfo,
    /// What this fetch actually cost, in cents. Admission control estimated
    /// it beforehand; this is the invoice-grade truth.
    pub cost_cents: u64,
    pub fetched_at: DateTime<Utc>,
}

/// A case under surveillance. This is the central mutable record of the
/// system: created on registration, mutated only by the scheduler after
/// each check, and logically destroyed by flipping status to Stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredCase {
    /// Our identifier, not the court's.
    pub monitor_id: Uuid,
    /// The court's identifier, e.g. "2:24-cv-01337".
    pub case_number: String,
    /// Which portal/source this case lives on.
    pub source_id: String,
    pub status: CaseStatus,
    pub frequency: PollFrequency,
    /// 1 = drop-everything, 5 = check when convenient.
    pub priority: u8,
    /// Per-case spending cap in cents. Zero means "uncapped", which the
    /// billing department would like a word about.
    pub cost_limit_cents: u64,
    /// Free-form tags. The urgent-marker scan looks at these and the title.
    pub tags: Vec<String>,
    /// Optional human-readable title ("Smith v. MegaCorp").
    pub title: Option<String>,

    // Running counters. The scheduler owns these after each check.
    pub check_count: u64,
    pub change_count: u64,
    pub error_count: u64,
    pub total_cost_cents: u64,

    pub next_check_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,

    // The last-known snapshot. Seeded by a synchronous fetch at registration
    // so the first scheduled check never mistakes "everything" for "new".
    pub cached_entries: Vec<DocketEntry>,
    pub cached_hash: String,
    pub cached_case_info: CaseInfo,

    /// Rules attached to this case, by ID. Rules are shared — many cases
    /// reference many rules, nobody owns anybody.
    pub rule_ids: Vec<Uuid>,

    pub created_at: DateTime<Utc>,
}

impl MonitoredCase {
    /// Create a freshly registered case. The cached snapshot starts empty;
    /// the orchestrator seeds it with an initial fetch before the case ever
    /// reaches the scheduler.
    pub fn new(
        case_number: impl Into<String>,
        source_id: impl Into<String>,
        frequency: PollFrequency,
        priority: u8,
    ) -> Self {
        let now = Utc::now();
        Self {
            monitor_id: Uuid::new_v4(),
            case_number: case_number.into(),
            source_id: source_id.into(),
            status: CaseStatus::Active,
            frequency,
            priority: priority.clamp(1, 5),
            cost_limit_cents: 0,
            tags: Vec::new(),
            title: None,
            check_count: 0,
            change_count: 0,
            error_count: 0,
            total_cost_cents: 0,
            next_check_at: now,
            last_checked_at: None,
            last_change_at: None,
            cached_entries: Vec::new(),
            cached_hash: String::new(),
            cached_case_info: CaseInfo::default(),
            rule_ids: Vec::new(),
            created_at: now,
        }
    }

    /// Compute the next check time: frequency interval plus a jitter of up
    /// to 10% of the interval. The jitter is sourced from UUID v4 randomness
    /// because we already carry a perfectly good entropy dispenser.
    ///
    /// Invariant: two cases registered in the same millisecond with the same
    /// frequency still land on different ticks. No thundering herds here.
    pub fn next_check_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.frequency.interval();
        let max_jitter_secs = (interval.as_secs() / 10).max(1);
        let entropy = Uuid::new_v4().as_u128();
        let jitter_secs = (entropy % (max_jitter_secs as u128 + 1)) as i64;
        now + chrono::Duration::seconds(interval.as_secs() as i64 + jitter_secs)
    }

    /// The key that makes (case number, source) pairs unique across the
    /// registry. Registering the same docket twice gets you one monitor
    /// and one rejection.
    pub fn identity_key(&self) -> String {
        identity_key(&self.case_number, &self.source_id)
    }
}

/// See [`MonitoredCase::identity_key`]. Free function so `add_case` can
/// check for duplicates before constructing anything.
pub fn identity_key(case_number: &str, source_id: &str) -> String {
    format!(
        "{}@{}",
        case_number.trim().to_lowercase(),
        source_id.trim().to_lowercase()
    )
}

/// The taxonomy of things that can happen on a docket. Each variant knows
/// its base severity; the classifier handles the keyword-driven overrides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// A brand-new docket entry that matched none of the keyword sets.
    /// Still news. Just not *exciting* news.
    NewEntry,
    /// An existing entry's description or filed date changed. Courts edit
    /// docket text more often than their reputation for finality suggests.
    EntryModified,
    /// An entry vanished. Rare, usually a clerk un-filing something,
    /// always worth a raised eyebrow.
    EntryRemoved,
    /// A document link appeared on an entry we already knew about.
    NewDocument,
    /// Somebody moved the court to do something.
    MotionFiled,
    /// The court ordered something. Somebody's day just changed.
    OrderEntered,
    /// The court decided something. Somebody's year just changed.
    JudgmentEntered,
    /// A hearing got scheduled. Cancel your weekend accordingly.
    HearingScheduled,
    /// A deadline got set. The associates already know.
    DeadlineSet,
    /// New judge. New rules. New everything.
    JudgeChange,
    /// The case's own status string changed (and it isn't a close/reopen —
    /// those get their own variants below).
    CaseStatusChange,
    CaseClosed,
    /// It's alive. IT'S ALIVE.
    CaseReopened,
    /// The party roster changed. Interveners, dismissed defendants,
    /// that one insurer who shows up in every case eventually.
    PartyChange,
}

impl ChangeType {
    /// The fixed type→severity table. Deterministic, auditable, and
    /// pointedly not machine learning.
    pub fn base_severity(&self) -> Severity {
        match self {
            ChangeType::JudgmentEntered => Severity::Urgent,
            ChangeType::OrderEntered => Severity::Critical,
            ChangeType::MotionFiled | ChangeType::HearingScheduled | ChangeType::DeadlineSet => {
                Severity::High
            }
            ChangeType::CaseClosed | ChangeType::CaseReopened => Severity::High,
            ChangeType::NewEntry
            | ChangeType::EntryModified
            | ChangeType::EntryRemoved
            | ChangeType::NewDocument
            | ChangeType::JudgeChange
            | ChangeType::CaseStatusChange
            | ChangeType::PartyChange => Severity::Medium,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::NewEntry => "NEW_ENTRY",
            ChangeType::EntryModified => "ENTRY_MODIFIED",
            ChangeType::EntryRemoved => "ENTRY_REMOVED",
            ChangeType::NewDocument => "NEW_DOCUMENT",
            ChangeType::MotionFiled => "MOTION_FILED",
            ChangeType::OrderEntered => "ORDER_ENTERED",
            ChangeType::JudgmentEntered => "JUDGMENT_ENTERED",
            ChangeType::HearingScheduled => "HEARING_SCHEDULED",
            ChangeType::DeadlineSet => "DEADLINE_SET",
            ChangeType::JudgeChange => "JUDGE_CHANGE",
            ChangeType::CaseStatusChange => "CASE_STATUS_CHANGE",
            ChangeType::CaseClosed => "CASE_CLOSED",
            ChangeType::CaseReopened => "CASE_REOPENED",
            ChangeType::PartyChange => "PARTY_CHANGE",
        };
        write!(f, "{}", s)
    }
}

/// Alert severity, in strictly increasing order of phone-buzzing intensity.
/// The derive gives us `Low < Medium < High < Critical < Urgent`, which the
/// decisive-keyword bump relies on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Urgent,
}

impl Severity {
    /// One step up the Low<Medium<High<Critical ladder, capped at Critical.
    /// Urgent is deliberately unreachable from here — only the explicit
    /// urgent-keyword list can put an alert at Urgent.
    pub fn bump_decisive(self) -> Severity {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High => Severity::Critical,
            Severity::Critical => Severity::Critical,
            Severity::Urgent => Severity::Urgent,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::Urgent => write!(f, "URGENT"),
        }
    }
}

/// One detected delta between two snapshots. Created by the detector,
/// consumed exactly once by the dispatcher, then archived in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetection {
    pub change_id: Uuid,
    pub monitor_id: Uuid,
    pub case_number: String,
    pub source_id: String,
    pub change_type: ChangeType,
    pub severity: Severity,
    /// The previous value for modified fields, when there is one.
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// The docket description (or metadata diff summary) this change is about.
    pub description: String,
    pub entry_number: Option<u32>,
    pub court: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl ChangeDetection {
    pub fn new(
        monitor_id: Uuid,
        case_number: impl Into<String>,
        source_id: impl Into<String>,
        change_type: ChangeType,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            monitor_id,
            case_number: case_number.into(),
            source_id: source_id.into(),
            change_type,
            severity,
            old_value: None,
            new_value: None,
            description: description.into(),
            entry_number: None,
            court: None,
            detected_at: Utc::now(),
        }
    }

    /// The deduplication fingerprint. Two checks that observe the same
    /// change (overlapping retries, a re-fetch after a deferral) produce
    /// the same fingerprint and only the first one alerts anybody.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.monitor_id,
            self.change_type,
            self.entry_number.map(|n| n.to_string()).unwrap_or_default(),
            self.new_value.as_deref().unwrap_or(&self.description),
        )
    }
}

impl fmt::Display for ChangeDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} on {} — {}",
            self.change_id, self.severity, self.change_type, self.case_number, self.description
        )
    }
}

/// The channels we can yell through. Each one has its own adapter, its own
/// transport, and its own opinion about message length.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NotificationChannel {
    Email,
    Sms,
    Webhook,
    Slack,
    Teams,
    /// Published to Redis for the dashboard to pick up.
    InApp,
    Push,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 7] = [
        NotificationChannel::Email,
        NotificationChannel::Sms,
        NotificationChannel::Webhook,
        NotificationChannel::Slack,
        NotificationChannel::Teams,
        NotificationChannel::InApp,
        NotificationChannel::Push,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "email" => Some(NotificationChannel::Email),
            "sms" => Some(NotificationChannel::Sms),
            "webhook" => Some(NotificationChannel::Webhook),
            "slack" => Some(NotificationChannel::Slack),
            "teams" => Some(NotificationChannel::Teams),
            "in_app" | "inapp" | "in-app" => Some(NotificationChannel::InApp),
            "push" => Some(NotificationChannel::Push),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::Webhook => "webhook",
            NotificationChannel::Slack => "slack",
            NotificationChannel::Teams => "teams",
            NotificationChannel::InApp => "in_app",
            NotificationChannel::Push => "push",
        };
        write!(f, "{}", s)
    }
}

/// Per-channel delivery outcome for one notification event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed(String),
    Skipped(String),
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed(reason) => write!(f, "failed:{}", reason),
            DeliveryStatus::Skipped(reason) => write!(f, "skipped:{}", reason),
        }
    }
}

/// A dispatch attempt: one (change, rule) pair, rendered and addressed.
/// Lifecycle: Pending → per-channel Delivered/Failed, retried until
/// `retry_count` hits the configured ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: Uuid,
    pub change_id: Uuid,
    pub rule_id: Uuid,
    pub monitor_id: Uuid,
    pub channels: Vec<NotificationChannel>,
    /// External addresses/webhook URLs plus internal user IDs, resolved
    /// from the rule at matching time.
    pub recipients: Vec<String>,
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub delivery: HashMap<NotificationChannel, DeliveryStatus>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Channels still owed a delivery attempt: Pending or Failed.
    /// Delivered and Skipped channels are done — a skip is a decision,
    /// not a transient condition.
    pub fn undelivered_channels(&self) -> Vec<NotificationChannel> {
        self.channels
            .iter()
            .filter(|c| {
                matches!(
                    self.delivery.get(c),
                    None | Some(DeliveryStatus::Pending) | Some(DeliveryStatus::Failed(_))
                )
            })
            .copied()
            .collect()
    }
}

/// A field-level condition a rule can impose beyond type/severity filters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuleCondition {
    /// Case-insensitive substring match on the change description.
    DescriptionContains(String),
    /// Exact (case-insensitive) match on the court name.
    CourtEquals(String),
    /// The change concerns a docket entry at or past this number.
    EntryNumberAtLeast(u32),
}

impl RuleCondition {
    pub fn matches(&self, change: &ChangeDetection) -> bool {
        match self {
            RuleCondition::DescriptionContains(needle) => change
                .description
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            RuleCondition::CourtEquals(court) => change
                .court
                .as_deref()
                .map(|c| c.eq_ignore_ascii_case(court))
                .unwrap_or(false),
            RuleCondition::EntryNumberAtLeast(min) => {
                change.entry_number.map(|n| n >= *min).unwrap_or(false)
            }
        }
    }
}

/// A subscription rule: which changes matter, who hears about them, and how.
/// Immutable once matched against a change; shared across cases by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringRule {
    pub rule_id: Uuid,
    pub name: String,
    /// Change types this rule fires on. Empty means "all of them",
    /// which is a bold lifestyle choice.
    pub change_types: Vec<ChangeType>,
    /// Minimum severity to fire on, if set.
    pub min_severity: Option<Severity>,
    pub channels: Vec<NotificationChannel>,
    pub recipients: Vec<String>,
    pub conditions: Vec<RuleCondition>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl MonitoringRule {
    pub fn new(name: impl Into<String>, channels: Vec<NotificationChannel>) -> Self {
        Self {
            rule_id: Uuid::new_v4(),
            name: name.into(),
            change_types: Vec::new(),
            min_severity: None,
            channels,
            recipients: Vec::new(),
            conditions: Vec::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Does this rule fire for this change? Inactive rules never match;
    /// everything else is filters all the way down.
    pub fn matches(&self, change: &ChangeDetection) -> bool {
        if !self.is_active {
            return false;
        }
        if !self.change_types.is_empty() && !self.change_types.contains(&change.change_type) {
            return false;
        }
        if let Some(min) = self.min_severity {
            if change.severity < min {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.matches(change))
    }
}

/// A transient scheduler queue entry. Ordered by (priority_score,
/// scheduled_time, seq) — the comparison key is immutable, the payload is
/// just the monitor ID, and nobody ever mutates one of these in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledCheck {
    pub monitor_id: Uuid,
    pub scheduled_time: DateTime<Utc>,
    /// Lower = sooner. Computed at insert time from priority, recent
    /// activity, and urgent markers; floor is 1.
    pub priority_score: u8,
    pub retry_count: u32,
}

/// Credential status. Only Active accounts get handed out by the pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    /// Tripped a hard budget threshold (or a human tripped it manually).
    Suspended,
    /// The portal locked it. We just report the bad news.
    Locked,
    Expired,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "ACTIVE"),
            AccountStatus::Suspended => write!(f, "SUSPENDED"),
            AccountStatus::Locked => write!(f, "LOCKED"),
            AccountStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// A source credential with its budget envelope. Usage bookkeeping lives in
/// the budget ledger (`cost.rs`), not here — this is the static-ish identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub label: String,
    /// Sources this credential may touch. Empty = all sources.
    pub allowed_sources: Vec<String>,
    pub daily_limit_cents: u64,
    pub monthly_limit_cents: u64,
    /// Checks per rolling hour before this account sits one out.
    pub rate_limit_per_hour: u32,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            account_id: Uuid::new_v4(),
            label: label.into(),
            allowed_sources: Vec::new(),
            daily_limit_cents: 10_000,
            monthly_limit_cents: 100_000,
            rate_limit_per_hour: 60,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn allows_source(&self, source_id: &str) -> bool {
        self.allowed_sources.is_empty()
            || self
                .allowed_sources
                .iter()
                .any(|s| s.eq_ignore_ascii_case(source_id))
    }
}

/// What kind of billable operation a check performs. The estimator maps
/// these plus page/document/search counts to cents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationKind {
    /// Pulling the docket sheet itself.
    DocketFetch,
    /// Downloading attached documents.
    DocumentDownload,
    /// Running a search query against the portal.
    Search,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_is_total() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert!(Severity::Critical < Severity::Urgent);
    }

    #[test]
    fn test_decisive_bump_caps_at_critical() {
        assert_eq!(Severity::Low.bump_decisive(), Severity::Medium);
        assert_eq!(Severity::High.bump_decisive(), Severity::Critical);
        assert_eq!(Severity::Critical.bump_decisive(), Severity::Critical);
        // Urgent stays Urgent — the bump never demotes.
        assert_eq!(Severity::Urgent.bump_decisive(), Severity::Urgent);
    }

    #[test]
    fn test_base_severity_table() {
        assert_eq!(ChangeType::JudgmentEntered.base_severity(), Severity::Urgent);
        assert_eq!(ChangeType::OrderEntered.base_severity(), Severity::Critical);
        assert_eq!(ChangeType::MotionFiled.base_severity(), Severity::High);
        assert_eq!(ChangeType::HearingScheduled.base_severity(), Severity::High);
        assert_eq!(ChangeType::DeadlineSet.base_severity(), Severity::High);
        assert_eq!(ChangeType::NewEntry.base_severity(), Severity::Medium);
        assert_eq!(ChangeType::JudgeChange.base_severity(), Severity::Medium);
    }

    #[test]
    fn test_next_check_jitter_stays_in_bounds() {
        let case = MonitoredCase::new("2:24-cv-00001", "pacer", PollFrequency::Every15Min, 3);
        let now = Utc::now();
        for _ in 0..50 {
            let next = case.next_check_from(now);
            let delta = (next - now).num_seconds();
            assert!(delta >= 15 * 60, "next check before the interval: {delta}s");
            assert!(delta <= 15 * 60 + 90, "jitter exceeded 10% of interval: {delta}s");
        }
    }

    #[test]
    fn test_identity_key_normalizes() {
        assert_eq!(
            identity_key("2:24-CV-0001 ", "PACER"),
            identity_key("2:24-cv-0001", "pacer")
        );
    }

    #[test]
    fn test_rule_matching_filters() {
        let mut rule = MonitoringRule::new("orders only", vec![NotificationChannel::Email]);
        rule.change_types = vec![ChangeType::OrderEntered];
        rule.min_severity = Some(Severity::Critical);

        let mut change = ChangeDetection::new(
            Uuid::new_v4(),
            "2:24-cv-0001",
            "pacer",
            ChangeType::OrderEntered,
            Severity::Critical,
            "ORDER granting motion to compel",
        );
        assert!(rule.matches(&change));

        change.severity = Severity::High;
        assert!(!rule.matches(&change), "below min severity must not match");

        change.severity = Severity::Critical;
        change.change_type = ChangeType::MotionFiled;
        assert!(!rule.matches(&change), "wrong change type must not match");
    }

    #[test]
    fn test_rule_conditions() {
        let mut rule = MonitoringRule::new("sanctions watch", vec![NotificationChannel::Slack]);
        rule.conditions = vec![RuleCondition::DescriptionContains("sanctions".into())];

        let mut change = ChangeDetection::new(
            Uuid::new_v4(),
            "2:24-cv-0001",
            "pacer",
            ChangeType::OrderEntered,
            Severity::Critical,
            "ORDER imposing SANCTIONS on counsel",
        );
        assert!(rule.matches(&change));

        change.description = "ORDER granting extension".into();
        assert!(!rule.matches(&change));
    }

    #[test]
    fn test_inactive_rule_never_matches() {
        let mut rule = MonitoringRule::new("muted", vec![NotificationChannel::Email]);
        rule.is_active = false;
        let change = ChangeDetection::new(
            Uuid::new_v4(),
            "2:24-cv-0001",
            "pacer",
            ChangeType::JudgmentEntered,
            Severity::Urgent,
            "JUDGMENT entered",
        );
        assert!(!rule.matches(&change));
    }

    #[test]
    fn test_fingerprint_is_stable_across_detections() {
        let monitor_id = Uuid::new_v4();
        let mut a = ChangeDetection::new(
            monitor_id,
            "2:24-cv-0001",
            "pacer",
            ChangeType::MotionFiled,
            Severity::High,
            "Motion to Dismiss filed",
        );
        a.entry_number = Some(3);
        let mut b = ChangeDetection::new(
            monitor_id,
            "2:24-cv-0001",
            "pacer",
            ChangeType::MotionFiled,
            Severity::High,
            "Motion to Dismiss filed",
        );
        b.entry_number = Some(3);
        // Different change_id, same observable change — same fingerprint.
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_paused_and_stopped_are_not_schedulable() {
        assert!(CaseStatus::Active.is_schedulable());
        assert!(CaseStatus::RateLimited.is_schedulable());
        assert!(CaseStatus::CostLimited.is_schedulable());
        assert!(!CaseStatus::Paused.is_schedulable());
        assert!(!CaseStatus::Stopped.is_schedulable());
        assert!(!CaseStatus::Error.is_schedulable());
    }

    #[test]
    fn test_undelivered_channels_excludes_done_states() {
        let mut event = NotificationEvent {
            event_id: Uuid::new_v4(),
            change_id: Uuid::new_v4(),
            rule_id: Uuid::new_v4(),
            monitor_id: Uuid::new_v4(),
            channels: vec![
                NotificationChannel::Email,
                NotificationChannel::Slack,
                NotificationChannel::Webhook,
            ],
            recipients: vec!["a@example.com".into()],
            title: "t".into(),
            body: "b".into(),
            severity: Severity::High,
            delivery: HashMap::new(),
            retry_count: 0,
            created_at: Utc::now(),
        };
        event
            .delivery
            .insert(NotificationChannel::Email, DeliveryStatus::Delivered);
        event.delivery.insert(
            NotificationChannel::Slack,
            DeliveryStatus::Failed("timeout".into()),
        );

        let undelivered = event.undelivered_channels();
        assert!(!undelivered.contains(&NotificationChannel::Email));
        assert!(undelivered.contains(&NotificationChannel::Slack));
        assert!(undelivered.contains(&NotificationChannel::Webhook));
    }
}
