// =============================================================================
// accounts.rs — THE CREDENTIAL MOTOR POOL
// =============================================================================
//
// The portal bills per credential, rate-limits per credential, and locks
// per credential. So we keep a pool of them and hand them out to check
// workers like a motor pool hands out trucks: sign one out, bring it back,
// and if they're all gone you WAIT — you don't hotwire a new one.
//
// Selection is round-robin by default (everyone shares the billing pain
// equally) or least-recently-used (the most-rested credential goes next,
// which spreads hourly rate windows nicely). Saturation — every session
// slot taken, or no eligible account for the source — returns None, and
// callers treat that as "retry later", never as a failure.
//
// The lease is a guard object: dropping it releases the session slot.
// Nobody has to remember to call release() at 2 AM in an error path.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Account, AccountStatus};

/// How the pool picks among eligible accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Rotate through the pool in order. Fair, boring, effective.
    RoundRobin,
    /// Hand out the account that's been idle longest. Spreads rolling
    /// rate windows thinner than round-robin when checks are bursty.
    LeastRecentlyUsed,
}

impl SelectionStrategy {
    /// Parse the config spelling; anything unrecognized falls back to
    /// round-robin with a warning, because a typo in an env var should
    /// not take down monitoring.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "lru" | "least_recently_used" => SelectionStrategy::LeastRecentlyUsed,
            "round_robin" | "rr" => SelectionStrategy::RoundRobin,
            other => {
                warn!(strategy = other, "Unknown account strategy — using round_robin");
                SelectionStrategy::RoundRobin
            }
        }
    }
}

/// One pooled credential plus its runtime bookkeeping.
struct AccountSlot {
    account: Account,
    last_used: Option<DateTime<Utc>>,
    /// Timestamps of checks in (roughly) the last hour, pruned on access.
    /// This is the per-account rate window.
    recent_checks: VecDeque<DateTime<Utc>>,
}

impl AccountSlot {
    fn prune_rate_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::hours(1);
        while self
            .recent_checks
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            self.recent_checks.pop_front();
        }
    }

    fn rate_exhausted(&mut self, now: DateTime<Utc>) -> bool {
        self.prune_rate_window(now);
        self.recent_checks.len() >= self.account.rate_limit_per_hour as usize
    }
}

struct PoolState {
    slots: Vec<AccountSlot>,
    /// Round-robin cursor. Wraps around; skips ineligible accounts.
    rr_cursor: usize,
    active_sessions: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_sessions: usize,
    strategy: SelectionStrategy,
}

/// The credential pool. Cheap to clone (it's an Arc all the way down).
#[derive(Clone)]
pub struct AccountPool {
    inner: Arc<PoolInner>,
}

impl AccountPool {
    pub fn new(strategy: SelectionStrategy, max_sessions: usize) -> Self {
        info!(
            ?strategy,
            max_sessions, "Credential pool initializing — the motor pool is open"
        );
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    rr_cursor: 0,
                    active_sessions: 0,
                }),
                max_sessions,
                strategy,
            }),
        }
    }

    pub fn add_account(&self, account: Account) {
        let mut state = self.inner.state.lock();
        info!(account_id = %account.account_id, label = %account.label, "Account added to pool");
        state.slots.push(AccountSlot {
            account,
            last_used: None,
            recent_checks: VecDeque::new(),
        });
    }

    /// Sign out a credential for a check against `source_id`.
    ///
    /// Returns None when the pool is session-saturated or no Active,
    /// source-permitted, rate-headroom account exists. None means "retry
    /// later" — the scheduler defers the check, it does not fail it.
    pub fn acquire(&self, source_id: &str) -> Option<AccountLease> {
        let now = Utc::now();
        let mut state = self.inner.state.lock();

        if state.active_sessions >= self.inner.max_sessions {
            debug!(
                active = state.active_sessions,
                max = self.inner.max_sessions,
                "Pool session-saturated — check must wait"
            );
            return None;
        }

        let chosen = match self.inner.strategy {
            SelectionStrategy::RoundRobin => pick_round_robin(&mut state, source_id, now),
            SelectionStrategy::LeastRecentlyUsed => pick_lru(&mut state, source_id, now),
        }?;

        let slot = &mut state.slots[chosen];
        slot.last_used = Some(now);
        slot.recent_checks.push_back(now);
        let account = slot.account.clone();
        state.active_sessions += 1;

        debug!(
            account_id = %account.account_id,
            label = %account.label,
            active_sessions = state.active_sessions,
            "Account leased"
        );

        Some(AccountLease {
            account,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Flip an account's status (suspension, unlock, expiry...). Returns
    /// false if the account isn't in this pool.
    pub fn set_status(&self, account_id: Uuid, status: AccountStatus) -> bool {
        let mut state = self.inner.state.lock();
        for slot in &mut state.slots {
            if slot.account.account_id == account_id {
                if slot.account.status != status {
                    info!(
                        account_id = %account_id,
                        from = %slot.account.status,
                        to = %status,
                        "Account status changed"
                    );
                }
                slot.account.status = status;
                return true;
            }
        }
        false
    }

    pub fn get(&self, account_id: Uuid) -> Option<Account> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .find(|s| s.account.account_id == account_id)
            .map(|s| s.account.clone())
    }

    pub fn accounts(&self) -> Vec<Account> {
        let state = self.inner.state.lock();
        state.slots.iter().map(|s| s.account.clone()).collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.state.lock().active_sessions
    }
}

fn eligible(slot: &mut AccountSlot, source_id: &str, now: DateTime<Utc>) -> bool {
    slot.account.status == AccountStatus::Active
        && slot.account.allows_source(source_id)
        && !slot.rate_exhausted(now)
}

fn pick_round_robin(state: &mut PoolState, source_id: &str, now: DateTime<Utc>) -> Option<usize> {
    let len = state.slots.len();
    if len == 0 {
        return None;
    }
    let start = state.rr_cursor % len;
    for offset in 0..len {
        let idx = (start + offset) % len;
        if eligible(&mut state.slots[idx], source_id, now) {
            state.rr_cursor = idx + 1;
            return Some(idx);
        }
    }
    None
}

fn pick_lru(state: &mut PoolState, source_id: &str, now: DateTime<Utc>) -> Option<usize> {
    let mut best: Option<(usize, Option<DateTime<Utc>>)> = None;
    for idx in 0..state.slots.len() {
        if !eligible(&mut state.slots[idx], source_id, now) {
            continue;
        }
        let last_used = state.slots[idx].last_used;
        let better = match &best {
            None => true,
            // Never-used beats any timestamp; otherwise oldest wins.
            Some((_, Some(current))) => last_used.map(|lu| lu < *current).unwrap_or(true),
            Some((_, None)) => false,
        };
        if better {
            best = Some((idx, last_used));
        }
    }
    best.map(|(idx, _)| idx)
}

/// A signed-out credential. Dropping the lease returns the session slot to
/// the pool — this is the `releaseFn` of the design, shaped as RAII so
/// early returns and panics in workers can't leak sessions.
pub struct AccountLease {
    pub account: Account,
    pool: Arc<PoolInner>,
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.active_sessions = state.active_sessions.saturating_sub(1);
        debug!(
            account_id = %self.account.account_id,
            active_sessions = state.active_sessions,
            "Account lease returned"
        );
    }
}
