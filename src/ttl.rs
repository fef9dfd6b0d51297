//! # TTL Clock and Query Lifecycle
//!
//! Two pieces live here:
//!
//! 1. [`TtlClock`], a monotonic logical clock counting cumulative *serving*
//!    time for a client group. It advances with wall-clock time only while a
//!    syncer is serving the group, so TTL countdowns pause across downtime
//!    and resume exactly where they left off on reconnect.
//!
//! 2. The query-lifecycle selection rules: which queries are eligible for
//!    eviction, the per-query eviction deadline, and the single-timer
//!    schedule with hysteresis that coalesces near-simultaneous expiries
//!    into one eviction batch.
//!
//! Time is injected through the [`Clock`] trait. Production uses
//! [`SystemClock`]; tests drive a [`ManualClock`] for fully deterministic
//! schedules.
//!
//! ## Lifecycle states
//!
//! Per `(query, client)` pair: `desired` (`inactivated_at = None`) →
//! `inactive` (`inactivated_at = t`) → evicted (client state removed, desire
//! tombstoned), or back to `desired` on a re-`put`. A query is eligible for
//! eviction only when **every** referencing client is inactive.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

use crate::cvr::{Cvr, QueryRecord};
use crate::types::QueryHash;

// =============================================================================
// Configuration
// =============================================================================

/// TTL applied when a client requests a negative (i.e. "default") TTL:
/// 10 minutes.
pub const DEFAULT_TTL_MS: u64 = 600_000;

/// Slack added to the eviction timer so queries expiring within a short
/// window of each other are evicted in one batch and one poke.
pub const TTL_TIMER_HYSTERESIS_MS: u64 = 100;

/// Interval of the background clock touch that keeps the TTL clock (and its
/// persisted copy) advancing during long idle connected periods.
pub const TTL_CLOCK_INTERVAL_MS: u64 = 60_000;

// =============================================================================
// Clock
// =============================================================================

/// A source of wall-clock milliseconds and deadline sleeps.
///
/// The syncer derives every timer (eviction, clock touch) from this trait,
/// so swapping in a [`ManualClock`] makes the whole group schedule
/// deterministic under test.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Completes once `now_ms() >= deadline_ms`.
    fn sleep_until<'a>(&'a self, deadline_ms: u64)
        -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// The real clock: Unix-epoch milliseconds and tokio sleeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn sleep_until<'a>(
        &'a self,
        deadline_ms: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        let delay = deadline_ms.saturating_sub(self.now_ms());
        Box::pin(tokio::time::sleep(std::time::Duration::from_millis(delay)))
    }
}

/// A hand-driven clock for deterministic tests.
///
/// `advance` wakes every pending `sleep_until` so timers fire exactly when
/// the test says time has passed, independent of the host scheduler.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
    notify: Notify,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
            notify: Notify::new(),
        }
    }

    /// Moves time forward by `ms` and wakes sleepers.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn sleep_until<'a>(
        &'a self,
        deadline_ms: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register before checking, so an advance racing this call
                // cannot be missed.
                notified.as_mut().enable();
                if self.now_ms() >= deadline_ms {
                    return;
                }
                notified.await;
            }
        })
    }
}

// =============================================================================
// TTL Clock
// =============================================================================

/// Cumulative serving time for one client group, in milliseconds.
///
/// Persisted alongside `last_active` (wall-clock). While the group is served,
/// every touch adds the wall-clock time elapsed since `last_active`; while
/// nothing serves the group, nothing touches it and the value stands still.
/// The value never decreases and never exceeds the wall-clock time elapsed
/// since the CVR's creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlClock {
    value_ms: u64,
    last_active_ms: u64,
}

impl TtlClock {
    /// A fresh clock, starting at zero serving time.
    pub fn new(now_ms: u64) -> Self {
        Self {
            value_ms: 0,
            last_active_ms: now_ms,
        }
    }

    /// Rebuilds a clock from its persisted parts.
    pub fn from_parts(value_ms: u64, last_active_ms: u64) -> Self {
        Self {
            value_ms,
            last_active_ms,
        }
    }

    /// Adds the serving time elapsed since the last touch and returns the
    /// new value. Wall-clock regressions contribute nothing.
    pub fn advance(&mut self, now_ms: u64) -> u64 {
        self.value_ms += now_ms.saturating_sub(self.last_active_ms);
        self.last_active_ms = now_ms;
        self.value_ms
    }

    /// Re-bases the clock after a serving gap: downtime between
    /// `last_active` and `now` must not count as serving time.
    pub fn resume(&mut self, now_ms: u64) {
        self.last_active_ms = now_ms;
    }

    /// The value the clock would have if touched at `now_ms`, without
    /// touching it.
    pub fn projected(&self, now_ms: u64) -> u64 {
        self.value_ms + now_ms.saturating_sub(self.last_active_ms)
    }

    pub fn value_ms(&self) -> u64 {
        self.value_ms
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms
    }
}

// =============================================================================
// Eviction Candidates
// =============================================================================

/// An eviction-eligible query with its effective deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactiveQuery {
    pub hash: QueryHash,
    /// TTL of the selected `(ttl, inactivated_at)` pair; negative means the
    /// default TTL was substituted.
    pub ttl_ms: i64,
    pub inactivated_at: u64,
    /// TTL-clock value at which the query may be evicted.
    pub expires_at: u64,
}

/// The TTL actually applied: negative values mean "default".
pub fn effective_ttl_ms(ttl_ms: i64) -> u64 {
    if ttl_ms < 0 {
        DEFAULT_TTL_MS
    } else {
        ttl_ms as u64
    }
}

/// The wider of two TTLs, comparing by effective value. Used when a client
/// re-`put`s a query it still desires: the window only widens.
pub fn max_ttl(a: i64, b: i64) -> i64 {
    if effective_ttl_ms(b) > effective_ttl_ms(a) {
        b
    } else {
        a
    }
}

/// Selects the governing `(ttl, inactivated_at)` pair among a query's
/// clients: the pair with the maximum expiry wins, ties broken by the
/// earliest `inactivated_at`. Returns `(ttl, inactivated_at, expiry)`, or
/// `None` if any client still desires the query.
fn select_deadline(states: impl Iterator<Item = (i64, Option<u64>)>) -> Option<(i64, u64, u64)> {
    let mut best: Option<(i64, u64, u64)> = None;
    let mut any = false;
    for (ttl_ms, inactivated_at) in states {
        any = true;
        let inactivated_at = inactivated_at?;
        let expiry = inactivated_at + effective_ttl_ms(ttl_ms);
        let better = match best {
            None => true,
            Some((_, best_inact, best_expiry)) => {
                expiry > best_expiry || (expiry == best_expiry && inactivated_at < best_inact)
            }
        };
        if better {
            best = Some((ttl_ms, inactivated_at, expiry));
        }
    }
    if !any {
        // No client references the query at all; evict at the first
        // opportunity.
        return Some((0, 0, 0));
    }
    best
}

/// Every eviction-eligible query of the CVR, sorted by ascending expiry.
///
/// A query is eligible only if **all** of its clients have inactivated it;
/// one desiring client excludes the query entirely. Internal queries are
/// never eligible.
pub fn inactive_queries(cvr: &Cvr) -> Vec<InactiveQuery> {
    let mut out = Vec::new();
    for (hash, query) in cvr.queries() {
        let QueryRecord::Client { client_state, .. } = query else {
            continue;
        };
        let states = client_state
            .values()
            .map(|s| (s.ttl_ms, s.inactivated_at));
        if let Some((ttl_ms, inactivated_at, expires_at)) = select_deadline(states) {
            out.push(InactiveQuery {
                hash: hash.clone(),
                ttl_ms,
                inactivated_at,
                expires_at,
            });
        }
    }
    out.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.hash.cmp(&b.hash)));
    out
}

/// TTL-clock value at which the next eviction is due, if any query is
/// eligible.
pub fn next_eviction_deadline(cvr: &Cvr) -> Option<u64> {
    inactive_queries(cvr).first().map(|q| q.expires_at)
}

/// The queries whose deadline has passed at TTL-clock value `now`.
pub fn expired_queries(cvr: &Cvr, now_ttl_ms: u64) -> Vec<QueryHash> {
    inactive_queries(cvr)
        .into_iter()
        .take_while(|q| q.expires_at <= now_ttl_ms)
        .map(|q| q.hash)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
