//! Sans-IO polling refresh coordinator.
//!
//! [`RefreshCoordinator`] decides *when* to fetch and whether a finished
//! fetch may still be applied; the caller owns the timer and the network.
//! Every [`start`](RefreshCoordinator::start) is paired with exactly one
//! [`RefreshAction::Clear`], either from the next `start` or from
//! [`cancel`](RefreshCoordinator::cancel).
//!
//! Timestamps are `web_time::Instant` so the same code runs natively and
//! in the browser.

use std::fmt::Debug;
use std::time::Duration;

use tracing::debug;
use web_time::Instant;

use crate::types::EngineConfig;

/// Identifies one issued fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket<K> {
    /// Key the fetch was issued for.
    pub key: K,
    /// Activation the fetch belongs to. Bumped on every start, cancel and
    /// supersede.
    pub generation: u64,
    /// Sequence number of the fetch within the coordinator.
    pub sequence: u64,
}

/// Side effect the caller must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshAction<K> {
    /// Fetch data for `ticket.key` and report back via
    /// [`RefreshCoordinator::complete`].
    Fetch(FetchTicket<K>),
    /// Drop whatever was cached for this key.
    Clear(K),
}

/// Periodic refresh state machine. See the module docs.
#[derive(Debug, Clone)]
pub struct RefreshCoordinator<K> {
    interval: Duration,
    active: Option<K>,
    generation: u64,
    sequence: u64,
    next_due: Option<Instant>,
    in_flight: Option<u64>,
}

impl<K> Default for RefreshCoordinator<K> {
    fn default() -> Self {
        Self::new(EngineConfig::DEFAULT_REFRESH_INTERVAL)
    }
}

impl<K> RefreshCoordinator<K> {
    /// Create an inactive coordinator that refreshes every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            active: None,
            generation: 0,
            sequence: 0,
            next_due: None,
            in_flight: None,
        }
    }

    /// Refresh period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Key currently being refreshed.
    #[must_use]
    pub const fn active(&self) -> Option<&K> {
        self.active.as_ref()
    }

    /// Current activation generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` while an issued fetch has not been completed.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// When the next periodic fetch is due, if active.
    #[must_use]
    pub const fn next_due(&self) -> Option<Instant> {
        self.next_due
    }
}

impl<K: Clone + PartialEq + Debug> RefreshCoordinator<K> {
    /// Start refreshing `key`, tearing down the previous key first.
    ///
    /// Returns `[Clear(old)?, Fetch(ticket)]`: the first fetch is issued
    /// immediately.
    pub fn start(&mut self, key: K, now: Instant) -> Vec<RefreshAction<K>> {
        let mut actions = Vec::with_capacity(2);
        if let Some(old) = self.active.take() {
            actions.push(RefreshAction::Clear(old));
        }
        self.generation += 1;
        self.active = Some(key);
        self.in_flight = None;
        debug!(key = ?self.active, generation = self.generation, "refresh started");
        if let Some(ticket) = self.issue(now) {
            actions.push(RefreshAction::Fetch(ticket));
        }
        actions
    }

    /// Emit a fetch if the period has elapsed and none is outstanding.
    ///
    /// An overdue tick that lands while a fetch is in flight is skipped,
    /// not queued. The next due time advances from the previous one, so a
    /// timer ticking every `interval` stays in phase even when it fires a
    /// little late; after a stall longer than one period it restarts from
    /// `now`.
    pub fn poll(&mut self, now: Instant) -> Option<RefreshAction<K>> {
        let due = self.next_due?;
        if now < due {
            return None;
        }
        let next = Some(due + self.interval)
            .filter(|next| *next > now)
            .unwrap_or(now + self.interval);
        if self.in_flight.is_some() {
            self.next_due = Some(next);
            debug!(key = ?self.active, "refresh tick skipped: fetch in flight");
            return None;
        }
        let ticket = self.issue(now)?;
        self.next_due = Some(next);
        Some(RefreshAction::Fetch(ticket))
    }

    /// Issue a fetch right away (manual refresh), unless one is already
    /// in flight. Resets the periodic schedule.
    pub fn trigger(&mut self, now: Instant) -> Option<FetchTicket<K>> {
        if self.in_flight.is_some() {
            debug!(key = ?self.active, "manual refresh deduplicated");
            return None;
        }
        self.issue(now)
    }

    /// Issue a fetch that replaces whatever is in flight, for use right
    /// after a mutation. Tickets issued before this call stop being
    /// current, so their (older) results are dropped by
    /// [`complete`](Self::complete). Resets the periodic schedule.
    pub fn supersede(&mut self, now: Instant) -> Option<FetchTicket<K>> {
        self.active.as_ref()?;
        self.generation += 1;
        self.in_flight = None;
        debug!(key = ?self.active, generation = self.generation, "in-flight refresh superseded");
        self.issue(now)
    }

    /// Record that the fetch for `ticket` finished.
    ///
    /// Returns `true` if its result should be applied, i.e. the ticket
    /// belongs to the current activation.
    pub fn complete(&mut self, ticket: &FetchTicket<K>) -> bool {
        if self.in_flight == Some(ticket.sequence) {
            self.in_flight = None;
        }
        let current = ticket.generation == self.generation && self.active.as_ref() == Some(&ticket.key);
        if !current {
            debug!(
                key = ?ticket.key,
                generation = ticket.generation,
                active_generation = self.generation,
                "stale refresh result dropped"
            );
        }
        current
    }

    /// Stop refreshing. Returns `Clear(key)` if a key was active.
    pub fn cancel(&mut self) -> Option<RefreshAction<K>> {
        let key = self.active.take()?;
        self.generation += 1;
        self.next_due = None;
        self.in_flight = None;
        debug!(key = ?key, "refresh cancelled");
        Some(RefreshAction::Clear(key))
    }

    fn issue(&mut self, now: Instant) -> Option<FetchTicket<K>> {
        let key = self.active.clone()?;
        self.sequence += 1;
        self.in_flight = Some(self.sequence);
        self.next_due = Some(now + self.interval);
        Some(FetchTicket {
            key,
            generation: self.generation,
            sequence: self.sequence,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn fetch_ticket(action: &RefreshAction<&'static str>) -> FetchTicket<&'static str> {
        match action {
            RefreshAction::Fetch(ticket) => ticket.clone(),
            RefreshAction::Clear(key) => panic!("expected fetch, got clear of {key}"),
        }
    }

    #[test]
    fn start_fetches_immediately() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        let actions = c.start("p1", now);
        assert_eq!(actions.len(), 1);
        assert_eq!(fetch_ticket(&actions[0]).key, "p1");
        assert_eq!(c.next_due(), Some(now + SECOND));
    }

    #[test]
    fn start_then_cancel_pairs_one_fetch_with_one_clear() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        let fetches = c
            .start("p1", now)
            .iter()
            .filter(|a| matches!(a, RefreshAction::Fetch(_)))
            .count();
        assert_eq!(fetches, 1);
        assert_eq!(c.cancel(), Some(RefreshAction::Clear("p1")));
        assert_eq!(c.cancel(), None);
        assert_eq!(c.poll(now + 10 * SECOND), None);
    }

    #[test]
    fn switching_keys_clears_previous() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        c.start("p1", now);
        let actions = c.start("p2", now);
        assert_eq!(actions[0], RefreshAction::Clear("p1"));
        assert_eq!(fetch_ticket(&actions[1]).key, "p2");
    }

    #[test]
    fn poll_waits_for_interval_and_completion() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        let first = fetch_ticket(&c.start("p1", now)[0]);

        assert_eq!(c.poll(now + SECOND / 2), None);
        // Still in flight: the due tick is skipped.
        assert_eq!(c.poll(now + SECOND), None);

        assert!(c.complete(&first));
        assert_eq!(c.poll(now + SECOND + SECOND / 2), None);
        let second = c.poll(now + 2 * SECOND).unwrap();
        assert_eq!(fetch_ticket(&second).generation, first.generation);
    }

    #[test]
    fn late_tick_keeps_schedule_phase() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        let first = fetch_ticket(&c.start("p1", now)[0]);
        c.complete(&first);

        let second = fetch_ticket(&c.poll(now + SECOND + SECOND / 5).unwrap());
        assert_eq!(c.next_due(), Some(now + 2 * SECOND));
        c.complete(&second);

        let third = fetch_ticket(&c.poll(now + 2 * SECOND).unwrap());
        c.complete(&third);

        // A stall longer than a period restarts the schedule from `now`.
        let stalled = now + 10 * SECOND;
        assert!(c.poll(stalled).is_some());
        assert_eq!(c.next_due(), Some(stalled + SECOND));
    }

    #[test]
    fn supersede_drops_result_in_flight() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        let polled = fetch_ticket(&c.start("p1", now)[0]);
        // A plain trigger would be deduplicated against the poll.
        assert_eq!(c.trigger(now), None);

        let fresh = c.supersede(now).unwrap();
        assert_eq!(fresh.key, "p1");
        assert!(!c.complete(&polled));
        assert!(c.is_in_flight());
        assert!(c.complete(&fresh));
        assert_eq!(c.active(), Some(&"p1"));
    }

    #[test]
    fn supersede_without_key_does_nothing() {
        let mut c: RefreshCoordinator<&str> = RefreshCoordinator::default();
        assert_eq!(c.supersede(Instant::now()), None);
        assert_eq!(c.generation(), 0);
    }

    #[test]
    fn stale_ticket_is_not_applied() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        let old = fetch_ticket(&c.start("p1", now)[0]);
        let new = fetch_ticket(&c.start("p2", now)[1]);
        assert!(!c.complete(&old));
        assert!(c.is_in_flight());
        assert!(c.complete(&new));
        assert!(!c.is_in_flight());
    }

    #[test]
    fn result_after_cancel_is_dropped() {
        let mut c = RefreshCoordinator::new(SECOND);
        let ticket = fetch_ticket(&c.start("p1", Instant::now())[0]);
        c.cancel();
        assert!(!c.complete(&ticket));
    }

    #[test]
    fn manual_trigger_is_deduplicated() {
        let mut c = RefreshCoordinator::new(SECOND);
        let now = Instant::now();
        let first = fetch_ticket(&c.start("p1", now)[0]);
        assert_eq!(c.trigger(now), None);
        c.complete(&first);
        let manual = c.trigger(now).unwrap();
        assert_eq!(manual.sequence, first.sequence + 1);
    }

    #[test]
    fn inactive_coordinator_does_nothing() {
        let mut c: RefreshCoordinator<&str> = RefreshCoordinator::default();
        assert_eq!(c.interval(), Duration::from_millis(60_000));
        assert_eq!(c.poll(Instant::now()), None);
        assert_eq!(c.trigger(Instant::now()), None);
    }
}
