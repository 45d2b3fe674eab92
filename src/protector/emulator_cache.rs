//! Memoized emulator verdict.
//!
//! The emulator probe walks several properties and paths, and an emulator
//! does not turn into a phone mid-session, so its verdict is kept for a
//! bounded window.
//!
//! The entry is two atomics. A caller that finds the entry stale claims the
//! refresh with a compare-and-swap on the timestamp; only the winner re-runs
//! the probe. Callers that lose the race, or read while the winner is still
//! probing, get the previous verdict (`false` before the first probe has
//! finished).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct EmulatorCache {
    /// Reference point for the stored timestamps
    epoch: Instant,
    ttl: Duration,
    /// Milliseconds since `epoch` plus one; zero means never checked
    checked_at: AtomicU64,
    verdict: AtomicBool,
    refreshes: AtomicU64,
}

impl EmulatorCache {
    pub fn new(ttl: Duration) -> Self {
        EmulatorCache {
            epoch: Instant::now(),
            ttl,
            checked_at: AtomicU64::new(0),
            verdict: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Return the cached verdict if it is younger than the TTL, otherwise run
    /// `probe`, store its result stamped with `now`, and return it.
    pub fn check<F>(&self, now: Instant, probe: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let stamp = self.stamp(now);
        let last = self.checked_at.load(Ordering::Acquire);

        if last != 0 && stamp.saturating_sub(last) < self.ttl_millis() {
            return self.verdict.load(Ordering::Acquire);
        }

        if self
            .checked_at
            .compare_exchange(last, stamp, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller is refreshing
            return self.verdict.load(Ordering::Acquire);
        }

        let verdict = probe();
        self.verdict.store(verdict, Ordering::Release);
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        verdict
    }

    /// Last stored verdict without probing.
    pub fn cached(&self) -> Option<bool> {
        if self.checked_at.load(Ordering::Acquire) == 0 {
            None
        } else {
            Some(self.verdict.load(Ordering::Acquire))
        }
    }

    /// Number of times the full probe actually ran.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn stamp(&self, now: Instant) -> u64 {
        let since = now.saturating_duration_since(self.epoch).as_millis();
        u64::try_from(since).unwrap_or(u64::MAX - 1) + 1
    }

    fn ttl_millis(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }
}
