//! Injectable time sources.
//!
//! Lease expiry, claim due-time, and reap thresholds are all evaluated inside the SQL
//! statement that reads or updates the row — Postgres is the single authoritative
//! clock for queue/lease timing, so `relay-db`/`relay-lease`/`relay-runtime` call
//! `Utc::now()` directly rather than through these traits. `Clock`/`MonotonicClock`
//! exist for call sites outside that hot path (e.g. deterministic-time tests) that want
//! an injectable source without reaching for a live database.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Wall-clock time source.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Monotonic time source, used for interval scheduling where wall-clock jumps
/// (NTP step, DST) must not affect cadence.
pub trait MonotonicClock: Send + Sync {
    fn monotonic_seconds(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl MonotonicClock for SystemClock {
    fn monotonic_seconds(&self) -> f64 {
        static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        let start = *START.get_or_init(std::time::Instant::now);
        start.elapsed().as_secs_f64()
    }
}

/// Deterministic clock for tests: starts at an arbitrary fixed instant and only
/// advances when told to.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
    monotonic_millis: AtomicU64,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            monotonic_millis: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().expect("fake clock poisoned");
        *guard = *guard + delta;
        let millis = delta.num_milliseconds().max(0) as u64;
        self.monotonic_millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().expect("fake clock poisoned");
        *guard = now;
    }
}

impl Clock for FakeClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("fake clock poisoned")
    }
}

impl MonotonicClock for FakeClock {
    fn monotonic_seconds(&self) -> f64 {
        self.monotonic_millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_both_wall_and_monotonic_time() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now_utc(), start);
        assert_eq!(clock.monotonic_seconds(), 0.0);

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(30));
        assert_eq!(clock.monotonic_seconds(), 30.0);
    }

    #[test]
    fn system_clock_monotonic_seconds_never_goes_backwards() {
        let clock = SystemClock;
        let a = clock.monotonic_seconds();
        let b = clock.monotonic_seconds();
        assert!(b >= a);
    }
}
