// Clock abstraction

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of wall clock time in milliseconds.
///
/// Liveness checks and idle timeouts read the time through this
/// trait, so tests can drive them with a [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// System clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> ManualClock {
        ManualClock {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);

        clock.advance(250);
        assert_eq!(clock.now_ms(), 1250);

        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
