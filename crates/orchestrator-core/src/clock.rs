//! Injectable time source.
//!
//! Every component that needs "now" takes a `&dyn Clock` rather than calling
//! `Utc::now()` directly. This is what makes retry-delay and
//! circuit-breaker-transition tests deterministic: a test installs a clock
//! it controls and advances it explicitly instead of sleeping on the wall
//! clock.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// A source of the current time.
///
/// `Send + Sync` so a single clock can be shared across worker tasks behind
/// an `Arc`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock, used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only advances when told to, for deterministic tests.
///
/// Stores time as milliseconds since the epoch in an atomic so it can be
/// advanced through a shared reference (`Arc<FixedClock>`) without a mutex.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.millis
            .fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .expect("stored millis are always a valid timestamp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_by_delta() {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }

    #[test]
    fn fixed_clock_set_is_absolute() {
        let clock = FixedClock::new(Utc::now());
        let target = DateTime::parse_from_rfc3339("2030-06-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
