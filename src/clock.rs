//! Wall-clock abstraction.
//!
//! The circuit breaker set keeps its own monotonic millisecond clock (see
//! `crate::circuit_breaker`), since breaker recovery only ever cares about elapsed
//! time. Everything that reasons about
//! timestamps stored in the message store — `visible_at`, `expires_at`, debounce
//! deadlines — needs actual wall-clock time instead, since those values are persisted
//! and compared across process restarts.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Clock abstraction so wall-clock-dependent behavior can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only advances when told to.
#[derive(Debug, Clone)]
pub struct FakeClock {
    micros_since_epoch: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros_since_epoch: Arc::new(AtomicI64::new(start.timestamp_micros())),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.micros_since_epoch
            .fetch_add(delta.num_microseconds().unwrap_or(0), Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.micros_since_epoch.store(at.timestamp_micros(), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.micros_since_epoch.load(Ordering::SeqCst);
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}
