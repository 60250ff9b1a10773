//! Time sources.
//!
//! Every time-dependent component takes an `Arc<dyn Clock>` so tests can drive
//! time deterministically with [`MockClock`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// With auto-advance enabled, each call to [`Clock::now`] returns the current
/// value and then moves the clock forward by the configured step.
#[derive(Debug)]
pub struct MockClock {
    inner: Mutex<MockInner>,
}

#[derive(Debug)]
struct MockInner {
    now: DateTime<Utc>,
    step: Option<Duration>,
}

impl MockClock {
    /// A mock clock frozen at the current system time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// A mock clock frozen at `now`.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(MockInner { now, step: None }),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.inner.lock().now = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.now = add(inner.now, by);
    }

    pub fn set_auto_advance(&self, step: Duration) {
        self.inner.lock().step = Some(step);
    }

    pub fn disable_auto_advance(&self) {
        self.inner.lock().step = None;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        let mut inner = self.inner.lock();
        let now = inner.now;
        if let Some(step) = inner.step {
            inner.now = add(now, step);
        }
        now
    }
}

/// Time elapsed from `earlier` to `later`, zero if the clock went backwards.
pub fn elapsed(later: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// `at + by`, saturating at the far future.
pub fn add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - by`, saturating at the far past.
pub fn sub(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Seconds as a `Duration`, clamping negative and non-finite input to zero.
pub fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}
