//! Injectable clocks.
//!
//! Expiration of pending puts, invalidation windows and region entries is
//! always measured against a [`TimeSource`], never against `Utc::now()`
//! directly, so tests can move time forwards and backwards deterministically.

use crate::Timestamp;
use chrono::{TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current time.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> Timestamp;

    /// Time elapsed since `since`, saturating at zero when the clock has
    /// moved backwards.
    fn elapsed_since(&self, since: Timestamp) -> Duration {
        self.now()
            .signed_duration_since(since)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether more than `max_idle` has passed since `since`.
    fn is_expired(&self, since: Timestamp, max_idle: Duration) -> bool {
        self.elapsed_since(since) >= max_idle
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// Starts at the wall-clock time of construction (or an explicit instant)
/// and only moves when told to.
#[derive(Debug)]
pub struct TestTimeSource {
    millis: AtomicI64,
}

impl TestTimeSource {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Move the clock forwards.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    /// Move the clock backwards.
    pub fn retreat(&self, by: Duration) {
        self.millis.fetch_sub(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Default for TestTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TestTimeSource {
    fn now(&self) -> Timestamp {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(Timestamp::UNIX_EPOCH)
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
