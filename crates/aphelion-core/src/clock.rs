//! Clock abstraction
//!
//! All time observed by the agent flows through the [`Clock`] trait: bundle
//! creation timestamps, lifetime expiry, retransmission deadlines, and the
//! action-time index of the custody cache. Production code uses
//! [`SystemClock`]; tests drive a [`ManualClock`] so expiry and timeout paths
//! can be exercised without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Source of wall-clock time in seconds and milliseconds
pub trait Clock: Send + Sync {
    /// Current time in Unix milliseconds
    fn now_millis(&self) -> u64;

    /// Current time in Unix seconds
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        // Pre-1970 system clocks are clamped rather than wrapped.
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually-advanced clock for tests
///
/// Starts at a caller-chosen instant and only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock at the given Unix-seconds instant
    pub fn at_secs(secs: u64) -> Self {
        Self {
            millis: AtomicU64::new(secs * 1000),
        }
    }

    /// Advance the clock by whole seconds
    pub fn advance_secs(&self, secs: u64) {
        self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
    }

    /// Advance the clock by milliseconds
    pub fn advance_millis(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute Unix-milliseconds instant
    pub fn set_millis(&self, ms: u64) {
        self.millis.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
