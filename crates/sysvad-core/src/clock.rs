//! Performance counter abstraction
//!
//! The stream engine never reads wall-clock time directly. It asks a
//! [`Clock`] for a performance-counter value and its frequency, and converts
//! to 100ns units with [`ks_convert_performance_time`].

use crate::HNS_PER_SECOND;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic performance-counter ticks
pub trait Clock: Send + Sync {
    /// Current counter value
    fn query_performance_counter(&self) -> u64;

    /// Counter ticks per second
    fn frequency(&self) -> u64;

    /// Current time in 100ns units
    fn now_hns(&self) -> u64 {
        ks_convert_performance_time(self.frequency(), self.query_performance_counter())
    }
}

/// Convert a performance-counter value to 100ns units without overflowing
///
/// Splits the value into whole seconds and remainder before scaling.
///
/// # Example
/// ```
/// use sysvad_core::clock::ks_convert_performance_time;
///
/// assert_eq!(ks_convert_performance_time(1_000_000, 1_500_000), 15_000_000);
/// ```
pub fn ks_convert_performance_time(frequency: u64, qpc: u64) -> u64 {
    if frequency == 0 {
        return 0;
    }
    (qpc / frequency) * HNS_PER_SECOND + (qpc % frequency) * HNS_PER_SECOND / frequency
}

/// Convert 100ns units back to performance-counter ticks
pub fn hns_to_performance_counter(frequency: u64, hns: u64) -> u64 {
    ((hns as u128 * frequency as u128) / HNS_PER_SECOND as u128) as u64
}

/// Monotonic clock backed by [`Instant`], reported at 10 MHz
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn query_performance_counter(&self) -> u64 {
        // Nanoseconds to 100ns ticks
        (self.origin.elapsed().as_nanos() / 100) as u64
    }

    fn frequency(&self) -> u64 {
        HNS_PER_SECOND
    }
}

/// Hand-driven clock for deterministic tests and simulations
///
/// Clones share the same counter, so a test can hold one handle and
/// advance time while a stream holds another.
///
/// # Example
/// ```
/// use sysvad_core::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(10_000_000);
/// clock.advance_hns(53_300);
/// assert_eq!(clock.now_hns(), 53_300);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    ticks: Arc<AtomicU64>,
    frequency: u64,
}

impl ManualClock {
    /// Create a clock at tick 0 with the given frequency
    pub fn new(frequency: u64) -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            frequency: frequency.max(1),
        }
    }

    /// Set the raw counter value
    pub fn set_ticks(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Advance by raw counter ticks
    pub fn advance_ticks(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Advance by 100ns units, converted to this clock's frequency
    pub fn advance_hns(&self, hns: u64) {
        self.advance_ticks(hns_to_performance_counter(self.frequency, hns));
    }

    /// Advance by whole milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.advance_hns(ms * crate::HNS_PER_MS);
    }
}

impl Clock for ManualClock {
    fn query_performance_counter(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }
}
