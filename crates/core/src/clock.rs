// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Time access for the pool.
//!
//! The credential debounce compares monotonic instants while queue
//! timestamps are wall-clock milliseconds; both come through this trait
//! so tests can drive them together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub trait Clock: Clone + Send + Sync + 'static {
    /// Monotonic reading, for durations and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch.
    fn epoch_ms(&self) -> u64;
}

/// Host time.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> u64 {
        SystemTime::UNIX_EPOCH
            .elapsed()
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Wall-clock origin reported by a fresh [`FakeClock`].
const FAKE_WALL_ORIGIN_MS: u64 = 1_700_000_000_000;

/// Deterministic clock for tests.
///
/// Both views derive from a single atomic millisecond offset over a
/// fixed origin, so the monotonic and wall readings can never drift
/// apart under concurrent advances. Advances are whole milliseconds;
/// every interval the pool measures is millisecond-grained.
#[derive(Clone)]
pub struct FakeClock {
    origin: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move time forward for every clone of this clock.
    pub fn advance(&self, by: Duration) {
        self.advance_ms(by.as_millis() as u64);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    fn epoch_ms(&self) -> u64 {
        FAKE_WALL_ORIGIN_MS + self.offset_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
