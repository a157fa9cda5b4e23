// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pool telemetry: monotonic counters plus a point-in-time snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters bumped from anywhere in the pool.
///
/// Atomics so increments never need the state lock.
#[derive(Debug, Default)]
pub struct PoolTelemetry {
    pub retired_after_cancel: AtomicU64,
    pub group_terminations: AtomicU64,
    pub group_kill_escalations: AtomicU64,
    pub queue_rejected_user: AtomicU64,
    pub queue_rejected_workspace: AtomicU64,
    pub queue_rejected_global: AtomicU64,
    pub load_shed_events: AtomicU64,
    pub orphans_reaped: AtomicU64,
}

impl PoolTelemetry {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> TelemetryCounters {
        TelemetryCounters {
            retired_after_cancel: self.retired_after_cancel.load(Ordering::Relaxed),
            group_terminations: self.group_terminations.load(Ordering::Relaxed),
            group_kill_escalations: self.group_kill_escalations.load(Ordering::Relaxed),
            queue_rejected_user: self.queue_rejected_user.load(Ordering::Relaxed),
            queue_rejected_workspace: self.queue_rejected_workspace.load(Ordering::Relaxed),
            queue_rejected_global: self.queue_rejected_global.load(Ordering::Relaxed),
            load_shed_events: self.load_shed_events.load(Ordering::Relaxed),
            orphans_reaped: self.orphans_reaped.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub retired_after_cancel: u64,
    pub group_terminations: u64,
    pub group_kill_escalations: u64,
    pub queue_rejected_user: u64,
    pub queue_rejected_workspace: u64,
    pub queue_rejected_global: u64,
    pub load_shed_events: u64,
    pub orphans_reaped: u64,
}

/// Counters plus the derived gauges, for `status`-style reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    #[serde(flatten)]
    pub counters: TelemetryCounters,
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub dynamic_max_workers: usize,
    pub queued_requests: usize,
}
