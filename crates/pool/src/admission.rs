// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission control: quotas, queue thresholds, and load shedding.

use crate::state::PoolState;
use ap_core::{OwnerKey, PoolConfig, RejectCode, WorkspaceKey};

/// Source of the 1-minute load average and cpu count, so tests can pin
/// load without touching the host.
pub trait LoadProbe: Send + Sync + 'static {
    fn one_minute(&self) -> f64;
    fn cpu_count(&self) -> usize;
}

/// Real host load via sysinfo.
#[derive(Debug, Default)]
pub struct SystemLoadProbe;

impl LoadProbe for SystemLoadProbe {
    fn one_minute(&self) -> f64 {
        sysinfo::System::load_average().one
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Whether the host is loaded enough to defer new spawns.
pub(crate) fn load_shedding(config: &PoolConfig, load: &dyn LoadProbe) -> bool {
    load.one_minute() > load.cpu_count() as f64 * config.load_shed_threshold
}

/// Check queue thresholds for one more queued request. Returns the
/// rejection code when any quota is exceeded, in per-owner, per-workspace,
/// global order.
pub(crate) fn queue_admission(
    state: &PoolState,
    config: &PoolConfig,
    owner: &OwnerKey,
    workspace: &WorkspaceKey,
) -> Result<(), RejectCode> {
    if state.queued_by_owner.get(owner.as_str()) >= config.max_queued_per_user {
        return Err(RejectCode::UserLimit);
    }
    if state.queued_by_workspace.get(workspace.as_str()) >= config.max_queued_per_workspace {
        return Err(RejectCode::WorkspaceLimit);
    }
    if state.total_queued >= config.max_queued_global {
        return Err(RejectCode::QueueFull);
    }
    Ok(())
}

/// Active-quota check for one owner; true when at or over the cap.
pub(crate) fn owner_at_active_limit(
    state: &PoolState,
    config: &PoolConfig,
    owner: &OwnerKey,
) -> bool {
    state.active_by_owner.get(owner.as_str()) >= config.max_workers_per_user
}

/// Active-quota check for one workspace; true when at or over the cap.
pub(crate) fn workspace_at_active_limit(
    state: &PoolState,
    config: &PoolConfig,
    workspace: &WorkspaceKey,
) -> bool {
    state.active_by_workspace.get(workspace.as_str()) >= config.max_workers_per_workspace
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod tests;
