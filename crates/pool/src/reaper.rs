// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orphan sweeping (Linux only).
//!
//! Agent CLI processes whose parent worker died escape the process-group
//! kill when they re-parented first. The sweeper walks the process table
//! on an interval and kills agent processes whose parent is a remembered
//! former worker, once they exceed the age threshold.

/// Whether a process looks like the agent CLI. Matches the process name
/// or the first element of its command line.
pub(crate) fn matches_agent_cli(name: &str, cmd: &[String], agent_cli: &str) -> bool {
    if name == agent_cli {
        return true;
    }
    cmd.first().is_some_and(|arg0| {
        arg0 == agent_cli || arg0.ends_with(&format!("/{agent_cli}"))
    })
}

#[cfg(target_os = "linux")]
mod sweep {
    use super::matches_agent_cli;
    use crate::manager::PoolInner;
    use crate::terminate::signal_tree;
    use ap_core::{Clock, PoolTelemetry};
    use nix::sys::signal::Signal;
    use std::collections::HashSet;
    use std::sync::Arc;
    use sysinfo::System;

    impl<C: Clock> PoolInner<C> {
        /// One sweep over the process table.
        pub(crate) fn sweep_orphans(self: &Arc<Self>) {
            let (former, live): (HashSet<u32>, HashSet<u32>) = {
                let state = self.state.lock();
                (
                    state.former_worker_pids.iter().copied().collect(),
                    state.workers.values().filter_map(|w| w.pid).collect(),
                )
            };
            if former.is_empty() {
                return;
            }

            let mut sys = System::new();
            sys.refresh_processes();
            let max_age_secs = self.config.orphan_max_age.as_secs();

            for (pid, process) in sys.processes() {
                if !matches_agent_cli(process.name(), process.cmd(), &self.config.agent_cli) {
                    continue;
                }
                let Some(parent) = process.parent() else {
                    continue;
                };
                let parent = parent.as_u32();
                if !former.contains(&parent) || live.contains(&parent) {
                    continue;
                }
                if process.run_time() < max_age_secs {
                    continue;
                }
                tracing::warn!(
                    pid = pid.as_u32(),
                    parent,
                    "reaping orphaned agent process"
                );
                signal_tree(pid.as_u32(), Signal::SIGKILL);
                PoolTelemetry::incr(&self.telemetry.orphans_reaped);
            }
        }
    }
}

#[cfg(test)]
#[path = "reaper_tests.rs"]
mod tests;
