// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker retirement and process-tree termination.
//!
//! Termination is three ordered steps: mark shutting down, tell the
//! worker (cancel + shutdown frames), then signal the process group with
//! SIGTERM, a grace period, and SIGKILL. The agent spawns subprocesses of
//! its own, so the group, not the pid, is the unit of termination;
//! single-pid signalling is only the fallback for an already-gone group
//! leader.

use crate::manager::PoolInner;
use crate::state::WorkerState;
use ap_core::{Clock, PoolTelemetry, WorkerKey};
use ap_ipc::ManagerFrame;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;

/// Signal a worker's process group, falling back to the single pid when
/// the group leader has already exited.
pub(crate) fn signal_tree(pid: u32, signal: Signal) {
    let target = Pid::from_raw(pid as i32);
    if killpg(target, signal).is_err() {
        let _ = kill(target, signal);
    }
}

impl<C: Clock> PoolInner<C> {
    /// Retire one worker.
    ///
    /// `graceful` sends `shutdown { graceful: true }` and gives the worker
    /// `shutdown_timeout` to exit on its own; the non-graceful path (post-
    /// cancel, pool shutdown) cancels any active query and goes straight
    /// to group signalling.
    pub(crate) async fn retire_worker(self: &Arc<Self>, key: WorkerKey, graceful: bool) {
        let Some((ipc, active, pid)) = ({
            let mut state = self.state.lock();
            state.workers.get_mut(&key).map(|entry| {
                entry.state = WorkerState::ShuttingDown;
                (
                    Arc::clone(&entry.ipc),
                    entry.active_request.clone(),
                    entry.pid,
                )
            })
        }) else {
            return;
        };

        if graceful {
            let _ = ipc.send(&ManagerFrame::Shutdown { graceful: true }).await;
            if self
                .wait_deregistered(&key, self.config.shutdown_timeout)
                .await
            {
                return;
            }
            tracing::warn!(worker_key = %key, "graceful shutdown timed out, escalating");
        } else {
            if let Some(request_id) = active {
                let _ = ipc.send(&ManagerFrame::Cancel { request_id }).await;
            }
            let _ = ipc.send(&ManagerFrame::Shutdown { graceful: false }).await;
        }

        self.terminate_group(&key, pid).await;
    }

    /// SIGTERM the group, wait `kill_grace`, SIGKILL if the worker is
    /// still registered, then force removal.
    pub(crate) async fn terminate_group(self: &Arc<Self>, key: &WorkerKey, pid: Option<u32>) {
        if let Some(pid) = pid {
            signal_tree(pid, Signal::SIGTERM);
            PoolTelemetry::incr(&self.telemetry.group_terminations);
        }

        tokio::time::sleep(self.config.kill_grace).await;

        if self.state.lock().workers.contains_key(key) {
            if let Some(pid) = pid {
                tracing::warn!(worker_key = %key, pid, "escalating to SIGKILL");
                signal_tree(pid, Signal::SIGKILL);
                PoolTelemetry::incr(&self.telemetry.group_kill_escalations);
            }
            self.reap_worker(key, "worker terminated");
        }
    }

    /// Immediate SIGKILL on the group, without the frame round-trip. Used
    /// when a worker never became ready.
    pub(crate) fn kill_group_now(&self, key: &WorkerKey) {
        let pid = self.state.lock().workers.get(key).and_then(|w| w.pid);
        if let Some(pid) = pid {
            signal_tree(pid, Signal::SIGKILL);
        }
    }

    /// Poll until the worker disappears from the registry or the timeout
    /// elapses. Exit watchers and disconnect handling do the removal.
    async fn wait_deregistered(&self, key: &WorkerKey, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.state.lock().workers.contains_key(key) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
