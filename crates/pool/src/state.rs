// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Mutable pool bookkeeping, guarded by one mutex per pool instance.

use crate::manager::{OnEvent, WorkerHealth};
use crate::queue::WorkspaceQueue;
use ap_core::{
    OwnerKey, QueryError, QueryPayload, QueryResolution, RequestId, WorkerKey,
    WorkspaceCredentials, WorkspaceKey,
};
use ap_ipc::IpcServer;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) type Resolver = oneshot::Sender<Result<QueryResolution, QueryError>>;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Starting,
    Ready,
    Busy,
    ShuttingDown,
    Dead,
}

/// A query currently held on a worker, with its continuation.
pub(crate) struct PendingQuery {
    pub owner: OwnerKey,
    pub workspace: WorkspaceKey,
    pub resolver: Option<Resolver>,
    pub on_event: OnEvent,
    pub session_id: Option<String>,
    /// Gates the active-counter decrement; it must run exactly once per
    /// pending query no matter which of cleanup, cancel, or crash wins.
    pub accounting_cleaned: bool,
    pub cancel_listener: Option<JoinHandle<()>>,
}

/// One supervised worker.
pub(crate) struct WorkerEntry {
    pub key: WorkerKey,
    /// Process id (= process-group id; spawned as group leader). `None`
    /// for in-process test workers.
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub credentials: WorkspaceCredentials,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub queries_processed: u64,
    pub active_request: Option<RequestId>,
    pub current_owner: Option<OwnerKey>,
    pub credentials_version: Option<String>,
    pub needs_restart_for_credentials: bool,
    pub retired_after_cancel: bool,
    /// Held for its spawner's first dispatch; selection and drain passes
    /// skip the worker until that dispatch lands.
    pub reserved: bool,
    pub pending: HashMap<RequestId, PendingQuery>,
    pub ipc: Arc<IpcServer>,
    pub health_waiter: Option<oneshot::Sender<WorkerHealth>>,
    /// Frame-routing and exit-watching tasks, aborted on removal.
    pub tasks: Vec<JoinHandle<()>>,
}

impl WorkerEntry {
    /// State invariant: busy iff a request is active.
    pub fn is_available(&self) -> bool {
        self.state == WorkerState::Ready && !self.retired_after_cancel && !self.reserved
    }
}

/// A deferred request owned by the fair queue until dequeued. Not yet
/// accounted as active.
pub(crate) struct QueuedRequest {
    pub request_id: RequestId,
    pub owner: OwnerKey,
    pub credentials: WorkspaceCredentials,
    pub payload: QueryPayload,
    pub on_event: OnEvent,
    pub cancel: Option<CancellationToken>,
    pub resolver: Option<Resolver>,
    pub enqueued_at_ms: u64,
    /// Abort handle for the queued-cancel listener; detached on dequeue.
    pub cancel_listener: Option<JoinHandle<()>>,
}

/// String-keyed counters with zero values removed.
#[derive(Debug, Default)]
pub(crate) struct CounterMap(HashMap<String, usize>);

impl CounterMap {
    pub fn get(&self, key: &str) -> usize {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn incr(&mut self, key: &str) {
        *self.0.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn decr(&mut self, key: &str) {
        match self.0.get_mut(key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.0.remove(key);
            }
            None => {
                tracing::error!(key, "counter decrement below zero suppressed");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Upper bound on remembered former-worker pids for the orphan sweeper.
const FORMER_PID_LIMIT: usize = 256;

/// Everything the manager mutates, behind one lock.
pub(crate) struct PoolState {
    pub workers: HashMap<WorkerKey, WorkerEntry>,
    pub active_by_owner: CounterMap,
    pub active_by_workspace: CounterMap,
    pub queued_by_owner: CounterMap,
    pub queued_by_workspace: CounterMap,
    pub total_queued: usize,
    pub queues: HashMap<WorkspaceKey, WorkspaceQueue<QueuedRequest>>,
    next_instance: HashMap<WorkspaceKey, u64>,
    pub former_worker_pids: VecDeque<u32>,
    pub credentials_version: Option<String>,
    pub last_credentials_check: Option<Instant>,
    pub shutting_down: bool,
}

impl PoolState {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
            active_by_owner: CounterMap::default(),
            active_by_workspace: CounterMap::default(),
            queued_by_owner: CounterMap::default(),
            queued_by_workspace: CounterMap::default(),
            total_queued: 0,
            queues: HashMap::new(),
            next_instance: HashMap::new(),
            former_worker_pids: VecDeque::new(),
            credentials_version: None,
            last_credentials_check: None,
            shutting_down: false,
        }
    }

    /// Allocate the next per-workspace instance id.
    pub fn next_instance_id(&mut self, workspace: &WorkspaceKey) -> u64 {
        let counter = self.next_instance.entry(workspace.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Remember an exited worker pid for orphan sweeping, bounded.
    pub fn record_former_pid(&mut self, pid: u32) {
        if self.former_worker_pids.len() >= FORMER_PID_LIMIT {
            self.former_worker_pids.pop_front();
        }
        self.former_worker_pids.push_back(pid);
    }

    /// Ready, not-retired workers of one workspace.
    pub fn available_workers_of(&self, workspace: &WorkspaceKey) -> Vec<WorkerKey> {
        self.workers
            .values()
            .filter(|w| w.key.workspace() == workspace && w.is_available())
            .map(|w| w.key.clone())
            .collect()
    }

    pub fn active_worker_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.state == WorkerState::Busy)
            .count()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.state == WorkerState::Ready)
            .count()
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
