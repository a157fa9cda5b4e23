// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pool lifecycle events exposed to subscribers, and the per-query
//! events delivered to a caller's event callback.

use crate::id::{RequestId, WorkerKey, WorkspaceKey};
use crate::payload::AgentResult;
use serde::Serialize;

/// The closed set of observable pool events.
///
/// Subscribers receive these over a broadcast channel; slow subscribers
/// may miss events but never block the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkerSpawned { key: WorkerKey },
    WorkerReady { key: WorkerKey },
    WorkerBusy { key: WorkerKey, request_id: RequestId },
    WorkerIdle { key: WorkerKey },
    WorkerShutdown { key: WorkerKey },
    WorkerCrashed { key: WorkerKey, reason: String },
    WorkerEvicted { key: WorkerKey },
    AtCapacity { workspace: WorkspaceKey },
    PoolError { message: String },
}

/// Events delivered to a caller's `on_event` callback, in worker
/// emission order; a terminal `Completed` is always last.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Session { session_id: String },
    Message { content: serde_json::Value },
    /// The worker finished; delivered before the caller's future resolves
    /// so stream handlers can release conversation locks early.
    Completed { result: AgentResult },
}
