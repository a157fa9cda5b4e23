// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC frame shapes.
//!
//! Frames are internally tagged by `type`; deserialization is the
//! validator. Unknown types or missing required fields fail typed decode
//! and the offending line is logged and dropped by the transport.

use ap_core::{AgentResult, QueryPayload, RequestId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A peer buffered more than [`crate::MAX_BUFFERED_BYTES`]; the buffer
    /// was discarded and the connection is unusable.
    #[error("ipc buffer overflow: peer exceeded {0} buffered bytes")]
    Overflow(usize),
    #[error("frame encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("peer disconnected")]
    Disconnected,
}

/// Frames sent by the manager to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ManagerFrame {
    /// Run one query. The worker must answer with exactly one `complete`
    /// or `error` frame carrying the same request id.
    Query {
        request_id: RequestId,
        payload: QueryPayload,
    },
    /// Fire the cancellation token of the active query, if it matches.
    Cancel { request_id: RequestId },
    /// Stop after acking. `graceful: false` means the process group will be
    /// signalled shortly after.
    Shutdown { graceful: bool },
    /// Probe; answered with `health_ok`.
    HealthCheck,
}

/// Frames sent by a worker to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerFrame {
    /// Sent exactly once, after privilege drop succeeds.
    Ready,
    /// The agent assigned a session id to the active query.
    Session {
        request_id: RequestId,
        session_id: String,
    },
    /// One agent event; content is opaque to the manager.
    Message {
        request_id: RequestId,
        content: serde_json::Value,
    },
    /// Terminal success frame.
    Complete {
        request_id: RequestId,
        result: AgentResult,
    },
    /// Terminal failure frame.
    Error {
        request_id: RequestId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostics: Option<serde_json::Value>,
    },
    ShutdownAck,
    HealthOk {
        #[serde(rename = "uptime")]
        uptime_ms: u64,
        queries_processed: u64,
    },
}

impl WorkerFrame {
    /// The request id this frame routes by, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            WorkerFrame::Session { request_id, .. }
            | WorkerFrame::Message { request_id, .. }
            | WorkerFrame::Complete { request_id, .. }
            | WorkerFrame::Error { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Whether this frame terminates a query.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerFrame::Complete { .. } | WorkerFrame::Error { .. }
        )
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
