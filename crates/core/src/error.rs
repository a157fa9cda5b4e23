// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed failures surfaced to callers.

use crate::credentials::CredentialsError;
use serde::Serialize;
use thiserror::Error;

/// Why the resolver declined to hand out a worker right now.
///
/// Deferred requests are enqueued with this reason; it never reaches the
/// caller unless the queue itself is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Pool is at its dynamic maximum and nothing was evictable.
    Capacity,
    /// The owner is at its active-query cap.
    UserLimit,
    /// The workspace is at its active-query cap.
    WorkspaceLimit,
    /// The 1-minute load average is above the shed threshold.
    LoadShed,
}

/// Admission rejection codes, surfaced when a request cannot even queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    QueueFull,
    UserLimit,
    WorkspaceLimit,
    LoadShed,
}

/// Everything a caller can observe as a failure.
///
/// Cancellation is deliberately absent: cancelled requests resolve
/// successfully with `QueryResolution::Cancelled`.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Bad credentials or a malformed request; no worker was touched.
    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    /// Queue quota exceeded; the corresponding telemetry counter was bumped.
    #[error("request rejected ({code:?})")]
    Rejected { code: RejectCode },

    /// The worker reported an agent failure; the worker returns to ready.
    #[error("agent failed: {error}")]
    Agent {
        error: String,
        stack: Option<String>,
        stderr: Option<String>,
        diagnostics: Option<serde_json::Value>,
    },

    /// The worker crashed or disconnected mid-query.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// A worker process could not be started.
    #[error("worker failed to start: {0}")]
    Spawn(String),

    /// The pool is shutting down; queued and pending work is rejected.
    #[error("pool shutting down")]
    ShuttingDown,
}

impl QueryError {
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            QueryError::Rejected { code } => Some(*code),
            _ => None,
        }
    }
}
