// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Query payloads and the terminal shapes a caller can observe.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The request body carried from the manager to a worker.
///
/// The `agent_config` blob is opaque to the manager; only the worker
/// consumes it. Serialized with camelCase keys to match the wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    /// User-supplied OAuth access token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// User-supplied environment key map; names are validated by the worker.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_env: HashMap<String, String>,
    /// Session cookie, opaque to the manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie: Option<String>,
    /// Agent configuration consumed only by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<serde_json::Value>,
}

impl QueryPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Whether this request authenticates via an OAuth token (the shared
    /// credentials file) rather than a caller-supplied access token.
    pub fn uses_oauth(&self) -> bool {
        self.access_token.as_deref().unwrap_or("").is_empty()
    }
}

/// Terminal result object reported by a worker's `complete` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub total_messages: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub cancelled: bool,
}

/// What a caller's submission resolves to when it does not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResolution {
    /// The worker ran the query to completion.
    Completed {
        session_id: Option<String>,
        result: AgentResult,
    },
    /// The request was cancelled before or during execution. Never an error.
    Cancelled { session_id: Option<String> },
}

impl QueryResolution {
    pub fn cancelled(&self) -> bool {
        matches!(self, QueryResolution::Cancelled { .. })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            QueryResolution::Completed { session_id, .. }
            | QueryResolution::Cancelled { session_id } => session_id.as_deref(),
        }
    }
}

#[cfg(test)]
#[path = "payload_tests.rs"]
mod tests;
