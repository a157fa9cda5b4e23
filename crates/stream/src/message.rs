// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed NDJSON messages sent to the HTTP client.

use ap_core::AgentResult;
use serde::Serialize;

/// One line of the client-facing stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamMessage {
    /// Emitted first, one per OAuth warning.
    Warning { message: String },
    /// Sanitized worker content with a per-request monotonic id.
    Message {
        message_id: u64,
        content: serde_json::Value,
    },
    /// Terminal result; the conversation lock is already released by the
    /// time the client reads this.
    Complete {
        message_id: u64,
        result: AgentResult,
    },
}

impl StreamMessage {
    /// Encode as one NDJSON line. Serialization of these shapes cannot
    /// fail; a broken line is replaced by an empty object rather than
    /// corrupting the stream.
    pub fn encode_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
