// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ap-stream: the NDJSON stream handler.
//!
//! Fans a worker's per-query event stream out to an HTTP client as
//! newline-delimited JSON, releasing the per-conversation lock on the
//! first terminal event rather than waiting for the child process to
//! finish tearing down, and reacting to a shared cancellation flag that
//! sibling requests can set without holding the stream's own abort
//! primitive.

pub mod cancel;
pub mod handler;
pub mod lock;
pub mod message;
pub mod sanitize;

pub use cancel::CancelState;
pub use handler::{StreamConfig, StreamContext, StreamHandler};
pub use lock::ConversationLock;
#[cfg(any(test, feature = "test-support"))]
pub use lock::MemoryLock;
pub use message::StreamMessage;
pub use sanitize::{clean_value, strip_system_reminders};
