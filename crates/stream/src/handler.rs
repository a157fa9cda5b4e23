// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The stream handler: worker events in, NDJSON lines out.
//!
//! The conversation lock is released on the first terminal event via
//! `on_stream_complete`, guarded by a once flag. The client connection
//! and the worker's teardown may both outlive it by hundreds of
//! milliseconds, and lock-hold time must not include either.

use crate::cancel::CancelState;
use crate::message::StreamMessage;
use crate::sanitize;
use ap_core::QueryEvent;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Request identity for log lines.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub request_id: String,
    pub workspace: String,
    pub model: Option<String>,
}

type SessionCallback = Arc<dyn Fn(&str) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&StreamMessage) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn() + Send + Sync>;

/// Handler wiring.
///
/// `on_stream_complete` is the idempotence-guarded completion hook; the
/// HTTP layer releases the conversation lock inside it. It is invoked
/// exactly once per stream, on every exit path.
pub struct StreamConfig {
    pub context: StreamContext,
    pub cancel: Arc<CancelState>,
    /// OAuth warnings injected ahead of any worker content.
    pub warnings: Vec<String>,
    /// Best-effort session-id capture.
    pub on_session_id: Option<SessionCallback>,
    /// Observes every outbound message, e.g. for billing counters.
    pub on_message: Option<MessageCallback>,
    pub on_stream_complete: CompleteCallback,
}

pub struct StreamHandler {
    config: StreamConfig,
    completed: AtomicBool,
    message_id: AtomicU64,
}

impl StreamHandler {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            completed: AtomicBool::new(false),
            message_id: AtomicU64::new(0),
        }
    }

    /// Pump events until the upstream closes or cancellation is
    /// requested, writing NDJSON lines into `output`.
    ///
    /// The event side is unbounded because the producer is a synchronous
    /// per-query callback that must never block the worker's frame
    /// router. Output-channel closure (client gone) ends the pump; the
    /// finalization below still runs.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<QueryEvent>,
        output: mpsc::Sender<String>,
    ) {
        tracing::debug!(
            request_id = %self.config.context.request_id,
            workspace = %self.config.context.workspace,
            model = self.config.context.model.as_deref(),
            "stream starting"
        );

        for warning in &self.config.warnings {
            let line = StreamMessage::Warning {
                message: warning.clone(),
            }
            .encode_line();
            if output.send(line).await.is_err() {
                break;
            }
        }

        loop {
            // Cooperative cancellation: checked before each wait and again
            // before each event is processed.
            if self.config.cancel.is_requested() {
                tracing::debug!(
                    request_id = %self.config.context.request_id,
                    "stream cancelled"
                );
                break;
            }
            let Some(event) = events.recv().await else {
                break;
            };
            if self.config.cancel.is_requested() {
                break;
            }

            match event {
                QueryEvent::Session { session_id } => {
                    if let Some(on_session_id) = &self.config.on_session_id {
                        on_session_id(&session_id);
                    }
                }
                QueryEvent::Message { mut content } => {
                    sanitize::clean_value(&mut content);
                    let message = StreamMessage::Message {
                        message_id: self.next_message_id(),
                        content,
                    };
                    if let Some(on_message) = &self.config.on_message {
                        on_message(&message);
                    }
                    if output.send(message.encode_line()).await.is_err() {
                        break;
                    }
                }
                QueryEvent::Completed { result } => {
                    // The worker is done; release the lock now, not when
                    // the child finishes tearing down.
                    self.complete_once();
                    let message = StreamMessage::Complete {
                        message_id: self.next_message_id(),
                        result,
                    };
                    if let Some(on_message) = &self.config.on_message {
                        on_message(&message);
                    }
                    if output.send(message.encode_line()).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Always runs: close the output (dropping our sender; a client
        // that already went away is not an error), complete exactly once,
        // reset the per-request counter.
        drop(output);
        self.complete_once();
        self.message_id.store(0, Ordering::SeqCst);
        tracing::debug!(
            request_id = %self.config.context.request_id,
            "stream finished"
        );
    }

    /// True once the completion hook has run.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn complete_once(&self) {
        if !self.completed.swap(true, Ordering::SeqCst) {
            (self.config.on_stream_complete)();
        }
    }

    fn next_message_id(&self) -> u64 {
        self.message_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
