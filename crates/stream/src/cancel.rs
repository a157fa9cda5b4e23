// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared cancellation flag.
//!
//! Deliberately a polled record rather than an abort signal with a
//! listener: the "stop" endpoint of a sibling HTTP request holds no
//! reference to this stream's abort primitive, only to this shared
//! state. The optional reader handle lets a cancel also wake the
//! upstream event source so the poll loop is never left blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct CancelState {
    requested: AtomicBool,
    reader: parking_lot::Mutex<Option<CancellationToken>>,
}

impl CancelState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set by the cancel endpoint or by the client disconnecting.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().as_ref() {
            reader.cancel();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Attach the upstream reader's cancellation handle, so a cancel can
    /// unblock a pending read. Cancels immediately if already requested.
    pub fn set_reader(&self, token: CancellationToken) {
        if self.is_requested() {
            token.cancel();
            return;
        }
        *self.reader.lock() = Some(token);
    }
}

#[cfg(test)]
#[path = "cancel_tests.rs"]
mod tests;
