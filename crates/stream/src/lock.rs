// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-conversation exclusion primitive, consumed as an interface.
//!
//! The real store is database-backed and lives outside this crate; the
//! stream handler only needs try-acquire / release / is-held semantics
//! with an idempotent release.

use async_trait::async_trait;

/// One conversation's lock, keyed externally by (user, tab group, tab).
#[async_trait]
pub trait ConversationLock: Send + Sync + 'static {
    /// Non-blocking; true when this caller now holds the lock.
    async fn try_acquire(&self) -> bool;

    /// Idempotent; releasing an unheld lock is a no-op.
    async fn release(&self);

    async fn is_held(&self) -> bool;
}

/// In-memory lock for tests.
#[cfg(any(test, feature = "test-support"))]
pub struct MemoryLock {
    held: std::sync::atomic::AtomicBool,
    releases: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "test-support"))]
impl MemoryLock {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            held: std::sync::atomic::AtomicBool::new(false),
            releases: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// How many times `release` has been called, held or not.
    pub fn release_count(&self) -> u64 {
        self.releases.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Synchronous view of the held flag, for test assertions.
    pub fn held_now(&self) -> bool {
        self.held.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl ConversationLock for MemoryLock {
    async fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
    }

    async fn release(&self) {
        self.releases
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.held.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn is_held(&self) -> bool {
        self.held.load(std::sync::atomic::Ordering::SeqCst)
    }
}
