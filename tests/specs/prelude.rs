// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared spec harness: a pool wired to stub workers, and a streamed
//! conversation combining the pool with the NDJSON handler and the
//! in-memory conversation lock.

#![allow(dead_code)]

pub use ap_core::{
    FakeClock, PoolConfig, PoolEvent, QueryError, QueryEvent, QueryPayload, QueryResolution,
};
pub use ap_pool::testing::{
    test_config, test_credentials, FixedLoadProbe, StaticCredentialSource, StubBehavior,
    StubLauncher,
};
pub use ap_pool::{QueryRequest, WorkerPool};
pub use ap_stream::{
    CancelState, ConversationLock, MemoryLock, StreamConfig, StreamContext, StreamHandler,
};
pub use std::sync::atomic::{AtomicU64, Ordering};
pub use std::sync::Arc;
pub use std::time::Duration;
pub use tokio::sync::{broadcast, mpsc};
pub use tokio::time::timeout;
pub use tokio_util::sync::CancellationToken;

pub struct PoolHarness {
    pub pool: WorkerPool<FakeClock>,
    pub launcher: Arc<StubLauncher>,
    pub load: FixedLoadProbe,
    pub creds: StaticCredentialSource,
    pub clock: FakeClock,
    _dir: tempfile::TempDir,
}

/// Pool over stub workers, tweakable config, pinned load.
pub fn pool_with(behavior: StubBehavior, tweak: impl FnOnce(&mut PoolConfig)) -> PoolHarness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let launcher = Arc::new(StubLauncher::new(behavior));
    let load = FixedLoadProbe::new(0.0, 4);
    let creds = StaticCredentialSource::new();
    let clock = FakeClock::new();
    let pool = WorkerPool::with_parts(
        config,
        Box::new(Arc::clone(&launcher)),
        Box::new(creds.clone()),
        Box::new(load.clone()),
        clock.clone(),
    );
    PoolHarness {
        pool,
        launcher,
        load,
        creds,
        clock,
        _dir: dir,
    }
}

pub fn request(id: &str, owner: &str, workspace: &str) -> QueryRequest {
    QueryRequest::new(
        id,
        owner,
        test_credentials(workspace),
        QueryPayload::new("run"),
    )
}

/// Wait for a matching pool event, with a hang guard.
pub async fn wait_event(
    events: &mut broadcast::Receiver<PoolEvent>,
    mut pred: impl FnMut(&PoolEvent) -> bool,
) -> PoolEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event bus error: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for pool event")
}

/// Poll a condition until it holds or the guard expires.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for: {what}"));
}

/// One HTTP-shaped conversation: lock acquired, query submitted, events
/// pumped through the stream handler, lock released on completion.
pub struct StreamedQuery {
    pub resolution: tokio::task::JoinHandle<Result<QueryResolution, QueryError>>,
    pub pump: tokio::task::JoinHandle<()>,
    pub output: mpsc::Receiver<String>,
    pub cancel_state: Arc<CancelState>,
    pub token: CancellationToken,
    pub completions: Arc<AtomicU64>,
    pub lock: Arc<MemoryLock>,
}

impl StreamedQuery {
    /// The cancel endpoint: sets the shared flag, which also fires the
    /// pool-side cancellation token attached as the upstream reader.
    pub fn cancel(&self) {
        self.cancel_state.request();
    }
}

pub async fn start_streamed_query(
    pool: &WorkerPool<FakeClock>,
    lock: Arc<MemoryLock>,
    id: &str,
    owner: &str,
    workspace: &str,
) -> StreamedQuery {
    assert!(lock.try_acquire().await, "conversation lock contended");

    let cancel_state = CancelState::new();
    let token = CancellationToken::new();
    cancel_state.set_reader(token.clone());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let completions = Arc::new(AtomicU64::new(0));
    let handler = Arc::new(StreamHandler::new(StreamConfig {
        context: StreamContext {
            request_id: id.to_string(),
            workspace: workspace.to_string(),
            model: None,
        },
        cancel: Arc::clone(&cancel_state),
        warnings: vec![],
        on_session_id: None,
        on_message: None,
        on_stream_complete: {
            let lock = Arc::clone(&lock);
            let completions = Arc::clone(&completions);
            Arc::new(move || {
                completions.fetch_add(1, Ordering::SeqCst);
                let lock = Arc::clone(&lock);
                tokio::spawn(async move {
                    lock.release().await;
                });
            })
        },
    }));

    let (output_tx, output) = mpsc::channel(4096);
    let pump = tokio::spawn({
        let handler = Arc::clone(&handler);
        async move { handler.run(event_rx, output_tx).await }
    });

    let mut query = request(id, owner, workspace);
    query.cancel = Some(token.clone());
    query.on_event = Arc::new(move |event| {
        let _ = event_tx.send(event);
    });
    let pool = pool.clone();
    let resolution = tokio::spawn(async move { pool.submit(query).await });

    StreamedQuery {
        resolution,
        pump,
        output,
        cancel_state,
        token,
        completions,
        lock,
    }
}
