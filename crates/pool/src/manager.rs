// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The pool manager: submission, dispatch, routing, draining, shutdown.
//!
//! Everything mutable sits in [`PoolState`] behind one `parking_lot`
//! mutex. Lock scopes compute a plan and release before any await; frame
//! sends, caller callbacks, and continuations all run outside the lock.
//! Spawn decisions register the worker under the same lock scope that
//! made them, so quota checks and the registry can never disagree.

use crate::admission::{self, LoadProbe, SystemLoadProbe};
use crate::credwatch::{evaluate, CredentialAction, CredentialSource, FileCredentialSource};
use crate::launcher::{ProcessLauncher, SpawnError, WorkerLauncher};
use crate::state::{PendingQuery, PoolState, QueuedRequest, Resolver, WorkerEntry, WorkerState};
use ap_core::{
    AgentResult, Clock, CredentialsError, DeferReason, OwnerKey, PoolConfig, PoolEvent,
    PoolTelemetry, QueryError, QueryPayload, QueryResolution, RejectCode, RequestId, SystemClock,
    TelemetrySnapshot, WorkerKey, WorkspaceCredentials, WorkspaceKey,
};
use ap_ipc::{ensure_socket_dir, socket_path, IpcServer, ManagerFrame, PeerEvent, WorkerFrame};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use ap_core::QueryEvent;

/// Per-query event callback; invoked in worker emission order.
pub type OnEvent = Arc<dyn Fn(QueryEvent) + Send + Sync>;

/// One query submission.
pub struct QueryRequest {
    pub request_id: RequestId,
    pub owner: OwnerKey,
    pub credentials: WorkspaceCredentials,
    pub payload: QueryPayload,
    pub on_event: OnEvent,
    pub cancel: Option<CancellationToken>,
}

impl QueryRequest {
    /// Request with a no-op event callback and no cancellation token.
    pub fn new(
        request_id: impl Into<RequestId>,
        owner: impl Into<OwnerKey>,
        credentials: WorkspaceCredentials,
        payload: QueryPayload,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            owner: owner.into(),
            credentials,
            payload,
            on_event: Arc::new(|_| {}),
            cancel: None,
        }
    }
}

/// Answer to a `health_check` probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHealth {
    pub uptime_ms: u64,
    pub queries_processed: u64,
}

/// Queue-drain poll interval while load recovers.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Idle/age eviction tick.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);
/// Credential version probe debounce.
const CREDENTIAL_DEBOUNCE: Duration = Duration::from_secs(1);
/// Event bus depth; subscribers that lag miss events, the pool never blocks.
const EVENT_BUS_CAPACITY: usize = 1024;
/// Poll interval while waiting on a starting worker.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The worker pool manager.
///
/// Cloneable handle; all clones supervise the same workers. Must be
/// created inside a tokio runtime (background timers spawn immediately).
pub struct WorkerPool<C: Clock = SystemClock> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Clock> Clone for WorkerPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PoolInner<C: Clock> {
    pub(crate) config: PoolConfig,
    pub(crate) clock: C,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) telemetry: PoolTelemetry,
    pub(crate) events: broadcast::Sender<PoolEvent>,
    pub(crate) launcher: Box<dyn WorkerLauncher>,
    pub(crate) cred_source: Box<dyn CredentialSource>,
    pub(crate) load: Box<dyn LoadProbe>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool<SystemClock> {
    pub fn new(config: PoolConfig) -> Self {
        let launcher = Box::new(ProcessLauncher::new(config.worker_binary.clone()));
        let cred_source = Box::new(FileCredentialSource::new(config.credentials_path.clone()));
        Self::with_parts(
            config,
            launcher,
            cred_source,
            Box::new(SystemLoadProbe),
            SystemClock,
        )
    }
}

impl<C: Clock> WorkerPool<C> {
    /// Assemble a pool from explicit collaborators. Tests inject stub
    /// launchers, pinned load, static credentials, and a fake clock here.
    pub fn with_parts(
        config: PoolConfig,
        launcher: Box<dyn WorkerLauncher>,
        cred_source: Box<dyn CredentialSource>,
        load: Box<dyn LoadProbe>,
        clock: C,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let inner = Arc::new(PoolInner {
            config,
            clock,
            state: Mutex::new(PoolState::new()),
            telemetry: PoolTelemetry::default(),
            events,
            launcher,
            cred_source,
            load,
            background: Mutex::new(Vec::new()),
        });
        inner.start_background();
        Self { inner }
    }

    /// Submit one query and wait for its resolution.
    pub async fn submit(&self, request: QueryRequest) -> Result<QueryResolution, QueryError> {
        self.inner.submit(request).await
    }

    /// Subscribe to the pool event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Counters plus gauges at this instant.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.telemetry_snapshot()
    }

    /// Probe one worker; `None` if it is gone or does not answer.
    pub async fn health_check(&self, key: &WorkerKey) -> Option<WorkerHealth> {
        self.inner.health_check(key).await
    }

    /// Reject queued work, fail in-flight queries, and tear every worker
    /// down. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// Run one idle/age eviction pass now (the 60 s timer calls this).
    pub fn run_eviction_pass(&self) {
        self.inner.run_eviction_pass();
    }

    /// Run one queue-drain pass now (the 5 s timer calls this).
    pub async fn run_drain_pass(&self) {
        self.inner.run_drain_pass().await;
    }
}

/// A worker slot bound and registered under the admission lock; the
/// process itself has not been launched yet.
struct PreparedWorker {
    key: WorkerKey,
    path: PathBuf,
}

/// What admission decided, computed under the lock and executed outside.
enum AdmitPlan {
    Dispatch(DispatchPlan),
    Launch(PreparedWorker, QueryRequest, Resolver),
    /// A same-workspace worker is starting; wait for it and re-admit.
    AwaitReady(WorkerKey, QueryRequest, Resolver),
    /// Queued, rejected, or resolved synchronously; nothing left to do.
    Settled,
}

/// Everything needed to send a `query` frame after unlock.
struct DispatchPlan {
    key: WorkerKey,
    ipc: Arc<IpcServer>,
    request_id: RequestId,
    payload: QueryPayload,
    cancel: Option<CancellationToken>,
}

impl<C: Clock> PoolInner<C> {
    fn start_background(self: &Arc<Self>) {
        let mut tasks = Vec::new();

        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                let Some(inner) = weak.upgrade() else { return };
                inner.run_drain_pass().await;
            }
        }));

        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(EVICTION_INTERVAL).await;
                let Some(inner) = weak.upgrade() else { return };
                inner.run_eviction_pass();
            }
        }));

        #[cfg(target_os = "linux")]
        {
            let weak = Arc::downgrade(self);
            let interval = self.config.orphan_sweep_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(inner) = weak.upgrade() else { return };
                    inner.sweep_orphans();
                }
            }));
        }

        self.background.lock().extend(tasks);
    }

    // ── Submission ───────────────────────────────────────────────────────

    async fn submit(
        self: &Arc<Self>,
        request: QueryRequest,
    ) -> Result<QueryResolution, QueryError> {
        if request.owner.as_str().is_empty() {
            return Err(CredentialsError::EmptyOwnerKey.into());
        }
        request
            .credentials
            .validate(&self.config.sites_root, &self.config.admin_workdir)?;

        self.check_credentials();

        let (resolver, resolution) = oneshot::channel();
        let plan = self.admit(request, resolver);
        self.execute_plan(plan).await;

        resolution.await.map_err(|_| QueryError::ShuttingDown)?
    }

    fn execute_plan(self: &Arc<Self>, plan: AdmitPlan) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            match plan {
                AdmitPlan::Settled => {}
                AdmitPlan::Dispatch(dispatch) => inner.perform_dispatch(dispatch).await,
                AdmitPlan::Launch(prepared, request, resolver) => {
                    inner.launch_then_dispatch(prepared, request, resolver).await;
                }
                AdmitPlan::AwaitReady(key, request, resolver) => {
                    inner.await_worker_settled(&key).await;
                    let plan = inner.admit(request, resolver);
                    inner.execute_plan(plan).await;
                }
            }
        })
    }

    /// Admission decision under one lock scope: quotas in spec order, then
    /// worker resolution, then queue-or-reject. Rejections and
    /// short-circuits resolve the caller directly.
    fn admit(self: &Arc<Self>, request: QueryRequest, resolver: Resolver) -> AdmitPlan {
        if request.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            let _ = resolver.send(Ok(QueryResolution::Cancelled { session_id: None }));
            return AdmitPlan::Settled;
        }

        let mut stale = Vec::new();
        let mut evicted = Vec::new();
        let plan = {
            let mut state = self.state.lock();
            if state.shutting_down {
                let _ = resolver.send(Err(QueryError::ShuttingDown));
                AdmitPlan::Settled
            } else {
                let workspace = request.credentials.workspace_key.clone();
                if admission::owner_at_active_limit(&state, &self.config, &request.owner) {
                    self.enqueue_or_reject(&mut state, request, resolver, DeferReason::UserLimit)
                } else if admission::workspace_at_active_limit(&state, &self.config, &workspace) {
                    self.enqueue_or_reject(
                        &mut state,
                        request,
                        resolver,
                        DeferReason::WorkspaceLimit,
                    )
                } else if let Some(key) = self.pick_ready_worker_locked(
                    &mut state,
                    &workspace,
                    request.payload.uses_oauth(),
                    &mut stale,
                ) {
                    AdmitPlan::Dispatch(
                        self.mark_dispatch_locked(&mut state, &key, request, resolver),
                    )
                } else if let Some(starting) = starting_worker_of(&state, &workspace) {
                    AdmitPlan::AwaitReady(starting, request, resolver)
                } else {
                    match self.spawn_decision_locked(
                        &mut state,
                        &request.owner,
                        &workspace,
                        &mut evicted,
                    ) {
                        Ok(()) => match self.register_worker_locked(&mut state, &request.credentials)
                        {
                            Ok(prepared) => AdmitPlan::Launch(prepared, request, resolver),
                            Err(err) => {
                                let _ =
                                    resolver.send(Err(QueryError::Spawn(err.to_string())));
                                AdmitPlan::Settled
                            }
                        },
                        Err(reason) => self.enqueue_or_reject(&mut state, request, resolver, reason),
                    }
                }
            }
        };

        for key in stale {
            self.spawn_retire(key, true);
        }
        for key in evicted {
            let _ = self.events.send(PoolEvent::WorkerEvicted { key: key.clone() });
            self.spawn_retire(key, true);
        }
        plan
    }

    /// Scan ready workers of a workspace; retire stale-credential workers
    /// along the way (collected into `stale`).
    fn pick_ready_worker_locked(
        &self,
        state: &mut PoolState,
        workspace: &WorkspaceKey,
        uses_oauth: bool,
        stale: &mut Vec<WorkerKey>,
    ) -> Option<WorkerKey> {
        let current_version = state.credentials_version.clone();
        for key in state.available_workers_of(workspace) {
            let now = self.clock.now();
            let Some(entry) = state.workers.get_mut(&key) else {
                continue;
            };
            if uses_oauth
                && (entry.needs_restart_for_credentials
                    || entry.credentials_version != current_version)
            {
                entry.state = WorkerState::ShuttingDown;
                stale.push(key);
                continue;
            }
            entry.last_activity = now;
            return Some(key);
        }
        None
    }

    /// Can we spawn? Errors carry the defer reason for the queue.
    fn spawn_decision_locked(
        &self,
        state: &mut PoolState,
        owner: &OwnerKey,
        workspace: &WorkspaceKey,
        evicted: &mut Vec<WorkerKey>,
    ) -> Result<(), DeferReason> {
        if admission::owner_at_active_limit(state, &self.config, owner) {
            return Err(DeferReason::UserLimit);
        }
        if admission::workspace_at_active_limit(state, &self.config, workspace) {
            return Err(DeferReason::WorkspaceLimit);
        }
        if admission::load_shedding(&self.config, self.load.as_ref()) {
            PoolTelemetry::incr(&self.telemetry.load_shed_events);
            return Err(DeferReason::LoadShed);
        }
        let dynamic_max = self.config.dynamic_max(self.load.cpu_count());
        if state.workers.len() >= dynamic_max {
            match self.pick_eviction_victim_locked(state) {
                Some(victim) => evicted.push(victim),
                None => {
                    let _ = self.events.send(PoolEvent::AtCapacity {
                        workspace: workspace.clone(),
                    });
                    return Err(DeferReason::Capacity);
                }
            }
        }
        Ok(())
    }

    /// Choose a ready worker to make room, per the configured strategy.
    fn pick_eviction_victim_locked(&self, state: &mut PoolState) -> Option<WorkerKey> {
        use ap_core::EvictionStrategy;
        let candidates = state.workers.values().filter(|w| w.is_available());
        let victim = match self.config.eviction_strategy {
            EvictionStrategy::Lru => candidates.min_by_key(|w| w.last_activity),
            EvictionStrategy::Oldest => candidates.min_by_key(|w| w.created_at),
            EvictionStrategy::LeastUsed => candidates.min_by_key(|w| w.queries_processed),
        }
        .map(|w| w.key.clone())?;
        if let Some(entry) = state.workers.get_mut(&victim) {
            entry.state = WorkerState::ShuttingDown;
        }
        Some(victim)
    }

    /// Put a request on its workspace queue, or reject if queue quotas are
    /// exceeded. The rejection code carries the defer reason when the
    /// deferral itself was a load shed.
    fn enqueue_or_reject(
        self: &Arc<Self>,
        state: &mut PoolState,
        request: QueryRequest,
        resolver: Resolver,
        reason: DeferReason,
    ) -> AdmitPlan {
        let workspace = request.credentials.workspace_key.clone();
        if let Err(scope) =
            admission::queue_admission(state, &self.config, &request.owner, &workspace)
        {
            let counter = match scope {
                RejectCode::UserLimit => &self.telemetry.queue_rejected_user,
                RejectCode::WorkspaceLimit => &self.telemetry.queue_rejected_workspace,
                _ => &self.telemetry.queue_rejected_global,
            };
            PoolTelemetry::incr(counter);
            let code = if reason == DeferReason::LoadShed {
                RejectCode::LoadShed
            } else {
                scope
            };
            let _ = resolver.send(Err(QueryError::Rejected { code }));
            return AdmitPlan::Settled;
        }

        let listener = request.cancel.clone().map(|token| {
            let inner = Arc::clone(self);
            let workspace = workspace.clone();
            let request_id = request.request_id.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                inner.on_cancel_queued(&workspace, &request_id);
            })
        });

        state.queued_by_owner.incr(request.owner.as_str());
        state.queued_by_workspace.incr(workspace.as_str());
        state.total_queued += 1;
        tracing::debug!(
            request_id = %request.request_id,
            owner = %request.owner,
            workspace = %workspace,
            ?reason,
            "request queued"
        );
        let queued = QueuedRequest {
            request_id: request.request_id,
            owner: request.owner.clone(),
            credentials: request.credentials,
            payload: request.payload,
            on_event: request.on_event,
            cancel: request.cancel,
            resolver: Some(resolver),
            enqueued_at_ms: self.clock.epoch_ms(),
            cancel_listener: listener,
        };
        state
            .queues
            .entry(workspace)
            .or_default()
            .enqueue(request.owner, queued);
        AdmitPlan::Settled
    }

    /// Mark a ready worker busy and register the pending query.
    fn mark_dispatch_locked(
        &self,
        state: &mut PoolState,
        key: &WorkerKey,
        request: QueryRequest,
        resolver: Resolver,
    ) -> DispatchPlan {
        let workspace = request.credentials.workspace_key.clone();
        state.active_by_owner.incr(request.owner.as_str());
        state.active_by_workspace.incr(workspace.as_str());

        let plan = {
            let entry = state
                .workers
                .get_mut(key)
                .unwrap_or_else(|| unreachable_worker(key));
            entry.reserved = false;
            entry.state = WorkerState::Busy;
            entry.active_request = Some(request.request_id.clone());
            entry.current_owner = Some(request.owner.clone());
            entry.last_activity = self.clock.now();
            entry.pending.insert(
                request.request_id.clone(),
                PendingQuery {
                    owner: request.owner,
                    workspace,
                    resolver: Some(resolver),
                    on_event: request.on_event,
                    session_id: None,
                    accounting_cleaned: false,
                    cancel_listener: None,
                },
            );
            DispatchPlan {
                key: key.clone(),
                ipc: Arc::clone(&entry.ipc),
                request_id: request.request_id,
                payload: request.payload,
                cancel: request.cancel,
            }
        };
        let _ = self.events.send(PoolEvent::WorkerBusy {
            key: plan.key.clone(),
            request_id: plan.request_id.clone(),
        });
        plan
    }

    /// Install the cancel listener and put the `query` frame on the wire.
    async fn perform_dispatch(self: &Arc<Self>, plan: DispatchPlan) {
        if let Some(token) = plan.cancel.clone() {
            let inner = Arc::clone(self);
            let key = plan.key.clone();
            let request_id = plan.request_id.clone();
            let listener = tokio::spawn(async move {
                token.cancelled().await;
                inner.on_cancel_active(&key, &request_id).await;
            });
            let mut state = self.state.lock();
            if let Some(pending) = state
                .workers
                .get_mut(&plan.key)
                .and_then(|entry| entry.pending.get_mut(&plan.request_id))
            {
                pending.cancel_listener = Some(listener);
            } else {
                // The query is already gone; the listener has nothing to do.
                listener.abort();
            }
        }

        let frame = ManagerFrame::Query {
            request_id: plan.request_id.clone(),
            payload: plan.payload,
        };
        if let Err(err) = plan.ipc.send(&frame).await {
            tracing::error!(%err, worker_key = %plan.key, "query dispatch failed");
            self.reap_worker(&plan.key, "worker unreachable at dispatch");
        }
    }

    // ── Spawning ─────────────────────────────────────────────────────────

    /// Bind the socket, insert the registry entry, and start the frame
    /// router, all under the admission lock, so capacity decisions and
    /// the registry can never diverge.
    fn register_worker_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        credentials: &WorkspaceCredentials,
    ) -> std::io::Result<PreparedWorker> {
        ensure_socket_dir(&self.config.socket_dir)?;
        let instance = state.next_instance_id(&credentials.workspace_key);
        let key = WorkerKey::new(credentials.workspace_key.clone(), instance);
        let path = socket_path(&self.config.socket_dir, &key);
        let (server, frames) = IpcServer::bind(&path)?;
        let server = Arc::new(server);

        let route = tokio::spawn({
            let inner = Arc::clone(self);
            let key = key.clone();
            async move {
                inner.route_worker(key, frames).await;
            }
        });

        let now = self.clock.now();
        state.workers.insert(
            key.clone(),
            WorkerEntry {
                key: key.clone(),
                pid: None,
                state: WorkerState::Starting,
                credentials: credentials.clone(),
                created_at: now,
                last_activity: now,
                queries_processed: 0,
                active_request: None,
                current_owner: None,
                credentials_version: state.credentials_version.clone(),
                needs_restart_for_credentials: false,
                retired_after_cancel: false,
                // The spawner's request dispatches first; drains wait.
                reserved: true,
                pending: HashMap::new(),
                ipc: server,
                health_waiter: None,
                tasks: vec![route],
            },
        );
        Ok(PreparedWorker { key, path })
    }

    /// Launch the prepared worker and dispatch the request onto it.
    /// Spawn failures reject this caller only.
    async fn launch_then_dispatch(
        self: &Arc<Self>,
        prepared: PreparedWorker,
        request: QueryRequest,
        resolver: Resolver,
    ) {
        match self.launch_worker(prepared).await {
            Ok(key) => {
                let plan = {
                    let mut state = self.state.lock();
                    if state.workers.contains_key(&key) {
                        Some(self.mark_dispatch_locked(&mut state, &key, request, resolver))
                    } else {
                        let _ = resolver.send(Err(QueryError::WorkerCrashed(
                            "worker exited before first dispatch".to_string(),
                        )));
                        None
                    }
                };
                if let Some(plan) = plan {
                    self.perform_dispatch(plan).await;
                }
            }
            Err(err) => {
                let _ = resolver.send(Err(QueryError::Spawn(err.to_string())));
            }
        }
    }

    /// Start the worker process and wait for its `ready` frame: ready,
    /// crash, or timeout (then SIGKILL + removal).
    async fn launch_worker(self: &Arc<Self>, prepared: PreparedWorker) -> Result<WorkerKey, SpawnError> {
        let PreparedWorker { key, path } = prepared;
        let Some(credentials) = ({
            let state = self.state.lock();
            state.workers.get(&key).map(|entry| entry.credentials.clone())
        }) else {
            return Err(SpawnError::CrashedOnStartup(
                "worker deregistered before launch".to_string(),
            ));
        };

        // Subscribe before launching so the ready event cannot be missed.
        let mut events = self.events.subscribe();

        let launched = match self.launcher.launch(&key, &credentials, &path).await {
            Ok(launched) => launched,
            Err(err) => {
                // Releases the socket server and the registry slot.
                self.reap_worker(&key, "worker process failed to spawn");
                return Err(err);
            }
        };

        {
            let mut state = self.state.lock();
            if let Some(entry) = state.workers.get_mut(&key) {
                entry.pid = launched.pid;
            }
        }
        let watcher = tokio::spawn({
            let inner = Arc::clone(self);
            let key = key.clone();
            let exited = launched.exited;
            async move {
                exited.await;
                inner.reap_worker(&key, "worker process exited");
            }
        });
        {
            let mut state = self.state.lock();
            match state.workers.get_mut(&key) {
                Some(entry) => entry.tasks.push(watcher),
                None => watcher.abort(),
            }
        }
        let _ = self.events.send(PoolEvent::WorkerSpawned { key: key.clone() });

        let deadline = tokio::time::sleep(self.config.ready_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::error!(worker_key = %key, "worker startup timed out");
                    self.kill_group_now(&key);
                    self.reap_worker(&key, "worker startup timed out");
                    return Err(SpawnError::ReadyTimeout);
                }
                event = events.recv() => match event {
                    Ok(PoolEvent::WorkerReady { key: ready_key }) if ready_key == key => {
                        return Ok(key);
                    }
                    Ok(PoolEvent::WorkerCrashed { key: crashed_key, reason }) if crashed_key == key => {
                        return Err(SpawnError::CrashedOnStartup(reason));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SpawnError::CrashedOnStartup("event bus closed".to_string()));
                    }
                },
            }
        }
    }

    /// Wait until a worker is no longer starting or reserved (or is gone),
    /// bounded by the ready timeout. Callers re-admit afterwards.
    async fn await_worker_settled(&self, key: &WorkerKey) {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            {
                let state = self.state.lock();
                match state.workers.get(key) {
                    None => return,
                    Some(entry)
                        if entry.state != WorkerState::Starting && !entry.reserved =>
                    {
                        return;
                    }
                    Some(_) => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    // ── Worker frame routing ─────────────────────────────────────────────

    async fn route_worker(
        self: Arc<Self>,
        key: WorkerKey,
        mut frames: mpsc::Receiver<PeerEvent<WorkerFrame>>,
    ) {
        while let Some(event) = frames.recv().await {
            match event {
                PeerEvent::Frame(frame) => self.on_worker_frame(&key, frame).await,
                PeerEvent::Invalid { error } => {
                    // Protocol error: logged, worker survives.
                    tracing::error!(worker_key = %key, %error, "invalid frame from worker");
                }
                PeerEvent::Overflow => {
                    // Structural: the connection is poisoned.
                    self.reap_worker(&key, "ipc buffer overflow");
                    return;
                }
                PeerEvent::Disconnected => {
                    self.reap_worker(&key, "Worker disconnected unexpectedly");
                    return;
                }
            }
        }
    }

    async fn on_worker_frame(self: &Arc<Self>, key: &WorkerKey, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Ready => {
                let became_ready = {
                    let mut state = self.state.lock();
                    match state.workers.get_mut(key) {
                        Some(entry) if entry.state == WorkerState::Starting => {
                            entry.state = WorkerState::Ready;
                            entry.last_activity = self.clock.now();
                            true
                        }
                        _ => false,
                    }
                };
                if became_ready {
                    let _ = self.events.send(PoolEvent::WorkerReady { key: key.clone() });
                    self.drain_workspace(key.workspace().clone()).await;
                }
            }

            WorkerFrame::Session {
                request_id,
                session_id,
            } => {
                let on_event = {
                    let mut state = self.state.lock();
                    state.workers.get_mut(key).and_then(|entry| {
                        entry.pending.get_mut(&request_id).map(|pending| {
                            pending.session_id = Some(session_id.clone());
                            Arc::clone(&pending.on_event)
                        })
                    })
                };
                match on_event {
                    Some(on_event) => on_event(QueryEvent::Session { session_id }),
                    None => {
                        tracing::warn!(worker_key = %key, request_id = %request_id, "session frame for unknown request");
                    }
                }
            }

            WorkerFrame::Message {
                request_id,
                content,
            } => {
                let on_event = {
                    let state = self.state.lock();
                    state.workers.get(key).and_then(|entry| {
                        entry
                            .pending
                            .get(&request_id)
                            .map(|pending| Arc::clone(&pending.on_event))
                    })
                };
                match on_event {
                    Some(on_event) => on_event(QueryEvent::Message { content }),
                    None => {
                        tracing::warn!(worker_key = %key, request_id = %request_id, "message frame for unknown request");
                    }
                }
            }

            WorkerFrame::Complete { request_id, result } => {
                self.finish_query(key, &request_id, Ok(result)).await;
            }

            WorkerFrame::Error {
                request_id,
                error,
                stack,
                stderr,
                diagnostics,
            } => {
                self.finish_query(
                    key,
                    &request_id,
                    Err(QueryError::Agent {
                        error,
                        stack,
                        stderr,
                        diagnostics,
                    }),
                )
                .await;
            }

            WorkerFrame::HealthOk {
                uptime_ms,
                queries_processed,
            } => {
                let waiter = {
                    let mut state = self.state.lock();
                    state
                        .workers
                        .get_mut(key)
                        .and_then(|entry| entry.health_waiter.take())
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(WorkerHealth {
                        uptime_ms,
                        queries_processed,
                    });
                }
            }

            WorkerFrame::ShutdownAck => {
                tracing::debug!(worker_key = %key, "shutdown acknowledged");
            }
        }
    }

    /// Terminal-frame cleanup: runs the accounting decrement exactly once,
    /// returns the worker to ready (or into retirement), resolves the
    /// caller, and drains the queue.
    async fn finish_query(
        self: &Arc<Self>,
        key: &WorkerKey,
        request_id: &RequestId,
        outcome: Result<AgentResult, QueryError>,
    ) {
        struct Finish {
            resolver: Option<Resolver>,
            on_event: OnEvent,
            session_id: Option<String>,
            retire: bool,
        }

        let finish = {
            let mut state = self.state.lock();
            let Some(entry) = state.workers.get_mut(key) else {
                tracing::warn!(worker_key = %key, "terminal frame from unregistered worker");
                return;
            };
            let Some(mut pending) = entry.pending.remove(request_id) else {
                tracing::warn!(worker_key = %key, request_id = %request_id, "terminal frame for unknown request");
                return;
            };
            if let Some(listener) = pending.cancel_listener.take() {
                listener.abort();
            }
            entry.queries_processed += 1;
            entry.active_request = None;
            entry.current_owner = None;
            entry.last_activity = self.clock.now();
            // Consulted only here: a busy worker flagged during credential
            // rotation retires after its current query, not mid-flight.
            let retire = entry.needs_restart_for_credentials || entry.retired_after_cancel;
            entry.state = if retire {
                WorkerState::ShuttingDown
            } else {
                WorkerState::Ready
            };

            let owner = pending.owner.clone();
            let workspace = pending.workspace.clone();
            if !pending.accounting_cleaned {
                pending.accounting_cleaned = true;
                state.active_by_owner.decr(owner.as_str());
                state.active_by_workspace.decr(workspace.as_str());
            }

            Finish {
                resolver: pending.resolver.take(),
                on_event: pending.on_event,
                session_id: pending.session_id,
                retire,
            }
        };

        let resolution = match outcome {
            Ok(result) => {
                (finish.on_event)(QueryEvent::Completed {
                    result: result.clone(),
                });
                Ok(QueryResolution::Completed {
                    session_id: finish.session_id,
                    result,
                })
            }
            Err(err) => Err(err),
        };
        if let Some(resolver) = finish.resolver {
            let _ = resolver.send(resolution);
        }

        if finish.retire {
            self.spawn_retire(key.clone(), true);
        } else {
            let _ = self.events.send(PoolEvent::WorkerIdle { key: key.clone() });
        }
        self.drain_workspace(key.workspace().clone()).await;
    }

    // ── Cancellation ─────────────────────────────────────────────────────

    /// Active-request cancellation: instruct the worker, resolve the
    /// caller immediately, and retire the worker so no second request runs
    /// on a process whose agent state may be inconsistent.
    async fn on_cancel_active(self: &Arc<Self>, key: &WorkerKey, request_id: &RequestId) {
        let ipc = {
            let state = self.state.lock();
            state.workers.get(key).map(|entry| Arc::clone(&entry.ipc))
        };
        if let Some(ipc) = ipc {
            let _ = ipc
                .send(&ManagerFrame::Cancel {
                    request_id: request_id.clone(),
                })
                .await;
        }

        let resolved = {
            let mut state = self.state.lock();
            let Some(entry) = state.workers.get_mut(key) else {
                return;
            };
            let Some(mut pending) = entry.pending.remove(request_id) else {
                // Double-cancel, or the query finished first.
                return;
            };
            pending.cancel_listener.take();
            entry.retired_after_cancel = true;
            entry.state = WorkerState::ShuttingDown;
            entry.active_request = None;
            entry.current_owner = None;

            let owner = pending.owner.clone();
            let workspace = pending.workspace.clone();
            if !pending.accounting_cleaned {
                pending.accounting_cleaned = true;
                state.active_by_owner.decr(owner.as_str());
                state.active_by_workspace.decr(workspace.as_str());
            }
            (pending.resolver.take(), pending.session_id.clone())
        };

        PoolTelemetry::incr(&self.telemetry.retired_after_cancel);
        let (resolver, session_id) = resolved;
        if let Some(resolver) = resolver {
            let _ = resolver.send(Ok(QueryResolution::Cancelled { session_id }));
        }
        self.spawn_retire(key.clone(), false);
    }

    /// Queued-request cancellation: pull it from the queue, fix counters,
    /// resolve with `cancelled`.
    fn on_cancel_queued(self: &Arc<Self>, workspace: &WorkspaceKey, request_id: &RequestId) {
        let resolver = {
            let mut state = self.state.lock();
            let Some(queue) = state.queues.get_mut(workspace) else {
                return;
            };
            let Some((owner, mut queued)) = queue.remove_where(|r| &r.request_id == request_id)
            else {
                return;
            };
            queued.cancel_listener.take();
            state.queued_by_owner.decr(owner.as_str());
            state.queued_by_workspace.decr(workspace.as_str());
            state.total_queued -= 1;
            queued.resolver.take()
        };
        if let Some(resolver) = resolver {
            let _ = resolver.send(Ok(QueryResolution::Cancelled { session_id: None }));
        }
    }

    // ── Queue draining ───────────────────────────────────────────────────

    /// Dispatch queued work for one workspace while workers (or spawn
    /// room) remain. Stops at the first deferral to preserve order.
    pub(crate) async fn drain_workspace(self: &Arc<Self>, workspace: WorkspaceKey) {
        loop {
            enum DrainPlan {
                Dispatch(DispatchPlan),
                Launch(PreparedWorker, QueryRequest, Resolver),
                Cancelled(Option<Resolver>),
                Done,
            }

            let mut stale = Vec::new();
            let mut evicted = Vec::new();
            let plan = {
                let mut state = self.state.lock();
                if state.shutting_down
                    || admission::workspace_at_active_limit(&state, &self.config, &workspace)
                {
                    DrainPlan::Done
                } else if state.queues.get(&workspace).is_none_or(|q| q.is_empty()) {
                    state.queues.remove(&workspace);
                    DrainPlan::Done
                } else if starting_worker_of(&state, &workspace).is_some()
                    && state.available_workers_of(&workspace).is_empty()
                {
                    // A worker is on its way up and holds the workspace's
                    // capacity; its first dispatch triggers the next drain.
                    DrainPlan::Done
                } else {
                    // Owners over their active cap skip this pass without
                    // losing their place in the rotation.
                    let queued_owners = state
                        .queues
                        .get(&workspace)
                        .map(|q| q.owners_in_order())
                        .unwrap_or_default();
                    let blocked: HashSet<String> = queued_owners
                        .into_iter()
                        .filter(|owner| {
                            admission::owner_at_active_limit(&state, &self.config, owner)
                        })
                        .map(|owner| owner.0)
                        .collect();
                    let popped = state
                        .queues
                        .get_mut(&workspace)
                        .and_then(|q| q.pop_eligible(|owner| !blocked.contains(owner.as_str())));
                    match popped {
                        None => DrainPlan::Done,
                        Some(mut queued) => {
                            state.queued_by_owner.decr(queued.owner.as_str());
                            state.queued_by_workspace.decr(workspace.as_str());
                            state.total_queued -= 1;
                            if let Some(listener) = queued.cancel_listener.take() {
                                listener.abort();
                            }
                            let waited_ms =
                                self.clock.epoch_ms().saturating_sub(queued.enqueued_at_ms);
                            tracing::debug!(
                                request_id = %queued.request_id,
                                waited_ms,
                                "dequeued request"
                            );
                            if queued.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                                DrainPlan::Cancelled(queued.resolver.take())
                            } else if let Some(key) = self.pick_ready_worker_locked(
                                &mut state,
                                &workspace,
                                queued.payload.uses_oauth(),
                                &mut stale,
                            ) {
                                let (request, resolver) = requeue_parts(queued);
                                DrainPlan::Dispatch(self.mark_dispatch_locked(
                                    &mut state, &key, request, resolver,
                                ))
                            } else {
                                match self.spawn_decision_locked(
                                    &mut state,
                                    &queued.owner,
                                    &workspace,
                                    &mut evicted,
                                ) {
                                    Ok(()) => {
                                        match self
                                            .register_worker_locked(&mut state, &queued.credentials)
                                        {
                                            Ok(prepared) => {
                                                let (request, resolver) = requeue_parts(queued);
                                                DrainPlan::Launch(prepared, request, resolver)
                                            }
                                            Err(err) => {
                                                if let Some(resolver) = queued.resolver.take() {
                                                    let _ = resolver.send(Err(QueryError::Spawn(
                                                        err.to_string(),
                                                    )));
                                                }
                                                DrainPlan::Done
                                            }
                                        }
                                    }
                                    Err(_reason) => {
                                        // Back to the front of its owner's
                                        // list; counters go back up.
                                        state.queued_by_owner.incr(queued.owner.as_str());
                                        state.queued_by_workspace.incr(workspace.as_str());
                                        state.total_queued += 1;
                                        let owner = queued.owner.clone();
                                        self.reinstall_queued_listener(&workspace, &mut queued);
                                        state
                                            .queues
                                            .entry(workspace.clone())
                                            .or_default()
                                            .requeue_front(owner, queued);
                                        DrainPlan::Done
                                    }
                                }
                            }
                        }
                    }
                }
            };

            for key in stale {
                self.spawn_retire(key, true);
            }
            for key in evicted {
                let _ = self.events.send(PoolEvent::WorkerEvicted { key: key.clone() });
                self.spawn_retire(key, true);
            }

            match plan {
                DrainPlan::Done => return,
                DrainPlan::Cancelled(resolver) => {
                    if let Some(resolver) = resolver {
                        let _ =
                            resolver.send(Ok(QueryResolution::Cancelled { session_id: None }));
                    }
                }
                DrainPlan::Dispatch(dispatch) => self.perform_dispatch(dispatch).await,
                DrainPlan::Launch(prepared, request, resolver) => {
                    self.launch_then_dispatch(prepared, request, resolver).await;
                }
            }
        }
    }

    fn reinstall_queued_listener(
        self: &Arc<Self>,
        workspace: &WorkspaceKey,
        queued: &mut QueuedRequest,
    ) {
        if let Some(token) = queued.cancel.clone() {
            let inner = Arc::clone(self);
            let workspace = workspace.clone();
            let request_id = queued.request_id.clone();
            queued.cancel_listener = Some(tokio::spawn(async move {
                token.cancelled().await;
                inner.on_cancel_queued(&workspace, &request_id);
            }));
        }
    }

    /// The 5-second poll: drain every backlogged workspace once load has
    /// dropped below the shed threshold. Prevents starvation when no
    /// worker was ever spawnable under load.
    pub(crate) async fn run_drain_pass(self: &Arc<Self>) {
        if admission::load_shedding(&self.config, self.load.as_ref()) {
            return;
        }
        let workspaces: Vec<WorkspaceKey> = {
            let state = self.state.lock();
            state.queues.keys().cloned().collect()
        };
        for workspace in workspaces {
            self.drain_workspace(workspace).await;
        }
    }

    // ── Crash / removal ──────────────────────────────────────────────────

    /// Remove a worker and fail everything pending on it. Fully
    /// synchronous so it is safe to call from the worker's own routing
    /// task. Idempotent.
    pub(crate) fn reap_worker(self: &Arc<Self>, key: &WorkerKey, reason: &str) {
        let mut resolvers: Vec<(Resolver, QueryError)> = Vec::new();
        let crashed;
        {
            let mut state = self.state.lock();
            let Some(mut entry) = state.workers.remove(key) else {
                return;
            };
            crashed = !matches!(entry.state, WorkerState::ShuttingDown | WorkerState::Dead);
            entry.state = WorkerState::Dead;
            for task in entry.tasks.drain(..) {
                task.abort();
            }
            entry.ipc.close();
            if let Some(pid) = entry.pid {
                state.record_former_pid(pid);
            }

            let shutting_down = state.shutting_down;
            let mut cleanups = Vec::new();
            for (_, mut pending) in entry.pending.drain() {
                if let Some(listener) = pending.cancel_listener.take() {
                    listener.abort();
                }
                if !pending.accounting_cleaned {
                    pending.accounting_cleaned = true;
                    cleanups.push((pending.owner.clone(), pending.workspace.clone()));
                }
                if let Some(resolver) = pending.resolver.take() {
                    let err = if shutting_down {
                        QueryError::ShuttingDown
                    } else {
                        QueryError::WorkerCrashed(reason.to_string())
                    };
                    resolvers.push((resolver, err));
                }
            }
            for (owner, workspace) in cleanups {
                state.active_by_owner.decr(owner.as_str());
                state.active_by_workspace.decr(workspace.as_str());
            }
        }

        for (resolver, err) in resolvers {
            let _ = resolver.send(Err(err));
        }

        if crashed {
            tracing::error!(worker_key = %key, reason, "worker crashed");
            let _ = self.events.send(PoolEvent::WorkerCrashed {
                key: key.clone(),
                reason: reason.to_string(),
            });
        } else {
            let _ = self.events.send(PoolEvent::WorkerShutdown { key: key.clone() });
        }

        // Freed capacity: drain this workspace in the background.
        let inner = Arc::clone(self);
        let workspace = key.workspace().clone();
        tokio::spawn(async move {
            inner.drain_workspace(workspace).await;
        });
    }

    // ── Credentials ──────────────────────────────────────────────────────

    /// Debounced credentials probe from the submission path.
    pub(crate) fn check_credentials(self: &Arc<Self>) {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            if state
                .last_credentials_check
                .is_some_and(|last| now.duration_since(last) < CREDENTIAL_DEBOUNCE)
            {
                return;
            }
            state.last_credentials_check = Some(now);
        }

        let check = match self.cred_source.check() {
            Ok(Some(check)) => check,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%err, "credentials probe failed");
                let _ = self.events.send(PoolEvent::PoolError {
                    message: format!("credentials probe failed: {err}"),
                });
                return;
            }
        };

        let mut to_retire = Vec::new();
        {
            let mut state = self.state.lock();
            match evaluate(state.credentials_version.as_deref(), &check) {
                CredentialAction::Unchanged => {}
                CredentialAction::Seed { version } => {
                    state.credentials_version = Some(version.clone());
                    for entry in state.workers.values_mut() {
                        if entry.credentials_version.is_none() {
                            entry.credentials_version = Some(version.clone());
                        }
                    }
                }
                CredentialAction::Rotate { version } => {
                    tracing::info!(version = %version, "credentials rotated, retiring stale workers");
                    state.credentials_version = Some(version.clone());
                    for entry in state.workers.values_mut() {
                        if entry.credentials_version.as_deref() == Some(version.as_str()) {
                            continue;
                        }
                        match entry.state {
                            WorkerState::Ready => {
                                entry.state = WorkerState::ShuttingDown;
                                to_retire.push(entry.key.clone());
                            }
                            WorkerState::Busy | WorkerState::Starting => {
                                entry.needs_restart_for_credentials = true;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        for key in to_retire {
            self.spawn_retire(key, true);
        }
    }

    // ── Eviction tick ────────────────────────────────────────────────────

    /// Retire ready workers idle beyond the inactivity timeout or older
    /// than the age cap.
    pub(crate) fn run_eviction_pass(self: &Arc<Self>) {
        let now = self.clock.now();
        let mut to_retire = Vec::new();
        {
            let mut state = self.state.lock();
            for entry in state.workers.values_mut() {
                if entry.state != WorkerState::Ready {
                    continue;
                }
                let idle =
                    now.duration_since(entry.last_activity) >= self.config.inactivity_timeout;
                let old = now.duration_since(entry.created_at) >= self.config.max_age;
                if idle || old {
                    entry.state = WorkerState::ShuttingDown;
                    to_retire.push(entry.key.clone());
                }
            }
        }
        for key in to_retire {
            tracing::info!(worker_key = %key, "evicting idle or aged worker");
            self.spawn_retire(key, true);
        }
    }

    // ── Probes and snapshots ─────────────────────────────────────────────

    async fn health_check(self: &Arc<Self>, key: &WorkerKey) -> Option<WorkerHealth> {
        let (ipc, answer) = {
            let mut state = self.state.lock();
            let entry = state.workers.get_mut(key)?;
            let (tx, rx) = oneshot::channel();
            entry.health_waiter = Some(tx);
            (Arc::clone(&entry.ipc), rx)
        };
        ipc.send(&ManagerFrame::HealthCheck).await.ok()?;
        tokio::time::timeout(Duration::from_secs(5), answer)
            .await
            .ok()?
            .ok()
    }

    pub(crate) fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.lock();
        TelemetrySnapshot {
            counters: self.telemetry.counters(),
            total_workers: state.workers.len(),
            active_workers: state.active_worker_count(),
            idle_workers: state.idle_worker_count(),
            dynamic_max_workers: self.config.dynamic_max(self.load.cpu_count()),
            queued_requests: state.total_queued,
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    async fn shutdown(self: &Arc<Self>) {
        let (queued, pending, keys) = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            let mut queued = Vec::new();
            let mut queues = std::mem::take(&mut state.queues);
            for queue in queues.values_mut() {
                queued.extend(queue.drain_all());
            }
            state.queued_by_owner = Default::default();
            state.queued_by_workspace = Default::default();
            state.total_queued = 0;

            // Reject in-flight queries now; terminal frames that race the
            // teardown find no pending entry and are dropped.
            let mut pending = Vec::new();
            for entry in state.workers.values_mut() {
                for (_, query) in entry.pending.drain() {
                    pending.push(query);
                }
                entry.active_request = None;
                entry.current_owner = None;
            }
            let mut cleanups = Vec::new();
            for query in &mut pending {
                if !query.accounting_cleaned {
                    query.accounting_cleaned = true;
                    cleanups.push((query.owner.clone(), query.workspace.clone()));
                }
            }
            for (owner, workspace) in cleanups {
                state.active_by_owner.decr(owner.as_str());
                state.active_by_workspace.decr(workspace.as_str());
            }

            let keys: Vec<WorkerKey> = state.workers.keys().cloned().collect();
            (queued, pending, keys)
        };

        for (_, mut request) in queued {
            if let Some(listener) = request.cancel_listener.take() {
                listener.abort();
            }
            if let Some(resolver) = request.resolver.take() {
                let _ = resolver.send(Err(QueryError::ShuttingDown));
            }
        }
        for mut query in pending {
            if let Some(listener) = query.cancel_listener.take() {
                listener.abort();
            }
            if let Some(resolver) = query.resolver.take() {
                let _ = resolver.send(Err(QueryError::ShuttingDown));
            }
        }

        for task in self.background.lock().drain(..) {
            task.abort();
        }

        let mut teardowns = Vec::new();
        for key in keys {
            let inner = Arc::clone(self);
            teardowns.push(tokio::spawn(async move {
                inner.retire_worker(key, false).await;
            }));
        }
        for teardown in teardowns {
            let _ = teardown.await;
        }
        tracing::info!("worker pool shut down");
    }

    /// Fire-and-forget retirement.
    pub(crate) fn spawn_retire(self: &Arc<Self>, key: WorkerKey, graceful: bool) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.retire_worker(key, graceful).await;
        });
    }
}

/// A same-workspace worker that is still starting (or ready but held for
/// its spawner's first dispatch).
fn starting_worker_of(state: &PoolState, workspace: &WorkspaceKey) -> Option<WorkerKey> {
    state
        .workers
        .values()
        .find(|w| {
            w.key.workspace() == workspace
                && (w.state == WorkerState::Starting
                    || (w.state == WorkerState::Ready && w.reserved))
        })
        .map(|w| w.key.clone())
}

fn requeue_parts(mut queued: QueuedRequest) -> (QueryRequest, Resolver) {
    let resolver = queued
        .resolver
        .take()
        .unwrap_or_else(|| oneshot::channel().0);
    (
        QueryRequest {
            request_id: queued.request_id,
            owner: queued.owner,
            credentials: queued.credentials,
            payload: queued.payload,
            on_event: queued.on_event,
            cancel: queued.cancel,
        },
        resolver,
    )
}

fn unreachable_worker(key: &WorkerKey) -> ! {
    // mark_dispatch_locked is only called for keys resolved under the same
    // lock scope.
    unreachable!("dispatch for unregistered worker {key}")
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
