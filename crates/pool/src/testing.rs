// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test doubles: an in-process worker speaking the real IPC protocol, a
//! pinned load probe, and a scriptable credential source.

use crate::credwatch::{CredentialCheck, CredentialSource};
use crate::launcher::{LaunchedWorker, SpawnError, WorkerLauncher};
use ap_core::{AgentResult, PoolConfig, RequestId, WorkerKey, WorkspaceCredentials, WorkspaceKey};
use ap_ipc::{IpcClient, ManagerFrame, PeerEvent, WorkerFrame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Script for stub workers: what each spawned worker does per query.
#[derive(Debug, Clone)]
pub struct StubBehavior {
    /// Session id announced at query start.
    pub session_id: Option<String>,
    /// Number of `message` frames per query.
    pub messages: usize,
    /// Pause between messages, so cancels can land mid-stream.
    pub message_delay: Duration,
    /// Fail queries with this error instead of completing.
    pub fail_with: Option<String>,
    /// Hold the connection open after the terminal frame (exercises
    /// early lock release ahead of teardown).
    pub linger_after_terminal: Duration,
    /// Emit messages, then wait for a cancel before finishing.
    pub run_until_cancelled: bool,
    /// Never send `ready` (exercises the startup timeout).
    pub never_ready: bool,
    /// Drop the connection after this many messages, without a terminal
    /// frame (exercises crash handling).
    pub crash_after_messages: Option<usize>,
    /// Payload of the `complete` frame's result object.
    pub result: Option<serde_json::Value>,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            session_id: Some("stub-session".to_string()),
            messages: 1,
            message_delay: Duration::ZERO,
            fail_with: None,
            linger_after_terminal: Duration::ZERO,
            run_until_cancelled: false,
            never_ready: false,
            crash_after_messages: None,
            result: None,
        }
    }
}

/// Launches stub workers as tokio tasks against the real socket.
pub struct StubLauncher {
    behavior: Mutex<StubBehavior>,
}

impl StubLauncher {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
        }
    }

    /// Change the script for workers spawned after this call.
    pub fn set_behavior(&self, behavior: StubBehavior) {
        *self.behavior.lock() = behavior;
    }
}

#[async_trait]
impl WorkerLauncher for StubLauncher {
    async fn launch(
        &self,
        key: &WorkerKey,
        _credentials: &WorkspaceCredentials,
        socket_path: &Path,
    ) -> Result<LaunchedWorker, SpawnError> {
        let behavior = self.behavior.lock().clone();
        let path = socket_path.to_path_buf();
        let key = key.clone();
        let task = tokio::spawn(async move {
            run_stub(key, path, behavior).await;
        });
        Ok(LaunchedWorker {
            pid: None,
            exited: Box::pin(async move {
                let _ = task.await;
            }),
        })
    }
}

#[async_trait]
impl WorkerLauncher for Arc<StubLauncher> {
    async fn launch(
        &self,
        key: &WorkerKey,
        credentials: &WorkspaceCredentials,
        socket_path: &Path,
    ) -> Result<LaunchedWorker, SpawnError> {
        StubLauncher::launch(self, key, credentials, socket_path).await
    }
}

async fn run_stub(key: WorkerKey, path: PathBuf, behavior: StubBehavior) {
    let Ok((client, mut frames)) = IpcClient::connect(&path).await else {
        return;
    };
    tracing::debug!(worker_key = %key, "stub worker connected");

    if behavior.never_ready {
        while frames.recv().await.is_some() {}
        return;
    }
    if client.send(&WorkerFrame::Ready).await.is_err() {
        return;
    }

    let mut queries_processed = 0u64;
    loop {
        match frames.recv().await {
            Some(PeerEvent::Frame(ManagerFrame::Query { request_id, .. })) => {
                if serve_query(&client, &mut frames, &behavior, request_id).await == Served::Crash {
                    return;
                }
                queries_processed += 1;
            }
            Some(PeerEvent::Frame(ManagerFrame::Shutdown { .. })) => {
                let _ = client.send(&WorkerFrame::ShutdownAck).await;
                return;
            }
            Some(PeerEvent::Frame(ManagerFrame::HealthCheck)) => {
                let _ = client
                    .send(&WorkerFrame::HealthOk {
                        uptime_ms: 1,
                        queries_processed,
                    })
                    .await;
            }
            Some(PeerEvent::Frame(ManagerFrame::Cancel { .. })) => {}
            Some(_) => {}
            None => return,
        }
    }
}

#[derive(PartialEq)]
enum Served {
    Done,
    Crash,
}

async fn serve_query(
    client: &IpcClient,
    frames: &mut mpsc::Receiver<PeerEvent<ManagerFrame>>,
    behavior: &StubBehavior,
    request_id: RequestId,
) -> Served {
    if let Some(session_id) = &behavior.session_id {
        let _ = client
            .send(&WorkerFrame::Session {
                request_id: request_id.clone(),
                session_id: session_id.clone(),
            })
            .await;
    }

    let mut cancelled = false;
    let mut sent = 0u64;
    for seq in 0..behavior.messages {
        drain_cancel(frames, &request_id, &mut cancelled);
        if cancelled {
            break;
        }
        if behavior.crash_after_messages == Some(seq) {
            return Served::Crash;
        }
        if client
            .send(&WorkerFrame::Message {
                request_id: request_id.clone(),
                content: serde_json::json!({ "seq": seq }),
            })
            .await
            .is_err()
        {
            return Served::Done;
        }
        sent += 1;
        if !behavior.message_delay.is_zero() {
            tokio::time::sleep(behavior.message_delay).await;
        }
    }
    if behavior.crash_after_messages == Some(behavior.messages) {
        return Served::Crash;
    }

    if behavior.run_until_cancelled && !cancelled {
        loop {
            match frames.recv().await {
                Some(PeerEvent::Frame(ManagerFrame::Cancel { request_id: rid }))
                    if rid == request_id =>
                {
                    cancelled = true;
                    break;
                }
                Some(PeerEvent::Frame(ManagerFrame::Shutdown { .. })) => {
                    let _ = client.send(&WorkerFrame::ShutdownAck).await;
                    cancelled = true;
                    break;
                }
                Some(_) => {}
                None => return Served::Done,
            }
        }
    }

    let terminal = match &behavior.fail_with {
        Some(error) => WorkerFrame::Error {
            request_id,
            error: error.clone(),
            stack: None,
            stderr: Some("stub stderr".to_string()),
            diagnostics: None,
        },
        None => WorkerFrame::Complete {
            request_id,
            result: AgentResult {
                kind: "result".to_string(),
                total_messages: sent,
                result: behavior.result.clone(),
                cancelled,
            },
        },
    };
    let _ = client.send(&terminal).await;

    if !behavior.linger_after_terminal.is_zero() {
        tokio::time::sleep(behavior.linger_after_terminal).await;
    }
    Served::Done
}

fn drain_cancel(
    frames: &mut mpsc::Receiver<PeerEvent<ManagerFrame>>,
    request_id: &RequestId,
    cancelled: &mut bool,
) {
    while let Ok(event) = frames.try_recv() {
        if let PeerEvent::Frame(ManagerFrame::Cancel { request_id: rid }) = event {
            if &rid == request_id {
                *cancelled = true;
            }
        }
    }
}

/// Load probe pinned by the test.
#[derive(Clone)]
pub struct FixedLoadProbe {
    load: Arc<Mutex<f64>>,
    cpus: usize,
}

impl FixedLoadProbe {
    pub fn new(load: f64, cpus: usize) -> Self {
        Self {
            load: Arc::new(Mutex::new(load)),
            cpus,
        }
    }

    pub fn set_load(&self, load: f64) {
        *self.load.lock() = load;
    }
}

impl crate::admission::LoadProbe for FixedLoadProbe {
    fn one_minute(&self) -> f64 {
        *self.load.lock()
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }
}

/// Credential source answering from memory.
#[derive(Clone, Default)]
pub struct StaticCredentialSource {
    check: Arc<Mutex<Option<CredentialCheck>>>,
}

impl StaticCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, version: impl Into<String>, permissions_repaired: bool) {
        *self.check.lock() = Some(CredentialCheck {
            version: version.into(),
            permissions_repaired,
        });
    }

    pub fn clear(&self) {
        *self.check.lock() = None;
    }
}

impl CredentialSource for StaticCredentialSource {
    fn check(&self) -> std::io::Result<Option<CredentialCheck>> {
        Ok(self.check.lock().clone())
    }
}

/// Pool config rooted in a temp directory, with test-friendly timings.
pub fn test_config(dir: &Path) -> PoolConfig {
    PoolConfig {
        socket_dir: dir.join("sockets"),
        sites_root: PathBuf::from("/srv/sites"),
        admin_workdir: PathBuf::from("/srv/admin"),
        ready_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_millis(200),
        kill_grace: Duration::from_millis(100),
        ..PoolConfig::default()
    }
}

/// Credentials for a workspace under the test sites root.
pub fn test_credentials(workspace: &str) -> WorkspaceCredentials {
    WorkspaceCredentials {
        uid: 1000,
        gid: 1000,
        workdir: PathBuf::from("/srv/sites").join(workspace),
        workspace_key: WorkspaceKey::new(workspace),
    }
}
