// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The worker request loop.
//!
//! Startup order is strict: connect the socket, drop privileges, send
//! `ready`. After that the loop dispatches manager frames until shutdown
//! or disconnect. One query runs at a time; its terminal frame is sent
//! from the loop itself so the busy flag clears only after the frame is
//! on the wire.

use crate::agent::{AgentError, AgentEvent, AgentRunner};
use crate::envprep;
use crate::privileges::{self, PrivilegeError};
use ap_core::{AgentResult, QueryPayload, RequestId};
use ap_ipc::{FrameError, IpcClient, ManagerFrame, PeerEvent, WorkerFrame};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Spawn-time environment contract with the manager.
pub const TARGET_UID_VAR: &str = "TARGET_UID";
pub const TARGET_GID_VAR: &str = "TARGET_GID";
pub const TARGET_CWD_VAR: &str = "TARGET_CWD";
pub const SOCKET_PATH_VAR: &str = "WORKER_SOCKET_PATH";
pub const WORKSPACE_KEY_VAR: &str = "WORKER_WORKSPACE_KEY";

#[derive(Debug, Error)]
pub enum WorkerRunError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for environment variable {0}")]
    InvalidEnv(&'static str),
    #[error("socket connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error(transparent)]
    Privileges(#[from] PrivilegeError),
    #[error(transparent)]
    Ipc(#[from] FrameError),
    #[error("manager disconnected")]
    Disconnected,
    #[error("ipc buffer overflow")]
    Overflow,
}

/// Inputs the manager passes at spawn time.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub uid: u32,
    pub gid: u32,
    pub workdir: PathBuf,
    pub socket_path: PathBuf,
    pub workspace_key: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerRunError> {
        Ok(Self {
            uid: parse_env(TARGET_UID_VAR)?,
            gid: parse_env(TARGET_GID_VAR)?,
            workdir: PathBuf::from(require_env(TARGET_CWD_VAR)?),
            socket_path: PathBuf::from(require_env(SOCKET_PATH_VAR)?),
            workspace_key: require_env(WORKSPACE_KEY_VAR)?,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, WorkerRunError> {
    std::env::var(key).map_err(|_| WorkerRunError::MissingEnv(key))
}

fn parse_env(key: &'static str) -> Result<u32, WorkerRunError> {
    require_env(key)?
        .parse()
        .map_err(|_| WorkerRunError::InvalidEnv(key))
}

struct ActiveQuery {
    request_id: RequestId,
    token: CancellationToken,
}

/// Connect, drop privileges, announce readiness, and serve queries until
/// the manager says stop.
pub async fn run<A: AgentRunner>(config: WorkerConfig, runner: A) -> Result<(), WorkerRunError> {
    // Connect while the socket directory is still readable; after setuid
    // the 0700 directory belongs to someone else.
    let (client, mut frames) = IpcClient::connect(&config.socket_path)
        .await
        .map_err(WorkerRunError::Connect)?;

    privileges::drop_privileges(config.uid, config.gid, &config.workdir)?;

    let client = Arc::new(client);
    client.send(&WorkerFrame::Ready).await?;
    let ready_at = Instant::now();
    tracing::info!(
        workspace_key = %config.workspace_key,
        uid = config.uid,
        "worker ready"
    );

    let runner = Arc::new(runner);
    let mut active: Option<ActiveQuery> = None;
    let mut queries_processed: u64 = 0;
    // Terminal frames come back to the loop so the busy flag clears only
    // after the frame is sent.
    let (done_tx, mut done_rx) = mpsc::channel::<(RequestId, Option<WorkerFrame>)>(4);

    loop {
        tokio::select! {
            done = done_rx.recv() => {
                let Some((request_id, terminal)) = done else { continue };
                let frame = terminal.unwrap_or_else(|| WorkerFrame::Error {
                    request_id: request_id.clone(),
                    error: "query task failed unexpectedly".to_string(),
                    stack: None,
                    stderr: None,
                    diagnostics: None,
                });
                if let Err(err) = client.send(&frame).await {
                    tracing::error!(%err, request_id = %request_id, "failed to send terminal frame");
                }
                if active.as_ref().is_some_and(|q| q.request_id == request_id) {
                    active = None;
                }
                queries_processed += 1;
            }

            event = frames.recv() => {
                match event {
                    Some(PeerEvent::Frame(ManagerFrame::Query { request_id, payload })) => {
                        if active.is_some() {
                            let _ = client.send(&WorkerFrame::Error {
                                request_id,
                                error: "Worker busy".to_string(),
                                stack: None,
                                stderr: None,
                                diagnostics: None,
                            }).await;
                        } else {
                            let token = CancellationToken::new();
                            active = Some(ActiveQuery {
                                request_id: request_id.clone(),
                                token: token.clone(),
                            });
                            start_query(
                                Arc::clone(&client),
                                Arc::clone(&runner),
                                request_id,
                                payload,
                                token,
                                done_tx.clone(),
                            );
                        }
                    }
                    Some(PeerEvent::Frame(ManagerFrame::Cancel { request_id })) => {
                        match &active {
                            Some(query) if query.request_id == request_id => {
                                tracing::info!(request_id = %request_id, "cancelling active query");
                                query.token.cancel();
                            }
                            _ => {
                                tracing::warn!(request_id = %request_id, "cancel for unknown request");
                            }
                        }
                        // No direct response; the agent's stream end
                        // produces the terminal frame.
                    }
                    Some(PeerEvent::Frame(ManagerFrame::Shutdown { graceful })) => {
                        let _ = client.send(&WorkerFrame::ShutdownAck).await;
                        tracing::info!(graceful, queries_processed, "worker shutting down");
                        return Ok(());
                    }
                    Some(PeerEvent::Frame(ManagerFrame::HealthCheck)) => {
                        let _ = client.send(&WorkerFrame::HealthOk {
                            uptime_ms: ready_at.elapsed().as_millis() as u64,
                            queries_processed,
                        }).await;
                    }
                    Some(PeerEvent::Invalid { error }) => {
                        tracing::error!(%error, "dropping invalid frame from manager");
                    }
                    Some(PeerEvent::Overflow) => return Err(WorkerRunError::Overflow),
                    Some(PeerEvent::Disconnected) | None => {
                        // The worker never reconnects.
                        return Err(WorkerRunError::Disconnected);
                    }
                }
            }
        }
    }
}

/// Run one query on its own task; deliver the terminal frame back through
/// `done_tx`. A panicking task yields `None`, which the loop converts to
/// an `error` frame so the exactly-one-terminal invariant survives
/// unexpected failure paths.
fn start_query<A: AgentRunner>(
    client: Arc<IpcClient>,
    runner: Arc<A>,
    request_id: RequestId,
    payload: QueryPayload,
    token: CancellationToken,
    done_tx: mpsc::Sender<(RequestId, Option<WorkerFrame>)>,
) {
    let task = tokio::spawn(execute_query(client, runner, request_id.clone(), payload, token));
    tokio::spawn(async move {
        let terminal = task.await.ok();
        let _ = done_tx.send((request_id, terminal)).await;
    });
}

async fn execute_query<A: AgentRunner>(
    client: Arc<IpcClient>,
    runner: Arc<A>,
    request_id: RequestId,
    payload: QueryPayload,
    token: CancellationToken,
) -> WorkerFrame {
    let summary = envprep::prepare_environment(&payload);
    tracing::info!(
        request_id = %request_id,
        auth_source = ?summary.auth_source,
        user_keys = summary.user_keys_installed,
        "query starting"
    );

    let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(64);
    let forwarder = tokio::spawn(forward_events(
        Arc::clone(&client),
        request_id.clone(),
        event_rx,
    ));

    let outcome = runner.run(&payload, token.clone(), event_tx).await;
    // The runner dropped its sender; the forwarder drains and reports how
    // many message frames went out.
    let total_messages = forwarder.await.unwrap_or(0);

    match outcome {
        Ok(outcome) => WorkerFrame::Complete {
            request_id,
            result: AgentResult {
                kind: "result".to_string(),
                total_messages,
                result: outcome.result,
                cancelled: token.is_cancelled(),
            },
        },
        Err(AgentError::Failed {
            message,
            stack,
            stderr,
            diagnostics,
        }) => WorkerFrame::Error {
            request_id,
            error: message,
            stack,
            stderr,
            diagnostics,
        },
        Err(AgentError::Io(err)) => WorkerFrame::Error {
            request_id,
            error: err.to_string(),
            stack: None,
            stderr: None,
            diagnostics: None,
        },
    }
}

async fn forward_events(
    client: Arc<IpcClient>,
    request_id: RequestId,
    mut events: mpsc::Receiver<AgentEvent>,
) -> u64 {
    let mut total = 0u64;
    while let Some(event) = events.recv().await {
        let frame = match event {
            AgentEvent::Session { session_id } => WorkerFrame::Session {
                request_id: request_id.clone(),
                session_id,
            },
            AgentEvent::Message { content } => {
                total += 1;
                WorkerFrame::Message {
                    request_id: request_id.clone(),
                    content,
                }
            }
        };
        if client.send(&frame).await.is_err() {
            break;
        }
    }
    total
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
