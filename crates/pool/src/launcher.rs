// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker process launching.
//!
//! The supervisor prepares the IPC socket first, then asks a launcher to
//! start the worker against it. Production uses [`ProcessLauncher`];
//! tests use an in-process stub speaking the same protocol.

use ap_core::{WorkerKey, WorkspaceCredentials};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Process(#[source] std::io::Error),
    #[error("socket setup failed: {0}")]
    Socket(#[source] std::io::Error),
    #[error("worker startup timed out")]
    ReadyTimeout,
    #[error("worker crashed during startup: {0}")]
    CrashedOnStartup(String),
}

/// A launched worker: its pid (when it is a real process) and a future
/// resolving when it exits.
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub exited: BoxFuture<'static, ()>,
}

/// Starts a worker for an already-bound socket endpoint.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(
        &self,
        key: &WorkerKey,
        credentials: &WorkspaceCredentials,
        socket_path: &Path,
    ) -> Result<LaunchedWorker, SpawnError>;
}

/// Spawns the worker binary as a new process-group leader with the
/// spawn-time environment contract: target identity, working directory,
/// socket path, workspace key. stdin is ignored; stdout/stderr are
/// inherited so worker logs land in the manager's log stream.
pub struct ProcessLauncher {
    worker_binary: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_binary: impl Into<PathBuf>) -> Self {
        Self {
            worker_binary: worker_binary.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        key: &WorkerKey,
        credentials: &WorkspaceCredentials,
        socket_path: &Path,
    ) -> Result<LaunchedWorker, SpawnError> {
        let mut command = std::process::Command::new(&self.worker_binary);
        command
            .env("TARGET_UID", credentials.uid.to_string())
            .env("TARGET_GID", credentials.gid.to_string())
            .env("TARGET_CWD", &credentials.workdir)
            .env("WORKER_SOCKET_PATH", socket_path)
            .env("WORKER_WORKSPACE_KEY", key.workspace().as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        {
            use std::os::unix::process::CommandExt;
            // Group leader, so termination can signal -pid.
            command.process_group(0);
        }

        let mut child = tokio::process::Command::from(command)
            .spawn()
            .map_err(SpawnError::Process)?;
        let pid = child.id();
        tracing::info!(worker_key = %key, pid, "worker process spawned");

        let exited: BoxFuture<'static, ()> = Box::pin(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(%status, "worker process exited");
                }
                Err(err) => {
                    tracing::error!(%err, "failed waiting on worker process");
                }
            }
        });

        Ok(LaunchedWorker { pid, exited })
    }
}
