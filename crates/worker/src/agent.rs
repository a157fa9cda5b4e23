// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The agent seam: what the worker actually runs.
//!
//! The runtime treats the agent as a function from a payload and a
//! cancellation token to a stream of events plus an outcome. The shipped
//! [`CliAgentRunner`] spawns the agent CLI in its own process group and
//! forwards its NDJSON stdout; tests use a scripted runner.

use ap_core::QueryPayload;
use async_trait::async_trait;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One event produced by the agent while it works.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The agent opened (or resumed) a session.
    Session { session_id: String },
    /// Opaque content forwarded verbatim to the caller.
    Message { content: serde_json::Value },
}

/// What the agent ends with on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
        stderr: Option<String>,
        diagnostics: Option<serde_json::Value>,
    },
    #[error("agent process error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn failed(message: impl Into<String>) -> Self {
        AgentError::Failed {
            message: message.into(),
            stack: None,
            stderr: None,
            diagnostics: None,
        }
    }
}

/// The function the worker runtime invokes once per query.
///
/// Implementations emit events through `events` as they happen and return
/// the outcome when the stream ends. On cancellation they must stop
/// producing events and return promptly; whether they return `Ok` or
/// `Err` the runtime still emits exactly one terminal frame.
#[async_trait]
pub trait AgentRunner: Send + Sync + 'static {
    async fn run(
        &self,
        payload: &QueryPayload,
        cancel: CancellationToken,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentOutcome, AgentError>;
}

/// Runs the agent CLI as a subprocess.
///
/// The child is its own process-group leader so cancellation can signal
/// the whole tree; the CLI spawns subprocesses of its own (MCP servers
/// and the like) which a single-pid kill would leave behind.
pub struct CliAgentRunner {
    command: String,
}

impl CliAgentRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn build_args(payload: &QueryPayload) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            payload.message.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(model) = &payload.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(prompt) = &payload.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }
        if let Some(session) = &payload.resume_session_id {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        // The agent-config blob is opaque to the manager; the worker honors
        // its extraArgs passthrough.
        if let Some(extra) = payload
            .agent_config
            .as_ref()
            .and_then(|config| config.get("extraArgs"))
            .and_then(|value| value.as_array())
        {
            args.extend(extra.iter().filter_map(|a| a.as_str().map(String::from)));
        }
        args
    }
}

impl Default for CliAgentRunner {
    fn default() -> Self {
        Self::new("claude")
    }
}

/// Kill an agent process group, falling back to the single pid when the
/// group leader is already gone.
fn kill_agent_tree(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    if killpg(pid, Signal::SIGKILL).is_err() {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(
        &self,
        payload: &QueryPayload,
        cancel: CancellationToken,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentOutcome, AgentError> {
        let mut command = std::process::Command::new(&self.command);
        command
            .args(Self::build_args(payload))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = tokio::process::Command::from(command).spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::failed("agent stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::failed("agent stderr unavailable"))?;
        let child_pid = child.id();

        let mut lines = BufReader::new(stdout).lines();
        let mut outcome = AgentOutcome::default();
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    if let Some(pid) = child_pid {
                        kill_agent_tree(pid);
                    }
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                        tracing::warn!(len = line.len(), "dropping unparseable agent output line");
                        continue;
                    };
                    if let Some(session_id) = value
                        .get("session_id")
                        .and_then(|s| s.as_str())
                        .filter(|_| value.get("type").and_then(|t| t.as_str()) == Some("system"))
                    {
                        let _ = events
                            .send(AgentEvent::Session { session_id: session_id.to_string() })
                            .await;
                        continue;
                    }
                    if value.get("type").and_then(|t| t.as_str()) == Some("result") {
                        outcome.result = Some(value.clone());
                    }
                    let _ = events.send(AgentEvent::Message { content: value }).await;
                }
            }
        }

        let status = child.wait().await?;
        if cancelled || status.success() {
            return Ok(outcome);
        }

        let mut err_text = String::new();
        let _ = stderr.read_to_string(&mut err_text).await;
        Err(AgentError::Failed {
            message: format!("agent exited with {status}"),
            stack: None,
            stderr: (!err_text.is_empty()).then_some(err_text),
            diagnostics: None,
        })
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
