// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix-socket endpoints: one server per worker on the manager side, one
//! connect-once client inside the worker.

use crate::codec::{encode, NdjsonParser, ParsedLine};
use crate::frame::{FrameError, ManagerFrame, WorkerFrame};
use ap_core::WorkerKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Queue depth for inbound peer events; a full queue applies backpressure
/// to the socket read loop, never drops frames.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a peer connection produces.
#[derive(Debug)]
pub enum PeerEvent<T> {
    Frame(T),
    /// A line that failed typed decode; logged and dropped.
    Invalid { error: String },
    /// The 10 MB buffer cap was exceeded; the connection is dead.
    Overflow,
    Disconnected,
}

/// Replace every byte outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_worker_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// `<socket_dir>/worker-<sanitized-key>.sock`
pub fn socket_path(socket_dir: &Path, key: &WorkerKey) -> PathBuf {
    socket_dir.join(format!("worker-{}.sock", sanitize_worker_key(&key.to_string())))
}

/// Create the socket directory if needed and force its mode to `0700`.
pub fn ensure_socket_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

/// Read loop shared by both endpoints: chunks in, typed events out.
async fn pump<T>(mut read: OwnedReadHalf, tx: mpsc::Sender<PeerEvent<T>>)
where
    T: DeserializeOwned + Send + 'static,
{
    let mut parser = NdjsonParser::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match read.read(&mut chunk).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(PeerEvent::Disconnected).await;
                return;
            }
            Ok(n) => match parser.push::<T>(&chunk[..n]) {
                Ok(lines) => {
                    for line in lines {
                        let event = match line {
                            ParsedLine::Frame(frame) => PeerEvent::Frame(frame),
                            ParsedLine::Invalid { error, snippet } => {
                                tracing::error!(%error, snippet, "dropping invalid ipc line");
                                PeerEvent::Invalid {
                                    error: error.to_string(),
                                }
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "ipc buffer overflow, closing connection");
                    let _ = tx.send(PeerEvent::Overflow).await;
                    return;
                }
            },
        }
    }
}

async fn write_frame<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    frame: &T,
) -> Result<(), FrameError> {
    let bytes = encode(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Manager-side endpoint: owns the listener for one worker's socket.
///
/// A reconnect displaces the previous client: its read task (and with it,
/// its parser state) is dropped and the write half replaced.
pub struct IpcServer {
    path: PathBuf,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    accept_task: JoinHandle<()>,
    conn_task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl IpcServer {
    /// Bind the socket and start accepting. Returns the server handle and
    /// the inbound event stream.
    pub fn bind(path: &Path) -> std::io::Result<(Self, mpsc::Receiver<PeerEvent<WorkerFrame>>)> {
        // Stale socket from a previous run
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let writer: Arc<Mutex<Option<OwnedWriteHalf>>> = Arc::new(Mutex::new(None));
        let conn_task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let accept_task = tokio::spawn({
            let writer = Arc::clone(&writer);
            let conn_task = Arc::clone(&conn_task);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let (read, write) = stream.into_split();
                    if let Some(prev) = conn_task.lock().take() {
                        prev.abort();
                    }
                    *writer.lock().await = Some(write);
                    let handle = tokio::spawn(pump::<WorkerFrame>(read, tx.clone()));
                    *conn_task.lock() = Some(handle);
                }
            }
        });

        Ok((
            Self {
                path: path.to_path_buf(),
                writer,
                accept_task,
                conn_task,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one frame to the connected worker.
    pub async fn send(&self, frame: &ManagerFrame) -> Result<(), FrameError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(FrameError::Disconnected)?;
        write_frame(writer, frame).await
    }

    /// Stop accepting, drop the peer, and remove the socket file.
    pub fn close(&self) {
        self.accept_task.abort();
        if let Some(task) = self.conn_task.lock().take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker-side endpoint. Connects once; if the socket closes the event
/// stream yields `Disconnected` and the worker exits.
pub struct IpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pump_task: JoinHandle<()>,
}

impl IpcClient {
    pub async fn connect(
        path: &Path,
    ) -> std::io::Result<(Self, mpsc::Receiver<PeerEvent<ManagerFrame>>)> {
        let stream = UnixStream::connect(path).await?;
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pump_task = tokio::spawn(pump::<ManagerFrame>(read, tx));
        Ok((
            Self {
                writer: Mutex::new(write),
                pump_task,
            },
            rx,
        ))
    }

    pub async fn send(&self, frame: &WorkerFrame) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut writer, frame).await
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

#[cfg(test)]
#[path = "socket_tests.rs"]
mod tests;
