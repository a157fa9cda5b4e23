// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ap-ipc: framed IPC between the manager and its workers.
//!
//! Wire format: UTF-8 NDJSON over a Unix-domain socket. One JSON object
//! per line, `\n`-terminated, no embedded newlines, at most 10 MB buffered
//! per peer.

pub mod codec;
pub mod frame;
pub mod socket;

pub use codec::{NdjsonParser, ParsedLine, MAX_BUFFERED_BYTES};
pub use frame::{FrameError, ManagerFrame, WorkerFrame};
pub use socket::{
    ensure_socket_dir, sanitize_worker_key, socket_path, IpcClient, IpcServer, PeerEvent,
};
