// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ap-worker: the long-lived worker process.
//!
//! A worker is spawned by the pool manager, connects to its Unix socket,
//! drops privileges to the workspace identity, and then executes one
//! agent query at a time until told to shut down.
//!
//! Everything the worker needs from the filesystem must be reachable
//! before the privilege drop; nothing on the query path loads modules or
//! opens manager-owned files.

pub mod agent;
pub mod envprep;
pub mod privileges;
pub mod runtime;

pub use agent::{AgentError, AgentEvent, AgentOutcome, AgentRunner, CliAgentRunner};
pub use envprep::{prepare_environment, AuthSource, EnvSummary};
pub use privileges::{drop_privileges, PrivilegeError};
pub use runtime::{run, WorkerConfig, WorkerRunError};
