// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker binary entry point.
//!
//! All initialization happens up front; after the privilege drop inside
//! `runtime::run` the process cannot load anything new from disk.

use ap_worker::{runtime, CliAgentRunner, WorkerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "worker misconfigured");
            std::process::exit(2);
        }
    };

    let agent_cli = std::env::var("AP_AGENT_CLI").unwrap_or_else(|_| "claude".to_string());
    let runner = CliAgentRunner::new(agent_cli);

    if let Err(err) = runtime::run(config, runner).await {
        tracing::error!(%err, "worker exited abnormally");
        std::process::exit(1);
    }
}
