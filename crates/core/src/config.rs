// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pool configuration: the closed set of tuning knobs plus the filesystem
//! layout the manager operates in.
//!
//! Every knob has a default and an `AP_*` environment override, parsed the
//! same way throughout: unparseable values fall back to the default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which ready worker to evict when the pool is at its dynamic maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Least recently active.
    #[default]
    Lru,
    /// Oldest by spawn time.
    Oldest,
    /// Fewest queries processed.
    LeastUsed,
}

/// Tuning knobs and paths for one pool instance.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Absolute upper bound on simultaneously-alive workers.
    pub max_workers: usize,
    /// Dynamic cap multiplier applied to the cpu count.
    pub workers_per_core: f64,
    /// Active-query cap per owner key.
    pub max_workers_per_user: usize,
    /// Active-query cap per workspace key.
    pub max_workers_per_workspace: usize,
    /// Queue admission thresholds.
    pub max_queued_per_user: usize,
    pub max_queued_per_workspace: usize,
    pub max_queued_global: usize,
    /// 1-minute load-average multiplier above which new spawns defer.
    pub load_shed_threshold: f64,
    /// Retire ready workers idle beyond this.
    pub inactivity_timeout: Duration,
    /// Retire workers older than this regardless of activity.
    pub max_age: Duration,
    /// How long to wait for a spawned worker's `ready` frame.
    pub ready_timeout: Duration,
    /// How long to wait for a graceful shutdown before escalating.
    pub shutdown_timeout: Duration,
    /// Gap between SIGTERM and SIGKILL on a process group.
    pub kill_grace: Duration,
    /// Orphan reaper tuning.
    pub orphan_sweep_interval: Duration,
    pub orphan_max_age: Duration,
    /// Eviction policy when at the dynamic maximum.
    pub eviction_strategy: EvictionStrategy,

    /// Directory holding per-worker sockets; created with mode 0700.
    pub socket_dir: PathBuf,
    /// Root under which workspace working directories must live.
    pub sites_root: PathBuf,
    /// The one working directory allowed outside `sites_root`.
    pub admin_workdir: PathBuf,
    /// Shared OAuth credentials file watched for rotation.
    pub credentials_path: PathBuf,
    /// Worker binary launched per spawn.
    pub worker_binary: PathBuf,
    /// Agent CLI command name, matched by the orphan sweeper.
    pub agent_cli: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let credentials_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".claude/.credentials.json");
        Self {
            max_workers: 32,
            workers_per_core: 2.0,
            max_workers_per_user: 2,
            max_workers_per_workspace: 4,
            max_queued_per_user: 5,
            max_queued_per_workspace: 20,
            max_queued_global: 100,
            load_shed_threshold: 1.5,
            inactivity_timeout: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(60 * 60),
            ready_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_millis(2_000),
            orphan_sweep_interval: Duration::from_secs(5 * 60),
            orphan_max_age: Duration::from_secs(10 * 60),
            eviction_strategy: EvictionStrategy::default(),
            socket_dir: PathBuf::from("/run/agent-pool"),
            sites_root: PathBuf::from("/srv/sites"),
            admin_workdir: PathBuf::from("/srv/admin"),
            credentials_path,
            worker_binary: PathBuf::from("ap-worker"),
            agent_cli: "claude".to_string(),
        }
    }
}

impl PoolConfig {
    /// Defaults overlaid with any `AP_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.max_workers = env_usize("AP_MAX_WORKERS", cfg.max_workers);
        cfg.workers_per_core = env_f64("AP_WORKERS_PER_CORE", cfg.workers_per_core);
        cfg.max_workers_per_user = env_usize("AP_MAX_WORKERS_PER_USER", cfg.max_workers_per_user);
        cfg.max_workers_per_workspace =
            env_usize("AP_MAX_WORKERS_PER_WORKSPACE", cfg.max_workers_per_workspace);
        cfg.max_queued_per_user = env_usize("AP_MAX_QUEUED_PER_USER", cfg.max_queued_per_user);
        cfg.max_queued_per_workspace =
            env_usize("AP_MAX_QUEUED_PER_WORKSPACE", cfg.max_queued_per_workspace);
        cfg.max_queued_global = env_usize("AP_MAX_QUEUED_GLOBAL", cfg.max_queued_global);
        cfg.load_shed_threshold = env_f64("AP_LOAD_SHED_THRESHOLD", cfg.load_shed_threshold);
        cfg.inactivity_timeout = env_ms("AP_INACTIVITY_TIMEOUT_MS", cfg.inactivity_timeout);
        cfg.max_age = env_ms("AP_MAX_AGE_MS", cfg.max_age);
        cfg.ready_timeout = env_ms("AP_READY_TIMEOUT_MS", cfg.ready_timeout);
        cfg.shutdown_timeout = env_ms("AP_SHUTDOWN_TIMEOUT_MS", cfg.shutdown_timeout);
        cfg.kill_grace = env_ms("AP_KILL_GRACE_MS", cfg.kill_grace);
        cfg.orphan_sweep_interval =
            env_ms("AP_ORPHAN_SWEEP_INTERVAL_MS", cfg.orphan_sweep_interval);
        cfg.orphan_max_age = env_ms("AP_ORPHAN_MAX_AGE_MS", cfg.orphan_max_age);
        if let Ok(strategy) = std::env::var("AP_EVICTION_STRATEGY") {
            cfg.eviction_strategy = match strategy.as_str() {
                "oldest" => EvictionStrategy::Oldest,
                "least_used" => EvictionStrategy::LeastUsed,
                _ => EvictionStrategy::Lru,
            };
        }
        if let Ok(dir) = std::env::var("AP_SOCKET_DIR") {
            cfg.socket_dir = PathBuf::from(dir);
        }
        if let Ok(root) = std::env::var("AP_SITES_ROOT") {
            cfg.sites_root = PathBuf::from(root);
        }
        if let Ok(path) = std::env::var("AP_CREDENTIALS_PATH") {
            cfg.credentials_path = PathBuf::from(path);
        }
        if let Ok(bin) = std::env::var("AP_WORKER_BINARY") {
            cfg.worker_binary = PathBuf::from(bin);
        }
        cfg
    }

    /// `min(max_workers, max(4, floor(cpu_count × workers_per_core)))`
    pub fn dynamic_max(&self, cpu_count: usize) -> usize {
        let scaled = (cpu_count as f64 * self.workers_per_core).floor() as usize;
        self.max_workers.min(scaled.max(4))
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
