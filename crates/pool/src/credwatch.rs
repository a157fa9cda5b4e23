// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential-file watching.
//!
//! The shared OAuth credentials file is stat'ed at most once per second
//! from the submission path. Any observed change retires stale workers:
//! idle ones immediately, busy ones when their current query finishes.

use serde::Serialize;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

/// Result of one credentials-file probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialCheck {
    /// `"<mtime-ms>:<size>"`; any change is treated as rotation.
    pub version: String,
    /// Whether traversal or read bits had to be added.
    pub permissions_repaired: bool,
}

/// Reads a version token for the credentials file.
pub trait CredentialSource: Send + Sync + 'static {
    /// `Ok(None)` when the file does not exist (nothing to watch).
    fn check(&self) -> io::Result<Option<CredentialCheck>>;
}

/// The production source: stat the file, repair read permissions in
/// place when they are too restrictive, and derive the version string.
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for FileCredentialSource {
    fn check(&self) -> io::Result<Option<CredentialCheck>> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut repaired = false;

        // Workers run under workspace identities; they need traversal
        // through the parent directories and read on the file itself.
        for dir in self.path.ancestors().skip(1) {
            let Ok(dir_meta) = std::fs::metadata(dir) else {
                continue;
            };
            let mode = dir_meta.permissions().mode();
            if mode & 0o011 != 0o011 {
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode | 0o011))?;
                repaired = true;
            }
        }

        let mode = meta.permissions().mode();
        if mode & 0o044 != 0o044 {
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode | 0o044))?;
            repaired = true;
        }

        let mtime_ms = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let version = format!("{}:{}", mtime_ms, meta.len());

        Ok(Some(CredentialCheck {
            version,
            permissions_repaired: repaired,
        }))
    }
}

/// What a probe result means given the currently-recorded version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CredentialAction {
    /// No change; nothing to do.
    Unchanged,
    /// First observation with sound permissions: record the version and
    /// seed workers that have none, without retiring anyone.
    Seed { version: String },
    /// Version changed or permissions had to be repaired: record the new
    /// version and retire stale workers.
    Rotate { version: String },
}

pub(crate) fn evaluate(recorded: Option<&str>, check: &CredentialCheck) -> CredentialAction {
    match recorded {
        None if !check.permissions_repaired => CredentialAction::Seed {
            version: check.version.clone(),
        },
        None => CredentialAction::Rotate {
            version: check.version.clone(),
        },
        Some(version) if version != check.version || check.permissions_repaired => {
            CredentialAction::Rotate {
                version: check.version.clone(),
            }
        }
        Some(_) => CredentialAction::Unchanged,
    }
}

#[cfg(test)]
#[path = "credwatch_tests.rs"]
mod tests;
