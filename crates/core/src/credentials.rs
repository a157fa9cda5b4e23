// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace credentials: the effective identity a worker runs under.

use crate::id::WorkspaceKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Rejection reasons for submitted credentials.
///
/// These are reported synchronously to the caller and never logged as
/// errors; no worker is touched on a validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    #[error("workspace key must not be empty")]
    EmptyWorkspaceKey,
    #[error("owner key must not be empty")]
    EmptyOwnerKey,
    #[error("working directory must be absolute: {0}")]
    RelativeWorkdir(PathBuf),
    #[error("working directory outside sites root: {0}")]
    WorkdirOutsideRoot(PathBuf),
}

/// The unique effective identity under which a worker runs.
///
/// Two workers share an identity iff their workspace keys are equal; the
/// uid/gid/workdir triple is what the worker binary actually applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceCredentials {
    pub uid: u32,
    pub gid: u32,
    pub workdir: PathBuf,
    pub workspace_key: WorkspaceKey,
}

impl WorkspaceCredentials {
    /// Validate credentials on submission.
    ///
    /// The working directory must be an absolute path inside `sites_root`,
    /// or equal the designated admin workspace directory.
    pub fn validate(
        &self,
        sites_root: &Path,
        admin_workdir: &Path,
    ) -> Result<(), CredentialsError> {
        if self.workspace_key.as_str().is_empty() {
            return Err(CredentialsError::EmptyWorkspaceKey);
        }
        if !self.workdir.is_absolute() {
            return Err(CredentialsError::RelativeWorkdir(self.workdir.clone()));
        }
        if self.workdir == admin_workdir {
            return Ok(());
        }
        if !self.workdir.starts_with(sites_root) {
            return Err(CredentialsError::WorkdirOutsideRoot(self.workdir.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;
