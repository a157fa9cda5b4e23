// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-shot privilege drop to the workspace identity.

use nix::unistd::{chdir, setgid, setuid, Gid, Uid};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("setgid({gid}) failed: {source}")]
    Setgid { gid: u32, source: nix::Error },
    #[error("setuid({uid}) failed: {source}")]
    Setuid { uid: u32, source: nix::Error },
    #[error("chdir({path}) failed: {source}")]
    Chdir { path: String, source: nix::Error },
}

/// Drop to the target identity: setgid, then setuid, then chdir.
///
/// The order is load-bearing: the group must change while we are still
/// privileged, and the socket connection must already be open because
/// after setuid the socket directory is unreadable. Callers exit non-zero
/// on any failure, before sending `ready`.
pub fn drop_privileges(uid: u32, gid: u32, workdir: &Path) -> Result<(), PrivilegeError> {
    setgid(Gid::from_raw(gid)).map_err(|source| PrivilegeError::Setgid { gid, source })?;
    setuid(Uid::from_raw(uid)).map_err(|source| PrivilegeError::Setuid { uid, source })?;
    chdir(workdir).map_err(|source| PrivilegeError::Chdir {
        path: workdir.display().to_string(),
        source,
    })?;
    Ok(())
}
