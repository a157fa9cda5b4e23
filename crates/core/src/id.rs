// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed identifiers for requests, owners, workspaces, and workers.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of one live query; unique while the request is in flight.
    RequestId
}

string_id! {
    /// The authenticated principal billed and rate-limited for a request.
    OwnerKey
}

string_id! {
    /// Opaque key of an isolated filesystem-and-identity unit.
    WorkspaceKey
}

/// Identifier of a spawned worker instance: `<workspace>:<instance>`.
///
/// The instance id distinguishes concurrent workers of the same workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerKey {
    workspace: WorkspaceKey,
    instance: u64,
}

impl WorkerKey {
    pub fn new(workspace: WorkspaceKey, instance: u64) -> Self {
        Self { workspace, instance }
    }

    pub fn workspace(&self) -> &WorkspaceKey {
        &self.workspace
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workspace, self.instance)
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
