// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-request environment isolation.
//!
//! Runs once per `query`, before the agent is invoked. Mutates the
//! process-wide environment so that no cookie, token, or `USER_*`
//! variable from the previous request leaks into this one.

use ap_core::QueryPayload;
use serde::Serialize;

/// Variable receiving the request's session cookie, always overwritten.
pub const SESSION_COOKIE_VAR: &str = "AP_SESSION_COOKIE";

/// Variable receiving the OAuth access token for the agent.
pub const OAUTH_TOKEN_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// Alternate auth variables the agent would otherwise pick up. Set to the
/// empty string rather than deleted, so nested subprocesses cannot
/// re-inherit host defaults.
pub const ALTERNATE_AUTH_VARS: &[&str] = &["ANTHROPIC_API_KEY", "ANTHROPIC_AUTH_TOKEN"];

/// Prefix under which user-supplied keys are installed.
pub const USER_KEY_PREFIX: &str = "USER_";

/// Where the request's auth came from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    /// Caller supplied its own access token.
    UserToken,
    /// The shared OAuth credentials file.
    SharedOauth,
}

/// Summary of what was installed, for the per-query log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvSummary {
    pub auth_source: AuthSource,
    pub user_keys_installed: usize,
}

/// `^[A-Z][A-Z0-9_]*$`
fn is_valid_user_key(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some('A'..='Z') => {}
        _ => return false,
    }
    chars.all(|c| matches!(c, 'A'..='Z' | '0'..='9' | '_'))
}

/// Reset the environment for one request.
///
/// The only failure mode is a panic from the OS layer; the steps
/// themselves are infallible.
pub fn prepare_environment(payload: &QueryPayload) -> EnvSummary {
    // 1. Session cookie: payload value or empty, never a previous user's.
    std::env::set_var(
        SESSION_COOKIE_VAR,
        payload.session_cookie.as_deref().unwrap_or(""),
    );

    // 2. Blank the alternate auth variables.
    for var in ALTERNATE_AUTH_VARS {
        std::env::set_var(var, "");
    }

    // 3. OAuth token from the payload, empty when absent.
    let token = payload.access_token.as_deref().unwrap_or("");
    std::env::set_var(OAUTH_TOKEN_VAR, token);
    let auth_source = if token.is_empty() {
        AuthSource::SharedOauth
    } else {
        AuthSource::UserToken
    };

    // 4. Sweep every USER_* variable from the previous request.
    let stale: Vec<String> = std::env::vars()
        .map(|(name, _)| name)
        .filter(|name| name.starts_with(USER_KEY_PREFIX))
        .collect();
    for name in stale {
        std::env::remove_var(name);
    }

    // 5. Install validated user keys; invalid names are silently dropped.
    let mut installed = 0usize;
    for (name, value) in &payload.user_env {
        if is_valid_user_key(name) {
            std::env::set_var(format!("{USER_KEY_PREFIX}{name}"), value);
            installed += 1;
        }
    }

    EnvSummary {
        auth_source,
        user_keys_installed: installed,
    }
}

#[cfg(test)]
#[path = "envprep_tests.rs"]
mod tests;
