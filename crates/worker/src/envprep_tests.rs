// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;
use yare::parameterized;

fn payload_with(f: impl FnOnce(&mut ap_core::QueryPayload)) -> ap_core::QueryPayload {
    let mut payload = ap_core::QueryPayload::new("hi");
    f(&mut payload);
    payload
}

#[parameterized(
    simple = { "MY_VAR", true },
    with_digits = { "VAR_2", true },
    single = { "X", true },
    leading_digit = { "2VAR", false },
    lowercase = { "my_var", false },
    leading_underscore = { "_VAR", false },
    empty = { "", false },
    hyphen = { "MY-VAR", false },
)]
fn user_key_validation(name: &str, valid: bool) {
    assert_eq!(is_valid_user_key(name), valid, "{name}");
}

#[test]
#[serial]
fn session_cookie_is_always_overwritten() {
    std::env::set_var(SESSION_COOKIE_VAR, "previous-user-cookie");

    prepare_environment(&payload_with(|p| p.session_cookie = None));
    assert_eq!(std::env::var(SESSION_COOKIE_VAR).unwrap(), "");

    prepare_environment(&payload_with(|p| p.session_cookie = Some("fresh".into())));
    assert_eq!(std::env::var(SESSION_COOKIE_VAR).unwrap(), "fresh");
}

#[test]
#[serial]
fn alternate_auth_vars_are_blanked_not_deleted() {
    std::env::set_var("ANTHROPIC_API_KEY", "host-default");
    prepare_environment(&payload_with(|_| {}));
    // still present (so children cannot re-inherit), but empty
    assert_eq!(std::env::var("ANTHROPIC_API_KEY").unwrap(), "");
}

#[test]
#[serial]
fn stale_user_vars_are_swept() {
    std::env::set_var("USER_LEFTOVER", "old");
    let summary = prepare_environment(&payload_with(|p| {
        p.user_env.insert("FRESH".to_string(), "new".to_string());
    }));
    assert!(std::env::var("USER_LEFTOVER").is_err());
    assert_eq!(std::env::var("USER_FRESH").unwrap(), "new");
    assert_eq!(summary.user_keys_installed, 1);
}

#[test]
#[serial]
fn invalid_user_keys_are_silently_dropped() {
    let summary = prepare_environment(&payload_with(|p| {
        p.user_env.insert("ok_not".to_string(), "x".to_string());
        p.user_env.insert("GOOD".to_string(), "y".to_string());
    }));
    assert_eq!(summary.user_keys_installed, 1);
    assert!(std::env::var("USER_ok_not").is_err());
}

#[test]
#[serial]
fn auth_source_tracks_access_token() {
    let summary = prepare_environment(&payload_with(|_| {}));
    assert_eq!(summary.auth_source, AuthSource::SharedOauth);
    assert_eq!(std::env::var(OAUTH_TOKEN_VAR).unwrap(), "");

    let summary = prepare_environment(&payload_with(|p| {
        p.access_token = Some("tok-123".to_string());
    }));
    assert_eq!(summary.auth_source, AuthSource::UserToken);
    assert_eq!(std::env::var(OAUTH_TOKEN_VAR).unwrap(), "tok-123");
}
