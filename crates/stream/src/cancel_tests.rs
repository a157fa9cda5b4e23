// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn request_sets_the_flag_once_and_for_all() {
    let state = CancelState::new();
    assert!(!state.is_requested());
    state.request();
    assert!(state.is_requested());
    state.request(); // double-cancel is a no-op
    assert!(state.is_requested());
}

#[test]
fn request_cancels_an_attached_reader() {
    let state = CancelState::new();
    let token = CancellationToken::new();
    state.set_reader(token.clone());
    assert!(!token.is_cancelled());
    state.request();
    assert!(token.is_cancelled());
}

#[test]
fn reader_attached_after_request_is_cancelled_immediately() {
    let state = CancelState::new();
    state.request();
    let token = CancellationToken::new();
    state.set_reader(token.clone());
    assert!(token.is_cancelled());
}
