// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Crash recovery and counter hygiene.

use crate::prelude::*;

#[tokio::test(flavor = "multi_thread")]
async fn worker_crash_mid_query_rejects_the_caller_and_recovers() {
    let h = pool_with(
        StubBehavior {
            messages: 3,
            crash_after_messages: Some(1),
            ..StubBehavior::default()
        },
        |_| {},
    );
    let mut events = h.pool.subscribe();

    let err = h
        .pool
        .submit(request("r1", "alice", "site-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::WorkerCrashed(_)));
    wait_event(&mut events, |e| matches!(e, PoolEvent::WorkerCrashed { .. })).await;

    // Counters did not leak from the crashed query.
    eventually("crashed worker removed", || {
        h.pool.telemetry().total_workers == 0
    })
    .await;
    assert_eq!(h.pool.telemetry().active_workers, 0);

    // A healthy worker serves the next request.
    h.launcher.set_behavior(StubBehavior::default());
    let resolution = h
        .pool
        .submit(request("r2", "alice", "site-a"))
        .await
        .unwrap();
    assert!(!resolution.cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn counters_drop_to_zero_after_mixed_load() {
    let h = pool_with(StubBehavior::default(), |config| {
        config.max_workers_per_workspace = 2;
    });

    let mut handles = Vec::new();
    for (id, owner, ws) in [
        ("m1", "alice", "site-a"),
        ("m2", "bob", "site-a"),
        ("m3", "alice", "site-b"),
        ("m4", "carol", "site-b"),
        ("m5", "bob", "site-a"),
        ("m6", "carol", "site-a"),
    ] {
        let pool = h.pool.clone();
        let req = request(id, owner, ws);
        handles.push(tokio::spawn(async move { pool.submit(req).await }));
    }
    // One of them is cancelled mid-flight.
    let token = CancellationToken::new();
    let mut cancelled_req = request("m7", "dave", "site-a");
    cancelled_req.cancel = Some(token.clone());
    let pool = h.pool.clone();
    handles.push(tokio::spawn(async move { pool.submit(cancelled_req).await }));
    token.cancel();

    for handle in handles {
        let result = timeout(Duration::from_secs(10), handle)
            .await
            .expect("request starved")
            .unwrap();
        assert!(result.is_ok(), "unexpected failure: {result:?}");
    }

    eventually("all accounting drained", || {
        let t = h.pool.telemetry();
        t.active_workers == 0 && t.queued_requests == 0
    })
    .await;
}
