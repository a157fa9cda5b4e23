// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fair scheduling across owners sharing one workspace.

use crate::prelude::*;

/// Two owners backlogged on a one-worker workspace are served
/// alternately, regardless of who filled the queue first.
#[tokio::test(flavor = "multi_thread")]
async fn two_owners_alternate_on_a_single_worker() {
    let h = pool_with(StubBehavior::default(), |config| {
        config.max_workers = 1;
        config.max_workers_per_workspace = 1;
        config.max_workers_per_user = 1;
        config.max_queued_per_user = 10;
        config.max_queued_per_workspace = 20;
    });
    let mut events = h.pool.subscribe();

    // Park every submission in the queue before any dispatch happens.
    h.load.set_load(1000.0);

    let mut handles = Vec::new();
    for (owner, ids) in [("alice", ["a1", "a2", "a3", "a4", "a5"]),
                         ("bob", ["b1", "b2", "b3", "b4", "b5"])] {
        for id in ids {
            let pool = h.pool.clone();
            let req = request(id, owner, "site-a");
            handles.push(tokio::spawn(async move { pool.submit(req).await }));
            // Deterministic enqueue order: wait until this one is queued.
            let want = handles.len();
            eventually("request queued", || {
                h.pool.telemetry().queued_requests == want
            })
            .await;
        }
    }

    // Load recovers; the drain pass starts dispatching.
    h.load.set_load(0.0);
    h.pool.run_drain_pass().await;

    for handle in handles {
        let resolution = timeout(Duration::from_secs(10), handle)
            .await
            .expect("request starved")
            .unwrap()
            .unwrap();
        assert!(!resolution.cancelled());
    }

    // Dispatch order from the event stream: strict A/B alternation.
    let mut dispatched = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::WorkerBusy { request_id, .. } = event {
            dispatched.push(request_id.as_str().to_string());
        }
    }
    assert_eq!(
        dispatched,
        vec!["a1", "b1", "a2", "b2", "a3", "b3", "a4", "b4", "a5", "b5"]
    );

    // After the drain every counter is back to zero.
    let t = h.pool.telemetry();
    assert_eq!(t.queued_requests, 0);
    assert_eq!(t.active_workers, 0);
    assert_eq!(t.idle_workers, t.total_workers);
}

/// Requests of one owner keep FIFO order even when another owner's
/// requests interleave.
#[tokio::test(flavor = "multi_thread")]
async fn per_owner_order_is_fifo() {
    let h = pool_with(StubBehavior::default(), |config| {
        config.max_workers = 1;
        config.max_workers_per_workspace = 1;
        config.max_queued_per_user = 10;
    });
    let mut events = h.pool.subscribe();
    h.load.set_load(1000.0);

    let mut handles = Vec::new();
    for id in ["a1", "a2", "a3"] {
        let pool = h.pool.clone();
        let req = request(id, "alice", "site-a");
        handles.push(tokio::spawn(async move { pool.submit(req).await }));
        let want = handles.len();
        eventually("request queued", || {
            h.pool.telemetry().queued_requests == want
        })
        .await;
    }

    h.load.set_load(0.0);
    h.pool.run_drain_pass().await;
    for handle in handles {
        timeout(Duration::from_secs(10), handle)
            .await
            .expect("request starved")
            .unwrap()
            .unwrap();
    }

    let mut dispatched = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::WorkerBusy { request_id, .. } = event {
            dispatched.push(request_id.as_str().to_string());
        }
    }
    assert_eq!(dispatched, vec!["a1", "a2", "a3"]);
}
