// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancellation specs.
//!
//! These document the production incidents the pool exists to prevent:
//! conversations whose lock stayed held for many seconds after a stop,
//! and workers stuck busy forever after an abort.

use crate::prelude::*;

#[tokio::test(flavor = "multi_thread")]
async fn cancel_then_resend_reacquires_the_lock_quickly() {
    let h = pool_with(
        StubBehavior {
            run_until_cancelled: true,
            ..StubBehavior::default()
        },
        |_| {},
    );
    let lock = MemoryLock::new();
    let mut events = h.pool.subscribe();

    let q1 = start_streamed_query(&h.pool, Arc::clone(&lock), "r1", "alice", "site-a").await;
    wait_event(&mut events, |e| matches!(e, PoolEvent::WorkerBusy { .. })).await;

    // Stop before any terminal event arrives.
    q1.cancel();

    let resolution = timeout(Duration::from_secs(2), q1.resolution)
        .await
        .expect("cancellation took more than 2s")
        .unwrap()
        .unwrap();
    assert!(resolution.cancelled());

    // The lock is released on the cancellation path, not on worker
    // teardown, so a resend can take it immediately.
    timeout(Duration::from_secs(2), q1.pump)
        .await
        .expect("stream did not finish")
        .unwrap();
    eventually("lock released", || {
        q1.completions.load(Ordering::SeqCst) == 1
    })
    .await;
    eventually("lock free", || !lock.held_now()).await;

    let q2 = start_streamed_query(&h.pool, Arc::clone(&lock), "r2", "alice", "site-a").await;
    q2.cancel();
    let resolution = q2.resolution.await.unwrap().unwrap();
    assert!(resolution.cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn rapid_ten_cycle_stop_and_resend() {
    let h = pool_with(
        StubBehavior {
            run_until_cancelled: true,
            ..StubBehavior::default()
        },
        |_| {},
    );
    let lock = MemoryLock::new();

    for i in 0..10 {
        let q = start_streamed_query(
            &h.pool,
            Arc::clone(&lock),
            &format!("cycle-{i}"),
            "alice",
            "site-a",
        )
        .await;
        q.cancel();

        let resolution = timeout(Duration::from_secs(2), q.resolution)
            .await
            .unwrap_or_else(|_| panic!("iteration {i}: cancel was not prompt"))
            .unwrap()
            .unwrap();
        assert!(resolution.cancelled(), "iteration {i}");

        timeout(Duration::from_secs(2), q.pump)
            .await
            .unwrap_or_else(|_| panic!("iteration {i}: stream stuck"))
            .unwrap();
        eventually("lock free between cycles", || !lock.held_now()).await;
        assert_eq!(q.completions.load(Ordering::SeqCst), 1, "iteration {i}");
    }

    // Final state: lock released, nothing queued.
    assert!(!lock.held_now());
    assert_eq!(h.pool.telemetry().queued_requests, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_stream_bounds_forwarded_events() {
    let h = pool_with(
        StubBehavior {
            messages: 2000,
            message_delay: Duration::from_millis(1),
            ..StubBehavior::default()
        },
        |_| {},
    );
    let lock = MemoryLock::new();

    let mut q = start_streamed_query(&h.pool, Arc::clone(&lock), "r1", "alice", "site-a").await;

    // Let 100 messages through, then stop.
    let mut forwarded = 0usize;
    while forwarded < 100 {
        match timeout(Duration::from_secs(5), q.output.recv()).await {
            Ok(Some(_)) => forwarded += 1,
            Ok(None) => panic!("stream ended before 100 messages"),
            Err(_) => panic!("stalled waiting for messages"),
        }
    }
    q.cancel();

    let resolution = timeout(Duration::from_secs(2), q.resolution)
        .await
        .expect("cancellation was not prompt")
        .unwrap()
        .unwrap();
    assert!(resolution.cancelled());

    timeout(Duration::from_secs(2), q.pump)
        .await
        .expect("stream did not finish")
        .unwrap();
    while let Some(_line) = q.output.recv().await {
        forwarded += 1;
    }
    assert!(
        forwarded < 1000,
        "worker was not bounded: {forwarded} events forwarded"
    );
    assert_eq!(q.completions.load(Ordering::SeqCst), 1);
    eventually("lock free", || !lock.held_now()).await;

    // Final state idle: the cancelled worker is retired, nothing active.
    eventually("pool idle", || {
        let t = h.pool.telemetry();
        t.active_workers == 0 && t.queued_requests == 0
    })
    .await;
}
