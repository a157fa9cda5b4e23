// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lock-hold time is bounded by the first terminal event, not by the
//! worker's teardown.

use crate::prelude::*;

#[tokio::test(flavor = "multi_thread")]
async fn terminal_event_releases_the_lock_before_the_worker_closes() {
    // The stub holds its socket open for a while after the terminal frame.
    let h = pool_with(
        StubBehavior {
            linger_after_terminal: Duration::from_millis(500),
            ..StubBehavior::default()
        },
        |_| {},
    );
    let lock = MemoryLock::new();

    let q = start_streamed_query(&h.pool, Arc::clone(&lock), "r1", "alice", "site-a").await;

    let resolution = timeout(Duration::from_secs(5), q.resolution)
        .await
        .expect("query stuck")
        .unwrap()
        .unwrap();
    assert!(!resolution.cancelled());

    // The completion hook has fired while the worker connection is still
    // open (the stub lingers; the worker stays registered and idle).
    eventually("early lock release", || {
        q.completions.load(Ordering::SeqCst) == 1 && !lock.held_now()
    })
    .await;
    let t = h.pool.telemetry();
    assert_eq!(t.total_workers, 1, "worker must still be alive while lingering");
    assert_eq!(t.idle_workers, 1);

    // Only one invocation, ever.
    timeout(Duration::from_secs(5), q.pump)
        .await
        .expect("stream did not finish")
        .unwrap();
    assert_eq!(q.completions.load(Ordering::SeqCst), 1);
}
