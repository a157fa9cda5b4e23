// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ap_core::AgentResult;
use std::time::Duration;
use tokio::time::timeout;

struct Fixture {
    handler: Arc<StreamHandler>,
    completions: Arc<AtomicU64>,
    cancel: Arc<CancelState>,
}

fn fixture(warnings: Vec<String>) -> Fixture {
    let completions = Arc::new(AtomicU64::new(0));
    let cancel = CancelState::new();
    let counter = Arc::clone(&completions);
    let handler = Arc::new(StreamHandler::new(StreamConfig {
        context: StreamContext {
            request_id: "req-1".to_string(),
            workspace: "site-a".to_string(),
            model: None,
        },
        cancel: Arc::clone(&cancel),
        warnings,
        on_session_id: None,
        on_message: None,
        on_stream_complete: Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    }));
    Fixture {
        handler,
        completions,
        cancel,
    }
}

fn complete_event() -> QueryEvent {
    QueryEvent::Completed {
        result: AgentResult {
            kind: "result".to_string(),
            total_messages: 1,
            result: None,
            cancelled: false,
        },
    }
}

async fn drain(output: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
    let mut lines = Vec::new();
    while let Some(line) = output.recv().await {
        lines.push(serde_json::from_str(line.trim()).unwrap());
    }
    lines
}

#[tokio::test]
async fn warnings_come_first_then_messages_with_monotonic_ids() {
    let f = fixture(vec!["token expiring".to_string()]);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::channel(16);

    let handler = Arc::clone(&f.handler);
    let pump = tokio::spawn(async move { handler.run(event_rx, output_tx).await });

    event_tx
        .send(QueryEvent::Message {
            content: serde_json::json!({"text": "one"}),
        })
        .unwrap();
    event_tx
        .send(QueryEvent::Message {
            content: serde_json::json!({"text": "two"}),
        })
        .unwrap();
    drop(event_tx);
    pump.await.unwrap();

    let lines = drain(&mut output_rx).await;
    assert_eq!(lines[0]["type"], "warning");
    assert_eq!(lines[1]["messageId"], 1);
    assert_eq!(lines[2]["messageId"], 2);
}

#[tokio::test]
async fn message_content_is_sanitized() {
    let f = fixture(vec![]);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::channel(16);

    let handler = Arc::clone(&f.handler);
    let pump = tokio::spawn(async move { handler.run(event_rx, output_tx).await });
    event_tx
        .send(QueryEvent::Message {
            content: serde_json::json!({
                "text": "visible <system-reminder>hidden</system-reminder>tail"
            }),
        })
        .unwrap();
    drop(event_tx);
    pump.await.unwrap();

    let lines = drain(&mut output_rx).await;
    assert_eq!(lines[0]["content"]["text"], "visible tail");
}

#[tokio::test]
async fn terminal_event_completes_before_upstream_closes() {
    let f = fixture(vec![]);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (output_tx, _output_rx) = mpsc::channel(16);

    let handler = Arc::clone(&f.handler);
    let pump = tokio::spawn(async move { handler.run(event_rx, output_tx).await });

    event_tx.send(complete_event()).unwrap();

    // The upstream is still open, yet the completion hook must already
    // have fired (this is what bounds lock-hold time).
    timeout(Duration::from_secs(2), async {
        while f.completions.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("completion hook did not fire on terminal event");
    assert!(f.handler.is_completed());

    // Closing the upstream later must not fire it again.
    drop(event_tx);
    pump.await.unwrap();
    assert_eq!(f.completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_end_without_terminal_still_completes_once() {
    let f = fixture(vec![]);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (output_tx, _output_rx) = mpsc::channel(16);

    let handler = Arc::clone(&f.handler);
    let pump = tokio::spawn(async move { handler.run(event_rx, output_tx).await });
    drop(event_tx);
    pump.await.unwrap();

    assert_eq!(f.completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_stops_the_pump_and_completes_once() {
    let f = fixture(vec![]);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::channel(64);

    // Queue a few events, then request cancellation.
    for i in 0..5 {
        event_tx
            .send(QueryEvent::Message {
                content: serde_json::json!({"seq": i}),
            })
            .unwrap();
    }
    f.cancel.request();

    let handler = Arc::clone(&f.handler);
    let pump = tokio::spawn(async move { handler.run(event_rx, output_tx).await });
    pump.await.unwrap();

    // Nothing was forwarded: the flag was already set before the loop ran.
    let lines = drain(&mut output_rx).await;
    assert!(lines.is_empty());
    assert_eq!(f.completions.load(Ordering::SeqCst), 1);

    // The sender side is still alive; the handler exited cooperatively.
    drop(event_tx);
}

#[tokio::test]
async fn session_ids_reach_the_callback_not_the_client() {
    let completions = Arc::new(AtomicU64::new(0));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let counter = Arc::clone(&completions);
    let sessions = Arc::clone(&seen);
    let handler = Arc::new(StreamHandler::new(StreamConfig {
        context: StreamContext::default(),
        cancel: CancelState::new(),
        warnings: vec![],
        on_session_id: Some(Arc::new(move |id: &str| {
            sessions.lock().push(id.to_string());
        })),
        on_message: None,
        on_stream_complete: Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    }));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::channel(16);
    let pump = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.run(event_rx, output_tx).await })
    };
    event_tx
        .send(QueryEvent::Session {
            session_id: "sess-9".to_string(),
        })
        .unwrap();
    drop(event_tx);
    pump.await.unwrap();

    assert_eq!(seen.lock().as_slice(), ["sess-9"]);
    assert!(drain(&mut output_rx).await.is_empty());
}
