// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A malformed line must not take the stream down.

use crate::prelude::*;
use ap_ipc::{NdjsonParser, ParsedLine, WorkerFrame};

#[tokio::test]
async fn bad_json_line_is_skipped_and_the_complete_still_lands() {
    // Worker output as it arrives off the socket: one corrupt line, then
    // a valid terminal frame.
    let raw = concat!(
        "{this is not json\n",
        "{\"type\":\"complete\",\"requestId\":\"r1\",\"result\":",
        "{\"type\":\"result\",\"totalMessages\":2,\"cancelled\":false}}\n",
    );

    let mut parser = NdjsonParser::new();
    let mut parse_errors = 0;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    for line in parser.push::<WorkerFrame>(raw.as_bytes()).unwrap() {
        match line {
            ParsedLine::Invalid { .. } => parse_errors += 1,
            ParsedLine::Frame(WorkerFrame::Complete { result, .. }) => {
                event_tx.send(QueryEvent::Completed { result }).unwrap();
            }
            ParsedLine::Frame(other) => panic!("unexpected frame: {other:?}"),
        }
    }
    drop(event_tx);
    assert_eq!(parse_errors, 1, "the corrupt line surfaces as a parse error");

    // The stream handler processes what survived parsing.
    let completions = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&completions);
    let handler = StreamHandler::new(StreamConfig {
        context: StreamContext::default(),
        cancel: CancelState::new(),
        warnings: vec![],
        on_session_id: None,
        on_message: None,
        on_stream_complete: Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    });
    let (output_tx, mut output_rx) = mpsc::channel(16);
    handler.run(event_rx, output_tx).await;

    let line = output_rx.recv().await.expect("complete line missing");
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(value["type"], "complete");
    assert_eq!(value["result"]["totalMessages"], 2);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}
