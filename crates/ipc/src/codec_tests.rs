// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::frame::WorkerFrame;
use proptest::prelude::*;

fn frames_of(lines: Vec<ParsedLine<WorkerFrame>>) -> Vec<WorkerFrame> {
    lines
        .into_iter()
        .filter_map(|l| match l {
            ParsedLine::Frame(f) => Some(f),
            ParsedLine::Invalid { .. } => None,
        })
        .collect()
}

#[test]
fn partial_line_is_preserved_across_chunks() {
    let mut parser = NdjsonParser::new();
    let out = parser.push::<WorkerFrame>(b"{\"type\":\"re").unwrap();
    assert!(out.is_empty());
    assert!(parser.buffered() > 0);

    let out = parser.push::<WorkerFrame>(b"ady\"}\n").unwrap();
    assert_eq!(frames_of(out), vec![WorkerFrame::Ready]);
    assert_eq!(parser.buffered(), 0);
}

#[test]
fn multiple_lines_in_one_chunk_come_out_in_order() {
    let mut parser = NdjsonParser::new();
    let chunk = b"{\"type\":\"ready\"}\n{\"type\":\"shutdown_ack\"}\n";
    let out = frames_of(parser.push::<WorkerFrame>(chunk).unwrap());
    assert_eq!(out, vec![WorkerFrame::Ready, WorkerFrame::ShutdownAck]);
}

#[test]
fn empty_lines_are_skipped() {
    let mut parser = NdjsonParser::new();
    let out = parser
        .push::<WorkerFrame>(b"\n\n  \n{\"type\":\"ready\"}\n\n")
        .unwrap();
    assert_eq!(frames_of(out).len(), 1);
}

#[test]
fn invalid_line_does_not_poison_the_stream() {
    let mut parser = NdjsonParser::new();
    let chunk = b"{nope}\n{\"type\":\"ready\"}\n";
    let out = parser.push::<WorkerFrame>(chunk).unwrap();
    assert_eq!(out.len(), 2);
    assert!(matches!(out[0], ParsedLine::Invalid { .. }));
    assert!(matches!(out[1], ParsedLine::Frame(WorkerFrame::Ready)));
}

#[test]
fn unknown_frame_type_is_invalid() {
    let mut parser = NdjsonParser::new();
    let out = parser
        .push::<WorkerFrame>(b"{\"type\":\"exfiltrate\"}\n")
        .unwrap();
    assert!(matches!(out[0], ParsedLine::Invalid { .. }));
}

#[test]
fn missing_required_field_is_invalid() {
    let mut parser = NdjsonParser::new();
    // session requires requestId and sessionId
    let out = parser
        .push::<WorkerFrame>(b"{\"type\":\"session\",\"requestId\":\"r1\"}\n")
        .unwrap();
    assert!(matches!(out[0], ParsedLine::Invalid { .. }));
}

#[test]
fn overflow_discards_buffer_and_errors() {
    let mut parser = NdjsonParser::new();
    let chunk = vec![b'x'; MAX_BUFFERED_BYTES + 1];
    let err = parser.push::<WorkerFrame>(&chunk).unwrap_err();
    assert!(matches!(err, FrameError::Overflow(_)));
    assert_eq!(parser.buffered(), 0);
}

#[test]
fn reset_drops_partial_bytes() {
    let mut parser = NdjsonParser::new();
    parser.push::<WorkerFrame>(b"{\"type\":\"rea").unwrap();
    parser.reset();
    let out = parser.push::<WorkerFrame>(b"{\"type\":\"ready\"}\n").unwrap();
    assert_eq!(frames_of(out), vec![WorkerFrame::Ready]);
}

#[test]
fn encode_terminates_with_single_newline() {
    let bytes = encode(&WorkerFrame::Ready).unwrap();
    assert!(bytes.ends_with(b"\n"));
    assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
}

#[test]
fn encode_escapes_newlines_inside_strings() {
    let frame = WorkerFrame::Error {
        request_id: "r1".into(),
        error: "line one\nline two".to_string(),
        stack: None,
        stderr: None,
        diagnostics: None,
    };
    let bytes = encode(&frame).unwrap();
    // exactly the terminator; the embedded newline is escaped
    assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
}

proptest! {
    /// Chunk boundaries never change what gets parsed.
    #[test]
    fn arbitrary_chunking_is_transparent(split in 1usize..60) {
        let stream = b"{\"type\":\"ready\"}\n{\"type\":\"session\",\"requestId\":\"r\",\"sessionId\":\"s\"}\n{\"type\":\"shutdown_ack\"}\n";
        let mut parser = NdjsonParser::new();
        let mut got = Vec::new();
        for chunk in stream.chunks(split) {
            got.extend(frames_of(parser.push::<WorkerFrame>(chunk).unwrap()));
        }
        prop_assert_eq!(got.len(), 3);
        prop_assert_eq!(&got[0], &WorkerFrame::Ready);
        prop_assert_eq!(&got[2], &WorkerFrame::ShutdownAck);
    }
}
