// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn warning_line_shape() {
    let line = StreamMessage::Warning {
        message: "token expires soon".to_string(),
    }
    .encode_line();
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(value["type"], "warning");
    assert_eq!(value["message"], "token expires soon");
    assert!(line.ends_with('\n'));
}

#[test]
fn message_ids_serialize_camel_case() {
    let line = StreamMessage::Message {
        message_id: 7,
        content: serde_json::json!({"text": "hi"}),
    }
    .encode_line();
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(value["messageId"], 7);
    assert_eq!(value["content"]["text"], "hi");
}

#[test]
fn complete_carries_the_result_object() {
    let line = StreamMessage::Complete {
        message_id: 3,
        result: AgentResult {
            kind: "result".to_string(),
            total_messages: 2,
            result: None,
            cancelled: false,
        },
    }
    .encode_line();
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(value["type"], "complete");
    assert_eq!(value["result"]["totalMessages"], 2);
}
