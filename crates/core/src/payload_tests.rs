// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn payload_round_trips_with_camel_case_keys() {
    let mut payload = QueryPayload::new("hello");
    payload.system_prompt = Some("be brief".to_string());
    payload.user_env.insert("MY_VAR".to_string(), "1".to_string());

    let json = serde_json::to_value(&payload).unwrap();
    assert_eq!(json["systemPrompt"], "be brief");
    assert_eq!(json["userEnv"]["MY_VAR"], "1");

    let back: QueryPayload = serde_json::from_value(json).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn absent_optional_fields_are_omitted() {
    let json = serde_json::to_value(QueryPayload::new("hi")).unwrap();
    let obj = json.as_object().unwrap();
    assert_eq!(obj.keys().collect::<Vec<_>>(), vec!["message"]);
}

#[test]
fn uses_oauth_when_no_access_token() {
    let mut payload = QueryPayload::new("hi");
    assert!(payload.uses_oauth());
    payload.access_token = Some(String::new());
    assert!(payload.uses_oauth());
    payload.access_token = Some("sk-token".to_string());
    assert!(!payload.uses_oauth());
}

#[test]
fn agent_result_type_field_is_renamed() {
    let result = AgentResult {
        kind: "result".to_string(),
        total_messages: 4,
        result: Some(serde_json::json!({"ok": true})),
        cancelled: false,
    };
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["type"], "result");
    assert_eq!(json["totalMessages"], 4);
}
