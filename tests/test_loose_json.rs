//! Tests for tolerant JSON extraction from model output.

use serde_json::json;
use setupsh::llm::parse_loose_json;

#[test]
fn test_direct_object() {
    let v = parse_loose_json(r#"{"route": "decide"}"#).unwrap();
    assert_eq!(v["route"], "decide");
}

#[test]
fn test_fenced_block_with_language_tag() {
    let text = "Here is the plan:\n```json\n{\"title\": \"t\", \"steps\": []}\n```\nthanks";
    let v = parse_loose_json(text).unwrap();
    assert_eq!(v["title"], "t");
}

#[test]
fn test_fenced_block_without_language_tag() {
    let text = "```\n{\"ok\": true}\n```";
    let v = parse_loose_json(text).unwrap();
    assert_eq!(v["ok"], json!(true));
}

#[test]
fn test_brace_span_with_surrounding_prose() {
    let text = "Sure! The decision is {\"action\": \"replan\"} as requested.";
    let v = parse_loose_json(text).unwrap();
    assert_eq!(v["action"], "replan");
}

#[test]
fn test_recognizer_order_prefers_whole_text() {
    // The whole text is valid JSON; the embedded fence must not win.
    let text = r#"{"outer": "```json\n{\"inner\": 1}\n```"}"#;
    let v = parse_loose_json(text).unwrap();
    assert!(v.get("outer").is_some());
}

#[test]
fn test_garbage_yields_none() {
    assert!(parse_loose_json("{ not json").is_none());
    assert!(parse_loose_json("").is_none());
    assert!(parse_loose_json("no braces at all").is_none());
}

#[test]
fn test_non_object_yields_none() {
    assert!(parse_loose_json("[1, 2, 3]").is_none());
    assert!(parse_loose_json("42").is_none());
}
