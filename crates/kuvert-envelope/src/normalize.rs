// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Dialect and identity normalisation.
//!
//! Two envelope dialects exist in the wild: the canonical `state`-keyed one
//! and an older `type`-keyed one whose conversational state is called
//! `message`.  Both are accepted at ingress and mapped here; only the
//! canonical dialect is ever emitted.  Normalisation is idempotent.

use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Canonical state names accepted by the validator.
pub const VALID_STATES: [&str; 12] = [
    "reply",
    "tool",
    "tools",
    "plan",
    "error",
    "clarify",
    "confirm",
    "reflect",
    "wait",
    "handoff",
    "finish",
    "ask_human",
];

pub fn normalize(v: Value) -> Value {
    let mut obj = match v {
        Value::Object(m) => m,
        other => return other,
    };

    migrate_dialect(&mut obj);

    // meta.confidence must exist (possibly null) once normalised.
    if let Some(Value::Object(meta)) = obj.get_mut("meta") {
        meta.entry("confidence").or_insert(Value::Null);
    }

    // Synthesise missing tool_ids and replace duplicates with fresh ones.
    if obj.get("state").and_then(Value::as_str) == Some("tools") {
        if let Some(Value::Array(tools)) = obj.get_mut("tools") {
            let mut seen: Vec<String> = Vec::new();
            for (idx, item) in tools.iter_mut().enumerate() {
                let Some(entry) = item.as_object_mut() else {
                    continue;
                };
                let current = entry
                    .get("tool_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let id = if current.is_empty() || seen.contains(&current) {
                    // Fresh ids must not collide with ids the model chose
                    // for other members.
                    let mut candidate = format!("tool_{idx}");
                    let mut n = 0;
                    while seen.contains(&candidate) {
                        n += 1;
                        candidate = format!("tool_{idx}_{n}");
                    }
                    candidate
                } else {
                    current
                };
                seen.push(id.clone());
                entry.insert("tool_id".into(), Value::String(id));
            }
        }
    }

    if !obj.contains_key("envelope_id") {
        let id: String = Uuid::new_v4().to_string().chars().take(8).collect();
        obj.insert("envelope_id".into(), Value::String(id));
    }
    if !obj.contains_key("timestamp") {
        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        obj.insert("timestamp".into(), Value::String(ts));
    }

    Value::Object(obj)
}

/// Map the `type` discriminator and the `message` state onto the canonical
/// dialect.
fn migrate_dialect(obj: &mut Map<String, Value>) {
    if !obj.contains_key("state") {
        if let Some(t) = obj.remove("type") {
            obj.insert("state".into(), t);
        }
    }

    if obj.get("state").and_then(Value::as_str) == Some("message") {
        obj.insert("state".into(), Value::String("reply".into()));
        // The old dialect carried the utterance as a bare `message` string.
        if !obj.contains_key("conversation") {
            if let Some(Value::String(text)) = obj.remove("message") {
                obj.insert("conversation".into(), json!({ "utterance": text }));
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn confidence_key_is_inserted_as_null() {
        let v = normalize(json!({"state": "reply", "meta": {"continue": false}}));
        assert!(v["meta"]["confidence"].is_null());
    }

    #[test]
    fn existing_confidence_is_preserved() {
        let v = normalize(json!({"state": "reply", "meta": {"continue": true, "confidence": 0.9}}));
        assert_eq!(v["meta"]["confidence"], 0.9);
    }

    #[test]
    fn missing_tool_ids_are_synthesised() {
        let v = normalize(json!({
            "state": "tools",
            "tools": [
                {"tool": "create_file", "arguments": {}},
                {"tool_id": "named", "tool": "create_file", "arguments": {}}
            ],
            "meta": {"continue": true}
        }));
        assert_eq!(v["tools"][0]["tool_id"], "tool_0");
        assert_eq!(v["tools"][1]["tool_id"], "named");
    }

    #[test]
    fn duplicate_tool_ids_get_fresh_ids() {
        let v = normalize(json!({
            "state": "tools",
            "tools": [
                {"tool_id": "x", "tool": "a", "arguments": {}},
                {"tool_id": "x", "tool": "b", "arguments": {}},
                {"tool_id": "x", "tool": "c", "arguments": {}}
            ],
            "meta": {"continue": true}
        }));
        let ids: Vec<&str> = v["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["tool_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids[0], "x");
        assert_ne!(ids[1], "x");
        assert_ne!(ids[2], ids[1]);
    }

    #[test]
    fn envelope_id_and_timestamp_added_once() {
        let v = normalize(json!({"state": "reply", "meta": {"continue": false}}));
        let id = v["envelope_id"].as_str().unwrap().to_string();
        let ts = v["timestamp"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 8);
        let again = normalize(v);
        assert_eq!(again["envelope_id"], id.as_str());
        assert_eq!(again["timestamp"], ts.as_str());
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(json!({
            "state": "tools",
            "tools": [{"tool": "a", "arguments": {}}, {"tool": "b", "arguments": {}}],
            "meta": {"continue": true}
        }));
        let twice = normalize(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn type_dialect_is_migrated_to_state() {
        let v = normalize(json!({"type": "tool", "tool": "read_file", "arguments": {}}));
        assert_eq!(v["state"], "tool");
        assert!(v.get("type").is_none());
    }

    #[test]
    fn message_state_becomes_reply_with_conversation() {
        let v = normalize(json!({
            "type": "message",
            "message": "hello there",
            "meta": {"continue": false, "stop_reason": "user_reply"}
        }));
        assert_eq!(v["state"], "reply");
        assert_eq!(v["conversation"]["utterance"], "hello there");
    }

    #[test]
    fn state_wins_over_type_when_both_present() {
        let v = normalize(json!({"state": "reply", "type": "tool", "meta": {"continue": false}}));
        assert_eq!(v["state"], "reply");
    }

    #[test]
    fn non_object_passes_through() {
        assert_eq!(normalize(json!([1, 2])), json!([1, 2]));
    }
}
