// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Structural auto-repair, applied when a parsed envelope fails validation
//! and before the model is asked to correct itself.
//!
//! Repair fixes what can be fixed mechanically without inventing content the
//! user would see: flow-control fields, state clamping, placeholder
//! sub-objects for non-conversational states.  A `reply` without an
//! utterance or a `clarify` without a question is left invalid so the
//! correction round-trip happens with the model instead of fabricating
//! words on its behalf.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::normalize::VALID_STATES;
use crate::validate::MAX_RATIONALE_CHARS;

/// Repair `v` in place as far as mechanically possible.
///
/// Idempotent, and the identity on already-valid envelopes.
pub fn auto_repair(v: Value) -> Value {
    let mut obj = match v {
        Value::Object(m) => m,
        // Not even an object: nothing to salvage.
        other => {
            debug!("auto_repair: non-object envelope {other}");
            return crate::error_envelope_value(
                "envelope is not a JSON object",
                "validation_error",
            );
        }
    };

    if !obj.contains_key("state") {
        obj.insert("state".into(), Value::String("error".into()));
        debug!("auto_repair: missing state, defaulting to error");
    }

    // Unknown states clamp to `error`, preserving the original for context.
    let state = obj
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let state = if VALID_STATES.contains(&state.as_str()) {
        state
    } else {
        obj.insert("state".into(), Value::String("error".into()));
        obj.entry("error").or_insert(json!({
            "error_type": "invalid_state",
            "error_message": format!("Original state '{state}' was invalid"),
        }));
        "error".to_string()
    };

    if !obj.contains_key("brief_rationale") {
        obj.insert(
            "brief_rationale".into(),
            Value::String("Auto-generated rationale".into()),
        );
    } else if let Some(Value::String(r)) = obj.get("brief_rationale") {
        if r.chars().count() > MAX_RATIONALE_CHARS {
            let truncated: String = r.chars().take(MAX_RATIONALE_CHARS).collect();
            obj.insert("brief_rationale".into(), Value::String(truncated));
        }
    }

    repair_meta(&mut obj, &state);
    repair_state_payload(&mut obj, &state);

    Value::Object(obj)
}

fn repair_meta(obj: &mut Map<String, Value>, state: &str) {
    if !matches!(obj.get("meta"), Some(Value::Object(_))) {
        obj.insert("meta".into(), json!({}));
    }
    let meta = obj
        .get_mut("meta")
        .and_then(Value::as_object_mut)
        .expect("meta inserted above");

    // Coerce `continue` to a boolean, defaulting to true.
    let proceed = match meta.get("continue") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => true,
    };
    meta.insert("continue".into(), Value::Bool(proceed));

    // stop_reason is required when continue=false; pick the one the state
    // implies when it is missing or not in the enum.
    if !proceed {
        let valid = meta
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(|s| crate::types::StopReason::ALL.contains(&s))
            .unwrap_or(false);
        if !valid {
            meta.insert(
                "stop_reason".into(),
                Value::String(implied_stop_reason(state).into()),
            );
        }
    }

    // Confidence must be a number in [0,1] or null.
    match meta.get("confidence") {
        Some(Value::Number(n)) => {
            if let Some(f) = n.as_f64() {
                if !(0.0..=1.0).contains(&f) {
                    let clamped = f.clamp(0.0, 1.0);
                    meta.insert("confidence".into(), json!(clamped));
                }
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => {
            meta.insert("confidence".into(), Value::Null);
        }
    }

    // Malformed update payloads are dropped rather than guessed at.
    if matches!(meta.get("goal_update"), Some(v) if !v.is_object()) {
        meta.remove("goal_update");
    }
    if matches!(meta.get("todo_update"), Some(v) if !v.is_object()) {
        meta.remove("todo_update");
    }
}

fn implied_stop_reason(state: &str) -> &'static str {
    match state {
        "reply" => "user_reply",
        "finish" => "task_done",
        "clarify" | "ask_human" | "wait" => "need_input",
        "confirm" => "need_approval",
        _ => "error",
    }
}

fn repair_state_payload(obj: &mut Map<String, Value>, state: &str) {
    match state {
        "tool" => {
            // A tool decision without a callable name cannot be dispatched;
            // downgrade to an error envelope instead of inventing one.
            let name_ok = obj
                .get("tool")
                .and_then(Value::as_str)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if !name_ok {
                debug!("auto_repair: tool state without tool name, downgrading to error");
                obj.insert("state".into(), Value::String("error".into()));
                obj.insert(
                    "error".into(),
                    json!({
                        "error_type": "missing_tool_name",
                        "error_message": "Tool state requires a valid tool name",
                    }),
                );
            } else if !obj.contains_key("arguments") {
                obj.insert("arguments".into(), json!({}));
            }
        }
        "tools" => {
            if let Some(Value::Array(tools)) = obj.get_mut("tools") {
                for item in tools.iter_mut() {
                    if let Some(entry) = item.as_object_mut() {
                        if !entry.contains_key("arguments") {
                            entry.insert("arguments".into(), json!({}));
                        }
                    }
                }
            }
            // A missing or empty array stays invalid: the validator rejects
            // it and the correction round-trip goes back to the model.
        }
        "wait" => {
            let has_event = obj
                .get("wait")
                .and_then(|w| w.get("event_type"))
                .is_some();
            if !has_event {
                let mut w = obj
                    .get("wait")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                w.insert("event_type".into(), Value::String("timeout".into()));
                obj.insert("wait".into(), Value::Object(w));
            }
        }
        "finish" => {
            let has_summary = obj
                .get("finish")
                .and_then(|f| f.get("summary"))
                .is_some();
            if !has_summary {
                let mut f = obj
                    .get("finish")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                f.insert(
                    "summary".into(),
                    Value::String("Auto-generated summary".into()),
                );
                obj.insert("finish".into(), Value::Object(f));
            }
        }
        "handoff" => {
            let mut h = obj
                .get("handoff")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            h.entry("to_agent")
                .or_insert(Value::String("unknown".into()));
            h.entry("message")
                .or_insert(Value::String("Auto-generated handoff".into()));
            obj.insert("handoff".into(), Value::Object(h));
        }
        "reflect" => {
            let has_analysis = obj
                .get("reflect")
                .and_then(|r| r.get("analysis"))
                .is_some();
            if !has_analysis {
                let mut r = obj
                    .get("reflect")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                r.insert(
                    "analysis".into(),
                    Value::String("Auto-generated analysis".into()),
                );
                obj.insert("reflect".into(), Value::Object(r));
            }
        }
        "plan" => {
            if !matches!(obj.get("plan"), Some(Value::Object(_))) {
                obj.insert("plan".into(), json!({ "steps": [] }));
            }
        }
        "error" => {
            let mut e = obj
                .get("error")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            e.entry("error_type")
                .or_insert(Value::String("error".into()));
            e.entry("error_message")
                .or_insert(Value::String("Auto-generated error".into()));
            obj.insert("error".into(), Value::Object(e));
        }
        // reply / clarify / confirm keep their user-facing content gaps;
        // ask_human has no required sub-object.
        _ => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
