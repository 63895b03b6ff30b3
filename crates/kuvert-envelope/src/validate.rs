// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use crate::normalize::VALID_STATES;
use crate::types::StopReason;

pub const MAX_RATIONALE_CHARS: usize = 220;

/// Validate a (normalised) envelope value against the per-state contract.
///
/// Returns `(ok, errors)`; errors are human-readable and are fed back to the
/// model verbatim during the correction round-trip, so they name the exact
/// field path that failed.
pub fn validate(v: &Value) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    let Some(obj) = v.as_object() else {
        return (false, vec!["Envelope must be a JSON object".into()]);
    };

    if !obj.contains_key("state") {
        errors.push("Missing required field: state".into());
    }
    if !obj.contains_key("meta") {
        errors.push("Missing required field: meta".into());
    }
    if !errors.is_empty() {
        return (false, errors);
    }

    let state = obj.get("state").and_then(Value::as_str).unwrap_or("");
    if !VALID_STATES.contains(&state) {
        errors.push(format!(
            "Invalid state: {state:?}. Must be one of {VALID_STATES:?}"
        ));
    }

    validate_meta(obj.get("meta").unwrap_or(&Value::Null), &mut errors);

    match obj.get("brief_rationale") {
        Some(Value::String(r)) => {
            if r.chars().count() > MAX_RATIONALE_CHARS {
                errors.push(format!(
                    "brief_rationale must be <= {MAX_RATIONALE_CHARS} characters"
                ));
            }
        }
        Some(_) => errors.push("brief_rationale must be a string".into()),
        None => errors.push("Missing required field: brief_rationale".into()),
    }

    validate_state_payload(obj, state, &mut errors);

    (errors.is_empty(), errors)
}

fn validate_meta(meta: &Value, errors: &mut Vec<String>) {
    let Some(meta) = meta.as_object() else {
        errors.push("meta must be an object".into());
        return;
    };

    let proceed = match meta.get("continue") {
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            errors.push("meta.continue must be a boolean".into());
            None
        }
        None => {
            errors.push("meta.continue is required".into());
            None
        }
    };

    if proceed == Some(false) {
        match meta.get("stop_reason").and_then(Value::as_str) {
            Some(r) => {
                if !StopReason::ALL.contains(&r) {
                    errors.push(format!(
                        "Invalid stop_reason: {r:?}. Must be one of {:?}",
                        StopReason::ALL
                    ));
                }
            }
            None => errors.push("meta.stop_reason required when continue=false".into()),
        }
    }

    match meta.get("confidence") {
        Some(Value::Null) | None => {}
        Some(Value::Number(n)) => {
            let f = n.as_f64().unwrap_or(-1.0);
            if !(0.0..=1.0).contains(&f) {
                errors.push("meta.confidence must be between 0 and 1".into());
            }
        }
        Some(_) => errors.push("meta.confidence must be a number or null".into()),
    }
}

fn validate_state_payload(
    obj: &serde_json::Map<String, Value>,
    state: &str,
    errors: &mut Vec<String>,
) {
    let require_sub = |field: &str, key: &str, errors: &mut Vec<String>| -> bool {
        match obj.get(field) {
            Some(Value::Object(sub)) => {
                if sub.contains_key(key) {
                    true
                } else {
                    errors.push(format!("{field}.{key} is required"));
                    false
                }
            }
            Some(_) => {
                errors.push(format!("'{field}' must be an object"));
                false
            }
            None => {
                errors.push(format!("state={state} requires '{field}' field"));
                false
            }
        }
    };

    match state {
        "tool" => {
            match obj.get("tool").and_then(Value::as_str) {
                Some(t) if !t.is_empty() => {}
                Some(_) => errors.push("'tool' must be a non-empty string".into()),
                None => errors.push("state=tool requires 'tool' field".into()),
            }
            if !obj.contains_key("arguments") {
                errors.push("state=tool requires 'arguments' field".into());
            }
        }
        "tools" => match obj.get("tools") {
            Some(Value::Array(tools)) => {
                if tools.is_empty() {
                    errors.push("'tools' must not be empty".into());
                }
                let mut seen = Vec::new();
                for (idx, item) in tools.iter().enumerate() {
                    let Some(entry) = item.as_object() else {
                        errors.push(format!("tools[{idx}] must be an object"));
                        continue;
                    };
                    match entry.get("tool").and_then(Value::as_str) {
                        Some(t) if !t.is_empty() => {}
                        _ => errors.push(format!("tools[{idx}] missing 'tool' field")),
                    }
                    if !entry.contains_key("arguments") {
                        errors.push(format!("tools[{idx}] missing 'arguments' field"));
                    }
                    match entry.get("tool_id").and_then(Value::as_str) {
                        Some(id) if !id.is_empty() => {
                            if seen.contains(&id) {
                                errors.push(format!("tools[{idx}] duplicate tool_id {id:?}"));
                            }
                            seen.push(id);
                        }
                        _ => errors.push(format!("tools[{idx}] missing 'tool_id' field")),
                    }
                }
            }
            Some(_) => errors.push("'tools' must be a list".into()),
            None => errors.push("state=tools requires 'tools' field".into()),
        },
        "reply" => {
            require_sub("conversation", "utterance", errors);
        }
        "plan" => {
            if !matches!(obj.get("plan"), Some(Value::Object(_))) {
                errors.push("state=plan requires 'plan' field".into());
            }
        }
        "clarify" => {
            require_sub("clarify", "question", errors);
        }
        "confirm" => {
            require_sub("confirm", "action", errors);
        }
        "wait" => {
            require_sub("wait", "event_type", errors);
        }
        "error" => {
            if require_sub("error", "error_type", errors) {
                require_sub("error", "error_message", errors);
            }
        }
        "finish" => {
            require_sub("finish", "summary", errors);
        }
        "handoff" => {
            if require_sub("handoff", "to_agent", errors) {
                require_sub("handoff", "message", errors);
            }
        }
        "reflect" => {
            require_sub("reflect", "analysis", errors);
        }
        // ask_human carries no required sub-object; an unknown state was
        // already reported above.
        _ => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
