// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The envelope codec: every model response passes through
//! parse → normalize → auto-repair → validate before the agent loop sees a
//! typed [`Envelope`].  Failures surface as [`DecodeError`] so the decision
//! client can drive the model-repair retry; [`decode_lossy`] maps them to a
//! fallback error envelope for callers that must always receive one.

mod normalize;
mod parse;
mod repair;
mod types;
mod validate;

pub use normalize::{normalize, VALID_STATES};
pub use parse::{extract_json, looks_truncated, ParseFailure};
pub use repair::auto_repair;
pub use types::*;
pub use validate::{validate, MAX_RATIONALE_CHARS};

use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope parse failed: {0}")]
    Parse(#[from] ParseFailure),
    /// The envelope survived auto-repair but still violates the schema.
    /// The error list is fed back to the model for self-correction.
    #[error("envelope validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Decode raw model output into a validated envelope.
///
/// Auto-repair only runs when the normalised envelope fails validation, so
/// well-formed envelopes pass through untouched.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let raw = extract_json(text)?;
    let normalised = normalize(raw);

    let (ok, errors) = validate(&normalised);
    let value = if ok {
        normalised
    } else {
        debug!(?errors, "envelope invalid, attempting auto-repair");
        let repaired = auto_repair(normalised);
        let (ok, remaining) = validate(&repaired);
        if !ok {
            return Err(DecodeError::Validation(remaining));
        }
        repaired
    };

    serde_json::from_value(value.clone()).map_err(|e| {
        // A validated value that fails typed deserialization is a schema /
        // type-model mismatch; report it like any other validation failure.
        debug!(error = %e, "validated envelope failed typed deserialization");
        DecodeError::Validation(vec![format!("envelope did not match schema: {e}")])
    })
}

/// Like [`decode`], but never fails: decode errors become a fallback error
/// envelope so the agent loop always has a valid decision to act on.
pub fn decode_lossy(text: &str) -> Envelope {
    match decode(text) {
        Ok(env) => env,
        Err(DecodeError::Parse(f)) => {
            create_error_envelope(&format!("LLM response parse failed: {f}"), "json_parse_error")
        }
        Err(DecodeError::Validation(errors)) => create_error_envelope(
            &format!("Envelope validation failed: {}", errors.join("; ")),
            "validation_error",
        ),
    }
}

/// Synthesise a valid terminal error envelope.
pub fn create_error_envelope(message: &str, error_type: &str) -> Envelope {
    Envelope {
        decision: Decision::Error {
            error: ErrorInfo {
                error_type: error_type.to_string(),
                error_message: message.to_string(),
                suggested_repair: None,
            },
        },
        brief_rationale: Some("Failed to produce a valid decision".into()),
        meta: Meta::stop(StopReason::Error),
        envelope_id: None,
        timestamp: None,
    }
}

/// Raw-value form of [`create_error_envelope`], for repair-time use where no
/// typed envelope exists yet.
pub(crate) fn error_envelope_value(message: &str, error_type: &str) -> Value {
    json!({
        "state": "error",
        "brief_rationale": "Failed to produce a valid decision",
        "error": {
            "error_type": error_type,
            "error_message": message,
        },
        "meta": {"continue": false, "stop_reason": "error"}
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decode_clean_envelope() {
        let text = r#"{
            "state": "tool",
            "brief_rationale": "Reading configuration",
            "tool": "read_file",
            "arguments": {"path": "config.json"},
            "meta": {"continue": true, "confidence": 0.85}
        }"#;
        let env = decode(text).unwrap();
        assert_eq!(env.state(), "tool");
        assert_eq!(env.meta.confidence, Some(0.85));
    }

    #[test]
    fn decode_adds_identity_fields() {
        let env = decode(
            r#"{"state": "plan", "brief_rationale": "r", "plan": {"steps": []}, "meta": {"continue": true}}"#,
        )
        .unwrap();
        assert!(env.envelope_id.is_some());
        assert!(env.timestamp.is_some());
    }

    #[test]
    fn serialize_then_decode_round_trips() {
        let env = Envelope {
            decision: Decision::Tools {
                tools: vec![
                    ToolRequest {
                        tool_id: "f1".into(),
                        tool: "create_file".into(),
                        arguments: json!({"path": "a.txt", "content": "A"}),
                    },
                    ToolRequest {
                        tool_id: "f2".into(),
                        tool: "create_file".into(),
                        arguments: json!({"path": "b.txt", "content": "B"}),
                    },
                ],
            },
            brief_rationale: Some("Creating files in parallel".into()),
            meta: Meta::proceed(),
            envelope_id: Some("e1234567".into()),
            timestamp: Some("2025-06-01T10:00:00Z".into()),
        };
        let text = serde_json::to_string(&env.to_value()).unwrap();
        let back = decode(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn decode_repairs_missing_meta() {
        let env = decode(r#"{"state": "tool", "tool": "get_cwd", "arguments": {}}"#).unwrap();
        assert!(env.meta.proceed);
    }

    #[test]
    fn decode_reports_validation_errors_for_contentless_reply() {
        let err = decode(r#"{"state": "reply", "brief_rationale": "r", "meta": {"continue": false, "stop_reason": "user_reply"}}"#)
            .unwrap_err();
        match err {
            DecodeError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.contains("conversation")))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn decode_fails_fast_on_truncation() {
        let err = decode(r#"{"state": "reply", "conversation": {"utterance": "cut of"#).unwrap_err();
        assert_eq!(err, DecodeError::Parse(ParseFailure::Truncated));
    }

    #[test]
    fn decode_lossy_never_fails() {
        let env = decode_lossy("no json here at all");
        assert_eq!(env.state(), "error");
        assert!(!env.meta.proceed);
        match &env.decision {
            Decision::Error { error } => assert_eq!(error.error_type, "json_parse_error"),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn error_envelope_always_validates() {
        let env = create_error_envelope("something broke", "api_error");
        let (ok, errors) = validate(&env.to_value());
        assert!(ok, "{errors:?}");
        assert_eq!(env.meta.stop_reason, Some(StopReason::Error));
    }

    #[test]
    fn decode_handles_prose_wrapped_envelope() {
        let text = "Of course, here is the decision:\n```json\n{\"state\": \"reply\", \"brief_rationale\": \"done\", \"conversation\": {\"utterance\": \"hi\"}, \"meta\": {\"continue\": false, \"stop_reason\": \"user_reply\"}}\n```";
        let env = decode(text).unwrap();
        match env.decision {
            Decision::Reply { conversation } => assert_eq!(conversation.utterance, "hi"),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn decode_migrates_legacy_dialect() {
        let env = decode(
            r#"{"type": "message", "message": "hello", "brief_rationale": "r", "meta": {"continue": false, "stop_reason": "user_reply"}}"#,
        )
        .unwrap();
        assert_eq!(env.state(), "reply");
    }

    #[test]
    fn normalize_is_applied_before_validation() {
        // Missing tool_ids would fail validation; normalize fills them in.
        let env = decode(
            r#"{"state": "tools", "brief_rationale": "r", "tools": [
                {"tool": "create_file", "arguments": {"path": "a"}},
                {"tool": "create_file", "arguments": {"path": "b"}}
            ], "meta": {"continue": true}}"#,
        )
        .unwrap();
        match env.decision {
            Decision::Tools { tools } => {
                assert_eq!(tools[0].tool_id, "tool_0");
                assert_eq!(tools[1].tool_id, "tool_1");
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }
}
