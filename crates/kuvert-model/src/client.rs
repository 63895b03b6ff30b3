// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::{debug, warn};

use kuvert_config::RetryPolicy;
use kuvert_envelope::{create_error_envelope, decode, DecodeError, Envelope, ParseFailure};

use crate::{ChatMessage, ChatRequest, ModelProvider, Role};

/// A decision plus the token usage that produced it (summed across retry
/// attempts so budget accounting sees the real spend).
#[derive(Debug, Clone)]
pub struct Decided {
    pub envelope: Envelope,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Drives one model call per agent cycle and turns the raw completion into
/// a validated envelope, retrying with the validator's feedback when the
/// model emits a malformed one.
pub struct DecisionClient {
    provider: Arc<dyn ModelProvider>,
    max_retries: u32,
    retry: RetryPolicy,
    temperature: Option<f32>,
}

impl DecisionClient {
    pub fn new(provider: Arc<dyn ModelProvider>, max_retries: u32) -> Self {
        Self {
            provider,
            max_retries,
            retry: RetryPolicy::default(),
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// One completion → envelope attempt.  API failures become terminal
    /// `api_error` envelopes; decode failures are returned for the retry
    /// layer to handle.
    async fn decide_once(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> (Result<Envelope, DecodeError>, u64, u64) {
        let req = ChatRequest {
            messages: messages.to_vec(),
            max_tokens,
            temperature: self.temperature,
            json_only: true,
        };
        match self.provider.complete(req).await {
            Ok(resp) => (
                decode(&resp.text),
                resp.input_tokens,
                resp.output_tokens,
            ),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "model call failed");
                (
                    Ok(create_error_envelope(
                        &format!("LLM API error: {e:#}"),
                        "api_error",
                    )),
                    0,
                    0,
                )
            }
        }
    }

    /// Decide with self-correction: validation errors are appended to the
    /// last user turn and the model is asked again; detected truncation
    /// doubles the completion budget instead.  Always returns a valid
    /// envelope.
    pub async fn decide_with_retry(&self, messages: &[ChatMessage], max_tokens: u32) -> Decided {
        let mut messages = messages.to_vec();
        let mut max_tokens = max_tokens;
        let mut total_in = 0u64;
        let mut total_out = 0u64;
        let mut last_error: Option<DecodeError> = None;

        for attempt in 0..self.max_retries {
            let (result, used_in, used_out) = self.decide_once(&messages, max_tokens).await;
            total_in += used_in;
            total_out += used_out;

            match result {
                Ok(envelope) => {
                    return Decided {
                        envelope,
                        input_tokens: total_in,
                        output_tokens: total_out,
                    }
                }
                Err(DecodeError::Parse(ParseFailure::Truncated)) => {
                    // The model ran out of room mid-envelope; a repair
                    // prompt cannot help, more output tokens can.
                    max_tokens = max_tokens.saturating_mul(2);
                    debug!(attempt, max_tokens, "truncated envelope, retrying with larger budget");
                    last_error = Some(DecodeError::Parse(ParseFailure::Truncated));
                }
                Err(DecodeError::Parse(failure)) => {
                    // No JSON at all: feeding prose back rarely converges,
                    // mirror the runtime's fail-fast behaviour.
                    return Decided {
                        envelope: create_error_envelope(
                            &format!("LLM response parse failed: {failure}"),
                            "json_parse_error",
                        ),
                        input_tokens: total_in,
                        output_tokens: total_out,
                    };
                }
                Err(DecodeError::Validation(errors)) => {
                    debug!(attempt, ?errors, "invalid envelope, asking model to correct");
                    append_correction(&mut messages, &errors);
                    last_error = Some(DecodeError::Validation(errors));
                }
            }

            if attempt + 1 < self.max_retries {
                tokio::time::sleep(self.retry.jittered_delay(attempt)).await;
            }
        }

        let detail = match last_error {
            Some(e) => format!(": {e}"),
            None => String::new(),
        };
        Decided {
            envelope: create_error_envelope(
                &format!(
                    "Failed to get valid envelope after {} attempts{detail}",
                    self.max_retries
                ),
                "max_retries_exceeded",
            ),
            input_tokens: total_in,
            output_tokens: total_out,
        }
    }
}

/// Append the validator's complaints to the last user message so the next
/// attempt sees exactly what was wrong.
fn append_correction(messages: &mut Vec<ChatMessage>, errors: &[String]) {
    let mut correction = String::from("\n\nPrevious envelope had validation errors:\n");
    for e in errors {
        correction.push_str("- ");
        correction.push_str(e);
        correction.push('\n');
    }
    correction.push_str("\nPlease emit a valid envelope that fixes these issues.");

    match messages.last_mut() {
        Some(last) if last.role == Role::User => last.content.push_str(&correction),
        _ => messages.push(ChatMessage::user(correction.trim_start().to_string())),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedDecider;
    use kuvert_envelope::{Decision, StopReason};

    fn client(scripts: Vec<&str>) -> DecisionClient {
        DecisionClient::new(Arc::new(ScriptedDecider::new(scripts)), 3)
    }

    fn user_messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("emit envelopes"),
            ChatMessage::user("do the thing"),
        ]
    }

    const VALID_REPLY: &str = r#"{"state": "reply", "brief_rationale": "done",
        "conversation": {"utterance": "hello"},
        "meta": {"continue": false, "stop_reason": "user_reply"}}"#;

    #[tokio::test]
    async fn valid_envelope_returns_first_try() {
        let c = client(vec![VALID_REPLY]);
        let decided = c.decide_with_retry(&user_messages(), 1000).await;
        assert_eq!(decided.envelope.state(), "reply");
        assert!(decided.output_tokens > 0);
    }

    #[tokio::test]
    async fn validation_error_feeds_back_and_retries() {
        // First script: reply without conversation — invalid even after
        // auto-repair.  Second script: correct envelope.
        let invalid = r#"{"state": "reply", "brief_rationale": "oops",
            "meta": {"continue": false, "stop_reason": "user_reply"}}"#;
        let provider = Arc::new(ScriptedDecider::new(vec![invalid, VALID_REPLY]));
        let c = DecisionClient::new(Arc::clone(&provider) as Arc<dyn ModelProvider>, 3);

        let decided = c.decide_with_retry(&user_messages(), 1000).await;
        assert_eq!(decided.envelope.state(), "reply");

        // The retry prompt must carry the validator's complaint.
        let last = provider.last_request.lock().unwrap().clone().unwrap();
        let user_turn = last.messages.last().unwrap();
        assert!(user_turn.content.contains("validation errors"));
        assert!(user_turn.content.contains("conversation"));
    }

    #[tokio::test]
    async fn retries_exhausted_yields_max_retries_envelope() {
        let invalid = r#"{"state": "clarify", "brief_rationale": "hm", "clarify": {},
            "meta": {"continue": false, "stop_reason": "need_input"}}"#;
        let c = client(vec![invalid, invalid, invalid]);
        let decided = c.decide_with_retry(&user_messages(), 1000).await;
        match &decided.envelope.decision {
            Decision::Error { error } => {
                assert_eq!(error.error_type, "max_retries_exceeded")
            }
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(decided.envelope.meta.stop_reason, Some(StopReason::Error));
    }

    #[tokio::test]
    async fn prose_without_json_is_parse_error_without_retry() {
        let c = client(vec!["I'll get right on that!", VALID_REPLY]);
        let decided = c.decide_with_retry(&user_messages(), 1000).await;
        match &decided.envelope.decision {
            Decision::Error { error } => assert_eq!(error.error_type, "json_parse_error"),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncation_retries_with_doubled_budget() {
        let truncated = r#"{"state": "reply", "conversation": {"utterance": "cut"#;
        let provider = Arc::new(ScriptedDecider::new(vec![truncated, VALID_REPLY]));
        let c = DecisionClient::new(Arc::clone(&provider) as Arc<dyn ModelProvider>, 3);
        let decided = c.decide_with_retry(&user_messages(), 500).await;
        assert_eq!(decided.envelope.state(), "reply");
        let last = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(last.max_tokens, 1000, "budget should double after truncation");
    }

    #[tokio::test]
    async fn usage_accumulates_across_attempts() {
        let invalid = r#"{"state": "reply", "brief_rationale": "oops",
            "meta": {"continue": false, "stop_reason": "user_reply"}}"#;
        let c = client(vec![invalid, VALID_REPLY]);
        let decided = c.decide_with_retry(&user_messages(), 1000).await;
        // Two completions happened; usage must reflect both.
        assert!(decided.output_tokens > (VALID_REPLY.len() / 4) as u64);
    }

    #[tokio::test]
    async fn json_mode_is_requested() {
        let provider = Arc::new(ScriptedDecider::new(vec![VALID_REPLY]));
        let c = DecisionClient::new(Arc::clone(&provider) as Arc<dyn ModelProvider>, 3);
        let _ = c.decide_with_retry(&user_messages(), 1000).await;
        let last = provider.last_request.lock().unwrap().clone().unwrap();
        assert!(last.json_only);
    }
}
