// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{ChatRequest, ChatResponse, ModelProvider};

/// A pre-scripted provider.  Each `complete` call pops the next canned
/// response text from the front of the queue, so tests can drive the whole
/// decision loop — envelopes, malformed JSON, truncation — without network
/// access.
pub struct ScriptedDecider {
    scripts: Arc<Mutex<Vec<String>>>,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
}

impl ScriptedDecider {
    pub fn new(scripts: Vec<impl Into<String>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().map(Into::into).collect())),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Remaining unused scripts; lets tests assert consumption.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedDecider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "scripted-mock"
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let approx_in: u64 = req.messages.iter().map(|m| m.approx_tokens()).sum();
        *self.last_request.lock().unwrap() = Some(req);
        let text = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed: a valid
                // terminal envelope so runaway loops end deterministically.
                r#"{"state": "reply", "brief_rationale": "No more scripted responses",
                    "conversation": {"utterance": "[script exhausted]"},
                    "meta": {"continue": false, "stop_reason": "task_done"}}"#
                    .to_string()
            } else {
                scripts.remove(0)
            }
        };
        let output_tokens = (text.len() / 4) as u64;
        Ok(ChatResponse {
            text,
            input_tokens: approx_in,
            output_tokens,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
