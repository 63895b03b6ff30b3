// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! OpenAI-compatible chat-completions driver.  Covers the hosted API and
//! every local server that mimics it (llama.cpp, Ollama, LiteLLM) via
//! `base_url`.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use kuvert_config::ModelConfig;

use crate::{ChatRequest, ChatResponse, ModelProvider, Role};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ModelConfig) -> Self {
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| {
                cfg.api_key_env
                    .as_ref()
                    .and_then(|env| std::env::var(env).ok())
            })
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        Self {
            model: cfg.name.clone(),
            api_key,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            temperature: cfg.temperature,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
        });
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }
        if req.json_only {
            // The JSON output mode keeps prose out of the envelope stream.
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, "openai completion request");
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.context("openai request failed")?;

        let status = resp.status();
        let payload: Value = resp.json().await.context("decoding openai response")?;
        if !status.is_success() {
            anyhow::bail!("openai error {status}: {payload}");
        }

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(ChatResponse {
            text,
            input_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_server_needs_no_api_key() {
        let cfg = ModelConfig {
            provider: "openai".into(),
            name: "llama3.2".into(),
            base_url: Some("http://localhost:11434/v1".into()),
            api_key: None,
            api_key_env: Some("KUVERT_TEST_UNSET_KEY_VAR".into()),
            ..ModelConfig::default()
        };
        let p = OpenAiCompatProvider::from_config(&cfg);
        assert_eq!(p.base_url, "http://localhost:11434/v1");
        assert_eq!(p.model_name(), "llama3.2");
    }
}
