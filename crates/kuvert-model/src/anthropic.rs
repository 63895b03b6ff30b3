// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use kuvert_config::ModelConfig;

use crate::{ChatRequest, ChatResponse, ModelProvider, Role};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Self> {
        let api_key = resolve_api_key(cfg)
            .context("no Anthropic API key: set ANTHROPIC_API_KEY or model.api_key_env")?;
        Ok(Self {
            model: cfg.name.clone(),
            api_key,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            temperature: cfg.temperature,
            client: reqwest::Client::new(),
        })
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(key) = &cfg.api_key {
        return Some(key.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        if let Ok(key) = std::env::var(env) {
            return Some(key);
        }
    }
    std::env::var("ANTHROPIC_API_KEY").ok()
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let (system, rest) = req.split_system();

        let messages: Vec<Value> = rest
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": req.max_tokens,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }

        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %self.model, "anthropic completion request");
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        let status = resp.status();
        let payload: Value = resp.json().await.context("decoding anthropic response")?;
        if !status.is_success() {
            anyhow::bail!("anthropic error {status}: {payload}");
        }

        let text = payload["content"]
            .as_array()
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b["type"] == "text")
                    .and_then(|b| b["text"].as_str())
            })
            .unwrap_or_default()
            .to_string();

        Ok(ChatResponse {
            text,
            input_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_api_key_wins_over_env() {
        let cfg = ModelConfig {
            api_key: Some("explicit".into()),
            api_key_env: Some("SOME_OTHER_VAR".into()),
            ..ModelConfig::default()
        };
        assert_eq!(resolve_api_key(&cfg).as_deref(), Some("explicit"));
    }

    #[test]
    fn from_config_uses_default_base_url() {
        let cfg = ModelConfig {
            api_key: Some("k".into()),
            ..ModelConfig::default()
        };
        let p = AnthropicProvider::from_config(&cfg).unwrap();
        assert_eq!(p.base_url, DEFAULT_BASE_URL);
        assert_eq!(p.name(), "anthropic");
    }

    #[test]
    fn base_url_override_is_respected() {
        let cfg = ModelConfig {
            api_key: Some("k".into()),
            base_url: Some("http://localhost:4000".into()),
            ..ModelConfig::default()
        };
        let p = AnthropicProvider::from_config(&cfg).unwrap();
        assert_eq!(p.base_url, "http://localhost:4000");
    }
}
