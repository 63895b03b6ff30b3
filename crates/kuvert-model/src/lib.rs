// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod anthropic;
mod client;
mod mock;
mod openai_compat;
mod provider;

pub use anthropic::AnthropicProvider;
pub use client::{Decided, DecisionClient};
pub use mock::ScriptedDecider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{ChatMessage, ChatRequest, ChatResponse, ModelProvider, Role};

use kuvert_config::ModelConfig;

/// Build a provider from configuration.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicProvider::from_config(cfg)?)),
        "openai" | "openai-compatible" | "ollama" => {
            Ok(Box::new(OpenAiCompatProvider::from_config(cfg)))
        }
        "mock" => Ok(Box::new(ScriptedDecider::new(Vec::<String>::new()))),
        other => anyhow::bail!(
            "unknown model provider {other:?} (expected anthropic, openai, or mock)"
        ),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
