// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a chat-completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    /// chars/4 approximation, used when a provider reports no usage.
    pub fn approx_tokens(&self) -> u64 {
        (self.content.len() / 4) as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Ask the vendor for JSON-only output where supported.
    pub json_only: bool,
}

impl ChatRequest {
    /// Split out the concatenated system prompt and the conversational rest;
    /// vendor APIs disagree about where the system message lives.
    pub fn split_system(&self) -> (Option<String>, Vec<&ChatMessage>) {
        let mut system_parts = Vec::new();
        let mut rest = Vec::new();
        for m in &self.messages {
            match m.role {
                Role::System => system_parts.push(m.content.as_str()),
                _ => rest.push(m),
            }
        }
        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, rest)
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A single-shot chat-completion endpoint.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    async fn complete(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
