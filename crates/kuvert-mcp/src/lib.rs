// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! MCP client transports.
//!
//! Every transport exposes the same capability contract — enumerate tools,
//! invoke one — and returns failures as [`ToolOutcome`] values rather than
//! errors, so a dead server degrades into an observation the agent can
//! reason about instead of a crashed run.

mod direct;
mod jsonrpc;
mod registry;
mod sse;
mod stdio;

pub use direct::DirectTransport;
pub use jsonrpc::{JsonRpcError, JsonRpcResponse, RpcSession, SESSION_ABORT_CODE};
pub use registry::{RegistryError, ServerEntry, ServerRegistry};
pub use sse::{SseEvent, SseEventParser, SseTransport};
pub use stdio::StdioTransport;

use serde_json::Value;

/// Result of a tool invocation over any transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutcome {
    pub ok: bool,
    /// Structured payload when the server provided one.
    pub structured: Option<Value>,
    /// Flattened text content blocks.
    pub text: Option<String>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            structured: None,
            text: None,
            error: Some(message.into()),
        }
    }

    /// Collapse into a single JSON value for observations: structured
    /// content wins, then text, then null.
    pub fn into_result_value(self) -> Value {
        if let Some(s) = self.structured {
            return s;
        }
        match self.text {
            Some(t) => Value::String(t),
            None => Value::Null,
        }
    }
}

/// Capability contract shared by all transports.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> anyhow::Result<Vec<String>>;

    /// Invoke one tool.  Failures are values; this never returns `Err`.
    async fn call_tool(&self, name: &str, args: Value) -> ToolOutcome;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
