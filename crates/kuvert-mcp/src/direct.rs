// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Direct HTTP transport: one POST per tool call against servers that
//! expose a plain REST surface (`POST {base}/tools/{name}`) next to their
//! SSE endpoint.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;

use crate::jsonrpc::outcome_from_call_result;
use crate::{Transport, ToolOutcome};

pub struct DirectTransport {
    base: String,
    client: reqwest::Client,
}

impl DirectTransport {
    pub fn new(server_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building direct HTTP client")?;
        Ok(Self {
            base: normalize_base(&server_url.into()),
            client,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}{path}", self.base);
        debug!(%url, "direct tool POST");
        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        resp.json::<Value>().await.context("decoding tool response")
    }
}

/// Registry entries often point at the SSE endpoint; strip a trailing
/// `/sse` so both transports can share one configured URL.
fn normalize_base(server_url: &str) -> String {
    let s = server_url.trim_end_matches('/');
    let s = s.strip_suffix("/sse").unwrap_or(s);
    format!("{s}/")
}

#[async_trait::async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &str {
        "direct"
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<String>> {
        let resp = self.post("tools/list", &serde_json::json!({})).await?;
        let tools = resp
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| match t {
                        Value::String(s) => Some(s.clone()),
                        other => other
                            .get("name")
                            .and_then(Value::as_str)
                            .map(String::from),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, args: Value) -> ToolOutcome {
        match self.post(&format!("tools/{name}"), &args).await {
            Ok(resp) => {
                // MCP-shaped bodies carry content blocks; plain REST bodies
                // are passed through as structured output.
                if resp.get("content").is_some() || resp.get("isError").is_some() {
                    outcome_from_call_result(resp)
                } else {
                    ToolOutcome {
                        ok: true,
                        structured: Some(resp),
                        text: None,
                        error: None,
                    }
                }
            }
            Err(e) => ToolOutcome::failure(format!("{e:#}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
