// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! MCP over server-sent events.
//!
//! The protocol is half-duplex by construction: the server can only push
//! through a one-way event stream, and the client can only speak by POSTing
//! JSON-RPC to a session URL that the server announces in the *first* event
//! of that stream.  This module bridges the two sides into one duplex
//! [`RpcSession`]: a reader task owns the long-lived GET, a sender task owns
//! the POSTs, and the announced endpoint is a one-shot rendezvous between
//! them.  Lifecycle is coupled — when the event stream dies, a synthesized
//! JSON-RPC error is pushed inbound so every pending caller unblocks, and
//! the cached session is re-established on next use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use kuvert_config::RetryPolicy;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::jsonrpc::{RpcSession, JSONRPC_VERSION, SESSION_ABORT_CODE};
use crate::{Transport, ToolOutcome};

/// Events may arrive minutes apart; the stream read timeout must be much
/// longer than the request POST timeout.
const EVENT_READ_TIMEOUT: Duration = Duration::from_secs(120);
const POST_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for the server to announce its message endpoint.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SseTransport {
    url: String,
    call_timeout: Duration,
    retry: RetryPolicy,
    /// Sessions cached by URL; the mutex guards first-use initialisation.
    sessions: Mutex<HashMap<String, Arc<RpcSession>>>,
}

impl SseTransport {
    pub fn new(url: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            call_timeout,
            retry: RetryPolicy::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_session(&self) -> anyhow::Result<Arc<RpcSession>> {
        let mut cache = self.sessions.lock().await;
        if let Some(session) = cache.get(&self.url) {
            if !session.is_closed() {
                return Ok(Arc::clone(session));
            }
            warn!(url = %self.url, "SSE session died; reconnecting");
            cache.remove(&self.url);
        }

        let mut last_err = None;
        for attempt in 0..self.retry.attempts {
            match self.establish().await {
                Ok(session) => {
                    cache.insert(self.url.clone(), Arc::clone(&session));
                    return Ok(session);
                }
                Err(e) => {
                    let delay = self.retry.jittered_delay(attempt);
                    warn!(url = %self.url, error = %format!("{e:#}"), ?delay, "SSE connect failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("SSE connect failed")))
    }

    async fn establish(&self) -> anyhow::Result<Arc<RpcSession>> {
        let event_client = reqwest::Client::builder()
            .read_timeout(EVENT_READ_TIMEOUT)
            .build()
            .context("building SSE event client")?;
        let post_client = reqwest::Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .context("building SSE post client")?;

        debug!(url = %self.url, "opening SSE event stream");
        let resp = event_client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .context("opening SSE stream")?
            .error_for_status()
            .context("SSE stream rejected")?;

        let (in_tx, in_rx) = mpsc::channel::<Value>(256);
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        // Reader: sole producer on the inbound channel.
        let url_for_log = self.url.clone();
        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut parser = SseEventParser::default();
            let mut stream = resp.bytes_stream();
            let fatal: Option<String> = loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        let text = String::from_utf8_lossy(&chunk);
                        for event in parser.push(&text) {
                            if event.event == "endpoint" {
                                // One-shot rendezvous with the sender side.
                                if let Some(tx) = endpoint_tx.take() {
                                    info!(endpoint = %event.data, "SSE message endpoint announced");
                                    let _ = tx.send(event.data.trim().to_string());
                                }
                                continue;
                            }
                            if event.data.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(&event.data) {
                                Ok(msg) => {
                                    if in_tx.send(msg).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "SSE event payload is not JSON-RPC")
                                }
                            }
                        }
                    }
                    Some(Err(e)) => break Some(format!("SSE stream error: {e}")),
                    None => break Some("SSE stream closed by server".to_string()),
                }
            };
            if let Some(message) = fatal {
                warn!(url = %url_for_log, "{message}");
                // Unblock pending callers before the channel closes.
                let abort = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": null,
                    "error": {"code": SESSION_ABORT_CODE, "message": message},
                });
                let _ = in_tx.send(abort).await;
            }
        });

        // The session is not usable until the endpoint is known.
        let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx)
            .await
            .context("timed out waiting for SSE endpoint event")?
            .context("SSE stream ended before announcing an endpoint")?;
        let message_url = Url::parse(&self.url)
            .context("SSE base url is invalid")?
            .join(&endpoint)
            .context("announced endpoint path is invalid")?;

        // Sender: sole consumer of the outbound channel.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let body = msg.to_string();
                match post_client
                    .post(message_url.clone())
                    .header(CONTENT_TYPE, "application/json")
                    .body(body)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status() == reqwest::StatusCode::ACCEPTED => {
                        debug!(url = %message_url, "message accepted");
                    }
                    Ok(resp) => {
                        // Anything but 202 counts as a failed send.
                        warn!(
                            url = %message_url,
                            status = %resp.status(),
                            "message POST failed"
                        );
                    }
                    Err(e) => warn!(url = %message_url, error = %e, "message POST error"),
                }
            }
            debug!("SSE sender finished");
        });

        let session = RpcSession::start(out_tx, in_rx);
        session
            .initialize(self.call_timeout)
            .await
            .context("MCP initialize handshake failed")?;
        info!(url = %self.url, "SSE MCP session established");
        Ok(session)
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &str {
        "sse"
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<String>> {
        let session = self.ensure_session().await?;
        session.list_tools(self.call_timeout).await
    }

    async fn call_tool(&self, name: &str, args: Value) -> ToolOutcome {
        let session = match self.ensure_session().await {
            Ok(s) => s,
            Err(e) => return ToolOutcome::failure(format!("{e:#}")),
        };
        session.call_tool(name, args, self.call_timeout).await
    }
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; the wire default is "message".
    pub event: String,
    pub data: String,
}

/// Incremental SSE wire parser.
///
/// Chunks arrive at arbitrary byte boundaries; complete events are
/// delimited by a blank line.  Multiple `data:` lines within one event are
/// joined with newlines, comment lines (leading `:`) are skipped.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buf: String,
}

impl SseEventParser {
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        loop {
            let Some(split) = find_event_boundary(&self.buf) else {
                break;
            };
            let (raw, rest) = self.buf.split_at(split.0);
            let raw = raw.to_string();
            self.buf = rest[split.1..].to_string();
            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
        }
        events
    }
}

/// Find the first blank-line event boundary; returns (index, delimiter len).
fn find_event_boundary(buf: &str) -> Option<(usize, usize)> {
    let lf = buf.find("\n\n").map(|i| (i, 2));
    let crlf = buf.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data_lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() && event == "message" {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
