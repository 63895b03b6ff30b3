// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! JSON-RPC 2.0 session shared by the stdio and SSE transports.
//!
//! The session owns an outbound channel (drained by the transport's sender
//! task) and consumes an inbound channel (fed by the transport's reader
//! task).  Requests are correlated to responses by numeric id through a
//! pending map of oneshot senders; an inbound error with a null id is
//! treated as session-fatal and unblocks every pending caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::ToolOutcome;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code pushed inbound when the transport dies underneath the session.
pub const SESSION_ABORT_CODE: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    /// Null for session-level synthesized errors.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct RpcSession {
    outbound: mpsc::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl RpcSession {
    /// Wire the session to its transport channels and spawn the inbound
    /// pump.  The reader task feeding `inbound` is the sole producer; when
    /// it drops the sender the pump drains and fails all pending requests.
    pub fn start(outbound: mpsc::Sender<Value>, mut inbound: mpsc::Receiver<Value>) -> Arc<Self> {
        let session = Arc::new(Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
        });

        let pending = Arc::clone(&session.pending);
        let closed = Arc::clone(&session.closed);
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let resp: JsonRpcResponse = match serde_json::from_value(msg) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "ignoring non-response inbound message");
                        continue;
                    }
                };
                match resp.id.as_ref().and_then(Value::as_u64) {
                    Some(id) => {
                        let waiter = pending.lock().expect("pending map poisoned").remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => debug!(id, "response for unknown or timed-out request"),
                        }
                    }
                    None => {
                        if let Some(err) = &resp.error {
                            // Session-fatal: unblock everything that is waiting.
                            warn!(code = err.code, message = %err.message, "session error, failing pending requests");
                            let mut map = pending.lock().expect("pending map poisoned");
                            for (_, tx) in map.drain() {
                                let _ = tx.send(resp.clone());
                            }
                        }
                        // id-less messages without an error are server
                        // notifications; nothing to correlate.
                    }
                }
            }
            // Transport gone: dropping the senders wakes every caller.
            closed.store(true, Ordering::SeqCst);
            pending.lock().expect("pending map poisoned").clear();
            debug!("rpc session pump finished");
        });

        session
    }

    /// True once the inbound side has shut down.  Cached sessions check this
    /// before reuse and re-establish the transport when it is set.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    /// Send a request and await its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> anyhow::Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        let mut msg = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
        });
        if let Some(p) = params {
            msg["params"] = p;
        }

        if self.outbound.send(msg).await.is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            anyhow::bail!("transport closed before request {method:?} could be sent");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => anyhow::bail!("transport closed while awaiting {method:?}"),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
                anyhow::bail!("timed out after {timeout:?} awaiting {method:?}")
            }
        }
    }

    /// Fire-and-forget notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> anyhow::Result<()> {
        let mut msg = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
        });
        if let Some(p) = params {
            msg["params"] = p;
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed before notification {method:?}"))
    }

    /// MCP `initialize` handshake; run once per established session.
    pub async fn initialize(&self, timeout: Duration) -> anyhow::Result<()> {
        let resp = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "kuvert", "version": env!("CARGO_PKG_VERSION")},
                })),
                timeout,
            )
            .await?;
        if let Some(err) = resp.error {
            anyhow::bail!("initialize rejected: {} ({})", err.message, err.code);
        }
        self.notify("notifications/initialized", None).await?;
        Ok(())
    }

    /// MCP `tools/list`.
    pub async fn list_tools(&self, timeout: Duration) -> anyhow::Result<Vec<String>> {
        let resp = self.request("tools/list", Some(json!({})), timeout).await?;
        if let Some(err) = resp.error {
            anyhow::bail!("tools/list failed: {} ({})", err.message, err.code);
        }
        let tools = resp
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    /// MCP `tools/call`; failures become `ToolOutcome` values.
    pub async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> ToolOutcome {
        let resp = match self
            .request(
                "tools/call",
                Some(json!({"name": name, "arguments": arguments})),
                timeout,
            )
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolOutcome::failure(format!("{e:#}")),
        };
        if let Some(err) = resp.error {
            return ToolOutcome::failure(format!("{} ({})", err.message, err.code));
        }
        outcome_from_call_result(resp.result.unwrap_or(Value::Null))
    }
}

/// Map an MCP `tools/call` result (`content` blocks + optional
/// `structuredContent` + `isError`) into a [`ToolOutcome`].
pub fn outcome_from_call_result(result: Value) -> ToolOutcome {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let structured = result.get("structuredContent").cloned();
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let text = if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    };

    if is_error {
        let message = text.clone().unwrap_or_else(|| "tool reported error".into());
        ToolOutcome {
            ok: false,
            structured,
            text,
            error: Some(message),
        }
    } else {
        ToolOutcome {
            ok: true,
            structured,
            text,
            error: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A loopback harness: requests written to `outbound` are answered by
    /// `respond` and fed back through `inbound`.
    fn loopback<F>(respond: F) -> Arc<RpcSession>
    where
        F: Fn(Value) -> Option<Value> + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(16);
        let (in_tx, in_rx) = mpsc::channel::<Value>(16);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Some(reply) = respond(msg) {
                    if in_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        });
        RpcSession::start(out_tx, in_rx)
    }

    fn echo_result(result: Value) -> impl Fn(Value) -> Option<Value> + Send + 'static {
        move |msg| {
            let id = msg.get("id")?.clone();
            Some(json!({"jsonrpc": "2.0", "id": id, "result": result.clone()}))
        }
    }

    #[tokio::test]
    async fn request_response_correlates_by_id() {
        let session = loopback(echo_result(json!({"ok": true})));
        let resp = session
            .request("ping", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn concurrent_requests_each_get_their_own_response() {
        // Echo the request id back inside the result so mixups are visible.
        let session = loopback(|msg| {
            let id = msg.get("id")?.clone();
            Some(json!({"jsonrpc": "2.0", "id": id.clone(), "result": {"echo_id": id}}))
        });
        let a = session.request("m", None, Duration::from_secs(1));
        let b = session.request("m", None, Duration::from_secs(1));
        let (ra, rb) = tokio::join!(a, b);
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.result.unwrap()["echo_id"], ra.id.unwrap());
        assert_eq!(rb.result.unwrap()["echo_id"], rb.id.unwrap());
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let session = loopback(|_| None);
        let err = session
            .request("ping", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn null_id_error_unblocks_pending_callers() {
        let (out_tx, _out_rx) = mpsc::channel::<Value>(16);
        let (in_tx, in_rx) = mpsc::channel::<Value>(16);
        let session = RpcSession::start(out_tx, in_rx);

        let pending = session.request("slow", None, Duration::from_secs(5));
        let abort = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            in_tx
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {"code": SESSION_ABORT_CODE, "message": "stream died"}
                }))
                .await
                .unwrap();
        };
        let (resp, _) = tokio::join!(pending, abort);
        let resp = resp.unwrap();
        assert_eq!(resp.error.unwrap().code, SESSION_ABORT_CODE);
    }

    #[tokio::test]
    async fn session_reports_closed_after_inbound_ends() {
        let (out_tx, _out_rx) = mpsc::channel::<Value>(16);
        let (in_tx, in_rx) = mpsc::channel::<Value>(16);
        let session = RpcSession::start(out_tx, in_rx);
        assert!(!session.is_closed());
        drop(in_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn list_tools_extracts_names() {
        let session = loopback(echo_result(json!({
            "tools": [{"name": "read_file"}, {"name": "search"}]
        })));
        let tools = session.list_tools(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tools, vec!["read_file", "search"]);
    }

    #[tokio::test]
    async fn call_tool_flattens_text_blocks() {
        let session = loopback(echo_result(json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "text", "text": "line two"}
            ],
            "isError": false
        })));
        let outcome = session
            .call_tool("t", json!({}), Duration::from_secs(1))
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.text.as_deref(), Some("line one\nline two"));
    }

    #[tokio::test]
    async fn call_tool_propagates_is_error() {
        let session = loopback(echo_result(json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        })));
        let outcome = session
            .call_tool("t", json!({}), Duration::from_secs(1))
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[test]
    fn structured_content_is_preserved() {
        let outcome = outcome_from_call_result(json!({
            "content": [],
            "structuredContent": {"rows": 3}
        }));
        assert!(outcome.ok);
        assert_eq!(outcome.structured.unwrap()["rows"], 3);
        assert!(outcome.text.is_none());
    }
}
