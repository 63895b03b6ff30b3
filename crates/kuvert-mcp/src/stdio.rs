// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! MCP over a child process: line-delimited JSON-RPC 2.0 on the server's
//! stdin/stdout.  The session is established once and reused; when the
//! child exits the session is invalidated and the next call relaunches it.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use crate::jsonrpc::RpcSession;
use crate::{Transport, ToolOutcome};

pub struct StdioTransport {
    command: Vec<String>,
    timeout: Duration,
    session: Mutex<Option<Arc<RpcSession>>>,
}

impl StdioTransport {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            session: Mutex::new(None),
        }
    }

    /// Return the live session, launching the server if needed.
    ///
    /// The mutex guards first-use initialisation: concurrent callers that
    /// race here must not spawn two children.
    async fn ensure_session(&self) -> anyhow::Result<Arc<RpcSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if !session.is_closed() {
                return Ok(Arc::clone(session));
            }
            warn!("stdio MCP server exited; relaunching");
            *slot = None;
        }

        let session = self.launch().await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn launch(&self) -> anyhow::Result<Arc<RpcSession>> {
        let (program, args) = self
            .command
            .split_first()
            .context("mcp.server_command is empty; configure the stdio server binary")?;

        debug!(program, ?args, "spawning stdio MCP server");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning MCP server {program:?}"))?;

        let stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;

        let (out_tx, mut out_rx) = mpsc::channel::<Value>(64);
        let (in_tx, in_rx) = mpsc::channel::<Value>(64);

        // Writer: drain outbound messages into the child as JSON lines.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = out_rx.recv().await {
                let mut line = msg.to_string();
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            debug!("stdio writer finished");
        });

        // Reader: one JSON-RPC message per stdout line.  When the stream
        // ends (child exit) the inbound sender drops, which closes the
        // session and unblocks pending callers.
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(next) = lines.next().await {
                let line = match next {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(error = %e, "stdio read error");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "non-JSON line from MCP server"),
                }
            }
            // Reap the child so it does not linger as a zombie.
            let _ = child.wait().await;
            debug!("stdio reader finished");
        });

        let session = RpcSession::start(out_tx, in_rx);
        session
            .initialize(self.timeout)
            .await
            .context("MCP initialize handshake failed")?;
        info!(program, "stdio MCP session established");
        Ok(session)
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<String>> {
        let session = self.ensure_session().await?;
        session.list_tools(self.timeout).await
    }

    async fn call_tool(&self, name: &str, args: Value) -> ToolOutcome {
        let session = match self.ensure_session().await {
            Ok(s) => s,
            Err(e) => return ToolOutcome::failure(format!("{e:#}")),
        };
        session.call_tool(name, args, self.timeout).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
