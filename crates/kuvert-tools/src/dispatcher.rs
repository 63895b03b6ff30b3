// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The tool dispatcher: name aliasing, parameter remapping, permission
//! checks, approval gating, and bounded parallel fan-out, in front of
//! either the built-in backend or an MCP transport.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use kuvert_config::ToolsConfig;
use kuvert_envelope::ToolRequest;
use kuvert_mcp::Transport;

use crate::builtin::{BuiltinTools, CATALOG};
use crate::observation::{BatchObservation, Observation};

pub enum ToolBackend {
    Builtin(BuiltinTools),
    Remote(Arc<dyn Transport>),
}

pub struct Dispatcher {
    backend: ToolBackend,
    dangerous: HashSet<String>,
    /// Session allow-set from resolved tags; empty = unrestricted.
    allowed: HashSet<String>,
    timeout: Duration,
    max_parallel: usize,
}

impl Dispatcher {
    pub fn builtin(cfg: &ToolsConfig) -> Self {
        let root = cfg.workdir.as_ref().map(std::path::PathBuf::from);
        Self::new(ToolBackend::Builtin(BuiltinTools::new(root)), cfg)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, cfg: &ToolsConfig) -> Self {
        Self::new(ToolBackend::Remote(transport), cfg)
    }

    fn new(backend: ToolBackend, cfg: &ToolsConfig) -> Self {
        Self {
            backend,
            dangerous: cfg.dangerous_tools.iter().cloned().collect(),
            allowed: HashSet::new(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            max_parallel: cfg.max_parallel.max(1),
        }
    }

    /// Restrict the callable set; an empty set means unrestricted.
    pub fn set_allowed_tools(&mut self, allowed: HashSet<String>) {
        self.allowed = allowed;
    }

    pub fn is_dangerous(&self, tool: &str) -> bool {
        self.dangerous.contains(canonical_name(tool))
    }

    /// Tool catalogue lines for the prompt: I/O hints for the built-in
    /// backend, server-reported names otherwise.
    pub async fn catalog(&self) -> Vec<String> {
        match &self.backend {
            ToolBackend::Builtin(_) => CATALOG.iter().map(|s| s.to_string()).collect(),
            ToolBackend::Remote(transport) => match transport.list_tools().await {
                Ok(names) => names,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "could not list remote tools");
                    Vec::new()
                }
            },
        }
    }

    /// Execute one tool call and normalise the result into an observation.
    pub async fn execute_single(&self, tool: &str, arguments: Value) -> Observation {
        let started = Instant::now();
        let canonical = canonical_name(tool);

        if !self.allowed.is_empty() && !self.allowed.contains(canonical) {
            return Observation::failure(
                canonical,
                format!("Tool '{canonical}' not allowed by current permissions"),
                elapsed_ms(started),
            );
        }

        if self.dangerous.contains(canonical) && !is_approved(&arguments) {
            debug!(tool = canonical, "withholding dangerous tool pending approval");
            return Observation::approval_required(
                canonical,
                format!("High-risk tool '{canonical}' requires human approval"),
            );
        }

        let arguments = remap_parameters(canonical, arguments);

        let run = async {
            match &self.backend {
                ToolBackend::Builtin(tools) => {
                    let arguments = drop_unknown_params(canonical, arguments);
                    let result = tools.execute(canonical, &arguments).await;
                    let success = result["success"].as_bool().unwrap_or(true);
                    if success {
                        Observation::success(canonical, result, 0.0)
                    } else {
                        let error = result["error"]
                            .as_str()
                            .unwrap_or("tool failed")
                            .to_string();
                        Observation::failure(canonical, error, 0.0)
                    }
                }
                ToolBackend::Remote(transport) => {
                    let outcome = transport.call_tool(canonical, arguments).await;
                    if outcome.ok {
                        Observation::success(canonical, outcome.into_result_value(), 0.0)
                    } else {
                        let error = outcome
                            .error
                            .unwrap_or_else(|| "transport error".to_string());
                        Observation::failure(canonical, error, 0.0)
                    }
                }
            }
        };

        let mut obs = match tokio::time::timeout(self.timeout, run).await {
            Ok(obs) => obs,
            Err(_) => Observation::failure(
                canonical,
                format!("Tool execution timeout ({}s)", self.timeout.as_secs()),
                0.0,
            ),
        };
        obs.duration_ms = elapsed_ms(started);
        obs
    }

    /// Execute a batch of tool calls, keyed by `tool_id`.
    ///
    /// With `parallel`, members run concurrently under a bounded worker
    /// count; per-member durations are measured independently and
    /// completion order is not reflected in the aggregate.
    pub async fn execute_batch(&self, requests: &[ToolRequest], parallel: bool) -> BatchObservation {
        let mut results: BTreeMap<String, Observation> = BTreeMap::new();

        if parallel {
            let semaphore = Arc::new(Semaphore::new(self.max_parallel));
            let futures = requests.iter().map(|req| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    let obs = self.execute_single(&req.tool, req.arguments.clone()).await;
                    (req.tool_id.clone(), obs)
                }
            });
            for (tool_id, obs) in futures::future::join_all(futures).await {
                results.insert(tool_id, obs);
            }
        } else {
            for req in requests {
                let obs = self.execute_single(&req.tool, req.arguments.clone()).await;
                results.insert(req.tool_id.clone(), obs);
            }
        }

        BatchObservation::from_results(results)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0
}

fn is_approved(arguments: &Value) -> bool {
    arguments["approved"].as_bool().unwrap_or(false)
}

/// Map common synonyms onto canonical tool names.
pub fn canonical_name(tool: &str) -> &str {
    match tool {
        "pwd" | "cwd" | "get_working_directory" | "current_working_directory"
        | "working_directory" => "get_cwd",
        "shell" | "bash" | "powershell" => "execute_powershell",
        other => other,
    }
}

/// Per-tool argument key renames, applied before dispatch.
fn remap_parameters(tool: &str, mut arguments: Value) -> Value {
    const REMAPS: &[(&str, &[(&str, &str)])] =
        &[("write_block", &[("content", "text"), ("filename", "path")])];

    if let Some((_, renames)) = REMAPS.iter().find(|(t, _)| *t == tool) {
        if let Some(obj) = arguments.as_object_mut() {
            for (from, to) in *renames {
                if let Some(v) = obj.remove(*from) {
                    obj.entry(to.to_string()).or_insert(v);
                }
            }
        }
    }
    arguments
}

/// For built-in tools the expected parameters are known; anything else is
/// dropped with a warning so a stray key never reaches the handler.
fn drop_unknown_params(tool: &str, mut arguments: Value) -> Value {
    let Some(expected) = BuiltinTools::expected_params(tool) else {
        return arguments;
    };
    if let Some(obj) = arguments.as_object_mut() {
        let unknown: Vec<String> = obj
            .keys()
            .filter(|k| !expected.contains(&k.as_str()))
            .cloned()
            .collect();
        for key in unknown {
            warn!(tool, param = %key, "dropping unknown tool parameter");
            obj.remove(&key);
        }
    }
    arguments
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
