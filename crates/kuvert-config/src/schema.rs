// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for opt-out fields.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub tags: TagsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "openai" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies or OpenAI-compatible
    /// servers (llama.cpp, Ollama).
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–1.0)
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-20250514".into(),
            // api_key_env is intentionally None here.  Each driver knows its
            // canonical env-var name (ANTHROPIC_API_KEY, OPENAI_API_KEY);
            // hard-coding one here would shadow that fallback whenever the
            // provider is overridden.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(8000),
            temperature: Some(0.3),
        }
    }
}

fn default_max_cycles() -> u32 {
    100
}
fn default_max_total_tokens() -> u64 {
    100_000
}
fn default_max_tokens_per_call() -> u32 {
    8000
}
fn default_max_retries() -> u32 {
    3
}
fn default_history_window() -> usize {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of decision cycles before the run is terminated with
    /// stop_reason=budget_exhausted
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Total token budget for a run (input + output, provider-reported)
    #[serde(default = "default_max_total_tokens")]
    pub max_total_tokens: u64,
    /// Wall-clock budget in seconds (None = no limit)
    #[serde(default)]
    pub max_time_seconds: Option<u64>,
    /// Maximum tokens requested per model call
    #[serde(default = "default_max_tokens_per_call")]
    pub max_tokens_per_call: u32,
    /// Retry attempts when the model emits an invalid envelope
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Number of trailing history events shown to the model
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Auto-approve confirm envelopes instead of pausing for the user
    #[serde(default)]
    pub auto_approve: bool,
    /// Allow the model to emit `tools` (parallel batch) envelopes
    #[serde(default = "default_true")]
    pub enable_multi_tool: bool,
    /// System prompt override; leave None to use the built-in protocol prompt
    #[serde(default)]
    pub custom_system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            max_total_tokens: default_max_total_tokens(),
            max_time_seconds: None,
            max_tokens_per_call: default_max_tokens_per_call(),
            max_retries: default_max_retries(),
            history_window: default_history_window(),
            auto_approve: false,
            enable_multi_tool: true,
            custom_system_prompt: None,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_max_parallel() -> usize {
    5
}
fn default_dangerous_tools() -> Vec<String> {
    [
        "execute_powershell",
        "powershell",
        "shell",
        "bash",
        "python",
        "python_eval",
        "delete_item",
        "write_block",
        "change_directory",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout in seconds for a single tool call
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Worker bound for parallel batch execution
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Tools that require `arguments.approved = true` before execution
    #[serde(default = "default_dangerous_tools")]
    pub dangerous_tools: Vec<String>,
    /// Working directory for built-in file tools (None = process cwd)
    #[serde(default)]
    pub workdir: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            max_parallel: default_max_parallel(),
            dangerous_tools: default_dangerous_tools(),
            workdir: None,
        }
    }
}

/// Which transport carries tool invocations.
///
/// Selected once at startup; `builtin` needs no server at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local built-in file tools, no external server
    #[default]
    Builtin,
    /// Child process speaking line-delimited JSON-RPC over stdio
    Stdio,
    /// Server-sent-events duplex bridge (GET stream + POSTed requests)
    Sse,
    /// Plain HTTP POST per tool call
    Direct,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Builtin => write!(f, "builtin"),
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Transport selection; also settable via KUVERT_TRANSPORT / --transport
    #[serde(default)]
    pub transport: TransportKind,
    /// Command line for the stdio server (first element is the binary)
    #[serde(default)]
    pub server_command: Vec<String>,
    /// Path to the server registry (mcpServers.json).  When unset the
    /// registry is searched next to the config files.
    #[serde(default)]
    pub servers_file: Option<String>,
}

fn default_user_id() -> String {
    "default_user".into()
}
fn default_roles() -> Vec<String> {
    vec!["agent".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsConfig {
    /// Resolve tags and build the system prompt / allowed-tool set from them
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
    #[serde(default)]
    pub org_id: String,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: default_user_id(),
            roles: default_roles(),
            org_id: String::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
