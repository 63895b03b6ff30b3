// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::{Config, TransportKind};

/// Candidate config files, highest priority first.
///
/// The first candidate that exists wins and is used alone — a workspace
/// config fully describes its runtime rather than being deep-merged over
/// user and system layers.  Omitted sections fall back to serde defaults.
fn config_candidates() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(".kuvert/config.yaml"),
        PathBuf::from(".kuvert.yaml"),
        PathBuf::from("kuvert.yaml"),
    ];
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("kuvert/config.yaml"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/kuvert/config.yaml"));
    }
    paths.push(PathBuf::from("/etc/kuvert/config.yaml"));
    paths
}

/// Load the runtime configuration.
///
/// An explicit path (the `--config` flag) must exist and parse.  Otherwise
/// the highest-priority discovered candidate is used; with no config file
/// at all the defaults apply (builtin tools, anthropic model, tags off).
/// Every loaded config passes the runtime sanity checks in [`ensure_runnable`].
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading explicit config");
        return read_config(path);
    }
    for path in config_candidates() {
        if path.is_file() {
            debug!(path = %path.display(), "using discovered config");
            return read_config(&path);
        }
    }
    debug!("no config file found, using defaults");
    Ok(Config::default())
}

fn read_config(path: &Path) -> anyhow::Result<Config> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    ensure_runnable(&config).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Reject configs the agent loop cannot run with.
///
/// These are the same constraints the decision loop assumes: at least one
/// cycle and one envelope attempt per run, a sampling temperature the
/// providers accept, and a stdio transport that actually names a server
/// binary to spawn.
pub fn ensure_runnable(config: &Config) -> anyhow::Result<()> {
    if config.agent.max_cycles < 1 {
        anyhow::bail!("agent.max_cycles must be at least 1");
    }
    if config.agent.max_retries < 1 {
        anyhow::bail!("agent.max_retries must be at least 1");
    }
    if let Some(t) = config.model.temperature {
        if !(0.0..=1.0).contains(&t) {
            anyhow::bail!("model.temperature must be between 0 and 1 (got {t})");
        }
    }
    if config.mcp.transport == TransportKind::Stdio && config.mcp.server_command.is_empty() {
        anyhow::bail!("mcp.transport = stdio requires mcp.server_command");
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
