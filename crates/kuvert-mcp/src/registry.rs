// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One configured MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub label: String,
    pub url: String,
    /// Optional per-server tool restriction, intersected with session
    /// permissions by the dispatcher.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

/// The `mcpServers.json` registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerRegistry {
    #[serde(default)]
    pub default_label: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no MCP servers configured")]
    Empty,
    #[error("unknown server_label {0:?}")]
    UnknownLabel(String),
    #[error("multiple MCP servers configured; provide 'server_label'")]
    Ambiguous,
}

impl ServerRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        // Tolerate a UTF-8 BOM; editors on some platforms insert one.
        let text = text.trim_start_matches('\u{feff}');
        serde_json::from_str(text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Search the conventional locations and load the first registry found.
    pub fn discover(explicit: Option<&Path>) -> Option<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            candidates.push(p.to_path_buf());
        }
        candidates.push(PathBuf::from("mcpServers.json"));
        candidates.push(PathBuf::from(".kuvert/mcpServers.json"));
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".config/kuvert/mcpServers.json"));
        }
        for path in candidates {
            if path.is_file() {
                match Self::load(&path) {
                    Ok(reg) => {
                        debug!(path = %path.display(), "loaded MCP server registry");
                        return Some(reg);
                    }
                    Err(e) => {
                        debug!(path = %path.display(), error = %format!("{e:#}"), "skipping registry");
                    }
                }
            }
        }
        None
    }

    /// Resolve a server entry: explicit label → default label → the single
    /// configured server.  Multiple servers without a label is ambiguous.
    pub fn resolve(&self, label: Option<&str>) -> Result<&ServerEntry, RegistryError> {
        if self.servers.is_empty() {
            return Err(RegistryError::Empty);
        }
        if let Some(l) = label {
            return self
                .servers
                .iter()
                .find(|s| s.label == l)
                .ok_or_else(|| RegistryError::UnknownLabel(l.to_string()));
        }
        if let Some(default) = &self.default_label {
            if let Some(entry) = self.servers.iter().find(|s| &s.label == default) {
                return Ok(entry);
            }
        }
        if self.servers.len() == 1 {
            return Ok(&self.servers[0]);
        }
        Err(RegistryError::Ambiguous)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
