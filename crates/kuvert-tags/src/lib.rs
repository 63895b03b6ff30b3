// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prioritised, principal-scoped prompt tags.
//!
//! A tag bundles a prompt fragment with the permissions that gate it: which
//! users/roles/orgs it applies to, which tools it unlocks, and how strongly
//! it ranks against other tags.  The resolved set for a principal is
//! assembled into a layered system prompt and a tool allow-set.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Tag category, which also determines its section in the assembled prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Company,
    Function,
    Role,
    Flow,
    Approach,
    Workflow,
    Tool,
    Guardrail,
}

impl TagKind {
    /// Section order in the assembled system prompt.  Flow, approach, and
    /// workflow tags share one section.
    fn section(&self) -> usize {
        match self {
            TagKind::Company => 0,
            TagKind::Function => 1,
            TagKind::Role => 2,
            TagKind::Flow | TagKind::Approach | TagKind::Workflow => 3,
            TagKind::Tool => 4,
            TagKind::Guardrail => 5,
        }
    }

    fn header(&self) -> &'static str {
        match self {
            TagKind::Company => "=== COMPANY CONTEXT ===",
            TagKind::Function => "=== FUNCTION CONTEXT ===",
            TagKind::Role => "=== ROLE CONTEXT ===",
            TagKind::Flow | TagKind::Approach | TagKind::Workflow => "=== FLOW CONTEXT ===",
            TagKind::Tool => "=== TOOLS AVAILABLE ===",
            TagKind::Guardrail => "=== GUARDRAILS ===",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    /// Empty = everyone; `"*"` = everyone explicitly.
    #[serde(default)]
    pub assigned_users: Vec<String>,
    /// Empty = every role.
    #[serde(default)]
    pub assigned_roles: Vec<String>,
    /// Empty = every org.
    #[serde(default)]
    pub org_scope: String,
    /// Tools this tag unlocks.  The union across resolved tags forms the
    /// session allow-set; an empty union means unrestricted.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Higher priority sorts first within a section.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPayload {
    #[serde(default)]
    pub meta: TagMeta,
    #[serde(default)]
    pub config: TagConfig,
    /// Free-form prompt fragment.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Unique key, e.g. "flow_checkout", "company_kuvert".
    pub name: String,
    pub kind: TagKind,
    pub payload: TagPayload,
}

/// The principal a session runs as.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub user_id: String,
    pub roles: Vec<String>,
    pub org_id: String,
}

/// Flat keyed store of tags.
///
/// BTreeMap keeps iteration deterministic, which makes prompt assembly a
/// pure function of the store contents.
#[derive(Debug, Clone, Default)]
pub struct TagStore {
    tags: BTreeMap<String, Tag>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with the built-in company and role tags.
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        store.add(Tag {
            name: "company_kuvert".into(),
            kind: TagKind::Company,
            payload: TagPayload {
                meta: TagMeta {
                    name: "Kuvert".into(),
                    description: "Envelope-driven agent runtime".into(),
                    version: "1.0.0".into(),
                },
                config: TagConfig {
                    assigned_users: vec!["*".into()],
                    ..TagConfig::default()
                },
                content: "\
You are Kuvert, a modular AI agent runtime built on the envelope v2.1 protocol.

Core Principles:
- Make structured decisions using the envelope protocol
- Execute tools efficiently via MCP
- Follow permission and scope rules
- Be helpful, accurate, and reliable"
                    .into(),
            },
        });
        store.add(Tag {
            name: "role_agent".into(),
            kind: TagKind::Role,
            payload: TagPayload {
                meta: TagMeta {
                    name: "AI Agent".into(),
                    description: "Autonomous AI agent role".into(),
                    version: "1.0.0".into(),
                },
                config: TagConfig {
                    assigned_roles: vec!["agent".into()],
                    ..TagConfig::default()
                },
                content: "\
You are an autonomous AI agent that can:
- Make decisions using envelope protocol states
- Execute tools to accomplish tasks
- Plan multi-step workflows
- Ask for clarification when needed
- Report progress and results

Always use the envelope protocol for structured decision making."
                    .into(),
            },
        });
        store
    }

    /// Add or replace a tag.
    pub fn add(&mut self, tag: Tag) {
        self.tags.insert(tag.name.clone(), tag);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.tags.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.tags.get(name)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Resolve the tags that apply to `principal`, sorted by priority
    /// descending (stable within equal priorities).
    pub fn resolve_for(&self, principal: &Principal) -> Vec<Tag> {
        let mut applicable: Vec<Tag> = self
            .tags
            .values()
            .filter(|tag| {
                let cfg = &tag.payload.config;
                let user_ok = cfg.assigned_users.is_empty()
                    || cfg.assigned_users.iter().any(|u| u == "*")
                    || cfg.assigned_users.contains(&principal.user_id);
                let role_ok = cfg.assigned_roles.is_empty()
                    || cfg
                        .assigned_roles
                        .iter()
                        .any(|r| principal.roles.contains(r));
                let org_ok = cfg.org_scope.is_empty() || cfg.org_scope == principal.org_id;
                user_ok && role_ok && org_ok
            })
            .cloned()
            .collect();
        applicable.sort_by_key(|t| std::cmp::Reverse(t.payload.config.priority));
        applicable
    }
}

/// Assemble the layered system prompt from resolved tags.
///
/// Sections are emitted in kind order (company → function → role →
/// flow/approach/workflow → tool → guardrail), each with a fixed header;
/// within a section the resolver's priority order is preserved.
pub fn build_system_prompt(tags: &[Tag]) -> String {
    let mut sections: Vec<Vec<&str>> = vec![Vec::new(); 6];
    for tag in tags {
        sections[tag.kind.section()].push(&tag.payload.content);
    }

    let headers = [
        TagKind::Company.header(),
        TagKind::Function.header(),
        TagKind::Role.header(),
        TagKind::Flow.header(),
        TagKind::Tool.header(),
        TagKind::Guardrail.header(),
    ];

    let mut parts: Vec<String> = Vec::new();
    for (header, contents) in headers.iter().zip(sections.iter()) {
        if contents.is_empty() {
            continue;
        }
        parts.push((*header).to_string());
        for c in contents {
            parts.push((*c).to_string());
        }
    }
    parts.join("\n")
}

/// Union of allowed tools across `tags`.  Empty means unrestricted.
pub fn allowed_tools(tags: &[Tag]) -> HashSet<String> {
    tags.iter()
        .flat_map(|t| t.payload.config.allowed_tools.iter().cloned())
        .collect()
}

/// True when `tool` may be invoked under the given tag set.
pub fn validate_tool_access(tool: &str, tags: &[Tag]) -> bool {
    let allowed = allowed_tools(tags);
    allowed.is_empty() || allowed.contains(tool)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
