// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Prompt assembly: one system message (built-in protocol template, custom
//! override, or the tag-assembled prompt) plus one user message carrying
//! the full cycle context — goal, budgets, tools, todos, plan, last
//! observation, history tail, and the closing instruction.

use serde_json::Value;

use kuvert_model::ChatMessage;

use crate::session::{EventKind, HistoryEvent, SessionContext};

/// Content snippets shown from tool results are clipped to keep the prompt
/// bounded; the model can always re-read a file for the full text.
const CONTENT_SNIPPET_CHARS: usize = 200;
const TREE_PREVIEW_LINES: usize = 6;
const FILES_PREVIEW_COUNT: usize = 5;
const RATIONALE_PREVIEW_CHARS: usize = 50;

/// The built-in envelope protocol prompt.
pub const SYSTEM_PROMPT: &str = r#"═══════════════════════════════════════════════════════════════
KUVERT AGENT SYSTEM v2.1
═══════════════════════════════════════════════════════════════

ROLE
────
Autonomous software engineering agent. Plan → Execute → Report.

OUTPUT CONTRACT
───────────────
Every response MUST be exactly one JSON envelope. No prose outside JSON.

ENVELOPE STRUCTURE
──────────────────
{
  "state": <state>,           // REQUIRED
  "brief_rationale": <string>, // REQUIRED: 1 sentence, ≤220 chars
  "meta": {
    "continue": <boolean>,     // REQUIRED: true=keep going, false=stop
    "stop_reason": <enum>,     // REQUIRED if continue=false
    "confidence": <0.0-1.0>    // OPTIONAL: certainty score
  }
}

STATES
──────
reply    → Respond to user (requires conversation.utterance)
tool     → Execute one tool (requires tool + arguments)
tools    → Execute multiple tools in parallel (requires tools[])
plan     → Create execution plan (requires plan)
reflect  → Analyse progress (requires reflect.analysis)
clarify  → Ask for clarification (requires clarify.question)
confirm  → Request approval (requires confirm.action)
wait     → Pause for an event (requires wait.event_type)
handoff  → Delegate to another agent (requires handoff.to_agent + message)
finish   → Declare the task complete (requires finish.summary)
error    → Report an error (requires error.error_type + error_message)
ask_human → Escalate to a human operator

STOP REASONS
────────────
user_reply | task_done | need_approval | need_input | error | dead_end | budget_exhausted

TOOL EXECUTION
──────────────
Single tool:
{"state":"tool","brief_rationale":"Reading config","tool":"read_file","arguments":{"path":"config.json"},"meta":{"continue":true}}

Multiple tools (parallel):
{"state":"tools","brief_rationale":"Creating files in parallel","tools":[
  {"tool_id":"f1","tool":"create_file","arguments":{"path":"a.txt","content":"..."}},
  {"tool_id":"f2","tool":"create_file","arguments":{"path":"b.txt","content":"..."}}
],"meta":{"continue":true}}

WHEN TO USE MULTI-TOOL
──────────────────────
✓ Creating multiple independent files
✓ Reading several files for comparison
✗ Creating directory THEN file inside (dependency!)
✗ Reading file THEN editing based on content (dependency!)

TRUST PROTOCOL
──────────────
Trust tool results with clear success indicators:
  ✓ create_file → {success:true, path:"...", size:1234}
  ✓ edit_file → {success:true, replacements:3}

Verify only when ambiguous:
  ✗ create_file → {success:true, size:0} (empty file?)

GOAL AND TODO UPDATES
─────────────────────
- If the objective changes, set meta.goal_update: {new_goal, reason}
- Manage a todo list with meta.todo_update:
  {action: "add"|"update"|"complete"|"remove", todo: {id, content, status, priority}, reason}

CORE DIRECTIVES
───────────────
- No prose outside JSON
- Always include meta.continue
- Plan before multi-step execution
- On file errors: explore with directory_tree/list_files, don't retry same path
- Dangerous tools require approval; when a result says approval_required,
  use state=confirm and wait
- When you ask the user a question, set meta.continue: false
- Trust clear tool feedback, verify only when ambiguous

EXAMPLES
────────
Greeting:
{"state":"reply","brief_rationale":"Greeting user","conversation":{"utterance":"Hello! How can I help?"},"meta":{"continue":false,"stop_reason":"user_reply"}}

Task complete:
{"state":"reply","brief_rationale":"Task finished successfully","conversation":{"utterance":"Created all files successfully"},"meta":{"continue":false,"stop_reason":"task_done","confidence":0.95}}

Dead end:
{"state":"reply","brief_rationale":"Cannot proceed without file","conversation":{"utterance":"I cannot find config.json. Can you confirm the path?"},"meta":{"continue":false,"stop_reason":"dead_end","confidence":0.88}}

═══════════════════════════════════════════════════════════════
END SYSTEM PROMPT
═══════════════════════════════════════════════════════════════"#;

/// Remaining budgets, shown to the model every cycle.
#[derive(Debug, Clone, Copy)]
pub struct RemainingBudgets {
    pub cycles: u32,
    pub tokens: u64,
}

pub struct PromptBuilder {
    custom_system_prompt: Option<String>,
    history_window: usize,
}

impl PromptBuilder {
    pub fn new(custom_system_prompt: Option<String>, history_window: usize) -> Self {
        Self {
            custom_system_prompt,
            history_window,
        }
    }

    /// Compose the message list for one decision cycle.
    ///
    /// `tag_prompt` (the assembled tag sections) takes precedence over the
    /// custom override, which takes precedence over the built-in template.
    pub fn build_messages(
        &self,
        session: &SessionContext,
        catalog: &[String],
        budgets: RemainingBudgets,
        tag_prompt: Option<&str>,
    ) -> Vec<ChatMessage> {
        let system = tag_prompt
            .map(str::to_string)
            .or_else(|| self.custom_system_prompt.clone())
            .unwrap_or_else(|| SYSTEM_PROMPT.to_string());

        let user = self.build_user_context(session, catalog, budgets);
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    fn build_user_context(
        &self,
        session: &SessionContext,
        catalog: &[String],
        budgets: RemainingBudgets,
    ) -> String {
        let mut sections: Vec<String> = Vec::new();

        sections.push(format!("GOAL\n----\n{}", session.goal));

        sections.push(format!(
            "BUDGET REMAINING\n----------------\nCycles: {}\nTokens: {}",
            budgets.cycles, budgets.tokens
        ));

        if !catalog.is_empty() {
            let tools_list: Vec<String> = catalog.iter().map(|t| format!("- {t}")).collect();
            sections.push(format!(
                "AVAILABLE TOOLS\n----------------\n{}\n\nConstraints:\n\
                 - Use only the tools above.\n\
                 - Do NOT invent tool names.",
                tools_list.join("\n")
            ));
        }

        if !session.todos.is_empty() {
            let lines: Vec<String> = session
                .todos
                .iter()
                .map(|t| {
                    format!(
                        "- [{}] {}: {}",
                        t.status.as_deref().unwrap_or("pending"),
                        t.id,
                        t.content.as_deref().unwrap_or("")
                    )
                })
                .collect();
            sections.push(format!("ACTIVE TODOS\n------------\n{}", lines.join("\n")));
        }

        if let Some(plan) = &session.plan {
            sections.push(format!("CURRENT PLAN\n------------\n{}", format_plan(plan)));
        }

        if let Some(obs) = &session.last_observation {
            sections.push(format!(
                "LAST TOOL RESULT\n----------------\n{}",
                format_observation(obs)
            ));
        }

        if !session.history.is_empty() {
            let tail = session.history_tail(self.history_window);
            sections.push(format!(
                "HISTORY (last {} events)\n------------------------------------\n{}",
                tail.len(),
                format_history(tail)
            ));
        }

        sections.push(format!(
            "{}\nYOUR TASK\n{}\n\nEmit exactly ONE JSON envelope now.",
            "=".repeat(60),
            "=".repeat(60)
        ));

        sections.join("\n\n")
    }
}

fn format_plan(plan: &Value) -> String {
    let mut lines = Vec::new();
    if let Some(root) = plan["root_task"].as_str() {
        lines.push(format!("Task: {root}"));
    }
    if let Some(steps) = plan["steps"].as_array() {
        for (i, step) in steps.iter().enumerate() {
            let text = match step {
                Value::String(s) => s.clone(),
                other => other["description"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            lines.push(format!("{}. {text}", i + 1));
        }
    }
    if lines.is_empty() {
        plan.to_string()
    } else {
        lines.join("\n")
    }
}

/// Compact, field-aware rendering of a tool observation.
pub fn format_observation(obs: &Value) -> String {
    if obs["_multi_tool"].as_bool().unwrap_or(false) {
        return format_multi_observation(obs);
    }

    let success = obs["success"].as_bool().unwrap_or(false);
    let label = if success { "SUCCESS" } else { "FAILURE" };
    let tool = obs["tool"].as_str().unwrap_or("unknown");
    let duration = obs["duration_ms"].as_f64().unwrap_or(0.0);

    let mut lines = vec![format!("{label}: {tool} ({duration}ms)")];

    if success {
        let result = &obs["result"];
        if let Some(path) = result["path"].as_str() {
            lines.push(format!("  path: {path}"));
        }
        if let Some(size) = result["size"].as_u64() {
            lines.push(format!("  size: {size} bytes"));
        }
        if let Some(n) = result["replacements"].as_u64() {
            lines.push(format!("  replacements: {n}"));
        }
        if let Some(msg) = result["message"].as_str() {
            lines.push(format!("  {msg}"));
        }
        if let Some(cwd) = result["cwd"].as_str() {
            lines.push(format!("  cwd: {cwd}"));
        }
        if let Some(files) = result["files"].as_array() {
            let names: Vec<&str> = files
                .iter()
                .filter_map(Value::as_str)
                .take(FILES_PREVIEW_COUNT)
                .collect();
            let ellipsis = if files.len() > FILES_PREVIEW_COUNT {
                " ..."
            } else {
                ""
            };
            lines.push(format!(
                "  files[{}]: {}{ellipsis}",
                files.len(),
                names.join(", ")
            ));
        }
        if let Some(tree) = result["tree"].as_str() {
            let preview: Vec<&str> = tree.lines().take(TREE_PREVIEW_LINES).collect();
            let ellipsis = if tree.lines().count() > TREE_PREVIEW_LINES {
                "\n    ..."
            } else {
                ""
            };
            lines.push(format!("  tree:\n    {}{ellipsis}", preview.join("\n    ")));
        }
        if let Some(content) = result["content"].as_str() {
            lines.push(format!("  content: {}", snippet(content)));
        }
        // Scalar fields not covered above.
        if let Some(map) = result.as_object() {
            for (k, v) in map {
                if matches!(
                    k.as_str(),
                    "path" | "size" | "replacements" | "message" | "cwd" | "files" | "tree"
                        | "content" | "success"
                ) {
                    continue;
                }
                match v {
                    Value::String(s) => lines.push(format!("  {k}: {}", snippet(s))),
                    Value::Number(_) | Value::Bool(_) => lines.push(format!("  {k}: {v}")),
                    _ => {}
                }
            }
        }
    } else if obs["approval_required"].as_bool().unwrap_or(false) {
        let reason = obs["reason"].as_str().unwrap_or("approval required");
        lines.push(format!("  approval_required: {reason}"));
    } else {
        let error = obs["error"].as_str().unwrap_or("Unknown error");
        lines.push(format!("  error: {error}"));
    }

    lines.join("\n")
}

fn format_multi_observation(obs: &Value) -> String {
    let count = obs["count"].as_u64().unwrap_or(0);
    let mut lines = vec![format!("Multi-tool execution ({count} tools):")];
    if let Some(results) = obs["results"].as_object() {
        for (tool_id, result) in results {
            let ok = result["success"].as_bool().unwrap_or(false);
            let status = if ok { "OK" } else { "FAIL" };
            let tool = result["tool"].as_str().unwrap_or("unknown");
            let duration = result["duration_ms"].as_f64().unwrap_or(0.0);
            lines.push(format!("  [{status}] {tool_id} ({tool}) - {duration}ms"));
            if ok {
                if let Some(path) = result["result"]["path"].as_str() {
                    lines.push(format!("      path: {path}"));
                }
                if let Some(size) = result["result"]["size"].as_u64() {
                    lines.push(format!("      size: {size} bytes"));
                }
            } else if let Some(error) = result["error"].as_str() {
                lines.push(format!("      error: {error}"));
            }
        }
    }
    lines.join("\n")
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= CONTENT_SNIPPET_CHARS {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(CONTENT_SNIPPET_CHARS).collect();
        format!("{clipped}...")
    }
}

/// One line per history event: `[idx] DECIDE|RESULT|MULTI-RESULT|…`.
pub fn format_history(events: &[HistoryEvent]) -> String {
    if events.is_empty() {
        return "(no history)".to_string();
    }
    let mut lines = Vec::new();
    for (idx, event) in events.iter().enumerate() {
        let line = match event.kind {
            EventKind::Decision => {
                let state = event.payload["state"].as_str().unwrap_or("unknown");
                let rationale: String = event.payload["brief_rationale"]
                    .as_str()
                    .unwrap_or("")
                    .chars()
                    .take(RATIONALE_PREVIEW_CHARS)
                    .collect();
                format!("[{idx}] DECIDE: state={state} ({rationale}...)")
            }
            EventKind::ToolResult => {
                let ok = event.payload["success"].as_bool().unwrap_or(false);
                let status = if ok { "OK" } else { "FAIL" };
                let tool = event.payload["tool"].as_str().unwrap_or("unknown");
                format!("[{idx}] RESULT: {tool} {status}")
            }
            EventKind::ToolsResult => {
                let count = event.payload["count"].as_u64().unwrap_or(0);
                let all_ok = event.payload["all_success"].as_bool().unwrap_or(false);
                let status = if all_ok { "ALL OK" } else { "PARTIAL" };
                format!("[{idx}] MULTI-RESULT: {count} tools {status}")
            }
            other => format!("[{idx}] {}", other.as_str().to_uppercase()),
        };
        lines.push(line);
    }
    lines.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
