// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use kuvert_envelope::{Envelope, GoalUpdate, TodoAction, TodoItem, TodoUpdate};
use kuvert_tags::Tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    /// Paused for approval, input, or an external event.
    Waiting,
    Completed,
}

/// History event categories; ordering in the log defines visible context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    UserMessage,
    Decision,
    ToolResult,
    ToolsResult,
    ApprovalRequest,
    /// Assistant-authored message.
    Message,
    /// Wait/external event marker.
    Event,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserMessage => "user_message",
            EventKind::Decision => "decision",
            EventKind::ToolResult => "tool_result",
            EventKind::ToolsResult => "tools_result",
            EventKind::ApprovalRequest => "approval_request",
            EventKind::Message => "message",
            EventKind::Event => "event",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// A tool call withheld pending human approval; approval re-dispatches it.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub tool: String,
    pub arguments: Value,
    pub reason: String,
}

/// Everything the agent knows about the current run.  Owned exclusively by
/// the [`crate::Agent`]; tool callbacks never touch it directly.
#[derive(Debug)]
pub struct SessionContext {
    pub id: String,
    pub goal: String,
    /// Append-only, in occurrence order.
    pub history: Vec<HistoryEvent>,
    pub last_observation: Option<Value>,
    pub plan: Option<Value>,
    pub todos: Vec<TodoItem>,
    pub current_tags: Vec<Tag>,
    /// Empty = unrestricted.
    pub allowed_tools: HashSet<String>,
    pub cycles_used: u32,
    pub tokens_used: u64,
    pub started: Instant,
    pub status: SessionStatus,
    pub pending_approval: Option<PendingApproval>,
}

impl SessionContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            history: Vec::new(),
            last_observation: None,
            plan: None,
            todos: Vec::new(),
            current_tags: Vec::new(),
            allowed_tools: HashSet::new(),
            cycles_used: 0,
            tokens_used: 0,
            started: Instant::now(),
            status: SessionStatus::Active,
            pending_approval: None,
        }
    }

    pub fn record(&mut self, kind: EventKind, payload: Value) {
        self.history.push(HistoryEvent {
            kind,
            timestamp: Utc::now(),
            payload,
        });
    }

    pub fn record_decision(&mut self, envelope: &Envelope) {
        self.record(EventKind::Decision, envelope.to_value());
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Visible tail of the history.
    pub fn history_tail(&self, window: usize) -> &[HistoryEvent] {
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }

    pub fn apply_goal_update(&mut self, update: &GoalUpdate) {
        debug!(new_goal = %update.new_goal, "goal updated by decision");
        self.goal = update.new_goal.clone();
    }

    pub fn apply_todo_update(&mut self, update: &TodoUpdate) {
        let id = update.todo.id.clone();
        match update.action {
            TodoAction::Add => {
                // Re-adding an existing id replaces it.
                self.todos.retain(|t| t.id != id);
                self.todos.push(update.todo.clone());
            }
            TodoAction::Update => {
                if let Some(existing) = self.todos.iter_mut().find(|t| t.id == id) {
                    *existing = merge_todo(existing, &update.todo);
                } else {
                    self.todos.push(update.todo.clone());
                }
            }
            TodoAction::Complete => {
                if let Some(existing) = self.todos.iter_mut().find(|t| t.id == id) {
                    existing.status = Some("completed".into());
                }
            }
            TodoAction::Remove => {
                self.todos.retain(|t| t.id != id);
            }
        }
    }
}

/// Field-wise merge: values present on the update win, everything else is
/// kept from the stored item.
fn merge_todo(existing: &TodoItem, update: &TodoItem) -> TodoItem {
    TodoItem {
        id: existing.id.clone(),
        content: update.content.clone().or_else(|| existing.content.clone()),
        status: update.status.clone().or_else(|| existing.status.clone()),
        priority: update.priority.clone().or_else(|| existing.priority.clone()),
        related_files: if update.related_files.is_empty() {
            existing.related_files.clone()
        } else {
            update.related_files.clone()
        },
        notes: update.notes.clone().or_else(|| existing.notes.clone()),
        dependencies: if update.dependencies.is_empty() {
            existing.dependencies.clone()
        } else {
            update.dependencies.clone()
        },
        created_at: existing
            .created_at
            .clone()
            .or_else(|| update.created_at.clone()),
        updated_at: update
            .updated_at
            .clone()
            .or_else(|| existing.updated_at.clone()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
