// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decision emitted by the model: the discriminated part of an envelope,
/// keyed by the `state` field.  Each variant carries exactly the sub-object
/// its state contract requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Decision {
    Reply {
        conversation: Conversation,
    },
    Tool {
        tool: String,
        arguments: Value,
    },
    Tools {
        tools: Vec<ToolRequest>,
    },
    Plan {
        plan: PlanSpec,
    },
    Error {
        error: ErrorInfo,
    },
    Clarify {
        clarify: ClarifySpec,
    },
    Confirm {
        confirm: ConfirmSpec,
    },
    Reflect {
        reflect: ReflectSpec,
    },
    Wait {
        wait: WaitSpec,
    },
    Handoff {
        handoff: HandoffSpec,
    },
    Finish {
        finish: FinishSpec,
    },
    AskHuman {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Decision {
    /// Canonical wire name of this decision's state.
    pub fn state(&self) -> &'static str {
        match self {
            Decision::Reply { .. } => "reply",
            Decision::Tool { .. } => "tool",
            Decision::Tools { .. } => "tools",
            Decision::Plan { .. } => "plan",
            Decision::Error { .. } => "error",
            Decision::Clarify { .. } => "clarify",
            Decision::Confirm { .. } => "confirm",
            Decision::Reflect { .. } => "reflect",
            Decision::Wait { .. } => "wait",
            Decision::Handoff { .. } => "handoff",
            Decision::Finish { .. } => "finish",
            Decision::AskHuman { .. } => "ask_human",
        }
    }
}

/// The envelope: one JSON object per model turn.  Common fields plus the
/// state-discriminated [`Decision`] flattened alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub decision: Decision,
    /// One-line justification, ≤220 chars, no chain-of-thought.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_rationale: Option<String>,
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn state(&self) -> &'static str {
        self.decision.state()
    }

    /// A reply, error, or finish decision ends the run no matter what
    /// `meta.continue` claims.
    pub fn is_terminal_state(&self) -> bool {
        matches!(
            self.decision,
            Decision::Reply { .. } | Decision::Error { .. } | Decision::Finish { .. }
        )
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("envelope serialization is infallible")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// true = keep looping, false = stop after handling this envelope.
    #[serde(rename = "continue")]
    pub proceed: bool,
    /// Required when `continue` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Certainty score in [0,1].  Normalisation guarantees the key exists
    /// (null when the model omitted it), so it is always serialized.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_update: Option<GoalUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_update: Option<TodoUpdate>,
}

impl Meta {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            stop_reason: None,
            confidence: None,
            goal_update: None,
            todo_update: None,
        }
    }

    pub fn stop(reason: StopReason) -> Self {
        Self {
            proceed: false,
            stop_reason: Some(reason),
            confidence: None,
            goal_update: None,
            todo_update: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserReply,
    TaskDone,
    NeedApproval,
    NeedInput,
    Error,
    DeadEnd,
    BudgetExhausted,
}

impl StopReason {
    pub const ALL: [&'static str; 7] = [
        "user_reply",
        "task_done",
        "need_approval",
        "need_input",
        "error",
        "dead_end",
        "budget_exhausted",
    ];
}

/// Conversational payload for `reply` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub utterance: String,
    /// e.g. "inform", "ack", "clarify", "question"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue_act: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Conversation {
    pub fn new(utterance: impl Into<String>) -> Self {
        Self {
            utterance: utterance.into(),
            dialogue_act: None,
            target: None,
        }
    }
}

/// One member of a `tools` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Unique within the batch; synthesised as `tool_<idx>` when absent.
    #[serde(default)]
    pub tool_id: String,
    pub tool: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_task: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarifySpec {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmSpec {
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSpec {
    pub event_type: String,
    /// Seconds to wait before the Agent resumes with an expiry observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_repair: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishSpec {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffSpec {
    pub to_agent: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectSpec {
    pub analysis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalUpdate {
    pub new_goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoAction {
    Add,
    Update,
    Complete,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoUpdate {
    pub action: TodoAction,
    pub todo: TodoItem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// "pending" | "in_progress" | "completed"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// "low" | "medium" | "high"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
