// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Events emitted by the agent during a run.
/// Consumers (the REPL, headless runner) subscribe to these to drive their
/// output; the agent never prints anything itself.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A new decision cycle is starting (1-based).
    CycleStarted(u32),
    /// The model produced a validated envelope.
    Decision {
        state: &'static str,
        rationale: Option<String>,
    },
    /// A single tool call finished.
    ToolFinished {
        tool: String,
        success: bool,
        duration_ms: f64,
    },
    /// A parallel batch finished.
    BatchFinished { count: usize, all_success: bool },
    /// A dangerous tool was withheld; the run is pausing for approval.
    ApprovalRequested { tool: String, reason: String },
    /// The agent asked the user something (clarify / confirm / ask_human).
    InputRequested { prompt: String },
    /// The agent entered a wait state.
    Waiting { event_type: String },
    /// The agent replied to the user.
    Reply { utterance: String },
    /// Terminal error (including budget exhaustion).
    Error { message: String },
}
