// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod events;
mod prompts;
mod session;

#[cfg(test)]
mod tests;

pub use agent::{Agent, RunOutcome, RunStats};
pub use events::AgentEvent;
pub use prompts::{format_history, format_observation, PromptBuilder, RemainingBudgets, SYSTEM_PROMPT};
pub use session::{
    EventKind, HistoryEvent, PendingApproval, SessionContext, SessionStatus,
};
