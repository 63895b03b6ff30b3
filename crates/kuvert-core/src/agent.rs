// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use kuvert_config::Config;
use kuvert_envelope::{
    create_error_envelope, Decision, Envelope, ErrorInfo, Meta, StopReason,
};
use kuvert_model::DecisionClient;
use kuvert_tags::{allowed_tools, build_system_prompt, Principal, TagStore};
use kuvert_tools::{Dispatcher, Observation};

use crate::events::AgentEvent;
use crate::prompts::{PromptBuilder, RemainingBudgets};
use crate::session::{EventKind, PendingApproval, SessionContext, SessionStatus};

#[derive(Debug, Clone)]
pub struct RunStats {
    pub cycles: u32,
    pub tokens: u64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub final_envelope: Envelope,
    pub stats: RunStats,
}

/// The core agent.  Owns the session and drives the decide → dispatch loop.
pub struct Agent {
    config: Arc<Config>,
    client: DecisionClient,
    dispatcher: Dispatcher,
    prompt_builder: PromptBuilder,
    tag_store: TagStore,
    session: SessionContext,
    catalog: Vec<String>,
    tag_prompt: Option<String>,
    events: Option<mpsc::Sender<AgentEvent>>,
    /// Runtime-toggleable copy of `agent.auto_approve` (`/auto on|off`).
    auto_approve: bool,
}

impl Agent {
    pub fn new(client: DecisionClient, dispatcher: Dispatcher, config: Arc<Config>) -> Self {
        let prompt_builder = PromptBuilder::new(
            config.agent.custom_system_prompt.clone(),
            config.agent.history_window,
        );
        let auto_approve = config.agent.auto_approve;
        Self {
            config,
            client,
            dispatcher,
            prompt_builder,
            tag_store: TagStore::with_defaults(),
            session: SessionContext::new(String::new()),
            catalog: Vec::new(),
            tag_prompt: None,
            events: None,
            auto_approve,
        }
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    pub fn set_auto_approve(&mut self, on: bool) {
        self.auto_approve = on;
    }

    /// Subscribe a consumer (REPL, headless runner) to progress events.
    pub fn set_event_sink(&mut self, tx: mpsc::Sender<AgentEvent>) {
        self.events = Some(tx);
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Discard the current session entirely: history, budgets, plan,
    /// status, and any tool call withheld for approval.  The next goal
    /// starts from a clean slate.
    pub fn reset(&mut self) {
        self.session = SessionContext::new(String::new());
    }

    pub fn tag_store_mut(&mut self) -> &mut TagStore {
        &mut self.tag_store
    }

    /// Run to completion (or until the session pauses for input/approval).
    pub async fn run(&mut self, goal: &str) -> RunOutcome {
        self.begin(goal).await;
        self.run_loop(None).await
    }

    /// Like [`run`] but with a cooperative cancellation channel; checked at
    /// the top of every cycle.  Both an explicit send and a dropped sender
    /// count as cancellation.
    pub async fn run_with_cancel(
        &mut self,
        goal: &str,
        cancel: &mut oneshot::Receiver<()>,
    ) -> RunOutcome {
        self.begin(goal).await;
        self.run_loop(Some(cancel)).await
    }

    /// Resume a session paused on approval or confirmation.
    ///
    /// Returns `None` when there is nothing to resume.  On approval the
    /// withheld tool call executes with `approved=true` injected; on denial
    /// the model sees a denial observation and decides what to do next.
    pub async fn resume_with_approval(&mut self, approve: bool) -> Option<RunOutcome> {
        if self.session.status != SessionStatus::Waiting {
            return None;
        }

        if let Some(pending) = self.session.pending_approval.take() {
            let obs = if approve {
                let mut args = pending.arguments.clone();
                if let Some(map) = args.as_object_mut() {
                    map.insert("approved".into(), Value::Bool(true));
                }
                self.dispatcher.execute_single(&pending.tool, args).await
            } else {
                Observation::failure(
                    pending.tool.clone(),
                    "approval denied by user".to_string(),
                    0.0,
                )
            };
            self.session.record(EventKind::ToolResult, obs.to_value());
            self.session.last_observation = Some(obs.to_value());
        } else {
            // Waiting on a confirm / clarify / ask_human envelope: feed a
            // synthetic confirmation observation back.
            let obs = json!({
                "success": approve,
                "tool": "user_confirmation",
                "result": {"approved": approve},
                "duration_ms": 0.0,
            });
            self.session.record(EventKind::ToolResult, obs.clone());
            self.session.last_observation = Some(obs);
        }

        self.session.status = SessionStatus::Active;
        Some(self.run_loop(None).await)
    }

    async fn begin(&mut self, goal: &str) {
        self.session = SessionContext::new(goal);
        self.session
            .record(EventKind::UserMessage, json!({"content": goal}));

        if self.config.tags.enabled {
            let principal = Principal {
                user_id: self.config.tags.user_id.clone(),
                roles: self.config.tags.roles.clone(),
                org_id: self.config.tags.org_id.clone(),
            };
            let tags = self.tag_store.resolve_for(&principal);
            let allowed = allowed_tools(&tags);
            debug!(
                tags = tags.len(),
                allowed = allowed.len(),
                "resolved tags for principal"
            );
            self.tag_prompt = Some(build_system_prompt(&tags));
            self.dispatcher.set_allowed_tools(allowed.clone());
            self.session.allowed_tools = allowed;
            self.session.current_tags = tags;
        }

        self.catalog = self.dispatcher.catalog().await;
    }

    async fn run_loop(&mut self, mut cancel: Option<&mut oneshot::Receiver<()>>) -> RunOutcome {
        let mut final_envelope: Option<Envelope> = None;

        loop {
            // Cancellation is checked between cycles only, so an in-flight
            // tool call always completes and its observation is recorded.
            if let Some(rx) = cancel.as_deref_mut() {
                match rx.try_recv() {
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    _ => {
                        info!("run cancelled by user");
                        final_envelope =
                            Some(create_error_envelope("Run cancelled by user", "cancelled"));
                        break;
                    }
                }
            }

            if let Some(message) = self.budget_stop() {
                warn!(%message, "budget exhausted");
                self.emit(AgentEvent::Error {
                    message: message.clone(),
                })
                .await;
                final_envelope = Some(budget_envelope(&message));
                break;
            }

            let agent_cfg = &self.config.agent;
            let budgets = RemainingBudgets {
                cycles: agent_cfg.max_cycles.saturating_sub(self.session.cycles_used),
                tokens: agent_cfg
                    .max_total_tokens
                    .saturating_sub(self.session.tokens_used),
            };
            let messages = self.prompt_builder.build_messages(
                &self.session,
                &self.catalog,
                budgets,
                self.tag_prompt.as_deref(),
            );

            self.emit(AgentEvent::CycleStarted(self.session.cycles_used + 1))
                .await;
            let decided = self
                .client
                .decide_with_retry(&messages, agent_cfg.max_tokens_per_call)
                .await;

            self.session.cycles_used += 1;
            self.session.tokens_used += decided.input_tokens + decided.output_tokens;

            let envelope = decided.envelope;
            self.session.record_decision(&envelope);
            self.emit(AgentEvent::Decision {
                state: envelope.state(),
                rationale: envelope.brief_rationale.clone(),
            })
            .await;

            // Side effects before dispatch; per-decision order means a later
            // update in history wins.
            if let Some(gu) = &envelope.meta.goal_update {
                self.session.apply_goal_update(gu);
            }
            if let Some(tu) = &envelope.meta.todo_update {
                self.session.apply_todo_update(tu);
            }

            match &envelope.decision {
                Decision::Tool { tool, arguments } => {
                    let obs = self
                        .dispatcher
                        .execute_single(tool, arguments.clone())
                        .await;
                    if obs.approval_required {
                        let reason = obs.reason.clone().unwrap_or_default();
                        self.session.record(
                            EventKind::ApprovalRequest,
                            json!({"tool": obs.tool, "reason": reason}),
                        );
                        self.session.pending_approval = Some(PendingApproval {
                            tool: tool.clone(),
                            arguments: arguments.clone(),
                            reason: reason.clone(),
                        });
                        self.session.status = SessionStatus::Waiting;
                        self.emit(AgentEvent::ApprovalRequested {
                            tool: obs.tool.clone(),
                            reason,
                        })
                        .await;
                        final_envelope = Some(envelope.clone());
                        break;
                    }
                    self.emit(AgentEvent::ToolFinished {
                        tool: obs.tool.clone(),
                        success: obs.success,
                        duration_ms: obs.duration_ms,
                    })
                    .await;
                    self.session.record(EventKind::ToolResult, obs.to_value());
                    self.session.last_observation = Some(obs.to_value());
                }

                Decision::Tools { tools } => {
                    if !agent_cfg.enable_multi_tool {
                        let obs = Observation::failure(
                            "multi_tool",
                            "Multi-tool execution disabled in config",
                            0.0,
                        );
                        self.session.record(EventKind::ToolResult, obs.to_value());
                        self.session.last_observation = Some(obs.to_value());
                    } else {
                        let batch = self.dispatcher.execute_batch(tools, true).await;
                        self.emit(AgentEvent::BatchFinished {
                            count: batch.count,
                            all_success: batch.all_success,
                        })
                        .await;
                        self.session
                            .record(EventKind::ToolsResult, batch.to_value());
                        self.session.last_observation = Some(batch.to_value());
                    }
                }

                Decision::Plan { plan } => {
                    self.session.plan = serde_json::to_value(plan).ok();
                    self.session.last_observation = None;
                }

                Decision::Reflect { .. } => {
                    self.session.last_observation = None;
                }

                Decision::Reply { conversation } => {
                    self.session.record(
                        EventKind::Message,
                        json!({"role": "assistant", "content": conversation.utterance}),
                    );
                    self.emit(AgentEvent::Reply {
                        utterance: conversation.utterance.clone(),
                    })
                    .await;
                    final_envelope = Some(envelope.clone());
                }

                Decision::Clarify { clarify } => {
                    if self.auto_approve {
                        // Unattended runs cannot answer questions.
                        final_envelope = Some(create_error_envelope(
                            "Agent requested clarification but auto_approve is enabled",
                            "need_input",
                        ));
                    } else {
                        self.emit(AgentEvent::InputRequested {
                            prompt: clarify.question.clone(),
                        })
                        .await;
                        self.session.status = SessionStatus::Waiting;
                        final_envelope = Some(envelope.clone());
                    }
                }

                Decision::Confirm { confirm } => {
                    if self.auto_approve {
                        let obs = json!({
                            "success": true,
                            "tool": "user_confirmation",
                            "result": {"approved": true},
                            "duration_ms": 0.0,
                        });
                        self.session.record(EventKind::ToolResult, obs.clone());
                        self.session.last_observation = Some(obs);
                    } else {
                        self.session.record(
                            EventKind::ApprovalRequest,
                            json!({"reason": confirm.action}),
                        );
                        self.emit(AgentEvent::InputRequested {
                            prompt: confirm.action.clone(),
                        })
                        .await;
                        self.session.status = SessionStatus::Waiting;
                        final_envelope = Some(envelope.clone());
                    }
                }

                Decision::AskHuman { reason } => {
                    let reason = reason.clone().unwrap_or_else(|| "operator input".into());
                    self.session
                        .record(EventKind::ApprovalRequest, json!({"reason": reason}));
                    self.emit(AgentEvent::InputRequested { prompt: reason }).await;
                    self.session.status = SessionStatus::Waiting;
                    final_envelope = Some(envelope.clone());
                }

                Decision::Wait { wait } => {
                    self.session.record(
                        EventKind::Event,
                        json!({"waiting_for": wait.event_type}),
                    );
                    self.emit(AgentEvent::Waiting {
                        event_type: wait.event_type.clone(),
                    })
                    .await;
                    match wait.timeout {
                        Some(secs) if secs > 0.0 => {
                            // Bounded wait: sleep it out, then resume with a
                            // synthetic expiry observation.
                            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                            let obs = json!({
                                "success": true,
                                "tool": "wait",
                                "result": {"expired": true, "event_type": wait.event_type},
                                "duration_ms": secs * 1000.0,
                            });
                            self.session.record(EventKind::ToolResult, obs.clone());
                            self.session.last_observation = Some(obs);
                        }
                        _ => {
                            self.session.status = SessionStatus::Waiting;
                            final_envelope = Some(envelope.clone());
                        }
                    }
                }

                Decision::Handoff { handoff } => {
                    // No multi-agent orchestration in this runtime; a handoff
                    // ends the run with the request on record.
                    self.session.record(
                        EventKind::Message,
                        json!({
                            "role": "assistant",
                            "content": format!("handoff to {}: {}", handoff.to_agent, handoff.message),
                        }),
                    );
                    final_envelope = Some(envelope.clone());
                }

                Decision::Error { error } => {
                    self.emit(AgentEvent::Error {
                        message: error.error_message.clone(),
                    })
                    .await;
                    final_envelope = Some(envelope.clone());
                }

                Decision::Finish { .. } => {
                    final_envelope = Some(envelope.clone());
                }
            }

            // A terminal state ends the run regardless of meta.continue.
            if final_envelope.is_none() && (envelope.is_terminal_state() || !envelope.meta.proceed)
            {
                final_envelope = Some(envelope.clone());
            }
            if final_envelope.is_some() {
                break;
            }
        }

        let final_envelope =
            final_envelope.unwrap_or_else(|| create_error_envelope("no decision made", "error"));

        if self.session.status != SessionStatus::Waiting {
            self.session.status = SessionStatus::Completed;
        }

        let success = run_succeeded(&final_envelope);
        RunOutcome {
            success,
            final_envelope,
            stats: RunStats {
                cycles: self.session.cycles_used,
                tokens: self.session.tokens_used,
                duration_seconds: self.session.elapsed_seconds(),
            },
        }
    }

    fn budget_stop(&self) -> Option<String> {
        let a = &self.config.agent;
        if self.session.cycles_used >= a.max_cycles {
            return Some(format!(
                "Max cycles reached: {}/{}",
                self.session.cycles_used, a.max_cycles
            ));
        }
        if self.session.tokens_used >= a.max_total_tokens {
            return Some(format!(
                "Max tokens reached: {}/{}",
                self.session.tokens_used, a.max_total_tokens
            ));
        }
        if let Some(limit) = a.max_time_seconds {
            let elapsed = self.session.elapsed_seconds();
            if elapsed >= limit as f64 {
                return Some(format!("Max time reached: {elapsed:.1}/{limit}s"));
            }
        }
        None
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// A run succeeded when it ended in a user-facing reply or a declared
/// finish, not in an error, question, or dead end.
fn run_succeeded(envelope: &Envelope) -> bool {
    match &envelope.decision {
        Decision::Reply { .. } | Decision::Finish { .. } => !matches!(
            envelope.meta.stop_reason,
            Some(StopReason::Error) | Some(StopReason::DeadEnd) | Some(StopReason::BudgetExhausted)
        ),
        _ => false,
    }
}

fn budget_envelope(message: &str) -> Envelope {
    Envelope {
        decision: Decision::Error {
            error: ErrorInfo {
                error_type: "budget_exhausted".into(),
                error_message: message.to_string(),
                suggested_repair: None,
            },
        },
        brief_rationale: Some("Budget exhausted".into()),
        meta: Meta::stop(StopReason::BudgetExhausted),
        envelope_id: None,
        timestamp: None,
    }
}
