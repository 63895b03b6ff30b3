// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent-loop tests against the scripted mock provider and the built-in
//! tool backend in a temporary workdir.

use std::sync::Arc;

use serde_json::json;

use kuvert_config::Config;
use kuvert_envelope::{Decision, StopReason};
use kuvert_model::{DecisionClient, ModelProvider, ScriptedDecider};
use kuvert_tools::Dispatcher;

use crate::session::{EventKind, SessionStatus};
use crate::Agent;

fn reply_done(text: &str) -> String {
    json!({
        "state": "reply",
        "brief_rationale": "Task finished",
        "conversation": {"utterance": text},
        "meta": {"continue": false, "stop_reason": "task_done"}
    })
    .to_string()
}

fn tool_call(tool: &str, args: serde_json::Value) -> String {
    json!({
        "state": "tool",
        "brief_rationale": format!("Calling {tool}"),
        "tool": tool,
        "arguments": args,
        "meta": {"continue": true}
    })
    .to_string()
}

struct Harness {
    agent: Agent,
    _dir: tempfile::TempDir,
    workdir: std::path::PathBuf,
}

fn harness(scripts: Vec<String>, mutate: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.tools.workdir = Some(dir.path().to_string_lossy().into_owned());
    mutate(&mut config);
    let config = Arc::new(config);

    let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedDecider::new(scripts));
    let client = DecisionClient::new(provider, config.agent.max_retries);
    let dispatcher = Dispatcher::builtin(&config.tools);

    Harness {
        agent: Agent::new(client, dispatcher, config),
        workdir: dir.path().to_path_buf(),
        _dir: dir,
    }
}

// ── Single tool flow ─────────────────────────────────────────────────────────

#[tokio::test]
async fn single_file_creation_flow() {
    let mut h = harness(
        vec![
            tool_call("create_file", json!({"path": "hello.txt", "content": "Hello"})),
            reply_done("Created hello.txt"),
        ],
        |_| {},
    );
    let outcome = h.agent.run("Create hello.txt with content Hello").await;

    assert!(outcome.success);
    assert_eq!(outcome.final_envelope.state(), "reply");
    assert_eq!(outcome.stats.cycles, 2);
    assert_eq!(
        std::fs::read_to_string(h.workdir.join("hello.txt")).unwrap(),
        "Hello"
    );

    // History: user_message, decision, tool_result, decision, message.
    let kinds: Vec<&str> = h
        .agent
        .session()
        .history
        .iter()
        .map(|e| e.kind.as_str())
        .collect();
    assert_eq!(
        kinds,
        vec!["user_message", "decision", "tool_result", "decision", "message"]
    );
}

#[tokio::test]
async fn tool_failure_is_fed_back_not_fatal() {
    let mut h = harness(
        vec![
            tool_call("read_file", json!({"path": "missing.txt"})),
            reply_done("The file does not exist"),
        ],
        |_| {},
    );
    let outcome = h.agent.run("Read missing.txt").await;
    assert!(outcome.success, "a failed tool call must not fail the run");
    let obs = h
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert_eq!(obs.payload["success"], false);
    assert!(obs.payload["error"]
        .as_str()
        .unwrap()
        .contains("File not found"));
}

// ── Parallel batch flow ──────────────────────────────────────────────────────

#[tokio::test]
async fn parallel_multi_file_flow() {
    let batch = json!({
        "state": "tools",
        "brief_rationale": "Creating files in parallel",
        "tools": [
            {"tool_id": "f1", "tool": "create_file", "arguments": {"path": "a.txt", "content": "A"}},
            {"tool_id": "f2", "tool": "create_file", "arguments": {"path": "b.txt", "content": "B"}},
            {"tool_id": "f3", "tool": "create_file", "arguments": {"path": "c.txt", "content": "C"}}
        ],
        "meta": {"continue": true}
    })
    .to_string();
    let mut h = harness(vec![batch, reply_done("All three created")], |_| {});
    let outcome = h.agent.run("Create a.txt, b.txt, c.txt").await;

    assert!(outcome.success);
    for (name, content) in [("a.txt", "A"), ("b.txt", "B"), ("c.txt", "C")] {
        assert_eq!(
            std::fs::read_to_string(h.workdir.join(name)).unwrap(),
            content
        );
    }
    let batch_event = h
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolsResult)
        .unwrap();
    assert_eq!(batch_event.payload["count"], 3);
    assert_eq!(batch_event.payload["all_success"], true);
}

#[tokio::test]
async fn multi_tool_disabled_yields_error_observation() {
    let batch = json!({
        "state": "tools",
        "brief_rationale": "batch",
        "tools": [{"tool_id": "x", "tool": "get_cwd", "arguments": {}}],
        "meta": {"continue": true}
    })
    .to_string();
    let mut h = harness(vec![batch, reply_done("ok")], |c| {
        c.agent.enable_multi_tool = false;
    });
    let _ = h.agent.run("batch something").await;
    let obs = h
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert!(obs.payload["error"]
        .as_str()
        .unwrap()
        .contains("disabled in config"));
}

// ── Approval gating ──────────────────────────────────────────────────────────

#[tokio::test]
async fn dangerous_tool_pauses_then_resumes_on_approval() {
    let mut h = harness(
        vec![
            tool_call("create_file", json!({"path": "x.txt", "content": "x"})),
            tool_call("delete_file", json!({"path": "x.txt"})),
            reply_done("Deleted after approval"),
        ],
        |c| {
            c.tools.dangerous_tools.push("delete_file".into());
        },
    );

    let outcome = h.agent.run("Create then delete x.txt").await;
    assert!(!outcome.success);
    assert_eq!(h.agent.session().status, SessionStatus::Waiting);
    assert!(h
        .agent
        .session()
        .history
        .iter()
        .any(|e| e.kind == EventKind::ApprovalRequest));
    assert!(h.workdir.join("x.txt").exists(), "tool must not have run");

    // The user approves; the withheld delete executes and the next decision
    // produces the final reply.
    let resumed = h.agent.resume_with_approval(true).await.unwrap();
    assert!(resumed.success);
    assert_eq!(resumed.final_envelope.state(), "reply");
    assert!(!h.workdir.join("x.txt").exists(), "delete must have run");
}

#[tokio::test]
async fn denied_approval_feeds_denial_back() {
    let mut h = harness(
        vec![
            tool_call("delete_file", json!({"path": "keep.txt"})),
            reply_done("Understood, leaving the file alone"),
        ],
        |c| {
            c.tools.dangerous_tools.push("delete_file".into());
        },
    );
    std::fs::write(h.workdir.join("keep.txt"), "precious").unwrap();

    let _ = h.agent.run("Delete keep.txt").await;
    let resumed = h.agent.resume_with_approval(false).await.unwrap();
    assert!(resumed.success);
    assert!(h.workdir.join("keep.txt").exists());
    let denial = h
        .agent
        .session()
        .history
        .iter()
        .filter(|e| e.kind == EventKind::ToolResult)
        .find(|e| e.payload["error"].as_str().unwrap_or("").contains("denied"))
        .expect("denial observation recorded");
    assert_eq!(denial.payload["success"], false);
}

#[tokio::test]
async fn resume_without_waiting_session_is_none() {
    let mut h = harness(vec![reply_done("hi")], |_| {});
    let _ = h.agent.run("say hi").await;
    assert!(h.agent.resume_with_approval(true).await.is_none());
}

#[tokio::test]
async fn reset_discards_waiting_session_and_pending_approval() {
    let mut h = harness(
        vec![
            tool_call("delete_file", json!({"path": "x.txt"})),
            reply_done("unreachable"),
        ],
        |c| {
            c.tools.dangerous_tools.push("delete_file".into());
        },
    );
    std::fs::write(h.workdir.join("x.txt"), "data").unwrap();

    let _ = h.agent.run("Delete x.txt").await;
    assert_eq!(h.agent.session().status, SessionStatus::Waiting);
    assert!(h.agent.session().pending_approval.is_some());

    h.agent.reset();
    assert_eq!(h.agent.session().status, SessionStatus::Active);
    assert!(h.agent.session().pending_approval.is_none());
    assert!(h.agent.session().history.is_empty());
    assert_eq!(h.agent.session().cycles_used, 0);
    assert_eq!(h.agent.session().tokens_used, 0);
    assert!(h.agent.session().plan.is_none());

    // The withheld call must not be resumable after the reset.
    assert!(h.agent.resume_with_approval(true).await.is_none());
    assert!(h.workdir.join("x.txt").exists(), "old approval must not fire");
}

// ── Confirm / clarify ────────────────────────────────────────────────────────

#[tokio::test]
async fn confirm_pauses_without_auto_approve() {
    let confirm = json!({
        "state": "confirm",
        "brief_rationale": "Deleting is destructive",
        "confirm": {"action": "Delete all build artifacts"},
        "meta": {"continue": false, "stop_reason": "need_approval"}
    })
    .to_string();
    let mut h = harness(vec![confirm], |_| {});
    let outcome = h.agent.run("clean up").await;
    assert!(!outcome.success);
    assert_eq!(outcome.final_envelope.state(), "confirm");
    assert_eq!(h.agent.session().status, SessionStatus::Waiting);
}

#[tokio::test]
async fn confirm_auto_approved_continues() {
    let confirm = json!({
        "state": "confirm",
        "brief_rationale": "Confirming cleanup",
        "confirm": {"action": "Delete artifacts"},
        "meta": {"continue": true}
    })
    .to_string();
    let mut h = harness(vec![confirm, reply_done("cleaned")], |c| {
        c.agent.auto_approve = true;
    });
    let outcome = h.agent.run("clean up").await;
    assert!(outcome.success);
    // The synthetic approval observation is visible in history.
    let obs = h
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert_eq!(obs.payload["result"]["approved"], true);
}

#[tokio::test]
async fn clarify_auto_approve_becomes_need_input_error() {
    let clarify = json!({
        "state": "clarify",
        "brief_rationale": "Ambiguous request",
        "clarify": {"question": "Which directory?"},
        "meta": {"continue": false, "stop_reason": "need_input"}
    })
    .to_string();
    let mut h = harness(vec![clarify], |c| {
        c.agent.auto_approve = true;
    });
    let outcome = h.agent.run("tidy it").await;
    assert!(!outcome.success);
    match &outcome.final_envelope.decision {
        Decision::Error { error } => assert_eq!(error.error_type, "need_input"),
        other => panic!("unexpected decision {other:?}"),
    }
}

// ── Budgets ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn budget_exhaustion_is_a_normal_terminal_state() {
    let endless = tool_call("get_cwd", json!({}));
    let mut h = harness(vec![endless.clone(), endless.clone(), endless], |c| {
        c.agent.max_cycles = 2;
    });
    let outcome = h.agent.run("never finishes").await;
    assert!(!outcome.success);
    assert_eq!(outcome.stats.cycles, 2);
    assert_eq!(
        outcome.final_envelope.meta.stop_reason,
        Some(StopReason::BudgetExhausted)
    );
    match &outcome.final_envelope.decision {
        Decision::Error { error } => assert_eq!(error.error_type, "budget_exhausted"),
        other => panic!("unexpected decision {other:?}"),
    }
}

#[tokio::test]
async fn token_budget_is_enforced() {
    let endless = tool_call("get_cwd", json!({}));
    let mut h = harness(vec![endless.clone(), endless.clone(), endless], |c| {
        c.agent.max_total_tokens = 1;
    });
    let outcome = h.agent.run("spend tokens").await;
    assert_eq!(
        outcome.final_envelope.meta.stop_reason,
        Some(StopReason::BudgetExhausted)
    );
    assert!(outcome.stats.cycles <= 2);
}

// ── Goal / todo updates ──────────────────────────────────────────────────────

#[tokio::test]
async fn goal_update_mutates_active_goal() {
    let reflect = json!({
        "state": "reflect",
        "brief_rationale": "Re-scoping",
        "reflect": {"analysis": "the user actually wants tests"},
        "meta": {
            "continue": true,
            "goal_update": {"new_goal": "write the tests", "reason": "clarified scope"}
        }
    })
    .to_string();
    let mut h = harness(vec![reflect, reply_done("done")], |_| {});
    let _ = h.agent.run("write the code").await;
    assert_eq!(h.agent.session().goal, "write the tests");
}

#[tokio::test]
async fn todo_update_maintains_list() {
    let plan = json!({
        "state": "plan",
        "brief_rationale": "Planning",
        "plan": {"root_task": "feature", "steps": ["a", "b"]},
        "meta": {
            "continue": true,
            "todo_update": {
                "action": "add",
                "todo": {"id": "t1", "content": "step one", "status": "pending"}
            }
        }
    })
    .to_string();
    let mut h = harness(vec![plan, reply_done("planned")], |_| {});
    let _ = h.agent.run("plan the feature").await;
    assert_eq!(h.agent.session().todos.len(), 1);
    assert_eq!(h.agent.session().todos[0].id, "t1");
    assert!(h.agent.session().plan.is_some());
}

// ── Permissions via tags ─────────────────────────────────────────────────────

#[tokio::test]
async fn tag_permissions_deny_unlisted_tools() {
    use kuvert_tags::{Tag, TagConfig, TagKind, TagMeta, TagPayload};

    let mut h = harness(
        vec![
            tool_call("create_file", json!({"path": "blocked.txt", "content": "x"})),
            reply_done("I am not permitted to create files"),
        ],
        |c| {
            c.tags.enabled = true;
        },
    );
    h.agent.tag_store_mut().add(Tag {
        name: "tool_readonly".into(),
        kind: TagKind::Tool,
        payload: TagPayload {
            meta: TagMeta::default(),
            config: TagConfig {
                assigned_users: vec!["*".into()],
                allowed_tools: vec!["read_file".into(), "list_files".into()],
                ..TagConfig::default()
            },
            content: "Read-only file access.".into(),
        },
    });

    let outcome = h.agent.run("Create blocked.txt").await;
    assert!(outcome.success, "agent explains the limitation and replies");
    assert!(!h.workdir.join("blocked.txt").exists(), "no file created");

    let obs = h
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert!(obs.payload["error"]
        .as_str()
        .unwrap()
        .contains("not allowed by current permissions"));
}

#[tokio::test]
async fn tag_prompt_is_used_as_system_message() {
    let provider = Arc::new(ScriptedDecider::new(vec![reply_done("hi")]));
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.tags.enabled = true;
    config.tools.workdir = Some(dir.path().to_string_lossy().into_owned());
    let config = Arc::new(config);
    let client = DecisionClient::new(
        Arc::clone(&provider) as Arc<dyn ModelProvider>,
        config.agent.max_retries,
    );
    let dispatcher = Dispatcher::builtin(&config.tools);
    let mut agent = Agent::new(client, dispatcher, config);

    let _ = agent.run("say hi").await;
    let req = provider.last_request.lock().unwrap().clone().unwrap();
    assert!(req.messages[0].content.contains("=== COMPANY CONTEXT ==="));
}

// ── Wait ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn wait_with_timeout_resumes_with_expiry_observation() {
    let wait = json!({
        "state": "wait",
        "brief_rationale": "Waiting for the build",
        "wait": {"event_type": "build_complete", "timeout": 0.05},
        "meta": {"continue": true}
    })
    .to_string();
    let mut h = harness(vec![wait, reply_done("resumed")], |_| {});
    let outcome = h.agent.run("wait for the build").await;
    assert!(outcome.success);
    let expiry = h
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert_eq!(expiry.payload["result"]["expired"], true);
}

#[tokio::test]
async fn wait_without_timeout_pauses_session() {
    let wait = json!({
        "state": "wait",
        "brief_rationale": "Waiting on deploy",
        "wait": {"event_type": "deploy_finished"},
        "meta": {"continue": false, "stop_reason": "need_input"}
    })
    .to_string();
    let mut h = harness(vec![wait], |_| {});
    let outcome = h.agent.run("wait for deploy").await;
    assert!(!outcome.success);
    assert_eq!(h.agent.session().status, SessionStatus::Waiting);
    assert!(h
        .agent
        .session()
        .history
        .iter()
        .any(|e| e.kind == EventKind::Event));
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn dropped_cancel_sender_stops_before_first_cycle() {
    let mut h = harness(vec![reply_done("never reached")], |_| {});
    let (tx, mut rx) = tokio::sync::oneshot::channel::<()>();
    drop(tx);
    let outcome = h.agent.run_with_cancel("do things", &mut rx).await;
    assert!(!outcome.success);
    assert_eq!(outcome.stats.cycles, 0);
    match &outcome.final_envelope.decision {
        Decision::Error { error } => assert_eq!(error.error_type, "cancelled"),
        other => panic!("unexpected decision {other:?}"),
    }
}

// ── Terminal semantics ───────────────────────────────────────────────────────

#[tokio::test]
async fn reply_with_continue_true_still_terminates() {
    let odd_reply = json!({
        "state": "reply",
        "brief_rationale": "Answering",
        "conversation": {"utterance": "done anyway"},
        "meta": {"continue": true}
    })
    .to_string();
    let mut h = harness(vec![odd_reply, reply_done("unreachable")], |_| {});
    let outcome = h.agent.run("quick question").await;
    assert_eq!(outcome.stats.cycles, 1, "terminal state must end the loop");
    assert_eq!(outcome.final_envelope.state(), "reply");
}

#[tokio::test]
async fn dead_end_reply_is_not_success() {
    let dead_end = json!({
        "state": "reply",
        "brief_rationale": "Cannot proceed",
        "conversation": {"utterance": "I cannot find the file"},
        "meta": {"continue": false, "stop_reason": "dead_end"}
    })
    .to_string();
    let mut h = harness(vec![dead_end], |_| {});
    let outcome = h.agent.run("edit the mystery file").await;
    assert!(!outcome.success);
    assert_eq!(outcome.final_envelope.state(), "reply");
}

#[tokio::test]
async fn finish_envelope_succeeds() {
    let finish = json!({
        "state": "finish",
        "brief_rationale": "All steps complete",
        "finish": {"summary": "created and verified the files"},
        "meta": {"continue": false, "stop_reason": "task_done"}
    })
    .to_string();
    let mut h = harness(vec![finish], |_| {});
    let outcome = h.agent.run("do the task").await;
    assert!(outcome.success);
    assert_eq!(outcome.final_envelope.state(), "finish");
}
