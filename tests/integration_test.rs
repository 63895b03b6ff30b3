// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end runtime scenarios driven through the scripted mock provider
/// and the built-in tool backend in a temporary workdir.
use std::sync::Arc;

use serde_json::json;

use kuvert_config::Config;
use kuvert_core::{Agent, EventKind, SessionStatus};
use kuvert_envelope::{Decision, StopReason};
use kuvert_model::{DecisionClient, ModelProvider, ScriptedDecider};
use kuvert_tags::{Tag, TagConfig, TagKind, TagMeta, TagPayload};
use kuvert_tools::Dispatcher;

struct Setup {
    agent: Agent,
    _dir: tempfile::TempDir,
    workdir: std::path::PathBuf,
}

fn setup(scripts: Vec<String>, mutate: impl FnOnce(&mut Config)) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.tools.workdir = Some(dir.path().to_string_lossy().into_owned());
    mutate(&mut config);
    let config = Arc::new(config);

    let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedDecider::new(scripts));
    let client = DecisionClient::new(provider, config.agent.max_retries);
    let dispatcher = Dispatcher::builtin(&config.tools);

    Setup {
        agent: Agent::new(client, dispatcher, config),
        workdir: dir.path().to_path_buf(),
        _dir: dir,
    }
}

// ── Scenario 1: single file creation ─────────────────────────────────────────

#[tokio::test]
async fn scenario_single_file_creation() {
    let mut s = setup(
        vec![
            json!({
                "state": "tool",
                "brief_rationale": "Creating hello.txt with the requested content",
                "tool": "create_file",
                "arguments": {"path": "hello.txt", "content": "Hello"},
                "meta": {"continue": true, "confidence": 0.9}
            })
            .to_string(),
            json!({
                "state": "reply",
                "brief_rationale": "File created successfully",
                "conversation": {"utterance": "Created hello.txt with the content Hello"},
                "meta": {"continue": false, "stop_reason": "task_done"}
            })
            .to_string(),
        ],
        |_| {},
    );

    let outcome = s.agent.run("Create hello.txt with content Hello").await;

    assert!(outcome.success);
    assert_eq!(outcome.final_envelope.state(), "reply");
    assert_eq!(
        outcome.final_envelope.meta.stop_reason,
        Some(StopReason::TaskDone)
    );
    assert_eq!(
        std::fs::read_to_string(s.workdir.join("hello.txt")).unwrap(),
        "Hello"
    );

    // Expected trace: decision(tool) → tool_result success size=5 → decision(reply).
    let tool_result = s
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert_eq!(tool_result.payload["success"], true);
    assert_eq!(tool_result.payload["result"]["size"], 5);
}

// ── Scenario 2: parallel multi-file ──────────────────────────────────────────

#[tokio::test]
async fn scenario_parallel_multi_file() {
    let mut s = setup(
        vec![
            json!({
                "state": "tools",
                "brief_rationale": "Creating the three files in parallel",
                "tools": [
                    {"tool_id": "fa", "tool": "create_file", "arguments": {"path": "a.txt", "content": "A"}},
                    {"tool_id": "fb", "tool": "create_file", "arguments": {"path": "b.txt", "content": "B"}},
                    {"tool_id": "fc", "tool": "create_file", "arguments": {"path": "c.txt", "content": "C"}}
                ],
                "meta": {"continue": true}
            })
            .to_string(),
            json!({
                "state": "reply",
                "brief_rationale": "All files created",
                "conversation": {"utterance": "Created a.txt, b.txt and c.txt"},
                "meta": {"continue": false, "stop_reason": "task_done"}
            })
            .to_string(),
        ],
        |_| {},
    );

    let outcome = s.agent.run("Create a.txt, b.txt, c.txt").await;
    assert!(outcome.success);

    let batch = s
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolsResult)
        .unwrap();
    assert_eq!(batch.payload["_multi_tool"], true);
    assert_eq!(batch.payload["all_success"], true);
    assert_eq!(batch.payload["count"], 3);
    // Result ids equal request ids; completion order is not asserted.
    for id in ["fa", "fb", "fc"] {
        assert!(batch.payload["results"].get(id).is_some());
    }

    for (name, content) in [("a.txt", "A"), ("b.txt", "B"), ("c.txt", "C")] {
        assert_eq!(
            std::fs::read_to_string(s.workdir.join(name)).unwrap(),
            content
        );
    }
}

// ── Scenario 3: approval required ────────────────────────────────────────────

#[tokio::test]
async fn scenario_approval_required() {
    let mut s = setup(
        vec![
            json!({
                "state": "tool",
                "brief_rationale": "Running the requested shell command",
                "tool": "execute_powershell",
                "arguments": {"command": "Get-Process"},
                "meta": {"continue": true}
            })
            .to_string(),
            json!({
                "state": "reply",
                "brief_rationale": "Command handled",
                "conversation": {"utterance": "The command was processed"},
                "meta": {"continue": false, "stop_reason": "task_done"}
            })
            .to_string(),
        ],
        |_| {},
    );

    let outcome = s.agent.run("Run Get-Process").await;
    assert!(!outcome.success);
    assert_eq!(s.agent.session().status, SessionStatus::Waiting);
    assert!(s
        .agent
        .session()
        .history
        .iter()
        .any(|e| e.kind == EventKind::ApprovalRequest));

    // Supplying approval resumes the run; the tool is dispatched with
    // approved=true and a subsequent reply is produced.
    let resumed = s.agent.resume_with_approval(true).await.unwrap();
    assert!(resumed.success);
    assert_eq!(resumed.final_envelope.state(), "reply");

    // The post-approval dispatch reached the backend (no longer withheld).
    let executed = s
        .agent
        .session()
        .history
        .iter()
        .filter(|e| e.kind == EventKind::ToolResult)
        .last()
        .unwrap();
    assert!(executed.payload.get("approval_required").is_none());
}

// ── Scenario 4: budget exhausted ─────────────────────────────────────────────

#[tokio::test]
async fn scenario_budget_exhausted() {
    let spin = json!({
        "state": "tool",
        "brief_rationale": "Exploring the workspace",
        "tool": "list_files",
        "arguments": {"path": "."},
        "meta": {"continue": true}
    })
    .to_string();
    let mut s = setup(vec![spin.clone(), spin.clone(), spin], |c| {
        c.agent.max_cycles = 2;
    });

    let outcome = s.agent.run("Solve an impossibly large task").await;
    assert!(!outcome.success);
    assert_eq!(outcome.stats.cycles, 2);
    assert_eq!(outcome.final_envelope.state(), "error");
    assert_eq!(
        outcome.final_envelope.meta.stop_reason,
        Some(StopReason::BudgetExhausted)
    );
}

// ── Scenario 5: malformed LLM output ─────────────────────────────────────────

#[tokio::test]
async fn scenario_malformed_llm_json() {
    let messy = "Let me answer that for you.\n\
        { \"state\": \"reply\", \"brief_rationale\": \"Answering\", \
        \"conversation\": {\"utterance\":\"hi\"}, \
        \"meta\":{\"continue\":false,\"stop_reason\":\"user_reply\"} }\n\
        // hope that helps!";
    let mut s = setup(vec![messy.to_string()], |_| {});

    let outcome = s.agent.run("Say hi").await;
    assert!(outcome.success);
    match &outcome.final_envelope.decision {
        Decision::Reply { conversation } => assert_eq!(conversation.utterance, "hi"),
        other => panic!("unexpected decision {other:?}"),
    }
}

// ── Scenario 6: permission denial via tags ───────────────────────────────────

#[tokio::test]
async fn scenario_permission_denial() {
    let mut s = setup(
        vec![
            json!({
                "state": "tool",
                "brief_rationale": "Creating the requested file",
                "tool": "create_file",
                "arguments": {"path": "secret.txt", "content": "data"},
                "meta": {"continue": true}
            })
            .to_string(),
            json!({
                "state": "reply",
                "brief_rationale": "Explaining the restriction",
                "conversation": {"utterance": "I only have read access and cannot create files"},
                "meta": {"continue": false, "stop_reason": "user_reply"}
            })
            .to_string(),
        ],
        |c| {
            c.tags.enabled = true;
        },
    );
    s.agent.tag_store_mut().add(Tag {
        name: "tool_read_only".into(),
        kind: TagKind::Tool,
        payload: TagPayload {
            meta: TagMeta::default(),
            config: TagConfig {
                assigned_users: vec!["*".into()],
                allowed_tools: vec!["read_file".into(), "list_files".into()],
                ..TagConfig::default()
            },
            content: "You may only read files.".into(),
        },
    });

    let outcome = s.agent.run("Create secret.txt").await;
    assert_eq!(outcome.final_envelope.state(), "reply");
    assert!(!s.workdir.join("secret.txt").exists(), "no file created");

    let denied = s
        .agent
        .session()
        .history
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert!(denied.payload["error"]
        .as_str()
        .unwrap()
        .contains("not allowed by current permissions"));
}

// ── Recorded decisions stay schema-valid ─────────────────────────────────────

#[tokio::test]
async fn decision_envelopes_in_history_revalidate() {
    let mut s = setup(
        vec![
            json!({
                "state": "tool",
                "brief_rationale": "Checking the working directory",
                "tool": "get_cwd",
                "arguments": {},
                "meta": {"continue": true}
            })
            .to_string(),
            json!({
                "state": "reply",
                "brief_rationale": "Reporting",
                "conversation": {"utterance": "done"},
                "meta": {"continue": false, "stop_reason": "task_done"}
            })
            .to_string(),
        ],
        |_| {},
    );
    let _ = s.agent.run("where am I").await;

    for event in &s.agent.session().history {
        if event.kind == EventKind::Decision {
            let (ok, errors) = kuvert_envelope::validate(&event.payload);
            assert!(ok, "recorded decision must revalidate: {errors:?}");
        }
    }
}
