// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end session flow through the public API: coordinator → agent →
//! dispatcher → built-in tools, with a scripted model and no network.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use quill_config::{AgentLimits, PermissionMode};
use quill_core::{Agent, AgentEvent, Coordinator, CoordinatorState, Session};
use quill_model::{ChatService, FinishReason, ResponseEvent, ScriptedMockService};
use quill_tools::{builtin_registry, AlwaysDenyHandler, Dispatcher, PermissionChecker};

fn coordinator(
    model: Arc<dyn ChatService>,
    mode: PermissionMode,
    dir: &tempfile::TempDir,
) -> (Coordinator, mpsc::Receiver<AgentEvent>) {
    let registry = Arc::new(builtin_registry());
    let checker = Arc::new(PermissionChecker::from_config(&Default::default()));
    let dispatcher = Arc::new(Dispatcher::new(registry, checker));
    let agent = Agent::new(model, dispatcher, AgentLimits::default());
    let session = Session::new(100_000, mode);
    let (tx, rx) = mpsc::channel(256);
    let c = Coordinator::new(
        agent,
        session,
        tx,
        dir.path(),
        dir.path(),
        Arc::new(AlwaysDenyHandler),
    );
    (c, rx)
}

fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

#[tokio::test]
async fn edit_turn_changes_the_file_and_leaves_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("config.toml");
    std::fs::write(&target, "debug = false\n").unwrap();
    let target_str = target.to_string_lossy().to_string();

    let model: Arc<dyn ChatService> = Arc::new(ScriptedMockService::new(vec![
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "tc-read".into(),
                name: "read".into(),
                arguments: json!({"path": target_str}).to_string(),
            },
            ResponseEvent::Done(FinishReason::ToolCalls),
        ],
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "tc-edit".into(),
                name: "edit".into(),
                arguments: json!({
                    "path": target_str,
                    "old_string": "debug = false",
                    "new_string": "debug = true"
                })
                .to_string(),
            },
            ResponseEvent::Done(FinishReason::ToolCalls),
        ],
        vec![
            ResponseEvent::TextDelta("Enabled debug mode.".into()),
            ResponseEvent::Done(FinishReason::Stop),
        ],
    ]));

    let (mut c, mut rx) = coordinator(model, PermissionMode::AutoEdit, &dir);
    c.handle_input("turn on debug in config.toml").await.unwrap();

    assert_eq!(c.state(), CoordinatorState::Idle);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "debug = true\n");

    // The events narrate the run in order: read starts before edit, the
    // turn completes exactly once.
    let events = drain(&mut rx);
    let tool_order: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolCallStarted(tc) => Some(tc.name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tool_order, vec!["read", "edit"]);
    assert_eq!(
        events.iter().filter(|e| matches!(e, AgentEvent::TurnComplete)).count(),
        1
    );

    // A snapshot of the pre-edit bytes exists on disk under the session's
    // own directory.
    let history_root = dir.path().join("file-history").join(&c.session().id);
    let backups: Vec<_> = std::fs::read_dir(&history_root)
        .unwrap()
        .flatten()
        .filter(|e| !e.file_name().to_string_lossy().ends_with(".meta.json"))
        .collect();
    assert_eq!(backups.len(), 1);
    let name = backups[0].file_name().to_string_lossy().to_string();
    assert!(name.contains("@v1"), "unexpected backup name {name}");
    assert_eq!(
        std::fs::read_to_string(backups[0].path()).unwrap(),
        "debug = false\n"
    );
}

#[tokio::test]
async fn plan_mode_blocks_the_edit_but_the_model_gets_told() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("x.txt");
    std::fs::write(&target, "unchanged").unwrap();
    let target_str = target.to_string_lossy().to_string();

    let model: Arc<dyn ChatService> = Arc::new(ScriptedMockService::new(vec![
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "tc-edit".into(),
                name: "edit".into(),
                arguments: json!({
                    "path": target_str,
                    "old_string": "unchanged",
                    "new_string": "changed"
                })
                .to_string(),
            },
            ResponseEvent::Done(FinishReason::ToolCalls),
        ],
        vec![
            ResponseEvent::TextDelta("I can only plan in this mode.".into()),
            ResponseEvent::Done(FinishReason::Stop),
        ],
    ]));

    let (mut c, mut rx) = coordinator(model, PermissionMode::Plan, &dir);
    c.handle_input("edit the file").await.unwrap();

    // No side effect happened; the denial flowed back as a tool result.
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "unchanged");
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolCallFinished { is_error: true, output, .. }
            if output.contains("permission denied")
    )));
    assert_eq!(
        c.session().messages.last().unwrap().as_text(),
        Some("I can only plan in this mode.")
    );
}

#[tokio::test]
async fn multi_turn_conversation_accumulates_history() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(ScriptedMockService::new(vec![
        vec![
            ResponseEvent::TextDelta("first".into()),
            ResponseEvent::Done(FinishReason::Stop),
        ],
        vec![
            ResponseEvent::TextDelta("second".into()),
            ResponseEvent::Done(FinishReason::Stop),
        ],
    ]));
    let last_request = model.last_request.clone();

    let (mut c, _rx) = coordinator(model, PermissionMode::Default, &dir);
    c.handle_input("question one").await.unwrap();
    c.handle_input("question two").await.unwrap();

    // The second request carried the whole prior exchange.
    let seen = last_request.lock().unwrap();
    let req = seen.as_ref().unwrap();
    let texts: Vec<&str> = req.messages.iter().filter_map(|m| m.as_text()).collect();
    assert!(texts.contains(&"question one"));
    assert!(texts.contains(&"first"));
    assert!(texts.contains(&"question two"));
}
