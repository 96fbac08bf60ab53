// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Command/session coordinator: the single-in-flight-turn state machine.
//!
//! Exactly one turn runs at a time.  Input arriving while a turn is
//! running joins a FIFO queue and executes after teardown.  Slash commands
//! bypass the model entirely; user-defined commands expand into a
//! synthesised prompt and go through the normal loop.
//!
//! Teardown only clears shared turn state when the stored cancellation
//! handle is still the current turn's handle — a fast cancel-then-resubmit
//! must never let the old turn's teardown stomp on the new turn.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use quill_config::PermissionMode;
use quill_model::{CancelToken, Message};
use quill_tools::{ConfirmationHandler, ExecutionContext, FileAccessTracker, SnapshotStore};

use crate::{Agent, AgentEvent, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    Errored,
}

/// What `handle_input` did with the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Executed (possibly along with previously queued inputs).
    Ran,
    /// A turn was in flight; the input was queued.
    Queued,
}

pub struct Coordinator {
    agent: Agent,
    session: Session,
    state: CoordinatorState,
    queue: VecDeque<String>,
    /// Handle of the in-flight turn's token; compared by identity at
    /// teardown (the race-freedom invariant).
    current_turn: Mutex<Option<CancelToken>>,
    events_tx: mpsc::Sender<AgentEvent>,
    workspace_root: std::path::PathBuf,
    state_dir: std::path::PathBuf,
    confirmation: Arc<dyn ConfirmationHandler>,
    tracker: Arc<FileAccessTracker>,
    /// User-defined slash commands: name → prompt template with `$ARGS`.
    custom_commands: HashMap<String, String>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Agent,
        session: Session,
        events_tx: mpsc::Sender<AgentEvent>,
        workspace_root: impl Into<std::path::PathBuf>,
        state_dir: impl Into<std::path::PathBuf>,
        confirmation: Arc<dyn ConfirmationHandler>,
    ) -> Self {
        Self {
            agent,
            session,
            state: CoordinatorState::Idle,
            queue: VecDeque::new(),
            current_turn: Mutex::new(None),
            events_tx,
            workspace_root: workspace_root.into(),
            state_dir: state_dir.into(),
            confirmation,
            tracker: Arc::new(FileAccessTracker::new()),
            custom_commands: HashMap::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Register a user-defined command.  `template` may contain `$ARGS`,
    /// replaced with everything after the command name.
    pub fn register_command(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.custom_commands.insert(name.into(), template.into());
    }

    /// Fire the in-flight turn's cancellation token, if any.  Safe to call
    /// from any task holding a shared reference.
    pub fn cancel_current(&self) {
        if let Some(token) = self.current_turn.lock().expect("turn lock poisoned").as_ref() {
            debug!("cancelling in-flight turn");
            token.cancel();
        }
    }

    /// Submit user input.  Queues when a turn is already running;
    /// otherwise executes this input and then drains the queue.
    pub async fn handle_input(&mut self, input: &str) -> anyhow::Result<SubmitOutcome> {
        self.queue.push_back(input.to_string());
        if self.state == CoordinatorState::Running {
            debug!(queued = self.queue.len(), "turn in flight; input queued");
            return Ok(SubmitOutcome::Queued);
        }
        self.drain_queue().await?;
        Ok(SubmitOutcome::Ran)
    }

    async fn drain_queue(&mut self) -> anyhow::Result<()> {
        while let Some(input) = self.queue.pop_front() {
            let trimmed = input.trim().to_string();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(command) = trimmed.strip_prefix('/') {
                self.execute_command(command).await?;
            } else {
                self.execute_turn(&trimmed).await?;
            }
        }
        Ok(())
    }

    // ── Turn execution ────────────────────────────────────────────────────────

    async fn execute_turn(&mut self, prompt: &str) -> anyhow::Result<()> {
        self.state = CoordinatorState::Running;
        let token = CancelToken::new();
        *self.current_turn.lock().expect("turn lock poisoned") = Some(token.clone());

        let ctx = self.execution_context(token.clone());
        let result = self
            .agent
            .run_turn(
                &mut self.session,
                Message::user(prompt),
                &ctx,
                self.events_tx.clone(),
            )
            .await;

        self.teardown(&token, result.is_err());
        result
    }

    /// Clear shared turn state — but only when `token` is still the
    /// current turn's handle.  A stale teardown is a no-op.
    fn teardown(&mut self, token: &CancelToken, errored: bool) {
        let mut current = self.current_turn.lock().expect("turn lock poisoned");
        let is_current = current.as_ref().map(|t| t.same_token(token)).unwrap_or(false);
        if !is_current {
            warn!("stale teardown ignored; a newer turn owns the state");
            return;
        }
        *current = None;
        self.state = if errored { CoordinatorState::Errored } else { CoordinatorState::Idle };
    }

    fn execution_context(&self, signal: CancelToken) -> ExecutionContext {
        ExecutionContext {
            signal,
            session_id: self.session.id.clone(),
            message_id: String::new(),
            workspace_root: self.workspace_root.clone(),
            snapshots: Arc::new(
                SnapshotStore::for_session(&self.state_dir, &self.session.id)
                    .with_keep(self.agent.limits().snapshot_keep),
            ),
            tracker: Arc::clone(&self.tracker),
            confirmation: Arc::clone(&self.confirmation),
            update_output: None,
        }
    }

    // ── Slash commands ────────────────────────────────────────────────────────

    async fn execute_command(&mut self, command: &str) -> anyhow::Result<()> {
        let (name, args) = match command.split_once(char::is_whitespace) {
            Some((n, a)) => (n, a.trim()),
            None => (command, ""),
        };
        debug!(command = name, "slash command");

        match name {
            "clear" => {
                let max_tokens = self.session.max_tokens;
                let mode = self.session.permission_mode;
                self.session = Session::new(max_tokens, mode);
                self.record_command_result("/clear", "Session cleared; starting fresh.");
            }
            "compact" => {
                let token = CancelToken::new();
                let ctx = self.execution_context(token);
                self.agent
                    .force_compact(&mut self.session, &ctx, &self.events_tx)
                    .await;
            }
            "mode" => match args.parse::<PermissionMode>() {
                Ok(mode) => {
                    self.session.permission_mode = mode;
                    self.record_command_result(
                        &format!("/mode {args}"),
                        &format!("Permission mode is now {mode}."),
                    );
                }
                Err(e) => {
                    self.record_command_result(&format!("/mode {args}"), &e);
                }
            },
            "undo" => {
                let result = self.undo_command(args);
                self.record_command_result(&format!("/undo {args}"), &result);
            }
            "help" => {
                self.record_command_result(
                    "/help",
                    "Commands: /clear, /compact, /mode <default|auto-edit|plan|yolo>, \
                     /undo <path> [message_id], /help. \
                     Custom commands run as /<name> [args].",
                );
            }
            _ => {
                if let Some(template) = self.custom_commands.get(name).cloned() {
                    // User-defined command: expand into a synthesised
                    // prompt and run it through the normal loop.
                    let prompt = template.replace("$ARGS", args);
                    return self.execute_turn(&prompt).await;
                }
                self.record_command_result(
                    &format!("/{command}"),
                    &format!("Unknown command /{name}. See /help for available commands."),
                );
            }
        }
        Ok(())
    }

    /// Record a locally handled command and its effect in the session log.
    fn record_command_result(&mut self, input: &str, result: &str) {
        self.session.push(Message::user(input));
        self.session.push(Message::assistant(result));
    }

    /// `/undo <path> [message_id]` — without a message id, list the
    /// file's snapshots newest-first; with one, restore it.  Handled
    /// locally against this session's snapshot store, no model involved.
    fn undo_command(&self, args: &str) -> String {
        let (path_arg, message_id) = match args.split_once(char::is_whitespace) {
            Some((p, id)) => (p, Some(id.trim())),
            None => (args, None),
        };
        if path_arg.is_empty() {
            return "Usage: /undo <path> [message_id]".to_string();
        }
        let path = {
            let p = std::path::Path::new(path_arg);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                self.workspace_root.join(p)
            }
        };
        let store = SnapshotStore::for_session(&self.state_dir, &self.session.id)
            .with_keep(self.agent.limits().snapshot_keep);

        match message_id {
            None => match store.list_snapshots(&path) {
                Ok(snapshots) if snapshots.is_empty() => {
                    format!("No snapshots of {} in this session.", path.display())
                }
                Ok(snapshots) => {
                    let mut out =
                        format!("Snapshots of {} (newest first):\n", path.display());
                    for meta in snapshots.iter().rev() {
                        out.push_str(&format!(
                            "  v{} — message {} — {}\n",
                            meta.version,
                            if meta.message_id.is_empty() {
                                "(unknown)"
                            } else {
                                &meta.message_id
                            },
                            meta.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        ));
                    }
                    out.push_str("Restore one with /undo <path> <message_id>.");
                    out
                }
                Err(e) => format!("Listing snapshots failed: {e}"),
            },
            Some(id) => match store.restore_snapshot(&path, id) {
                Ok(()) => format!(
                    "Restored {} to its state before message {id}.",
                    path.display()
                ),
                Err(e) => format!("Restore failed: {e}"),
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use quill_config::AgentLimits;
    use quill_model::{ChatService, FinishReason, ResponseEvent, ScriptedMockService};
    use quill_tools::{builtin_registry, AlwaysDenyHandler, Dispatcher, PermissionChecker};

    fn coordinator_with(
        model: Arc<dyn ChatService>,
    ) -> (tempfile::TempDir, Coordinator, mpsc::Receiver<AgentEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(builtin_registry());
        let checker = Arc::new(PermissionChecker::from_config(&Default::default()));
        let dispatcher = Arc::new(Dispatcher::new(registry, checker));
        let agent = Agent::new(model, dispatcher, AgentLimits::default());
        let session = Session::new(100_000, PermissionMode::Default);
        let (tx, rx) = mpsc::channel(256);
        let coordinator = Coordinator::new(
            agent,
            session,
            tx,
            dir.path(),
            dir.path(),
            Arc::new(AlwaysDenyHandler),
        );
        (dir, coordinator, rx)
    }

    fn scripted(text: &str) -> Arc<dyn ChatService> {
        Arc::new(ScriptedMockService::always_text(text))
    }

    #[tokio::test]
    async fn plain_input_runs_a_turn_and_returns_to_idle() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("hello"));
        let outcome = c.handle_input("hi there").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Ran);
        assert_eq!(c.state(), CoordinatorState::Idle);
        assert_eq!(c.session().messages.last().unwrap().as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn queued_inputs_drain_in_fifo_order() {
        let model = Arc::new(ScriptedMockService::new(vec![
            vec![ResponseEvent::TextDelta("first answer".into()), ResponseEvent::Done(FinishReason::Stop)],
            vec![ResponseEvent::TextDelta("second answer".into()), ResponseEvent::Done(FinishReason::Stop)],
        ]));
        let (_dir, mut c, _rx) = coordinator_with(model);

        // "early question" was queued while a turn was notionally in
        // flight; the later submission drains the queue in FIFO order.
        c.queue.push_back("early question".into());
        c.handle_input("late question").await.unwrap();

        let texts: Vec<&str> = c.session().messages.iter().filter_map(|m| m.as_text()).collect();
        let early = texts.iter().position(|t| *t == "early question").unwrap();
        let late = texts.iter().position(|t| *t == "late question").unwrap();
        assert!(early < late, "queue order violated: {texts:?}");
        // The first script answered the first-executed input.
        assert_eq!(texts[early + 1], "first answer");
        assert_eq!(texts[late + 1], "second answer");
        assert_eq!(c.queue_len(), 0);
        assert_eq!(c.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn clear_resets_session_with_a_fresh_id() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("x"));
        c.handle_input("hello").await.unwrap();
        let old_id = c.session().id.clone();
        assert!(c.session().messages.len() > 1);

        c.handle_input("/clear").await.unwrap();
        assert_ne!(c.session().id, old_id);
        // Only the recorded command remains.
        let texts: Vec<&str> = c.session().messages.iter().filter_map(|m| m.as_text()).collect();
        assert_eq!(texts, vec!["/clear", "Session cleared; starting fresh."]);
    }

    #[tokio::test]
    async fn mode_command_switches_permission_mode() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("x"));
        c.handle_input("/mode plan").await.unwrap();
        assert_eq!(c.session().permission_mode, PermissionMode::Plan);

        c.handle_input("/mode yolo").await.unwrap();
        assert_eq!(c.session().permission_mode, PermissionMode::Yolo);
    }

    #[tokio::test]
    async fn invalid_mode_is_reported_not_applied() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("x"));
        c.handle_input("/mode turbo").await.unwrap();
        assert_eq!(c.session().permission_mode, PermissionMode::Default);
        let last = c.session().messages.last().unwrap().as_text().unwrap();
        assert!(last.contains("unknown permission mode"), "{last}");
    }

    #[tokio::test]
    async fn undo_without_snapshots_reports_none() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("never called"));
        c.handle_input("/undo src/main.rs").await.unwrap();
        let last = c.session().messages.last().unwrap().as_text().unwrap();
        assert!(last.contains("No snapshots"), "{last}");
        // Handled locally; only the recorded command pair was added.
        assert_eq!(c.session().messages.len(), 2);
    }

    #[tokio::test]
    async fn undo_lists_snapshots_newest_first() {
        let (dir, mut c, _rx) = coordinator_with(scripted("x"));
        let target = dir.path().join("t.txt");
        std::fs::write(&target, "v1").unwrap();
        let store = quill_tools::SnapshotStore::for_session(dir.path(), &c.session().id);
        store.create_snapshot(&target, "msg-a").unwrap();
        std::fs::write(&target, "v2").unwrap();
        store.create_snapshot(&target, "msg-b").unwrap();

        c.handle_input(&format!("/undo {}", target.display())).await.unwrap();

        let last = c.session().messages.last().unwrap().as_text().unwrap();
        let a = last.find("msg-a").unwrap();
        let b = last.find("msg-b").unwrap();
        assert!(b < a, "newest snapshot should be listed first:\n{last}");
    }

    #[tokio::test]
    async fn undo_with_message_id_restores_the_file() {
        let (dir, mut c, _rx) = coordinator_with(scripted("x"));
        let target = dir.path().join("t.txt");
        std::fs::write(&target, "before").unwrap();
        let store = quill_tools::SnapshotStore::for_session(dir.path(), &c.session().id);
        store.create_snapshot(&target, "msg-1").unwrap();
        std::fs::write(&target, "after").unwrap();

        c.handle_input(&format!("/undo {} msg-1", target.display())).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "before");
        let last = c.session().messages.last().unwrap().as_text().unwrap();
        assert!(last.contains("Restored"), "{last}");
    }

    #[tokio::test]
    async fn undo_with_unknown_message_id_reports_failure() {
        let (dir, mut c, _rx) = coordinator_with(scripted("x"));
        let target = dir.path().join("t.txt");
        std::fs::write(&target, "x").unwrap();
        let store = quill_tools::SnapshotStore::for_session(dir.path(), &c.session().id);
        store.create_snapshot(&target, "msg-1").unwrap();

        c.handle_input(&format!("/undo {} ghost", target.display())).await.unwrap();

        let last = c.session().messages.last().unwrap().as_text().unwrap();
        assert!(last.contains("Restore failed"), "{last}");
    }

    #[tokio::test]
    async fn undo_without_path_shows_usage() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("x"));
        c.handle_input("/undo").await.unwrap();
        let last = c.session().messages.last().unwrap().as_text().unwrap();
        assert!(last.contains("Usage: /undo"), "{last}");
    }

    #[tokio::test]
    async fn unknown_command_errors_locally_with_help_pointer() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("never called"));
        c.handle_input("/frobnicate now").await.unwrap();
        let last = c.session().messages.last().unwrap().as_text().unwrap();
        assert!(last.contains("Unknown command /frobnicate"));
        assert!(last.contains("/help"));
        // The model was never involved.
        assert_eq!(c.session().messages.len(), 2);
    }

    #[tokio::test]
    async fn custom_command_expands_into_a_prompt() {
        let model = Arc::new(ScriptedMockService::always_text("reviewed"));
        let last_request = model.last_request.clone();
        let (_dir, mut c, _rx) = coordinator_with(model);
        c.register_command("review", "Review the following file carefully: $ARGS");

        c.handle_input("/review src/main.rs").await.unwrap();

        let seen = last_request.lock().unwrap();
        let req = seen.as_ref().unwrap();
        let prompt = req
            .messages
            .iter()
            .find(|m| m.as_text().map(|t| t.contains("Review the following")).unwrap_or(false))
            .unwrap();
        assert!(prompt.as_text().unwrap().contains("src/main.rs"));
        assert_eq!(c.session().messages.last().unwrap().as_text(), Some("reviewed"));
    }

    #[tokio::test]
    async fn compact_command_emits_compaction_events() {
        let model = Arc::new(ScriptedMockService::new(vec![
            vec![ResponseEvent::TextDelta("## Goal\nsummary".into()), ResponseEvent::Done(FinishReason::Stop)],
        ]));
        let (_dir, mut c, mut rx) = coordinator_with(model);
        // Seed enough history for the summariser to have work.
        for i in 0..10 {
            c.session.push(Message::user(format!("question {i}")));
            c.session.push(Message::assistant(format!("answer {i}")));
        }

        c.handle_input("/compact").await.unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Compacting { active: true, .. })));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Compacting { active: false, .. })));
    }

    #[tokio::test]
    async fn compact_resets_cumulative_usage_once() {
        let model = Arc::new(ScriptedMockService::new(vec![
            vec![ResponseEvent::TextDelta("summary".into()), ResponseEvent::Done(FinishReason::Stop)],
        ]));
        let (_dir, mut c, _rx) = coordinator_with(model);
        for i in 0..10 {
            c.session.push(Message::user(format!("q {i} padding padding")));
            c.session.push(Message::assistant(format!("a {i} padding padding")));
        }
        c.session.add_usage(5000, 800);

        c.handle_input("/compact").await.unwrap();
        assert_eq!(c.session().input_tokens_total, 0);
        assert_eq!(c.session().output_tokens_total, 0);
    }

    // ── Race-freedom invariant ────────────────────────────────────────────────

    #[tokio::test]
    async fn stale_teardown_does_not_clobber_the_new_turn() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("x"));

        let old_token = CancelToken::new();
        let new_token = CancelToken::new();
        *c.current_turn.lock().unwrap() = Some(new_token.clone());
        c.state = CoordinatorState::Running;

        // Teardown from the old (cancelled) turn arrives late.
        c.teardown(&old_token, false);
        assert_eq!(c.state(), CoordinatorState::Running, "stale teardown cleared state");
        assert!(c.current_turn.lock().unwrap().is_some());

        // The owning turn's teardown still works.
        c.teardown(&new_token, false);
        assert_eq!(c.state(), CoordinatorState::Idle);
        assert!(c.current_turn.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_current_fires_the_stored_token() {
        let (_dir, c, _rx) = coordinator_with(scripted("x"));
        let token = CancelToken::new();
        *c.current_turn.lock().unwrap() = Some(token.clone());
        c.cancel_current();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn consecutive_turns_return_to_idle_each_time() {
        let model = Arc::new(ScriptedMockService::new(vec![
            vec![ResponseEvent::TextDelta("one".into()), ResponseEvent::Done(FinishReason::Stop)],
            vec![ResponseEvent::TextDelta("two".into()), ResponseEvent::Done(FinishReason::Stop)],
        ]));
        let (_dir, mut c, _rx) = coordinator_with(model);

        c.handle_input("first").await.unwrap();
        assert_eq!(c.state(), CoordinatorState::Idle);
        c.handle_input("second").await.unwrap();
        assert_eq!(c.state(), CoordinatorState::Idle);
        assert_eq!(c.session().messages.last().unwrap().as_text(), Some("two"));
    }

    #[tokio::test]
    async fn empty_input_is_ignored() {
        let (_dir, mut c, _rx) = coordinator_with(scripted("x"));
        c.handle_input("   ").await.unwrap();
        assert!(c.session().messages.is_empty());
    }
}
