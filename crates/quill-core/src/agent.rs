// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use quill_config::{AgentLimits, PermissionMode};
use quill_model::{
    is_abort_error, ChatService, CompletionRequest, Message, ResponseEvent, ToolSchema,
};
use quill_tools::{Dispatcher, ExecutionContext, ToolCall};

use crate::{compact::compact_session, events::AgentEvent, Session};

/// Response from the turn-limit consultation.
#[derive(Debug, Clone, Default)]
pub struct TurnLimitDecision {
    pub continue_run: bool,
    pub reason: Option<String>,
}

/// Consulted when a user turn exhausts its tool-round budget with tool
/// calls still pending.  Returning `continue_run: true` grants another
/// full budget.
#[async_trait]
pub trait TurnLimitHandler: Send + Sync {
    async fn on_turn_limit(&self, turns: u32) -> TurnLimitDecision;
}

/// The core agent: drives the model ⇄ tool loop for one user turn.
///
/// The agent borrows the session mutably for the duration of a turn and
/// emits [`AgentEvent`]s through the channel the caller provides.  All
/// side effects flow through the [`Dispatcher`].
pub struct Agent {
    model: Arc<dyn ChatService>,
    dispatcher: Arc<Dispatcher>,
    limits: AgentLimits,
    turn_limit_handler: Option<Arc<dyn TurnLimitHandler>>,
    thinking_enabled: bool,
}

/// One streamed provider response, fully drained.
struct StreamedTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
    /// The cancellation token fired mid-stream; `text` holds whatever
    /// arrived before the cut.
    aborted: bool,
}

impl Agent {
    pub fn new(model: Arc<dyn ChatService>, dispatcher: Arc<Dispatcher>, limits: AgentLimits) -> Self {
        Self {
            model,
            dispatcher,
            limits,
            turn_limit_handler: None,
            thinking_enabled: true,
        }
    }

    pub fn with_turn_limit_handler(mut self, handler: Arc<dyn TurnLimitHandler>) -> Self {
        self.turn_limit_handler = Some(handler);
        self
    }

    pub fn with_thinking(mut self, enabled: bool) -> Self {
        self.thinking_enabled = enabled;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn limits(&self) -> &AgentLimits {
        &self.limits
    }

    /// Run one user turn to completion (or cancellation).
    ///
    /// `ctx` carries the turn's cancellation token and the side-effect
    /// services; its `message_id` is replaced per assistant iteration so
    /// snapshots key to message boundaries.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        user_message: Message,
        ctx: &ExecutionContext,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        let mode = session.permission_mode;

        if session.messages.is_empty() {
            session.push(Message::system(system_prompt(mode, &ctx.workspace_root)));
        }

        // Proactive compaction before the new user message joins the log.
        self.ensure_fits_budget(session, ctx, &tx).await;

        session.push(user_message);

        let mut turns = 0u32;
        let mut partial_text = String::new();

        loop {
            // No new provider request once the turn is cancelled.
            if ctx.signal.is_cancelled() {
                return self.finish_aborted(session, partial_text, &tx).await;
            }

            let streamed = self.stream_one_turn(session, ctx, &tx).await?;

            if !streamed.text.is_empty() {
                partial_text.push_str(&streamed.text);
                session.push(Message::assistant(&streamed.text));
                let _ = tx.send(AgentEvent::TextComplete(streamed.text.clone())).await;
            }

            if streamed.aborted {
                return self.finish_aborted(session, partial_text, &tx).await;
            }

            if streamed.tool_calls.is_empty() {
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(());
            }

            // Turn budget: consulted when the response still carries
            // unresolved tool calls after `max_turns` iterations.
            turns += 1;
            if turns >= self.limits.max_turns {
                let _ = tx.send(AgentEvent::TurnLimitReached { turns }).await;
                let decision = match &self.turn_limit_handler {
                    Some(h) => h.on_turn_limit(turns).await,
                    None => TurnLimitDecision::default(),
                };
                if decision.continue_run {
                    debug!(turns, "turn limit extended by handler");
                    turns = 0;
                } else {
                    let reason = decision
                        .reason
                        .unwrap_or_else(|| "turn budget exhausted".into());
                    session.push(Message::assistant(format!(
                        "Stopped after {turns} tool-call rounds: {reason}. \
                         The remaining tool calls were not executed; ask to \
                         continue if the task is unfinished."
                    )));
                    let _ = tx.send(AgentEvent::TurnComplete).await;
                    return Ok(());
                }
            }

            // Phase 1: record the assistant's tool-call messages before any
            // results, keeping the wire formats' ordering contract intact.
            let mut exec = ctx.clone();
            exec.message_id = Uuid::new_v4().to_string();
            for tc in &streamed.tool_calls {
                session.push(Message::tool_call(&tc.id, &tc.name, tc.args.to_string()));
                let _ = tx.send(AgentEvent::ToolCallStarted(tc.clone())).await;
            }

            // Phase 2: dispatch.  Concurrency-safe tools run in parallel;
            // the dispatcher returns outputs in call order regardless.
            let outputs = self
                .dispatcher
                .dispatch_all(&streamed.tool_calls, &exec, mode)
                .await;

            // Phase 3: record results in the model's tool_calls order.
            for (tc, output) in streamed.tool_calls.iter().zip(outputs.iter()) {
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        call_id: tc.id.clone(),
                        tool_name: tc.name.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error(),
                        metadata: output.metadata.clone(),
                    })
                    .await;
                session.push(Message::tool_result(&tc.id, &output.content));
            }

            // Mid-loop budget gate so one large tool result cannot blow the
            // next request.
            self.ensure_fits_budget(session, ctx, &tx).await;
        }
    }

    /// Unconditional compaction, for the explicit `/compact` command.
    pub async fn force_compact(
        &self,
        session: &mut Session,
        ctx: &ExecutionContext,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        self.run_compaction(session, ctx, tx).await;
    }

    async fn ensure_fits_budget(
        &self,
        session: &mut Session,
        ctx: &ExecutionContext,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        if ctx.signal.is_cancelled() {
            return;
        }
        if !session.is_near_limit(self.limits.compaction_threshold) {
            return;
        }
        self.run_compaction(session, ctx, tx).await;
    }

    async fn run_compaction(
        &self,
        session: &mut Session,
        ctx: &ExecutionContext,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let pre = session.token_count;
        let _ = tx
            .send(AgentEvent::Compacting {
                active: true,
                pre_tokens: Some(pre),
                post_tokens: None,
                fallback: false,
            })
            .await;

        let outcome = compact_session(
            session,
            &self.model,
            self.limits.compaction_keep_recent,
            &ctx.signal,
        )
        .await;

        // Single usage-reset path, driven by compaction completion.
        session.reset_usage();

        let _ = tx
            .send(AgentEvent::Compacting {
                active: false,
                pre_tokens: Some(outcome.pre_tokens),
                post_tokens: Some(outcome.post_tokens),
                fallback: outcome.fallback,
            })
            .await;
    }

    /// Stream one provider response, forwarding deltas and assembling tool
    /// calls.  Returns `aborted: true` instead of an error when the turn's
    /// token fired mid-stream, so the caller can finalise partial content.
    async fn stream_one_turn(
        &self,
        session: &mut Session,
        ctx: &ExecutionContext,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<StreamedTurn> {
        let tools: Vec<ToolSchema> = self
            .dispatcher
            .registry()
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let request = CompletionRequest {
            messages: session.messages.clone(),
            tools,
            stream: true,
        };

        let mut stream = match self.model.stream_chat(request, ctx.signal.clone()).await {
            Ok(s) => s,
            Err(e) if is_abort_error(&e) => {
                return Ok(StreamedTurn { text: String::new(), tool_calls: vec![], aborted: true });
            }
            Err(e) => return Err(e),
        };

        let mut text = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut stream_ended = false;
        let mut aborted = false;

        loop {
            // Every stream read is a suspension point; the select keeps it
            // cancellation-aware even for drivers that do not wrap their
            // streams themselves.
            let event = tokio::select! {
                biased;
                _ = ctx.signal.cancelled() => {
                    aborted = true;
                    break;
                }
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };

            match event {
                Ok(ResponseEvent::TextDelta(delta)) if !delta.is_empty() => {
                    text.push_str(&delta);
                    let _ = tx.send(AgentEvent::TextDelta(delta)).await;
                }
                Ok(ResponseEvent::TextDelta(_)) => {}
                Ok(ResponseEvent::ThinkingDelta(delta)) => {
                    if self.thinking_enabled && !delta.is_empty() {
                        let _ = tx.send(AgentEvent::ThinkingDelta(delta)).await;
                    }
                }
                Ok(ResponseEvent::ToolCall { index, id, name, arguments }) => {
                    let entry = pending.entry(index).or_insert_with(PendingToolCall::default);
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments);
                }
                Ok(ResponseEvent::Usage { input_tokens, output_tokens }) => {
                    session.add_usage(input_tokens, output_tokens);
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: input_tokens,
                            output: output_tokens,
                            total: input_tokens + output_tokens,
                            max_context: session.max_tokens,
                        })
                        .await;
                }
                Ok(ResponseEvent::Done(reason)) => {
                    if !stream_ended {
                        stream_ended = true;
                        let _ = tx
                            .send(AgentEvent::StreamEnd {
                                finish_reason: reason.as_str().to_string(),
                            })
                            .await;
                    }
                    break;
                }
                Ok(ResponseEvent::Error(e)) => {
                    warn!("model stream warning: {e}");
                    let _ = tx.send(AgentEvent::Error(e)).await;
                }
                Err(e) if is_abort_error(&e) => {
                    aborted = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        // Flush assembled tool calls ordered by provider index.  Calls with
        // no name cannot be dispatched and are dropped; an empty id gets a
        // synthetic one so the result message can still reference it.
        let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::with_capacity(sorted.len());
        for (i, (_, ptc)) in sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name");
                continue;
            }
            tool_calls.push(ptc.finish(i));
        }

        Ok(StreamedTurn { text, tool_calls, aborted })
    }

    /// Common abort epilogue: partial content is already in the log; add
    /// the single "task stopped" marker and report.
    async fn finish_aborted(
        &self,
        session: &mut Session,
        partial_text: String,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        session.push(Message::assistant("[task stopped by user]"));
        let _ = tx.send(AgentEvent::Aborted { partial_text }).await;
        Ok(())
    }
}

/// Mode-aware system prompt.
fn system_prompt(mode: PermissionMode, workspace_root: &Path) -> String {
    let mut prompt = format!(
        "You are quill, a coding agent working in {}.\n\
         Use the provided tools to inspect and change the workspace; never \
         guess file contents you could read. Read a file before editing it. \
         Prefer small, verifiable steps, and report what you changed.",
        workspace_root.display()
    );
    if mode == PermissionMode::Plan {
        prompt.push_str(
            "\n\nYou are in plan mode: only read and search tools are \
             available. Investigate and produce a plan; do not attempt \
             changes until the user leaves plan mode.",
        );
    }
    prompt
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, position: usize) -> ToolCall {
        let id = if self.id.is_empty() {
            warn!(tool_name = %self.name, "tool call had empty id; generating synthetic id");
            format!("tc_synthetic_{position}")
        } else {
            self.id
        };
        // Arguments must resolve to an object; `null` or garbage would
        // poison the conversation history on the next request.
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(_) => match serde_json::from_str(&fix_invalid_json_escapes(&self.args_buf)) {
                    Ok(v) => {
                        warn!(tool_call_id = %id, "repaired invalid JSON escapes in tool arguments");
                        v
                    }
                    Err(e) => {
                        warn!(
                            tool_call_id = %id,
                            error = %e,
                            "tool call arguments are not valid JSON; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCall { id, name: self.name, args }
    }
}

/// Replace invalid escape sequences inside JSON string values with a
/// doubled backslash so the document parses.  Models occasionally emit
/// `\c`, `\(` and similar inside tool arguments.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
