// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Context compaction: replacing old messages with a model-authored
//! summary to reclaim token budget.
//!
//! The normal path sends the old history to the model with a structured
//! summarisation prompt and rebuilds the window as system prompt +
//! boundary marker + summary + the most recent K messages.  When the
//! summariser fails for any reason the deterministic size-based fallback
//! keeps the most recent messages and drops the rest — it makes no model
//! call and always succeeds.

use std::sync::Arc;

use tracing::warn;

use quill_model::{
    CancelToken, ChatService, CompletionRequest, Message, MessageContent, Role,
};

use crate::Session;

const SUMMARY_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Summarise the conversation below into a dense checkpoint the agent can \
continue from. Use EXACTLY these Markdown sections:

## Goal
What the user is trying to achieve, in 1-2 sentences.

## Decisions
Every significant decision made so far and why, as bullets.

## Open Threads
Unfinished subtasks, unanswered questions, pending follow-ups.

## Referenced Files
Every file path that was read, edited, or discussed, one per line.

Preserve file paths, function names, error messages, and commands \
verbatim where they matter. The summary replaces the original history.";

/// Marker prefixed to the summary so a reader of the log can see where
/// compaction happened.
const BOUNDARY_MARKER: &str = "[Earlier conversation summarised below]";

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub pre_tokens: usize,
    pub post_tokens: usize,
    /// `true` when the size-based fallback ran instead of the summariser.
    pub fallback: bool,
    /// File paths the summary references, for the metadata check.
    pub referenced_files: Vec<String>,
}

/// Compact `session` in place.
///
/// `keep_recent` non-system messages survive verbatim; everything older is
/// summarised.  The split point moves backward past tool-call/tool-result
/// groups so the kept tail never opens with an orphan tool message.
pub async fn compact_session(
    session: &mut Session,
    model: &Arc<dyn ChatService>,
    keep_recent: usize,
    signal: &CancelToken,
) -> CompactionOutcome {
    let pre_tokens = session.token_count;

    let system: Option<Message> = session
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .cloned();
    let non_system: Vec<Message> = session
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let mut split = non_system.len().saturating_sub(keep_recent);
    // Never split inside a tool interaction group: a kept tail starting
    // with a ToolResult would reference a call id the summary destroyed.
    while split > 0 && split < non_system.len() {
        match &non_system[split].content {
            MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => split -= 1,
            _ => break,
        }
    }

    if split == 0 {
        // Nothing old enough to summarise — report a no-op.
        return CompactionOutcome {
            pre_tokens,
            post_tokens: pre_tokens,
            fallback: false,
            referenced_files: vec![],
        };
    }

    let to_summarise = &non_system[..split];
    let recent = &non_system[split..];

    let request = CompletionRequest {
        messages: vec![Message::user(format!(
            "{SUMMARY_PROMPT}\n\n---\n\n{}",
            serialize_history(to_summarise)
        ))],
        tools: vec![],
        stream: true,
    };

    match model.chat(request, signal.clone()).await {
        Ok(resp) if !resp.text.trim().is_empty() => {
            let summary = resp.text.trim().to_string();
            let referenced_files = extract_file_paths(&summary);

            let mut rebuilt = Vec::with_capacity(recent.len() + 2);
            if let Some(sys) = system {
                rebuilt.push(sys);
            }
            rebuilt.push(Message::assistant(format!("{BOUNDARY_MARKER}\n\n{summary}")));
            rebuilt.extend(recent.iter().cloned());
            session.replace_messages(rebuilt);

            CompactionOutcome {
                pre_tokens,
                post_tokens: session.token_count,
                fallback: false,
                referenced_files,
            }
        }
        outcome => {
            if let Err(e) = outcome {
                warn!("compaction summariser failed, using size-based fallback: {e:#}");
            } else {
                warn!("compaction summariser returned empty text, using size-based fallback");
            }
            truncate_fallback(session, keep_recent);
            CompactionOutcome {
                pre_tokens,
                post_tokens: session.token_count,
                fallback: true,
                referenced_files: vec![],
            }
        }
    }
}

/// Deterministic fallback: keep the system prompt and the most recent
/// `keep_recent` messages, drop everything else.  No model call.
pub fn truncate_fallback(session: &mut Session, keep_recent: usize) {
    let system: Option<Message> = session
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .cloned();
    let non_system: Vec<Message> = session
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let mut split = non_system.len().saturating_sub(keep_recent);
    while split > 0 && split < non_system.len() {
        match &non_system[split].content {
            MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => split -= 1,
            _ => break,
        }
    }

    let mut rebuilt = Vec::new();
    if let Some(sys) = system {
        rebuilt.push(sys);
    }
    rebuilt.push(Message::assistant(
        "[Context truncated: earlier history was dropped to stay within the \
         context window. Ask the user to restate anything that is missing.]",
    ));
    rebuilt.extend(non_system[split..].iter().cloned());
    session.replace_messages(rebuilt);
}

/// Flatten a message slice into role-labelled text for the summariser.
fn serialize_history(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        match &m.content {
            MessageContent::Text(t) => out.push_str(&format!("{role}: {t}\n")),
            MessageContent::Parts(_) => {
                out.push_str(&format!("{role}: {}\n", m.as_text().unwrap_or("[multimodal]")))
            }
            MessageContent::ToolCall { function, .. } => out.push_str(&format!(
                "{role} called {}({})\n",
                function.name, function.arguments
            )),
            MessageContent::ToolResult { content, .. } => {
                out.push_str(&format!("tool result: {content}\n"))
            }
        }
    }
    out
}

/// Pull file-path-looking tokens out of the summary text.
fn extract_file_paths(summary: &str) -> Vec<String> {
    let re = regex::Regex::new(r"[\w~./-]*/[\w./-]+\.\w+|[\w-]+\.\w{1,8}").expect("static regex");
    let mut paths: Vec<String> = re
        .find_iter(summary)
        .map(|m| m.as_str().to_string())
        .filter(|p| p.contains('/') || p.contains('.'))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use quill_config::PermissionMode;
    use quill_model::{FinishReason, ResponseEvent, ScriptedMockService};

    use super::*;

    fn long_session() -> Session {
        let mut s = Session::new(100_000, PermissionMode::Default);
        s.push(Message::system("you are an agent"));
        for i in 0..20 {
            s.push(Message::user(format!("request number {i} with some padding text")));
            s.push(Message::assistant(format!("answer number {i} with some padding text")));
        }
        s
    }

    fn summariser(text: &str) -> Arc<dyn ChatService> {
        Arc::new(ScriptedMockService::always_text(text))
    }

    #[tokio::test]
    async fn compaction_shrinks_the_window() {
        let mut s = long_session();
        let pre = s.token_count;
        let model = summariser("## Goal\nShip it.\n## Decisions\n- none\n## Open Threads\n- none\n## Referenced Files\nsrc/main.rs");
        let outcome = compact_session(&mut s, &model, 4, &CancelToken::new()).await;

        assert!(!outcome.fallback);
        assert_eq!(outcome.pre_tokens, pre);
        assert!(outcome.post_tokens <= outcome.pre_tokens);
        assert!(s.messages.len() < 42);
        // system + boundary/summary + 4 recent
        assert_eq!(s.messages.len(), 6);
        assert_eq!(s.messages[0].role, Role::System);
        assert!(s.messages[1].as_text().unwrap().contains("summarised below"));
    }

    #[tokio::test]
    async fn summary_file_references_are_extracted() {
        let mut s = long_session();
        let model = summariser("## Referenced Files\nsrc/main.rs\ncrates/core/lib.rs");
        let outcome = compact_session(&mut s, &model, 4, &CancelToken::new()).await;
        assert!(outcome.referenced_files.contains(&"src/main.rs".to_string()));
        assert!(outcome.referenced_files.contains(&"crates/core/lib.rs".to_string()));
    }

    #[tokio::test]
    async fn recent_tail_survives_verbatim() {
        let mut s = long_session();
        let model = summariser("summary text");
        compact_session(&mut s, &model, 4, &CancelToken::new()).await;
        let last = s.messages.last().unwrap();
        assert!(last.as_text().unwrap().contains("answer number 19"));
    }

    #[tokio::test]
    async fn failed_summariser_falls_back_to_truncation() {
        let mut s = long_session();
        // Empty reply forces the fallback.
        let model = summariser("");
        let outcome = compact_session(&mut s, &model, 4, &CancelToken::new()).await;
        assert!(outcome.fallback);
        assert!(outcome.post_tokens <= outcome.pre_tokens);
        assert!(s
            .messages
            .iter()
            .any(|m| m.as_text().map(|t| t.contains("Context truncated")).unwrap_or(false)));
    }

    #[tokio::test]
    async fn short_session_is_a_noop() {
        let mut s = Session::new(100_000, PermissionMode::Default);
        s.push(Message::system("sys"));
        s.push(Message::user("hi"));
        let model = summariser("should never be called");
        let outcome = compact_session(&mut s, &model, 6, &CancelToken::new()).await;
        assert_eq!(outcome.pre_tokens, outcome.post_tokens);
        assert_eq!(s.messages.len(), 2);
    }

    #[tokio::test]
    async fn split_never_strands_a_tool_result() {
        let mut s = Session::new(100_000, PermissionMode::Default);
        s.push(Message::system("sys"));
        for i in 0..6 {
            s.push(Message::user(format!("padding user message {i}")));
            s.push(Message::assistant(format!("padding answer {i}")));
        }
        s.push(Message::tool_call("tc-1", "read", "{}"));
        s.push(Message::tool_result("tc-1", "file contents"));
        s.push(Message::assistant("done reading"));

        let model = summariser("summary");
        compact_session(&mut s, &model, 2, &CancelToken::new()).await;

        // The kept tail must contain the tool call for any kept result.
        let mut seen_calls = std::collections::HashSet::new();
        for m in &s.messages {
            match &m.content {
                MessageContent::ToolCall { tool_call_id, .. } => {
                    seen_calls.insert(tool_call_id.clone());
                }
                MessageContent::ToolResult { tool_call_id, .. } => {
                    assert!(
                        seen_calls.contains(tool_call_id),
                        "tool result {tool_call_id} stranded without its call"
                    );
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn summariser_receives_the_old_history() {
        let mut s = long_session();
        let mock = ScriptedMockService::new(vec![vec![
            ResponseEvent::TextDelta("summary".into()),
            ResponseEvent::Done(FinishReason::Stop),
        ]]);
        let last_request = mock.last_request.clone();
        let model: Arc<dyn ChatService> = Arc::new(mock);
        compact_session(&mut s, &model, 4, &CancelToken::new()).await;

        let seen = last_request.lock().unwrap();
        let req = seen.as_ref().unwrap();
        let prompt = req.messages[0].as_text().unwrap();
        assert!(prompt.contains("request number 0"));
        assert!(prompt.contains("compaction assistant"));
        // The recent tail is NOT part of the summarisation prompt.
        assert!(!prompt.contains("request number 19"));
    }

    #[test]
    fn extract_file_paths_finds_paths_and_dedupes() {
        let files = extract_file_paths("see src/main.rs and src/main.rs plus lib/util.py");
        assert_eq!(files, vec!["lib/util.py", "src/main.rs"]);
    }
}
