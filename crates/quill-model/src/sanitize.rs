// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! History sanitisation applied by both drivers before a request is built.
//!
//! A `tool`-role message whose `tool_call_id` has no matching assistant
//! `tool_calls` entry earlier in the log (an *orphan*) makes providers
//! reject the whole request with a 400.  Orphans can appear after
//! compaction or an aborted turn; filtering them here keeps the wire
//! payload coherent without the callers having to care.

use std::collections::HashSet;

use tracing::warn;

use crate::{Message, MessageContent, Role};

/// Drop tool-result messages that do not reference a prior assistant tool
/// call in the same history, and assistant tool-call messages whose results
/// were summarised away would be kept — only results are position-checked
/// because a dangling call is still a valid assistant turn for every
/// provider.
pub fn filter_orphan_tool_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut seen_call_ids: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());

    for msg in messages {
        match &msg.content {
            MessageContent::ToolCall { tool_call_id, .. } => {
                seen_call_ids.insert(tool_call_id.clone());
                out.push(msg);
            }
            MessageContent::ToolResult { tool_call_id, .. } => {
                if seen_call_ids.contains(tool_call_id) {
                    out.push(msg);
                } else {
                    warn!(
                        tool_call_id = %tool_call_id,
                        "dropping orphan tool result with no matching assistant tool call"
                    );
                }
            }
            _ => out.push(msg),
        }
    }
    out
}

/// Extract all system message text, concatenated in order.
///
/// Used by the Anthropic driver, which carries the system prompt as a
/// top-level field rather than a conversation turn.
pub fn collect_system_text(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages.iter().filter(|m| m.role == Role::System) {
        if let Some(t) = m.as_text() {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(t);
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
