// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use quill_tools::ToolCall;

/// Events emitted by the agent during a single turn.
///
/// Delivered losslessly and in emission order over an `mpsc` channel.  The
/// UI consumer may coalesce adjacent `TextDelta`s for rendering; the core
/// never does, and tool-argument fragments are assembled before any
/// `ToolCallStarted` is emitted so there is nothing to coalesce across.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// The full text of the assistant message once streaming finishes.
    TextComplete(String),
    /// A reasoning chunk from the model (extended thinking APIs).
    ThinkingDelta(String),
    /// The model requested a tool call (arguments fully assembled).
    ToolCallStarted(ToolCall),
    /// A tool call finished.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
        metadata: serde_json::Value,
    },
    /// Token usage reported by the provider.
    TokenUsage {
        input: u32,
        output: u32,
        total: u32,
        max_context: usize,
    },
    /// Compaction started (`active: true`) or finished (`active: false`,
    /// with before/after token counts and whether the size-based fallback
    /// ran instead of the summariser).
    Compacting {
        active: bool,
        pre_tokens: Option<usize>,
        post_tokens: Option<usize>,
        fallback: bool,
    },
    /// One provider response finished streaming.  Emitted exactly once per
    /// response.
    StreamEnd { finish_reason: String },
    /// The turn budget was exhausted with tool calls still pending.  The
    /// registered [`crate::TurnLimitHandler`] decides whether to continue.
    TurnLimitReached { turns: u32 },
    /// The turn was cancelled; any text already streamed is preserved.
    Aborted { partial_text: String },
    /// The agent finished processing the current user turn.
    TurnComplete,
    /// A recoverable error worth showing.
    Error(String),
}
