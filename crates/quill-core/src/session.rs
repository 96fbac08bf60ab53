// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use quill_config::PermissionMode;
use quill_model::Message;
use uuid::Uuid;

/// In-memory conversation session.
///
/// The session exclusively owns its message log; only the coordinator and
/// the compaction routine mutate it.  The agent loop borrows it mutably
/// for the duration of one turn.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate token count for the current message list.
    pub token_count: usize,
    /// Context window used for compaction decisions.
    pub max_tokens: usize,
    pub permission_mode: PermissionMode,
    /// Cumulative provider-reported usage for this session.
    pub input_tokens_total: u64,
    pub output_tokens_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize, permission_mode: PermissionMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            permission_mode,
            input_tokens_total: 0,
            output_tokens_total: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    /// Fraction of context window consumed (0.0–1.0).
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate the token count from scratch (after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    pub fn add_usage(&mut self, input: u32, output: u32) {
        self.input_tokens_total += input as u64;
        self.output_tokens_total += output as u64;
    }

    /// Reset cumulative usage.  Driven by the compaction-finished event so
    /// there is exactly one reset path.
    pub fn reset_usage(&mut self) {
        self.input_tokens_total = 0;
        self.output_tokens_total = 0;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
