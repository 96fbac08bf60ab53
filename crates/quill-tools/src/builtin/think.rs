// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

/// Scratchpad with no side effects.  Gives the model a place to reason
/// between tool calls without producing user-visible output.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Think
    }

    fn description(&self) -> &str {
        "Record a thought while working through a problem. No side effects;\n\
         the note is acknowledged and nothing else happens. Use it to plan\n\
         multi-step work or reason about tool results."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "thought": {
                    "type": "string",
                    "description": "The thought to record"
                }
            },
            "required": ["thought"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ExecutionContext) -> ToolOutput {
        if call.args.get("thought").and_then(|v| v.as_str()).is_none() {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'thought'");
        }
        ToolOutput::ok(&call.id, "Thought recorded.")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
