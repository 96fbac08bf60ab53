// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

pub struct UndoEditTool;

#[async_trait]
impl Tool for UndoEditTool {
    fn name(&self) -> &str {
        "undo_edit"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    fn description(&self) -> &str {
        "Roll a file back to a pre-edit snapshot.\n\
         (path, message_id?)\n\
         Without message_id: lists available snapshots newest-first so the\n\
         right restore point can be picked.  With message_id: restores the\n\
         file to its content before that message's edit, atomically."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path of the file to roll back"
                },
                "message_id": {
                    "type": "string",
                    "description": "Snapshot to restore; omit to list snapshots"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(|v| v.as_str()).map(str::to_string)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let Some(path_arg) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'path'");
        };
        let path = super::resolve_path(&ctx.workspace_root, path_arg);
        let message_id = call.args.get("message_id").and_then(|v| v.as_str());

        debug!(path = %path.display(), ?message_id, "undo_edit tool");

        let snapshots = match ctx.snapshots.list_snapshots(&path) {
            Ok(s) => s,
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("listing snapshots failed: {e}"),
                );
            }
        };

        let Some(message_id) = message_id else {
            if snapshots.is_empty() {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::NotFound,
                    format!("no snapshots of {} in this session", path.display()),
                );
            }
            let mut out = format!("Snapshots of {} (newest first):\n", path.display());
            for meta in snapshots.iter().rev() {
                out.push_str(&format!(
                    "  v{} — message {} — {}\n",
                    meta.version,
                    if meta.message_id.is_empty() { "(unknown)" } else { &meta.message_id },
                    meta.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                ));
            }
            return ToolOutput::ok(&call.id, out)
                .with_metadata(json!({ "count": snapshots.len() }));
        };

        match ctx.snapshots.restore_snapshot(&path, message_id) {
            Ok(()) => {
                ctx.tracker.record_read(&ctx.session_id, &path);
                ToolOutput::ok(
                    &call.id,
                    format!("Restored {} to its state before message {message_id}", path.display()),
                )
            }
            Err(e) => ToolOutput::err(
                &call.id,
                ToolErrorKind::NotFound,
                format!("restore failed: {e}"),
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
