// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

/// Lines returned per call unless the model narrows the window.
const DEFAULT_LIMIT: usize = 2000;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    fn description(&self) -> &str {
        "Read a file from the filesystem.\n\
         path: absolute path to the file (relative paths resolve against the workspace root).\n\
         offset: 1-based line to start from (optional). limit: number of lines (default 2000).\n\
         Output is numbered (line<TAB>content) so later edits can reference exact lines.\n\
         Large files are paged: re-call with offset to continue."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path to the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based line number to start reading from"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 2000)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(|v| v.as_str()).map(str::to_string)
    }

    fn abstract_rule(&self, args: &Value) -> Option<String> {
        let path = args.get("path").and_then(|v| v.as_str())?;
        let ext = std::path::Path::new(path).extension()?.to_string_lossy();
        Some(format!("read(**/*.{ext})"))
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => super::resolve_path(&ctx.workspace_root, p),
            None => {
                return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'path'")
            }
        };
        let offset = call
            .args
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|v| (v as usize).max(1))
            .unwrap_or(1);
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_LIMIT);

        debug!(path = %path.display(), offset, limit, "read tool");

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                );
            }
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("read error: {e}"),
                );
            }
        };

        ctx.tracker.record_read(&ctx.session_id, &path);

        let total_lines = content.lines().count();
        let mut out = String::new();
        let mut shown = 0usize;
        for (i, line) in content.lines().enumerate().skip(offset - 1).take(limit) {
            out.push_str(&format!("{:>6}\t{line}\n", i + 1));
            shown += 1;
        }

        let truncated = offset - 1 + shown < total_lines;
        if truncated {
            out.push_str(&format!(
                "... [{} of {} lines shown; re-read with offset={} to continue]\n",
                shown,
                total_lines,
                offset + shown
            ));
        }
        if out.is_empty() {
            out = "(empty file)".to_string();
        }

        ToolOutput::ok(&call.id, out).with_metadata(json!({
            "lines": total_lines,
            "shown": shown,
            "truncated": truncated,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{AlwaysDenyHandler, FileAccessTracker, SnapshotStore};
    use quill_model::CancelToken;

    fn ctx(dir: &tempfile::TempDir) -> ExecutionContext {
        ExecutionContext {
            signal: CancelToken::new(),
            session_id: "s".into(),
            message_id: "m".into(),
            workspace_root: dir.path().to_path_buf(),
            snapshots: Arc::new(SnapshotStore::for_session(dir.path(), "s")),
            tracker: Arc::new(FileAccessTracker::new()),
            confirmation: Arc::new(AlwaysDenyHandler),
            update_output: None,
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "r1".into(), name: "read".into(), args }
    }

    #[tokio::test]
    async fn reads_file_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a.txt");
        std::fs::write(&f, "alpha\nbeta\n").unwrap();
        let ctx = ctx(&dir);

        let out = ReadTool.execute(&call(json!({"path": f})), &ctx).await;
        assert!(!out.is_error(), "{}", out.content);
        assert!(out.content.contains("     1\talpha"));
        assert!(out.content.contains("     2\tbeta"));
    }

    #[tokio::test]
    async fn records_read_in_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a.txt");
        std::fs::write(&f, "x\n").unwrap();
        let ctx = ctx(&dir);

        ReadTool.execute(&call(json!({"path": f})), &ctx).await;
        assert!(ctx.tracker.has_file_been_read("s", &f));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let out = ReadTool
            .execute(&call(json!({"path": dir.path().join("nope.txt")})), &ctx)
            .await;
        assert_eq!(out.error_kind(), Some(ToolErrorKind::NotFound));
    }

    #[tokio::test]
    async fn offset_and_limit_page_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a.txt");
        let body: String = (1..=10).map(|i| format!("line{i}\n")).collect();
        std::fs::write(&f, body).unwrap();
        let ctx = ctx(&dir);

        let out = ReadTool
            .execute(&call(json!({"path": f, "offset": 3, "limit": 2})), &ctx)
            .await;
        assert!(out.content.contains("line3"));
        assert!(out.content.contains("line4"));
        assert!(!out.content.contains("line5\n"));
        assert_eq!(out.metadata["truncated"], true);
    }

    #[tokio::test]
    async fn relative_path_resolves_against_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rel.txt"), "hi\n").unwrap();
        let ctx = ctx(&dir);
        let out = ReadTool.execute(&call(json!({"path": "rel.txt"})), &ctx).await;
        assert!(!out.is_error(), "{}", out.content);
        assert!(out.content.contains("hi"));
    }

    #[test]
    fn abstract_rule_generalises_by_extension() {
        let rule = ReadTool.abstract_rule(&json!({"path": "/src/main.rs"}));
        assert_eq!(rule.as_deref(), Some("read(**/*.rs)"));
    }
}
