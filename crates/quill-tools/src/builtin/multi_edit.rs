// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

use super::edit::{apply_replacement, diff_snippet, snapshot_before_write, ReplaceError};

pub struct MultiEditTool;

#[async_trait]
impl Tool for MultiEditTool {
    fn name(&self) -> &str {
        "multi_edit"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    fn description(&self) -> &str {
        "Apply an ordered list of string replacements to one file.\n\
         (path, edits: [{old_string, new_string, replace_all=false}, ...])\n\
         Each edit applies to the result of the previous one, so later\n\
         old_strings may reference earlier new_strings.  One snapshot of the\n\
         pre-edit file is taken for the whole batch.  Operations are reported\n\
         individually; the file is written once after the pass, including when\n\
         some operations failed — the state reached so far is what lands on\n\
         disk, and the report says which edits made it in."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path of the file to edit"
                },
                "edits": {
                    "type": "array",
                    "description": "Ordered replacements",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": { "type": "string" },
                            "new_string": { "type": "string" },
                            "replace_all": { "type": "boolean" }
                        },
                        "required": ["old_string", "new_string"]
                    }
                }
            },
            "required": ["path", "edits"],
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(|v| v.as_str()).map(str::to_string)
    }

    fn abstract_rule(&self, args: &Value) -> Option<String> {
        let path = args.get("path").and_then(|v| v.as_str())?;
        let ext = std::path::Path::new(path).extension()?.to_string_lossy();
        Some(format!("edit(**/*.{ext})"))
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let Some(path_arg) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'path'");
        };
        let Some(edits) = call.args.get("edits").and_then(|v| v.as_array()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'edits'");
        };
        if edits.is_empty() {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "'edits' is empty");
        }

        let path = super::resolve_path(&ctx.workspace_root, path_arg);
        debug!(path = %path.display(), edit_count = edits.len(), "multi_edit tool");

        let before = match tokio::fs::read_to_string(&path).await {
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

        let mut warnings = ctx.tracker.edit_warnings(&ctx.session_id, &path);
        // One snapshot per file per message, regardless of how many edits
        // the batch carries.
        snapshot_before_write(ctx, &path, &mut warnings);

        let mut current = before.clone();
        let mut report: Vec<String> = Vec::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for (i, edit) in edits.iter().enumerate() {
            let old = edit.get("old_string").and_then(|v| v.as_str()).unwrap_or("");
            let new = edit.get("new_string").and_then(|v| v.as_str()).unwrap_or("");
            let replace_all = edit.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false);

            match apply_replacement(&current, old, new, replace_all) {
                Ok(outcome) => {
                    current = outcome.content;
                    succeeded += 1;
                    report.push(format!(
                        "edit {}: ok ({} replacement{})",
                        i + 1,
                        outcome.replaced,
                        if outcome.replaced == 1 { "" } else { "s" },
                    ));
                }
                Err(ReplaceError::Noop) => {
                    failed += 1;
                    report.push(format!(
                        "edit {}: failed (old_string and new_string are identical)",
                        i + 1
                    ));
                }
                Err(ReplaceError::NotFound) => {
                    failed += 1;
                    report.push(format!(
                        "edit {}: failed (old_string not found at this point in the file)",
                        i + 1
                    ));
                }
            }
        }

        // Write whatever state the pass reached, even on partial failure.
        if current != before {
            if let Err(e) = tokio::fs::write(&path, &current).await {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("write failed: {e}"),
                );
            }
            ctx.tracker.record_read(&ctx.session_id, &path);
        }

        let diff = diff_snippet(path_arg, &before, &current);
        let mut content = format!(
            "Applied {succeeded}/{} edits to {}\n{}\n\n{diff}",
            edits.len(),
            path.display(),
            report.join("\n"),
        );
        for w in &warnings {
            content.push_str(&format!("\n{w}"));
        }

        if succeeded == 0 {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::ExecutionError,
                format!("no edits applied to {}\n{}", path.display(), report.join("\n")),
            );
        }

        ToolOutput::ok(&call.id, content).with_metadata(json!({
            "succeeded": succeeded,
            "failed": failed,
            "warnings": warnings,
            "partial": failed > 0,
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
            message_id: "msg-1".into(),
            workspace_root: dir.path().to_path_buf(),
            snapshots: Arc::new(SnapshotStore::for_session(dir.path(), "s")),
            tracker: Arc::new(FileAccessTracker::new()),
            confirmation: Arc::new(AlwaysDenyHandler),
            update_output: None,
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "me1".into(), name: "multi_edit".into(), args }
    }

    #[tokio::test]
    async fn edits_apply_sequentially_to_running_result() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("t.txt");
        std::fs::write(&f, "step0\n").unwrap();
        let ctx = ctx(&dir);
        ctx.tracker.record_read("s", &f);

        // The second edit references the first edit's output.
        let out = MultiEditTool
            .execute(
                &call(json!({"path": f, "edits": [
                    {"old_string": "step0", "new_string": "step1"},
                    {"old_string": "step1", "new_string": "step2"},
                ]})),
                &ctx,
            )
            .await;
        assert!(!out.is_error(), "{}", out.content);
        assert_eq!(std::fs::read_to_string(&f).unwrap(), "step2\n");
        assert_eq!(out.metadata["succeeded"], 2);
    }

    #[tokio::test]
    async fn equivalent_to_sequential_single_edits() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("t.txt");
        std::fs::write(&f, "alpha beta gamma\n").unwrap();
        let ctx = ctx(&dir);
        ctx.tracker.record_read("s", &f);

        MultiEditTool
            .execute(
                &call(json!({"path": f, "edits": [
                    {"old_string": "alpha", "new_string": "A"},
                    {"old_string": "gamma", "new_string": "C"},
                ]})),
                &ctx,
            )
            .await;
        assert_eq!(std::fs::read_to_string(&f).unwrap(), "A beta C\n");
    }

    #[tokio::test]
    async fn one_snapshot_for_the_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("t.txt");
        std::fs::write(&f, "a b c\n").unwrap();
        let ctx = ctx(&dir);
        ctx.tracker.record_read("s", &f);

        MultiEditTool
            .execute(
                &call(json!({"path": f, "edits": [
                    {"old_string": "a", "new_string": "x"},
                    {"old_string": "b", "new_string": "y"},
                    {"old_string": "c", "new_string": "z"},
                ]})),
                &ctx,
            )
            .await;
        let snaps = ctx.snapshots.list_snapshots(&f).unwrap();
        assert_eq!(snaps.len(), 1);
        let backup = ctx.snapshots.snapshot_dir().join(&snaps[0].backup_name);
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "a b c\n");
    }

    #[tokio::test]
    async fn partial_failure_writes_intermediate_state_and_reports_per_op() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("t.txt");
        std::fs::write(&f, "one two\n").unwrap();
        let ctx = ctx(&dir);
        ctx.tracker.record_read("s", &f);

        let out = MultiEditTool
            .execute(
                &call(json!({"path": f, "edits": [
                    {"old_string": "one", "new_string": "1"},
                    {"old_string": "missing", "new_string": "x"},
                    {"old_string": "two", "new_string": "2"},
                ]})),
                &ctx,
            )
            .await;
        assert!(!out.is_error());
        // Ops 1 and 3 landed; op 2 reported as failed.
        assert_eq!(std::fs::read_to_string(&f).unwrap(), "1 2\n");
        assert!(out.content.contains("edit 1: ok"));
        assert!(out.content.contains("edit 2: failed"));
        assert!(out.content.contains("edit 3: ok"));
        assert_eq!(out.metadata["partial"], true);
    }

    #[tokio::test]
    async fn all_failures_is_an_error_and_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("t.txt");
        std::fs::write(&f, "content\n").unwrap();
        let ctx = ctx(&dir);

        let out = MultiEditTool
            .execute(
                &call(json!({"path": f, "edits": [
                    {"old_string": "absent", "new_string": "x"},
                ]})),
                &ctx,
            )
            .await;
        assert_eq!(out.error_kind(), Some(ToolErrorKind::ExecutionError));
        assert_eq!(std::fs::read_to_string(&f).unwrap(), "content\n");
    }

    #[tokio::test]
    async fn empty_edit_list_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("t.txt");
        std::fs::write(&f, "x\n").unwrap();
        let ctx = ctx(&dir);

        let out = MultiEditTool
            .execute(&call(json!({"path": f, "edits": []})), &ctx)
            .await;
        assert_eq!(out.error_kind(), Some(ToolErrorKind::Validation));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let out = MultiEditTool
            .execute(
                &call(json!({"path": dir.path().join("no.txt"), "edits": [
                    {"old_string": "a", "new_string": "b"},
                ]})),
                &ctx,
            )
            .await;
        assert_eq!(out.error_kind(), Some(ToolErrorKind::NotFound));
    }
}
