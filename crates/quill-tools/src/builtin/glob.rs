// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

const DEFAULT_MAX_RESULTS: usize = 100;
const HARD_MAX_RESULTS: usize = 1000;

/// Directories skipped regardless of gitignore state — build outputs and
/// dependency trees that drown out real matches.
const BUILTIN_IGNORES: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "build",
    "dist",
    "out",
    ".venv",
    "__pycache__",
];

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern, gitignore-aware.\n\
         Patterns: *.rs | **/*.rs | src/**/*.{ts,tsx}\n\
         Patterns without a slash are auto-prefixed with **/ for recursive search.\n\
         Results are workspace-relative, sorted by modification time (newest\n\
         first), capped at max_results (default 100, hard cap 1000) with a\n\
         truncation marker when more matched.\n\
         .git/, node_modules/, target/ and other build outputs are always skipped.\n\
         For content search use grep; for attribute filters (size, mtime) use find."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, e.g. '**/*.rs'"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search from (default: workspace root)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default 100, max 1000)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("pattern")
            .and_then(|v| v.as_str())
            .map(|p| format!("search:{}", p.to_lowercase()))
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let Some(pattern) = call.args.get("pattern").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'pattern'");
        };
        let root = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| super::resolve_path(&ctx.workspace_root, p))
            .unwrap_or_else(|| ctx.workspace_root.clone());
        let max_results = call
            .args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|v| (v as usize).min(HARD_MAX_RESULTS))
            .unwrap_or(DEFAULT_MAX_RESULTS);

        debug!(pattern, root = %root.display(), max_results, "glob tool");

        // Bare file patterns ("*.rs") almost always mean "anywhere below
        // the root".
        let normalised = if pattern.contains('/') {
            pattern.to_string()
        } else {
            format!("**/{pattern}")
        };
        let compiled = match glob::Pattern::new(&normalised) {
            Ok(p) => p,
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::Validation,
                    format!("invalid glob pattern '{pattern}': {e}"),
                );
            }
        };

        let signal = ctx.signal.clone();
        let result = tokio::task::spawn_blocking(move || {
            walk_glob(&root, &compiled, max_results, &signal)
        })
        .await;

        let (mut entries, truncated) = match result {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                return ToolOutput::err(&call.id, ToolErrorKind::ExecutionError, e.to_string())
            }
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::Internal,
                    format!("glob walker panicked: {e}"),
                );
            }
        };

        if ctx.signal.is_cancelled() {
            return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "glob aborted");
        }

        // Newest first.
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        if entries.is_empty() {
            return ToolOutput::ok(&call.id, "(no matches)")
                .with_metadata(json!({ "count": 0, "truncated": false }));
        }

        let count = entries.len();
        let mut out: String = entries
            .into_iter()
            .map(|(rel, _)| rel)
            .collect::<Vec<_>>()
            .join("\n");
        if truncated {
            out.push_str(&format!(
                "\n... [result cap {max_results} reached — narrow the pattern or raise max_results]"
            ));
        }

        ToolOutput::ok(&call.id, out)
            .with_metadata(json!({ "count": count, "truncated": truncated }))
    }
}

type GlobEntry = (String, Option<std::time::SystemTime>);

/// Gitignore-aware walk.  Returns (entries, truncated) where `truncated`
/// is set exactly when the walker produced more than `max_results`
/// matches.
fn walk_glob(
    root: &Path,
    pattern: &glob::Pattern,
    max_results: usize,
    signal: &quill_model::CancelToken,
) -> anyhow::Result<(Vec<GlobEntry>, bool)> {
    let mut walker = ignore::WalkBuilder::new(root);
    walker
        .hidden(false)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !BUILTIN_IGNORES.contains(&name.as_ref())
        });

    let mut entries: Vec<GlobEntry> = Vec::new();
    let mut truncated = false;

    for result in walker.build() {
        if signal.is_cancelled() {
            break;
        }
        let entry = match result {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        if !pattern.matches_path(rel) {
            continue;
        }
        if entries.len() >= max_results {
            truncated = true;
            break;
        }
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        entries.push((rel.to_string_lossy().to_string(), mtime));
    }

    Ok((entries, truncated))
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
        ToolCall { id: "g1".into(), name: "glob".into(), args }
    }

    fn seed(dir: &tempfile::TempDir) {
        std::fs::create_dir_all(dir.path().join("src/deep")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/deep/mod.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi").unwrap();
    }

    #[tokio::test]
    async fn finds_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir);
        let ctx = ctx(&dir);
        let out = GlobTool.execute(&call(json!({"pattern": "**/*.rs"})), &ctx).await;
        assert!(!out.is_error(), "{}", out.content);
        assert!(out.content.contains("src/main.rs"));
        assert!(out.content.contains("src/deep/mod.rs"));
        assert!(!out.content.contains("README.md"));
        assert_eq!(out.metadata["count"], 3);
    }

    #[tokio::test]
    async fn bare_pattern_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir);
        let ctx = ctx(&dir);
        let out = GlobTool.execute(&call(json!({"pattern": "*.rs"})), &ctx).await;
        assert!(out.content.contains("src/deep/mod.rs"), "{}", out.content);
    }

    #[tokio::test]
    async fn no_matches_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir);
        let ctx = ctx(&dir);
        let out = GlobTool.execute(&call(json!({"pattern": "**/*.zig"})), &ctx).await;
        assert!(!out.is_error());
        assert!(out.content.contains("no matches"));
        assert_eq!(out.metadata["truncated"], false);
    }

    #[tokio::test]
    async fn builtin_ignores_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir);
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("target/debug/junk.rs"), "x").unwrap();
        let ctx = ctx(&dir);

        let out = GlobTool.execute(&call(json!({"pattern": "**/*"})), &ctx).await;
        assert!(!out.content.contains("node_modules"), "{}", out.content);
        assert!(!out.content.contains("target/"), "{}", out.content);
    }

    #[tokio::test]
    async fn truncation_flag_set_exactly_when_cap_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let ctx = ctx(&dir);

        let out = GlobTool
            .execute(&call(json!({"pattern": "*.txt", "max_results": 3})), &ctx)
            .await;
        assert_eq!(out.metadata["truncated"], true);
        assert_eq!(out.metadata["count"], 3);

        let out = GlobTool
            .execute(&call(json!({"pattern": "*.txt", "max_results": 5})), &ctx)
            .await;
        assert_eq!(out.metadata["truncated"], false);
        assert_eq!(out.metadata["count"], 5);
    }

    #[tokio::test]
    async fn invalid_pattern_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let out = GlobTool.execute(&call(json!({"pattern": "[unclosed"})), &ctx).await;
        assert_eq!(out.error_kind(), Some(ToolErrorKind::Validation));
    }

    #[tokio::test]
    async fn newest_files_sort_first() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.txt");
        let new = dir.path().join("new.txt");
        std::fs::write(&old, "x").unwrap();
        // Push the old file's mtime into the past instead of sleeping.
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let f = std::fs::File::options().write(true).open(&old).unwrap();
        f.set_modified(past).unwrap();
        drop(f);
        std::fs::write(&new, "y").unwrap();
        let ctx = ctx(&dir);

        let out = GlobTool.execute(&call(json!({"pattern": "*.txt"})), &ctx).await;
        let newest = out.content.find("new.txt").unwrap();
        let oldest = out.content.find("old.txt").unwrap();
        assert!(newest < oldest, "{}", out.content);
    }
}
