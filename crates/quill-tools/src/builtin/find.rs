// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

const DEFAULT_MAX_RESULTS: usize = 200;
const DEFAULT_MAX_DEPTH: usize = 16;

pub struct FindTool;

#[async_trait]
impl Tool for FindTool {
    fn name(&self) -> &str {
        "find"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn description(&self) -> &str {
        "Find filesystem entries by attribute filters.\n\
         name: glob on the file name (e.g. '*.lock'). type: file | dir.\n\
         extension: bare extension (e.g. 'rs'). min_size / max_size: bytes.\n\
         modified_within_secs: only entries touched in the last N seconds.\n\
         max_depth (default 16) and max_results (default 200) cap the walk.\n\
         Results sort by depth, directories first, newest first, then name.\n\
         For content search use grep; for plain glob patterns use glob."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to search from (default: workspace root)"
                },
                "name": {
                    "type": "string",
                    "description": "Glob matched against the entry name"
                },
                "type": {
                    "type": "string",
                    "enum": ["file", "dir"],
                    "description": "Restrict to files or directories"
                },
                "extension": {
                    "type": "string",
                    "description": "File extension without the dot"
                },
                "min_size": {
                    "type": "integer",
                    "description": "Minimum size in bytes"
                },
                "max_size": {
                    "type": "integer",
                    "description": "Maximum size in bytes"
                },
                "modified_within_secs": {
                    "type": "integer",
                    "description": "Only entries modified within the last N seconds"
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum directory depth (default 16)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum entries to return (default 200)"
                }
            },
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("name")
            .or_else(|| args.get("extension"))
            .and_then(|v| v.as_str())
            .map(|p| format!("search:{}", p.to_lowercase()))
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let root = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| super::resolve_path(&ctx.workspace_root, p))
            .unwrap_or_else(|| ctx.workspace_root.clone());
        if !root.exists() {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::NotFound,
                format!("{} does not exist", root.display()),
            );
        }

        let name_glob = match call.args.get("name").and_then(|v| v.as_str()) {
            Some(g) => match glob::Pattern::new(g) {
                Ok(p) => Some(p),
                Err(e) => {
                    return ToolOutput::err(
                        &call.id,
                        ToolErrorKind::Validation,
                        format!("invalid name glob '{g}': {e}"),
                    );
                }
            },
            None => None,
        };
        let entry_type = call.args.get("type").and_then(|v| v.as_str()).map(str::to_string);
        let extension = call.args.get("extension").and_then(|v| v.as_str()).map(str::to_string);
        let min_size = call.args.get("min_size").and_then(|v| v.as_u64());
        let max_size = call.args.get("max_size").and_then(|v| v.as_u64());
        let modified_within = call
            .args
            .get("modified_within_secs")
            .and_then(|v| v.as_u64())
            .map(std::time::Duration::from_secs);
        let max_depth = call
            .args
            .get("max_depth")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_DEPTH);
        let max_results = call
            .args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        debug!(root = %root.display(), max_depth, max_results, "find tool");

        let now = SystemTime::now();
        let mut hits: Vec<FindHit> = Vec::new();
        let mut truncated = false;

        for entry in walkdir::WalkDir::new(&root)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
            .flatten()
        {
            if ctx.signal.is_cancelled() {
                return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "find aborted");
            }

            let is_dir = entry.file_type().is_dir();
            match entry_type.as_deref() {
                Some("file") if is_dir => continue,
                Some("dir") if !is_dir => continue,
                _ => {}
            }

            let file_name = entry.file_name().to_string_lossy();
            if let Some(g) = &name_glob {
                if !g.matches(&file_name) {
                    continue;
                }
            }
            if let Some(ext) = &extension {
                let matches = entry
                    .path()
                    .extension()
                    .map(|e| e.to_string_lossy() == *ext)
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if let Some(min) = min_size {
                if is_dir || meta.len() < min {
                    continue;
                }
            }
            if let Some(max) = max_size {
                if is_dir || meta.len() > max {
                    continue;
                }
            }
            let mtime = meta.modified().ok();
            if let Some(window) = modified_within {
                let recent = mtime
                    .and_then(|m| now.duration_since(m).ok())
                    .map(|age| age <= window)
                    .unwrap_or(false);
                if !recent {
                    continue;
                }
            }

            if hits.len() >= max_results {
                truncated = true;
                break;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            hits.push(FindHit { rel, depth: entry.depth(), is_dir, mtime });
        }

        // depth asc, directories first, newest first, name asc.
        hits.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then(b.is_dir.cmp(&a.is_dir))
                .then(b.mtime.cmp(&a.mtime))
                .then(a.rel.cmp(&b.rel))
        });

        if hits.is_empty() {
            return ToolOutput::ok(&call.id, "(no matches)")
                .with_metadata(json!({ "count": 0, "truncated": false }));
        }

        let count = hits.len();
        let mut out: String = hits
            .into_iter()
            .map(|h| if h.is_dir { format!("{}/", h.rel) } else { h.rel })
            .collect::<Vec<_>>()
            .join("\n");
        if truncated {
            out.push_str(&format!("\n... [result cap {max_results} reached]"));
        }

        ToolOutput::ok(&call.id, out)
            .with_metadata(json!({ "count": count, "truncated": truncated }))
    }
}

struct FindHit {
    rel: String,
    depth: usize,
    is_dir: bool,
    mtime: Option<SystemTime>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
