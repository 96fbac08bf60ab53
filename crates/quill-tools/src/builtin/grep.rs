// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Regex content search with a degrading strategy ladder.
//!
//! Strategies are tried in order until one can run: system ripgrep, `git
//! grep` (inside a repository), system grep, and finally a pure in-process
//! walker built on the `ignore` + `regex` crates.  A strategy failing to
//! *execute* falls through to the next; "no matches" is a successful empty
//! result and stops the ladder.  The result metadata records which
//! strategy ran so behaviour differences can be diagnosed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

const DEFAULT_HEAD_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Ripgrep,
    GitGrep,
    SystemGrep,
    Internal,
}

impl Strategy {
    fn as_str(&self) -> &'static str {
        match self {
            Strategy::Ripgrep => "ripgrep",
            Strategy::GitGrep => "git-grep",
            Strategy::SystemGrep => "system-grep",
            Strategy::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
struct GrepQuery {
    pattern: String,
    root: PathBuf,
    glob: Option<String>,
    output_mode: String,
    case_insensitive: bool,
    before: usize,
    after: usize,
}

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn description(&self) -> &str {
        "Regex content search across files.\n\
         pattern: full regex. path: file or directory (default workspace root).\n\
         glob: filename filter like '*.rs'. case_insensitive: default false.\n\
         output_mode: content (default, path:line:text) | files_with_matches | count.\n\
         context / context_before / context_after: context lines around content matches.\n\
         head_limit + offset paginate the output lines: [offset, offset+head_limit).\n\
         Uses ripgrep, git grep, or grep when available; falls back to a\n\
         built-in walker otherwise."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: workspace root)"
                },
                "glob": {
                    "type": "string",
                    "description": "Glob filter for file names, e.g. '*.rs'"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Output format (default content)"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Case-insensitive search (default false)"
                },
                "context": {
                    "type": "integer",
                    "description": "Context lines before and after each match"
                },
                "context_before": {
                    "type": "integer",
                    "description": "Context lines before each match"
                },
                "context_after": {
                    "type": "integer",
                    "description": "Context lines after each match"
                },
                "head_limit": {
                    "type": "integer",
                    "description": "Maximum output lines to return (default 100)"
                },
                "offset": {
                    "type": "integer",
                    "description": "Output lines to skip before head_limit applies (default 0)"
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
        let context = call.args.get("context").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let query = GrepQuery {
            pattern: pattern.to_string(),
            root,
            glob: call.args.get("glob").and_then(|v| v.as_str()).map(str::to_string),
            output_mode: call
                .args
                .get("output_mode")
                .and_then(|v| v.as_str())
                .unwrap_or("content")
                .to_string(),
            case_insensitive: call
                .args
                .get("case_insensitive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            before: call
                .args
                .get("context_before")
                .and_then(|v| v.as_u64())
                .unwrap_or(context as u64) as usize,
            after: call
                .args
                .get("context_after")
                .and_then(|v| v.as_u64())
                .unwrap_or(context as u64) as usize,
        };
        let head_limit = call
            .args
            .get("head_limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_HEAD_LIMIT as u64) as usize;
        let offset = call.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

        debug!(pattern = %query.pattern, root = %query.root.display(), mode = %query.output_mode, "grep tool");

        // Validate the regex up front — every strategy needs it to be sane,
        // and the internal walker will compile it anyway.
        if let Err(e) = regex::RegexBuilder::new(&query.pattern)
            .case_insensitive(query.case_insensitive)
            .build()
        {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::Validation,
                format!("invalid regex: {e}"),
            );
        }

        let mut output = None;
        let mut strategy_used = Strategy::Internal;
        for strategy in ladder(&query.root).await {
            if ctx.signal.is_cancelled() {
                return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "grep aborted");
            }
            match run_strategy(strategy, &query, ctx).await {
                Ok(text) => {
                    strategy_used = strategy;
                    output = Some(text);
                    break;
                }
                Err(e) => {
                    warn!(strategy = strategy.as_str(), "grep strategy failed: {e:#}");
                }
            }
        }

        let Some(text) = output else {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::ExecutionError,
                "all search strategies failed",
            );
        };

        let all_lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        let total = all_lines.len();
        let window: Vec<&str> = all_lines.into_iter().skip(offset).take(head_limit).collect();

        let body = if window.is_empty() {
            "(no matches)".to_string()
        } else {
            let mut s = window.join("\n");
            if offset + window.len() < total {
                s.push_str(&format!(
                    "\n... [{} more lines — re-run with offset={}]",
                    total - offset - window.len(),
                    offset + window.len()
                ));
            }
            s
        };

        ToolOutput::ok(&call.id, body).with_metadata(json!({
            "strategy": strategy_used.as_str(),
            "total_lines": total,
            "offset": offset,
            "head_limit": head_limit,
        }))
    }
}

async fn has_binary(name: &str) -> bool {
    tokio::process::Command::new("which")
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

fn inside_git_repo(root: &Path) -> bool {
    let mut current = Some(root);
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return true;
        }
        current = dir.parent();
    }
    false
}

/// Capability probe: the ordered strategies worth attempting for this root.
/// The internal walker is always last — it cannot fail to exist.
async fn ladder(root: &Path) -> Vec<Strategy> {
    let mut order = Vec::new();
    if has_binary("rg").await {
        order.push(Strategy::Ripgrep);
    }
    if inside_git_repo(root) && has_binary("git").await {
        order.push(Strategy::GitGrep);
    }
    if has_binary("grep").await {
        order.push(Strategy::SystemGrep);
    }
    order.push(Strategy::Internal);
    order
}

async fn run_strategy(
    strategy: Strategy,
    query: &GrepQuery,
    ctx: &ExecutionContext,
) -> anyhow::Result<String> {
    match strategy {
        Strategy::Ripgrep => {
            let mut args: Vec<String> = vec!["--color".into(), "never".into(), "--no-heading".into()];
            match query.output_mode.as_str() {
                "files_with_matches" => args.push("-l".into()),
                "count" => args.push("-c".into()),
                _ => {
                    args.push("-n".into());
                    if query.before > 0 {
                        args.push(format!("-B{}", query.before));
                    }
                    if query.after > 0 {
                        args.push(format!("-A{}", query.after));
                    }
                }
            }
            if query.case_insensitive {
                args.push("--ignore-case".into());
            }
            if let Some(glob) = &query.glob {
                args.push("-g".into());
                args.push(glob.clone());
            }
            args.push("-e".into());
            args.push(query.pattern.clone());
            args.push(query.root.to_string_lossy().to_string());
            run_search_process("rg", &args, ctx).await
        }
        Strategy::GitGrep => {
            let mut args: Vec<String> = vec!["grep".into(), "-I".into(), "--no-color".into()];
            match query.output_mode.as_str() {
                "files_with_matches" => args.push("-l".into()),
                "count" => args.push("-c".into()),
                _ => {
                    args.push("-n".into());
                    if query.before > 0 {
                        args.push(format!("-B{}", query.before));
                    }
                    if query.after > 0 {
                        args.push(format!("-A{}", query.after));
                    }
                }
            }
            if query.case_insensitive {
                args.push("-i".into());
            }
            args.push("-E".into());
            args.push(query.pattern.clone());
            if let Some(glob) = &query.glob {
                args.push("--".into());
                args.push(glob.clone());
            }
            let cwd = if query.root.is_file() {
                query.root.parent().unwrap_or(Path::new(".")).to_path_buf()
            } else {
                query.root.clone()
            };
            run_search_process_in("git", &args, &cwd, ctx).await
        }
        Strategy::SystemGrep => {
            let mut args: Vec<String> = vec!["-r".into(), "-I".into(), "-E".into()];
            match query.output_mode.as_str() {
                "files_with_matches" => args.push("-l".into()),
                "count" => args.push("-c".into()),
                _ => {
                    args.push("-n".into());
                    if query.before > 0 {
                        args.push(format!("-B{}", query.before));
                    }
                    if query.after > 0 {
                        args.push(format!("-A{}", query.after));
                    }
                }
            }
            if query.case_insensitive {
                args.push("-i".into());
            }
            if let Some(glob) = &query.glob {
                args.push(format!("--include={glob}"));
            }
            args.push(query.pattern.clone());
            args.push(query.root.to_string_lossy().to_string());
            run_search_process("grep", &args, ctx).await
        }
        Strategy::Internal => internal_walker(query, ctx).await,
    }
}

async fn run_search_process(
    program: &str,
    args: &[String],
    ctx: &ExecutionContext,
) -> anyhow::Result<String> {
    run_search_process_in(program, args, Path::new("."), ctx).await
}

/// Run a search subprocess, racing the cancellation token.  Exit status 1
/// with empty output means "no matches" for the whole grep family; 2+ is a
/// real failure and lets the ladder fall through.
async fn run_search_process_in(
    program: &str,
    args: &[String],
    cwd: &Path,
    ctx: &ExecutionContext,
) -> anyhow::Result<String> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::select! {
        biased;
        _ = ctx.signal.cancelled() => anyhow::bail!("search aborted"),
        out = child => out?,
    };

    let code = output.status.code().unwrap_or(-1);
    if code > 1 || code < 0 {
        anyhow::bail!(
            "{program} exited with {code}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Pure in-process fallback: gitignore-aware walk + regex per line.
async fn internal_walker(query: &GrepQuery, ctx: &ExecutionContext) -> anyhow::Result<String> {
    let query = query.clone();
    let signal = ctx.signal.clone();
    tokio::task::spawn_blocking(move || {
        let re = regex::RegexBuilder::new(&query.pattern)
            .case_insensitive(query.case_insensitive)
            .build()?;
        let glob = query
            .glob
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid glob: {e}"))?;

        let files: Vec<PathBuf> = if query.root.is_file() {
            vec![query.root.clone()]
        } else {
            ignore::WalkBuilder::new(&query.root)
                .hidden(false)
                .git_ignore(true)
                .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
                .build()
                .filter_map(|r| r.ok())
                .map(|e| e.into_path())
                .filter(|p| p.is_file())
                .collect()
        };

        let mut out = String::new();
        for file in files {
            if signal.is_cancelled() {
                anyhow::bail!("search aborted");
            }
            if let Some(g) = &glob {
                let name = file.file_name().map(|n| n.to_string_lossy().to_string());
                if !name.map(|n| g.matches(&n)).unwrap_or(false) {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue; // binary or unreadable
            };
            let lines: Vec<&str> = content.lines().collect();
            let matches: Vec<usize> =
                lines.iter().enumerate().filter(|(_, l)| re.is_match(l)).map(|(i, _)| i).collect();
            if matches.is_empty() {
                continue;
            }
            let display = file.to_string_lossy();
            match query.output_mode.as_str() {
                "files_with_matches" => out.push_str(&format!("{display}\n")),
                "count" => out.push_str(&format!("{display}:{}\n", matches.len())),
                _ => {
                    let mut emitted: Vec<usize> = Vec::new();
                    for &m in &matches {
                        let start = m.saturating_sub(query.before);
                        let end = (m + query.after).min(lines.len().saturating_sub(1));
                        for i in start..=end {
                            if emitted.contains(&i) {
                                continue;
                            }
                            emitted.push(i);
                            let sep = if i == m { ':' } else { '-' };
                            out.push_str(&format!("{display}{sep}{}{sep}{}\n", i + 1, lines[i]));
                        }
                    }
                }
            }
        }
        Ok(out)
    })
    .await?
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
