// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! String-replacement edit tool.
//!
//! `old_string` must occur in the file.  Matching tries an exact search
//! first and then retries with unicode quote normalisation (curly single
//! and double quotes map to their ASCII forms), which recovers the common
//! case of a model quoting file content it saw rendered.  Every
//! successful edit snapshots the pre-edit bytes keyed by the requesting
//! message id so `undo_edit` can roll back to message boundaries.

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::{debug, warn};

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

// ─── Replacement engine (shared with multi_edit) ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchStrategy {
    Exact,
    UnicodeNormalised,
}

impl MatchStrategy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::UnicodeNormalised => "unicode_normalised",
        }
    }
}

#[derive(Debug)]
pub(crate) struct ReplaceOutcome {
    pub content: String,
    pub replaced: usize,
    pub total_matches: usize,
    pub strategy: MatchStrategy,
    /// 1-based (line, column) of every match in the pre-edit content.
    pub match_positions: Vec<(usize, usize)>,
}

#[derive(Debug)]
pub(crate) enum ReplaceError {
    NotFound,
    Noop,
}

/// Map curly quotes to their ASCII forms; everything else unchanged.
fn normalise_char(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' => '\'',
        '\u{201C}' | '\u{201D}' => '"',
        other => other,
    }
}

/// Find every non-overlapping occurrence of `needle` in `haystack`,
/// comparing char-by-char through `map`.  Returns char positions.
fn find_char_matches(haystack: &[char], needle: &[char], map: fn(char) -> char) -> Vec<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return vec![];
    }
    let mut matches = Vec::new();
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        let hit = haystack[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(h, n)| map(*h) == map(*n));
        if hit {
            matches.push(i);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    matches
}

/// Replace `old` with `new` in `content`.
///
/// `replace_all = false` replaces only the first occurrence; when the
/// pattern occurs more than once the caller is expected to surface the
/// per-match coordinates as a warning.
pub(crate) fn apply_replacement(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<ReplaceOutcome, ReplaceError> {
    if old == new {
        return Err(ReplaceError::Noop);
    }
    if old.is_empty() {
        return Err(ReplaceError::NotFound);
    }

    let haystack: Vec<char> = content.chars().collect();
    let needle: Vec<char> = old.chars().collect();

    // Byte offset of every char position, with an end sentinel.
    let mut offsets: Vec<usize> = content.char_indices().map(|(i, _)| i).collect();
    offsets.push(content.len());

    let (matches, strategy) = {
        let exact = find_char_matches(&haystack, &needle, |c| c);
        if !exact.is_empty() {
            (exact, MatchStrategy::Exact)
        } else {
            let norm = find_char_matches(&haystack, &needle, normalise_char);
            if norm.is_empty() {
                return Err(ReplaceError::NotFound);
            }
            (norm, MatchStrategy::UnicodeNormalised)
        }
    };

    let match_positions: Vec<(usize, usize)> = matches
        .iter()
        .map(|&pos| line_col(content, offsets[pos]))
        .collect();

    let to_replace: &[usize] = if replace_all { &matches } else { &matches[..1] };

    let mut out = String::with_capacity(content.len());
    let mut cursor = 0usize;
    for &pos in to_replace {
        let start = offsets[pos];
        let end = offsets[pos + needle.len()];
        out.push_str(&content[cursor..start]);
        out.push_str(new);
        cursor = end;
    }
    out.push_str(&content[cursor..]);

    Ok(ReplaceOutcome {
        content: out,
        replaced: to_replace.len(),
        total_matches: matches.len(),
        strategy,
        match_positions,
    })
}

/// 1-based (line, column) of a byte offset.
fn line_col(content: &str, offset: usize) -> (usize, usize) {
    let before = &content[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before.chars().rev().take_while(|&c| c != '\n').count() + 1;
    (line, col)
}

/// Unified diff snippet with 4 context lines.
pub(crate) fn diff_snippet(path: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(4)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

// ─── Tool ─────────────────────────────────────────────────────────────────────

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    fn description(&self) -> &str {
        "Replace a string in a file.\n\
         (path, old_string, new_string, replace_all=false)\n\
         old_string must occur in the file exactly; curly quotes are normalised\n\
         to ASCII automatically when the exact match fails.\n\
         With replace_all=false and multiple occurrences, only the first is\n\
         replaced and the result warns with every match's line:column — include\n\
         more surrounding context in old_string to disambiguate.\n\
         To create a new file, pass an empty old_string and the full content as\n\
         new_string.\n\
         Read the file first; editing an unread or externally modified file\n\
         succeeds but carries a staleness warning."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path of the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Text to replace (must occur in the file)"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["path", "old_string", "new_string"],
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
        let Some(old) = call.args.get("old_string").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'old_string'");
        };
        let Some(new) = call.args.get("new_string").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'new_string'");
        };
        let replace_all = call
            .args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let path = super::resolve_path(&ctx.workspace_root, path_arg);
        debug!(path = %path.display(), replace_all, "edit tool");

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(c) => Some(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("read error: {e}"),
                );
            }
        };

        // File creation: empty old_string against a nonexistent file.
        let Some(before) = existing else {
            if !old.is_empty() {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                );
            }
            let mut warnings = Vec::new();
            snapshot_before_write(ctx, &path, &mut warnings);
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(e) = tokio::fs::write(&path, new).await {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("write failed: {e}"),
                );
            }
            let diff = diff_snippet(path_arg, "", new);
            return ToolOutput::ok(&call.id, format!("Created {}\n\n{diff}", path.display()))
                .with_metadata(json!({ "created": true, "warnings": warnings }));
        };

        let outcome = match apply_replacement(&before, old, new, replace_all) {
            Ok(o) => o,
            Err(ReplaceError::Noop) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::Validation,
                    "old_string and new_string are identical",
                );
            }
            Err(ReplaceError::NotFound) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::NotFound,
                    format!(
                        "old_string not found in {}. Re-read the file and check \
                         whitespace and exact wording.",
                        path.display()
                    ),
                );
            }
        };

        let mut warnings = ctx.tracker.edit_warnings(&ctx.session_id, &path);
        snapshot_before_write(ctx, &path, &mut warnings);

        if let Err(e) = tokio::fs::write(&path, &outcome.content).await {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::ExecutionError,
                format!("write failed: {e}"),
            );
        }
        // The write is this session's own; refresh the signature so the next
        // edit does not warn about it.
        ctx.tracker.record_read(&ctx.session_id, &path);

        if !replace_all && outcome.total_matches > 1 {
            let coords: Vec<String> = outcome
                .match_positions
                .iter()
                .map(|(l, c)| format!("{l}:{c}"))
                .collect();
            warnings.push(format!(
                "warning: old_string occurs {} times (at {}); only the first was \
                 replaced. Pass replace_all=true or add surrounding context.",
                outcome.total_matches,
                coords.join(", ")
            ));
        }

        let diff = diff_snippet(path_arg, &before, &outcome.content);
        let mut content = format!(
            "Edited {} ({} replacement{})\n\n{diff}",
            path.display(),
            outcome.replaced,
            if outcome.replaced == 1 { "" } else { "s" },
        );
        for w in &warnings {
            content.push_str(&format!("\n{w}"));
        }

        ToolOutput::ok(&call.id, content).with_metadata(json!({
            "replacements": outcome.replaced,
            "matches": outcome.total_matches,
            "strategy": outcome.strategy.as_str(),
            "warnings": warnings,
        }))
    }
}

/// Snapshot the pre-edit bytes; failure is logged and surfaced as a
/// warning, never a reason to abort the edit.
pub(crate) fn snapshot_before_write(
    ctx: &ExecutionContext,
    path: &std::path::Path,
    warnings: &mut Vec<String>,
) {
    if let Err(e) = ctx.snapshots.create_snapshot(path, &ctx.message_id) {
        warn!(path = %path.display(), "snapshot failed: {e:#}");
        warnings.push(format!("warning: pre-edit snapshot failed ({e})"));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
