// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use quill_config::{PermissionMode, PermissionRulesConfig};

use crate::{Tool, ToolKind};

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Ask,
    Deny,
}

/// One parsed rule: `tool_name` or `tool_name(signature-glob)`.
///
/// The glob supports `*` and `?` and matches the tool's canonical
/// signature string (file path, command line, `search:<query>`).
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub tool_name: String,
    pub signature: Option<Regex>,
    /// Original text, kept for persistence round-trips.
    pub source: String,
}

impl CompiledRule {
    /// Parse a rule string.  Returns `None` for unparseable input so one
    /// bad config entry never takes down the whole rule set.
    pub fn parse(rule: &str) -> Option<Self> {
        let rule = rule.trim();
        if rule.is_empty() {
            return None;
        }
        if let Some(open) = rule.find('(') {
            let close = rule.rfind(')')?;
            if close < open {
                return None;
            }
            let name = rule[..open].trim();
            let glob = &rule[open + 1..close];
            if name.is_empty() {
                return None;
            }
            Some(Self {
                tool_name: name.to_string(),
                signature: Some(glob_to_regex(glob)?),
                source: rule.to_string(),
            })
        } else {
            Some(Self {
                tool_name: rule.to_string(),
                signature: None,
                source: rule.to_string(),
            })
        }
    }

    fn matches(&self, tool_name: &str, signature: Option<&str>) -> bool {
        if self.tool_name != tool_name {
            return false;
        }
        match (&self.signature, signature) {
            // Bare rule: matches every call of this tool.
            (None, _) => true,
            // Signature rule needs a signature to match against.
            (Some(re), Some(sig)) => re.is_match(sig),
            (Some(_), None) => false,
        }
    }
}

/// Convert a simple glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Rule-list evaluator plus the per-mode overrides.
///
/// Evaluation order: deny (ignores mode) → allow → mode override → ask.
/// The allow list is copy-on-write: persisted approvals from confirmation
/// responses append to a session-scoped overlay without touching the
/// configured rules.
pub struct PermissionChecker {
    allow: RwLock<Arc<Vec<CompiledRule>>>,
    ask: Vec<CompiledRule>,
    deny: Vec<CompiledRule>,
}

impl PermissionChecker {
    pub fn from_config(cfg: &PermissionRulesConfig) -> Self {
        let compile =
            |rules: &[String]| -> Vec<CompiledRule> { rules.iter().filter_map(|r| CompiledRule::parse(r)).collect() };
        Self {
            allow: RwLock::new(Arc::new(compile(&cfg.allow))),
            ask: compile(&cfg.ask),
            deny: compile(&cfg.deny),
        }
    }

    /// Decide whether `tool` may run with `args` under `mode`.
    pub fn check(
        &self,
        tool: &dyn Tool,
        args: &serde_json::Value,
        mode: PermissionMode,
    ) -> PermissionDecision {
        let name = tool.name();
        let signature = tool.signature_content(args);
        let sig = signature.as_deref();

        // 1. Deny wins over everything, including yolo.
        if self.deny.iter().any(|r| r.matches(name, sig)) {
            return PermissionDecision::Deny;
        }

        // 2. Explicit allow (config + persisted session approvals).
        let allow = self.allow.read().expect("permission lock poisoned").clone();
        if allow.iter().any(|r| r.matches(name, sig)) {
            return PermissionDecision::Allow;
        }

        // 3. An explicit ask rule pins the decision before mode overrides
        //    get a say (except plan mode, which is stricter).
        let explicit_ask = self.ask.iter().any(|r| r.matches(name, sig));

        // 4. Mode overrides.
        let kind = tool.kind();
        match mode {
            PermissionMode::Yolo => return PermissionDecision::Allow,
            PermissionMode::Plan => {
                if matches!(kind, ToolKind::Read | ToolKind::Search) {
                    return PermissionDecision::Allow;
                }
                return PermissionDecision::Deny;
            }
            PermissionMode::AutoEdit => {
                if !explicit_ask && (kind.is_read_only() || kind == ToolKind::Edit) {
                    return PermissionDecision::Allow;
                }
            }
            PermissionMode::Default => {
                if !explicit_ask && kind.is_read_only() {
                    return PermissionDecision::Allow;
                }
            }
        }

        PermissionDecision::Ask
    }

    /// Append a rule to the session allow overlay (copy-on-write).
    pub fn persist_allow(&self, rule: &str) {
        let Some(compiled) = CompiledRule::parse(rule) else {
            debug!(rule, "ignoring unparseable persisted allow rule");
            return;
        };
        let mut guard = self.allow.write().expect("permission lock poisoned");
        let mut next: Vec<CompiledRule> = guard.as_ref().clone();
        next.push(compiled);
        *guard = Arc::new(next);
        debug!(rule, "persisted session allow rule");
    }

    /// Current allow rules (config + session overlay), by source text.
    pub fn allow_rules(&self) -> Vec<String> {
        self.allow
            .read()
            .expect("permission lock poisoned")
            .iter()
            .map(|r| r.source.clone())
            .collect()
    }
}

// ─── Confirmation protocol ────────────────────────────────────────────────────

/// An `ask` decision routed to the UI collaborator.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub tool_name: String,
    pub title: String,
    pub message: String,
    pub risks: Vec<String>,
    pub affected_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfirmationOutcome {
    pub approved: bool,
    pub reason: Option<String>,
    /// When `true`, the matched abstract rule joins the allow list for the
    /// remainder of the session.
    pub persist: bool,
}

/// Implemented by the UI collaborator.  Must not block the core — the
/// dispatcher awaits the future and remains cancellation-aware.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn request(&self, req: ConfirmationRequest) -> ConfirmationOutcome;
}

/// Handler that rejects everything.  Used headless and in tests.
pub struct AlwaysDenyHandler;

#[async_trait]
impl ConfirmationHandler for AlwaysDenyHandler {
    async fn request(&self, _req: ConfirmationRequest) -> ConfirmationOutcome {
        ConfirmationOutcome { approved: false, reason: Some("no interactive approver".into()), persist: false }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::{ExecutionContext, ToolCall, ToolOutput};

    struct FakeTool {
        name: &'static str,
        kind: ToolKind,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn kind(&self) -> ToolKind {
            self.kind
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn signature_content(&self, args: &Value) -> Option<String> {
            args.get("command").and_then(|v| v.as_str()).map(str::to_string)
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ExecutionContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    fn checker(allow: &[&str], ask: &[&str], deny: &[&str]) -> PermissionChecker {
        PermissionChecker::from_config(&PermissionRulesConfig {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            ask: ask.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn shell() -> FakeTool {
        FakeTool { name: "shell", kind: ToolKind::Execute }
    }

    // ── Rule parsing ──────────────────────────────────────────────────────────

    #[test]
    fn bare_rule_matches_any_signature() {
        let r = CompiledRule::parse("shell").unwrap();
        assert!(r.matches("shell", Some("anything")));
        assert!(r.matches("shell", None));
        assert!(!r.matches("read", None));
    }

    #[test]
    fn signature_rule_matches_glob() {
        let r = CompiledRule::parse("shell(git status*)").unwrap();
        assert!(r.matches("shell", Some("git status")));
        assert!(r.matches("shell", Some("git status --short")));
        assert!(!r.matches("shell", Some("git commit")));
        assert!(!r.matches("shell", None));
    }

    #[test]
    fn unparseable_rules_are_dropped() {
        assert!(CompiledRule::parse("").is_none());
        assert!(CompiledRule::parse("(orphan)").is_none());
        assert!(CompiledRule::parse("shell(unclosed").is_none());
    }

    // ── Decision order ────────────────────────────────────────────────────────

    #[test]
    fn deny_beats_allow_for_same_pattern() {
        let c = checker(&["shell(rm*)"], &[], &["shell(rm*)"]);
        let d = c.check(&shell(), &json!({"command": "rm -rf /tmp/x"}), PermissionMode::Default);
        assert_eq!(d, PermissionDecision::Deny);
    }

    #[test]
    fn deny_wins_even_in_yolo_mode() {
        let c = checker(&[], &[], &["shell(rm*)"]);
        let d = c.check(&shell(), &json!({"command": "rm -rf /"}), PermissionMode::Yolo);
        assert_eq!(d, PermissionDecision::Deny);
    }

    #[test]
    fn allow_rule_short_circuits_ask() {
        let c = checker(&["shell(git status*)"], &[], &[]);
        let d = c.check(&shell(), &json!({"command": "git status"}), PermissionMode::Default);
        assert_eq!(d, PermissionDecision::Allow);
    }

    #[test]
    fn unmatched_execute_tool_asks_in_default_mode() {
        let c = checker(&[], &[], &[]);
        let d = c.check(&shell(), &json!({"command": "cargo build"}), PermissionMode::Default);
        assert_eq!(d, PermissionDecision::Ask);
    }

    #[test]
    fn yolo_allows_unmatched_tools() {
        let c = checker(&[], &[], &[]);
        let d = c.check(&shell(), &json!({"command": "cargo build"}), PermissionMode::Yolo);
        assert_eq!(d, PermissionDecision::Allow);
    }

    #[test]
    fn read_tools_allowed_in_every_mode() {
        let c = checker(&[], &[], &[]);
        let read = FakeTool { name: "read", kind: ToolKind::Read };
        for mode in [
            PermissionMode::Default,
            PermissionMode::AutoEdit,
            PermissionMode::Plan,
            PermissionMode::Yolo,
        ] {
            assert_eq!(c.check(&read, &json!({}), mode), PermissionDecision::Allow, "{mode}");
        }
    }

    #[test]
    fn plan_mode_denies_side_effects() {
        let c = checker(&[], &[], &[]);
        for kind in [
            ToolKind::Edit,
            ToolKind::Execute,
            ToolKind::Delete,
            ToolKind::Move,
            ToolKind::Network,
            ToolKind::Other,
        ] {
            let t = FakeTool { name: "t", kind };
            assert_eq!(c.check(&t, &json!({}), PermissionMode::Plan), PermissionDecision::Deny);
        }
        let search = FakeTool { name: "s", kind: ToolKind::Search };
        assert_eq!(c.check(&search, &json!({}), PermissionMode::Plan), PermissionDecision::Allow);
    }

    #[test]
    fn auto_edit_mode_allows_edit_tools() {
        let c = checker(&[], &[], &[]);
        let edit = FakeTool { name: "edit", kind: ToolKind::Edit };
        assert_eq!(
            c.check(&edit, &json!({}), PermissionMode::AutoEdit),
            PermissionDecision::Allow
        );
        assert_eq!(c.check(&edit, &json!({}), PermissionMode::Default), PermissionDecision::Ask);
    }

    #[test]
    fn explicit_ask_rule_pins_ask_over_auto_edit() {
        let c = checker(&[], &["edit"], &[]);
        let edit = FakeTool { name: "edit", kind: ToolKind::Edit };
        assert_eq!(c.check(&edit, &json!({}), PermissionMode::AutoEdit), PermissionDecision::Ask);
    }

    // ── Persisted approvals ───────────────────────────────────────────────────

    #[test]
    fn persisted_allow_applies_to_later_checks() {
        let c = checker(&[], &[], &[]);
        let args = json!({"command": "cargo test"});
        assert_eq!(c.check(&shell(), &args, PermissionMode::Default), PermissionDecision::Ask);
        c.persist_allow("shell(cargo *)");
        assert_eq!(c.check(&shell(), &args, PermissionMode::Default), PermissionDecision::Allow);
        assert!(c.allow_rules().contains(&"shell(cargo *)".to_string()));
    }

    #[test]
    fn persisted_garbage_rule_is_ignored() {
        let c = checker(&[], &[], &[]);
        c.persist_allow("shell(unclosed");
        assert!(c.allow_rules().is_empty());
    }
}
