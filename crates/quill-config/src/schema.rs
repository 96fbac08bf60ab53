// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless the user opts out need a named function.
fn default_true() -> bool {
    true
}

/// Global permission policy that biases every tool-permission decision.
///
/// The mode is consulted only after the explicit rule lists: a matching
/// `deny` rule wins over any mode, a matching `allow` rule wins over every
/// mode except nothing (deny is checked first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Rules decide; everything unmatched asks the user.
    #[default]
    Default,
    /// Like `Default`, but edit tools run without asking.
    AutoEdit,
    /// Read/search only — every side-effecting tool is denied until the
    /// user leaves plan mode.
    Plan,
    /// Everything runs without asking.
    Yolo,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Default => write!(f, "default"),
            PermissionMode::AutoEdit => write!(f, "auto-edit"),
            PermissionMode::Plan => write!(f, "plan"),
            PermissionMode::Yolo => write!(f, "yolo"),
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "auto-edit" | "auto_edit" => Ok(PermissionMode::AutoEdit),
            "plan" => Ok(PermissionMode::Plan),
            "yolo" => Ok(PermissionMode::Yolo),
            other => Err(format!(
                "unknown permission mode '{other}' (expected default | auto-edit | plan | yolo)"
            )),
        }
    }
}

/// Wire shape the configured provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// `/chat/completions` with an `assistant.tool_calls` array.
    #[default]
    OpenaiCompat,
    /// `/v1/messages` with content blocks and a top-level `system` field.
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Base URL override. The provider default is used when absent.
    pub base_url: Option<String>,
    /// Explicit API key. When absent the loader falls back to the
    /// provider's canonical environment variable (`OPENAI_API_KEY` /
    /// `ANTHROPIC_API_KEY`).
    pub api_key: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Context window used for compaction accounting.
    pub context_window: Option<u32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenaiCompat,
            model: "gpt-4o".into(),
            base_url: None,
            api_key: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            context_window: None,
        }
    }
}

fn default_max_turns() -> u32 {
    50
}
fn default_compaction_threshold() -> f32 {
    0.8
}
fn default_compaction_keep_recent() -> usize {
    6
}
fn default_snapshot_keep() -> usize {
    10
}

/// Agent loop limits and compaction tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimits {
    /// Maximum model⇄tool iterations per user turn before the turn-limit
    /// handler is consulted.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Fraction of the context window at which proactive compaction fires.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of recent non-system messages preserved verbatim when the
    /// older history is summarised away.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Snapshots retained per file per session.
    #[serde(default = "default_snapshot_keep")]
    pub snapshot_keep: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            compaction_threshold: default_compaction_threshold(),
            compaction_keep_recent: default_compaction_keep_recent(),
            snapshot_keep: default_snapshot_keep(),
        }
    }
}

/// Explicit permission rule lists.
///
/// Each entry is `tool_name` or `tool_name(signature-glob)` — e.g.
/// `read`, `shell(git status*)`, `edit(**/*.rs)`. Deny always wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionRulesConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub ask: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Top-level user configuration (`~/.quill/config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Schema version. Older files are migrated on load; see
    /// [`crate::migrate_to_current`].
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub permissions: PermissionRulesConfig,
    #[serde(default)]
    pub agent: AgentLimits,
}

// ─── External tool server configuration ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    #[default]
    Stdio,
    Websocket,
    Sse,
}

/// One external tool server entry in `mcp-config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default)]
    pub transport: McpTransport,
    /// Command path (stdio) or URL (websocket / sse).
    pub endpoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

/// External tool servers keyed by id (`mcp-config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: std::collections::HashMap<String, McpServerConfig>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
