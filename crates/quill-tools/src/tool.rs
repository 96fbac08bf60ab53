// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use quill_model::CancelToken;

use crate::{permission::ConfirmationHandler, FileAccessTracker, SnapshotStore};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim in results).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// What a tool does to the world.  Drives the permission-mode overrides:
/// `Read`/`Search`/`Think` run freely, `Edit` is auto-approved in auto-edit
/// mode, and everything except `Read`/`Search` is denied in plan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Read,
    Search,
    Edit,
    Execute,
    Delete,
    Move,
    Network,
    Think,
    Other,
}

impl ToolKind {
    /// Side-effect-free kinds that never need confirmation.
    pub fn is_read_only(&self) -> bool {
        matches!(self, ToolKind::Read | ToolKind::Search | ToolKind::Think)
    }
}

/// Error taxonomy shared by every tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// Parameter or schema mismatch.
    Validation,
    /// Target file / snapshot / tool not present.
    NotFound,
    /// The checker said deny, or confirmation was rejected.
    PermissionDenied,
    /// The cancellation token fired.
    Aborted,
    /// The tool ran but failed (e.g. subprocess non-zero exit).
    ExecutionError,
    /// HTTP / parse / auth failure against a remote endpoint.
    ProviderError,
    /// Bug or invariant violation.
    Internal,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Validation => "validation",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::PermissionDenied => "permission_denied",
            ToolErrorKind::Aborted => "aborted",
            ToolErrorKind::ExecutionError => "execution_error",
            ToolErrorKind::ProviderError => "provider_error",
            ToolErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// The result of executing a tool.
///
/// `content` is what the model sees; `display` (when set) is the shorter
/// human-facing summary.  `metadata` carries structured extras such as the
/// search strategy used or snapshot warnings.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub display: Option<String>,
    pub metadata: Value,
    pub error: Option<ToolError>,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            display: None,
            metadata: Value::Null,
            error: None,
        }
    }

    pub fn err(
        call_id: impl Into<String>,
        kind: ToolErrorKind,
        msg: impl Into<String>,
    ) -> Self {
        let message = msg.into();
        Self {
            call_id: call_id.into(),
            content: message.clone(),
            display: None,
            metadata: Value::Null,
            error: Some(ToolError { kind, message }),
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Everything a tool may touch while executing.  Borrowed per invocation;
/// tools never own the session.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Per-turn cancellation token; checked at every suspension point.
    pub signal: CancelToken,
    pub session_id: String,
    /// Id of the assistant message that requested this call.  Snapshots
    /// created during the call are keyed by it so undo can target message
    /// boundaries.
    pub message_id: String,
    pub workspace_root: PathBuf,
    pub snapshots: Arc<SnapshotStore>,
    pub tracker: Arc<FileAccessTracker>,
    pub confirmation: Arc<dyn ConfirmationHandler>,
    /// Live output channel for long-running tools (subprocess stdio).
    pub update_output: Option<mpsc::Sender<String>>,
}

impl ExecutionContext {
    /// Send a live output line if a consumer is attached.
    pub async fn push_output(&self, line: impl Into<String>) {
        if let Some(tx) = &self.update_output {
            let _ = tx.send(line.into()).await;
        }
    }
}

/// Trait every built-in and external tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn display_name(&self) -> &str {
        self.name()
    }
    fn kind(&self) -> ToolKind;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Whether this tool may run in parallel with other invocations in the
    /// same turn.  Mutating tools serialise by default.
    fn concurrency_safe(&self) -> bool {
        self.kind().is_read_only()
    }
    /// Canonical string the permission rules match parameter signatures
    /// against (e.g. the file path, or `search:<lowercased query>`).
    fn signature_content(&self, _args: &Value) -> Option<String> {
        None
    }
    /// Generalised rule covering calls like this one (e.g. `edit(**/*.rs)`),
    /// used when the user persists an approval.
    fn abstract_rule(&self, _args: &Value) -> Option<String> {
        None
    }
    /// Execute the tool.  Failures are values ([`ToolOutput::err`]), never
    /// panics — the model sees them as the next tool message.
    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
