// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool definitions, registry, dispatcher, and the side-effect gatekeepers.
//!
//! Every side effect the agent performs flows through this crate: the
//! permission checker decides whether a call may run, the snapshot store
//! makes edits recoverable, and the file-access tracker enforces the
//! read-before-write discipline (as warnings, never hard blocks).

pub mod builtin;
mod dispatch;
mod permission;
mod registry;
mod snapshot;
mod tool;
mod tracker;

pub use dispatch::Dispatcher;
pub use permission::{
    AlwaysDenyHandler, CompiledRule, ConfirmationHandler, ConfirmationOutcome,
    ConfirmationRequest, PermissionChecker, PermissionDecision,
};
pub use registry::{ToolRegistry, ToolSchema};
pub use snapshot::{path_fingerprint, SnapshotMeta, SnapshotStore};
pub use tool::{
    ExecutionContext, Tool, ToolCall, ToolError, ToolErrorKind, ToolKind, ToolOutput,
};
pub use tracker::{FileAccessTracker, Modification};

/// Register every built-in tool on a fresh registry.
pub fn builtin_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(builtin::ReadTool);
    registry.register(builtin::EditTool);
    registry.register(builtin::MultiEditTool);
    registry.register(builtin::UndoEditTool);
    registry.register(builtin::GlobTool);
    registry.register(builtin::GrepTool);
    registry.register(builtin::FindTool);
    registry.register(builtin::WebFetchTool::default());
    registry.register(builtin::WebSearchTool::default());
    registry.register(builtin::ThinkTool);
    registry.register(builtin::ShellTool::default());
    registry
}
