// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use quill_config::PermissionMode;

use crate::{
    ConfirmationRequest, ExecutionContext, PermissionChecker, PermissionDecision, ToolCall,
    ToolErrorKind, ToolOutput, ToolRegistry,
};

/// Routes every model-requested tool call through lookup, schema
/// validation, the permission pipeline, and execution.
///
/// Failures at any stage become error results fed back to the model — the
/// dispatcher never raises into the agent loop.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    checker: Arc<PermissionChecker>,
    /// Serialises tools that are not concurrency-safe within one session.
    serial: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, checker: Arc<PermissionChecker>) -> Self {
        Self { registry, checker, serial: tokio::sync::Mutex::new(()) }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn checker(&self) -> &Arc<PermissionChecker> {
        &self.checker
    }

    /// Dispatch a batch of tool calls from one assistant turn.
    ///
    /// Concurrency-safe tools run in parallel; the rest serialise through
    /// the per-session mutex.  Results are returned in the order of
    /// `calls` regardless of completion order.
    pub async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        ctx: &ExecutionContext,
        mode: PermissionMode,
    ) -> Vec<ToolOutput> {
        let tasks: Vec<_> = calls
            .iter()
            .map(|call| self.dispatch(call, ctx, mode))
            .collect();
        futures::future::join_all(tasks).await
    }

    /// Dispatch a single tool call.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ExecutionContext,
        mode: PermissionMode,
    ) -> ToolOutput {
        // A cancelled turn skips execution entirely.
        if ctx.signal.is_cancelled() {
            return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "tool call aborted");
        }

        let Some(tool) = self.registry.get(&call.name) else {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::NotFound,
                format!("unknown tool: {}", call.name),
            );
        };

        if let Err(msg) = validate_args(&tool.parameters_schema(), &call.args) {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::Validation,
                format!("invalid arguments for {}: {msg}", call.name),
            );
        }

        match self.checker.check(tool.as_ref(), &call.args, mode) {
            PermissionDecision::Deny => {
                debug!(tool = %call.name, "permission denied");
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::PermissionDenied,
                    format!("permission denied for {}", call.name),
                );
            }
            PermissionDecision::Ask => {
                let request = ConfirmationRequest {
                    tool_name: call.name.clone(),
                    title: format!("Run {}?", tool.display_name()),
                    message: tool
                        .signature_content(&call.args)
                        .unwrap_or_else(|| call.args.to_string()),
                    risks: vec![],
                    affected_files: affected_files(&call.args),
                };
                // The confirmation prompt is a suspension point: a cancel
                // while the user decides aborts the call.
                let outcome = tokio::select! {
                    biased;
                    _ = ctx.signal.cancelled() => {
                        return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "tool call aborted");
                    }
                    outcome = ctx.confirmation.request(request) => outcome,
                };
                if !outcome.approved {
                    let reason = outcome.reason.unwrap_or_else(|| "rejected by user".into());
                    return ToolOutput::err(
                        &call.id,
                        ToolErrorKind::PermissionDenied,
                        format!("{} not approved: {reason}", call.name),
                    );
                }
                if outcome.persist {
                    if let Some(rule) = tool
                        .abstract_rule(&call.args)
                        .or_else(|| Some(call.name.clone()))
                    {
                        self.checker.persist_allow(&rule);
                    }
                }
            }
            PermissionDecision::Allow => {}
        }

        debug!(tool = %call.name, call_id = %call.id, "executing tool");
        let output = if tool.concurrency_safe() {
            tool.execute(call, ctx).await
        } else {
            let _guard = self.serial.lock().await;
            // Re-check after possibly waiting on another invocation.
            if ctx.signal.is_cancelled() {
                return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "tool call aborted");
            }
            tool.execute(call, ctx).await
        };

        if output.is_error() {
            warn!(tool = %call.name, "tool returned error: {}", output.content);
        }
        output
    }
}

/// Minimal JSON-Schema check at the dispatch boundary: the argument value
/// must be an object, required properties must be present, and declared
/// primitive types must match.  Tools still validate semantics themselves;
/// this catches malformed model output before it reaches them.
pub(crate) fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required parameter '{key}'"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(declared) = props.get(key).and_then(|p| p.get("type")).and_then(|t| t.as_str())
            else {
                continue;
            };
            let ok = match declared {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("parameter '{key}' must be of type {declared}"));
            }
        }
    }

    Ok(())
}

fn affected_files(args: &Value) -> Vec<String> {
    ["path", "file_path"]
        .iter()
        .filter_map(|k| args.get(*k).and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
