// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::Tool;

/// A tool schema as advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Read-mostly after startup; external-server connects and disconnects
/// take the write lock to add or remove their adapters, so lookups keep
/// working while a server list refreshes.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .insert(tool.name().to_string(), tool);
    }

    /// Remove a tool by name; returns `true` when something was removed.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Schemas for all registered tools, sorted by name for stable request
    /// payloads.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        let mut schemas: Vec<ToolSchema> = tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("tool registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::{ExecutionContext, ToolCall, ToolKind, ToolOutput};

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl crate::Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn kind(&self) -> ToolKind {
            ToolKind::Other
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ExecutionContext) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[test]
    fn register_and_get() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn unregister_removes_tool() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        assert!(reg.unregister("t"));
        assert!(!reg.unregister("t"));
        assert!(reg.get("t").is_none());
    }

    #[test]
    fn schemas_sorted_by_name() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn builtin_registry_contains_core_tools() {
        let reg = crate::builtin_registry();
        for name in ["read", "edit", "multi_edit", "undo_edit", "glob", "grep", "find",
                     "web_fetch", "web_search", "think", "shell"] {
            assert!(reg.get(name).is_some(), "missing builtin tool {name}");
        }
    }
}
