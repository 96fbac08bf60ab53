// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use quill_config::McpConfig;
use quill_tools::{
    ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput, ToolRegistry,
};

use crate::{remote_tool_name, McpClient, RemoteToolInfo, ServerState};

/// Local adapter for one remote tool.
///
/// Implements [`quill_tools::Tool`] so remote tools flow through the same
/// registry, permission pipeline, and dispatcher as the built-ins.
pub struct RemoteTool {
    client: Arc<McpClient>,
    info: RemoteToolInfo,
    registry_name: String,
}

impl RemoteTool {
    pub fn new(client: Arc<McpClient>, info: RemoteToolInfo) -> Self {
        let registry_name = remote_tool_name(client.name(), &info.name);
        Self { client, info, registry_name }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.registry_name
    }

    fn display_name(&self) -> &str {
        &self.info.name
    }

    fn kind(&self) -> ToolKind {
        // Remote side effects are opaque, so the checker treats them as
        // confirm-by-default.
        ToolKind::Other
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    fn concurrency_safe(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        if self.client.state() != ServerState::Connected {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::ProviderError,
                format!("tool server {} is not connected", self.client.name()),
            );
        }

        let invoke = self.client.call_tool(&self.info.name, call.args.clone());
        let result = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => {
                return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "remote call aborted");
            }
            r = invoke => r,
        };

        match result {
            Ok((text, false)) => ToolOutput::ok(&call.id, text),
            Ok((text, true)) => ToolOutput::err(&call.id, ToolErrorKind::ExecutionError, text),
            Err(e) => ToolOutput::err(
                &call.id,
                ToolErrorKind::ProviderError,
                format!("remote call failed: {e:#}"),
            ),
        }
    }
}

/// Owns the configured server clients and keeps the shared registry in
/// sync with what is actually connected.
pub struct ServerManager {
    registry: Arc<ToolRegistry>,
    clients: tokio::sync::Mutex<HashMap<String, ManagedServer>>,
}

struct ManagedServer {
    client: Arc<McpClient>,
    registered: Vec<String>,
}

impl ServerManager {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry, clients: tokio::sync::Mutex::new(HashMap::new()) }
    }

    /// Connect every enabled auto-connect server.  Individual failures are
    /// logged and skipped — one bad server never blocks the rest.
    pub async fn connect_configured(&self, config: &McpConfig) {
        for (id, server) in &config.servers {
            if !server.enabled || !server.auto_connect {
                continue;
            }
            let client = Arc::new(McpClient::new(id.clone()));
            if let Err(e) = client.connect(server).await {
                warn!(server = %id, "skipping tool server: {e:#}");
                continue;
            }
            if let Err(e) = self.adopt(client).await {
                warn!(server = %id, "tool discovery failed: {e:#}");
            }
        }
    }

    /// Register a connected client's tools.  Also the entry point for
    /// tests, which hand over a client with a fake transport.
    pub async fn adopt(&self, client: Arc<McpClient>) -> anyhow::Result<usize> {
        let tools = client.list_tools().await?;
        let mut registered = Vec::with_capacity(tools.len());
        for info in tools {
            let adapter = RemoteTool::new(Arc::clone(&client), info);
            registered.push(adapter.name().to_string());
            self.registry.register(adapter);
        }
        debug!(server = %client.name(), count = registered.len(), "registered remote tools");
        let count = registered.len();
        self.clients
            .lock()
            .await
            .insert(client.name().to_string(), ManagedServer { client, registered });
        Ok(count)
    }

    /// Drop a server and remove its tools from the registry.
    pub async fn disconnect(&self, server: &str) {
        let Some(managed) = self.clients.lock().await.remove(server) else {
            return;
        };
        for name in &managed.registered {
            self.registry.unregister(name);
        }
        managed.client.disconnect().await;
        debug!(server, "tool server disconnected");
    }

    /// Re-fetch tool lists for servers that signalled a change.
    pub async fn refresh_changed(&self) {
        let mut clients = self.clients.lock().await;
        for (name, managed) in clients.iter_mut() {
            if !managed.client.take_tools_updated() {
                continue;
            }
            match managed.client.list_tools().await {
                Ok(tools) => {
                    for old in &managed.registered {
                        self.registry.unregister(old);
                    }
                    managed.registered.clear();
                    for info in tools {
                        let adapter = RemoteTool::new(Arc::clone(&managed.client), info);
                        managed.registered.push(adapter.name().to_string());
                        self.registry.register(adapter);
                    }
                    debug!(server = %name, "remote tool list refreshed");
                }
                Err(e) => warn!(server = %name, "tool refresh failed: {e:#}"),
            }
        }
    }

    pub async fn server_states(&self) -> Vec<(String, ServerState)> {
        self.clients
            .lock()
            .await
            .iter()
            .map(|(name, m)| (name.clone(), m.client.state()))
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
