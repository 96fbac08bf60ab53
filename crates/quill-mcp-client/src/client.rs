// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tracing::{debug, warn};

use quill_config::{McpServerConfig, McpTransport};

use crate::{
    protocol::{Request, Response},
    RemoteToolInfo, StdioTransport, Transport, WebSocketTransport, protocol::PROTOCOL_VERSION,
};

/// Connection lifecycle of one tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// JSON-RPC client for one configured tool server.
///
/// Responses are matched to requests by id; notifications arriving in
/// between are absorbed (a `tools/list_changed` notification raises the
/// `tools_updated` flag for the manager to act on).
pub struct McpClient {
    name: String,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    state: RwLock<ServerState>,
    next_id: AtomicU64,
    tools_updated: AtomicBool,
}

impl McpClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: tokio::sync::Mutex::new(None),
            state: RwLock::new(ServerState::Disconnected),
            next_id: AtomicU64::new(1),
            tools_updated: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServerState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: ServerState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    /// `true` once a tools-changed notification arrived; reading clears it.
    pub fn take_tools_updated(&self) -> bool {
        self.tools_updated.swap(false, Ordering::SeqCst)
    }

    /// Open the transport described by `config` and run the initialize
    /// handshake.  On failure the client parks in [`ServerState::Error`].
    pub async fn connect(&self, config: &McpServerConfig) -> anyhow::Result<()> {
        self.set_state(ServerState::Connecting);
        let result = self.connect_inner(config).await;
        match &result {
            Ok(()) => self.set_state(ServerState::Connected),
            Err(e) => {
                warn!(server = %self.name, "tool server connect failed: {e:#}");
                self.set_state(ServerState::Error);
            }
        }
        result
    }

    async fn connect_inner(&self, config: &McpServerConfig) -> anyhow::Result<()> {
        let transport: Box<dyn Transport> = match config.transport {
            McpTransport::Stdio => {
                Box::new(StdioTransport::spawn(&config.endpoint, &config.args, &config.env)?)
            }
            McpTransport::Websocket | McpTransport::Sse => {
                // SSE endpoints are reached over the same socket upgrade in
                // this protocol revision.
                Box::new(WebSocketTransport::connect(&config.endpoint).await?)
            }
        };
        *self.transport.lock().await = Some(transport);

        let result = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": { "name": "quill", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": {},
                })),
            )
            .await
            .context("initialize handshake failed")?;
        debug!(server = %self.name, ?result, "tool server initialized");

        // The handshake completes with a notification the server expects
        // before serving requests.
        self.notify("notifications/initialized", None).await?;
        Ok(())
    }

    /// Install an already-open transport (tests use an in-memory pipe).
    pub async fn connect_with_transport(&self, transport: Box<dyn Transport>) {
        *self.transport.lock().await = Some(transport);
        self.set_state(ServerState::Connected);
    }

    pub async fn disconnect(&self) {
        *self.transport.lock().await = None;
        self.set_state(ServerState::Disconnected);
    }

    /// Fetch the remote tool list.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<RemoteToolInfo>> {
        let result = self.request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .context("tools/list result missing 'tools'")?;
        Ok(tools
            .iter()
            .filter_map(|t| serde_json::from_value(t.clone()).ok())
            .collect())
    }

    /// Invoke a remote tool.  Returns the concatenated text content and
    /// the server's error flag.
    pub async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<(String, bool)> {
        let result = self
            .request("tools/call", Some(json!({ "name": name, "arguments": args })))
            .await?;
        let is_error = result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
        let text = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok((text, is_error))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> anyhow::Result<()> {
        let guard = self.transport.lock().await;
        let transport = guard.as_ref().context("not connected")?;
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        transport.send(msg.to_string()).await
    }

    /// Send one request and wait for the response with the matching id.
    /// Notifications that arrive first are absorbed, never dropped on the
    /// floor silently.
    async fn request(&self, method: &str, params: Option<Value>) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let guard = self.transport.lock().await;
        let transport = guard.as_ref().context("not connected")?;

        let req = Request::new(id, method, params);
        transport.send(serde_json::to_string(&req)?).await?;

        loop {
            let Some(line) = transport.recv().await? else {
                self.set_state(ServerState::Error);
                bail!("tool server {} closed the connection", self.name);
            };
            let resp: Response = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(server = %self.name, "unparseable message from server: {e} — {line}");
                    continue;
                }
            };

            if resp.id.is_none() {
                if let Some(method) = &resp.method {
                    debug!(server = %self.name, method, "server notification");
                    if method.contains("tools/list_changed") {
                        self.tools_updated.store(true, Ordering::SeqCst);
                    }
                }
                continue;
            }
            if resp.id != Some(id) {
                warn!(server = %self.name, "response for unexpected id {:?}", resp.id);
                continue;
            }
            if let Some(err) = resp.error {
                bail!("server error {}: {}", err.code, err.message);
            }
            return Ok(resp.result.unwrap_or(Value::Null));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
