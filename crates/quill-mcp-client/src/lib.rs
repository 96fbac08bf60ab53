// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Client for external tool servers speaking a JSON-RPC 2.0 protocol.
//!
//! One client per configured server.  After the initialize handshake the
//! client fetches the remote tool list and wraps each entry as a local
//! [`quill_tools::Tool`] whose handler forwards the invocation across the
//! transport (a child process on stdio, or a WebSocket).  A failing server
//! never takes the agent down — its tools simply leave the registry.

mod adapter;
mod client;
mod protocol;
mod transport;

pub use adapter::{RemoteTool, ServerManager};
pub use client::{McpClient, ServerState};
pub use protocol::{remote_tool_name, RemoteToolInfo};
pub use transport::{StdioTransport, Transport, WebSocketTransport};
