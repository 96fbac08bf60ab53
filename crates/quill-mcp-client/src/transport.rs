// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::debug;

/// One bidirectional message pipe to a tool server.
///
/// Both transports frame messages as one JSON document per unit: a line on
/// stdio, a text frame on WebSocket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, text: String) -> anyhow::Result<()>;
    /// Next inbound message; `None` when the peer closed the connection.
    async fn recv(&self) -> anyhow::Result<Option<String>>;
}

// ─── Stdio ────────────────────────────────────────────────────────────────────

/// Child process speaking line-delimited JSON on stdin/stdout.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<tokio::io::Lines<BufReader<ChildStdout>>>,
    /// Kept so the child dies with the transport (`kill_on_drop`).
    _child: Child,
}

impl StdioTransport {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        debug!(command, "spawning stdio tool server");
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning tool server {command}"))?;

        let stdin = child.stdin.take().context("tool server has no stdin")?;
        let stdout = child.stdout.take().context("tool server has no stdout")?;
        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout).lines()),
            _child: child,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, text: String) -> anyhow::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<Option<String>> {
        let mut lines = self.stdout.lock().await;
        Ok(lines.next_line().await?)
    }
}

// ─── WebSocket ────────────────────────────────────────────────────────────────

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

/// WebSocket connection carrying one JSON document per text frame.
pub struct WebSocketTransport {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        debug!(url, "connecting to websocket tool server");
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("websocket connect to {url}"))?;
        debug!(status = %response.status(), "websocket tool server connected");
        let (sink, source) = stream.split();
        Ok(Self { sink: Mutex::new(sink), source: Mutex::new(source) })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, text: String) -> anyhow::Result<()> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .context("websocket send failed")?;
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<Option<String>> {
        let mut source = self.source.lock().await;
        loop {
            match source.next().await {
                Some(Ok(WsMessage::Text(t))) => return Ok(Some(t)),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                // Control frames carry no protocol payload.
                Some(Ok(_)) => continue,
                Some(Err(e)) => bail!("websocket read error: {e}"),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
