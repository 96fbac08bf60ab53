// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use quill_config::{ProviderConfig, ProviderKind};

use crate::{
    cancel::CancelToken, AssembledToolCall, CompletionRequest, FinishReason, ResponseEvent, Usage,
};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// Typed failure surfaced by the chat drivers.
///
/// Drivers return `anyhow::Result`; callers that need to distinguish a
/// user-initiated abort from a real failure downcast to this type.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The per-turn cancellation token fired.  Never presented to the user
    /// as an error — the turn ends with a neutral "task stopped" marker.
    #[error("request aborted")]
    Aborted,
    /// The provider returned a non-success HTTP status.
    #[error("{provider} error {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    /// No API key was configured and the provider requires one.
    #[error("API key not set; provide api_key in config or the {env_var} environment variable")]
    MissingApiKey { env_var: &'static str },
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else
    /// surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => {
                *status == 429 || *status == 408 || (500..=599).contains(status)
            }
            _ => false,
        }
    }
}

/// `true` when `err` is (or wraps) a cancellation.
pub fn is_abort_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ProviderError>(), Some(ProviderError::Aborted))
}

/// A fully collected (non-streaming) chat response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<AssembledToolCall>,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
}

/// One chat driver: a model endpoint speaking a concrete wire shape.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Stable driver id for status display and logs.
    fn name(&self) -> &str;

    /// Model identifier forwarded to the API.
    fn model_name(&self) -> &str;

    /// Send a completion request and stream response events.
    ///
    /// `signal` must reach the in-flight HTTP request: a fired token aborts
    /// the connection and the stream yields [`ProviderError::Aborted`].
    async fn stream_chat(
        &self,
        req: CompletionRequest,
        signal: CancelToken,
    ) -> anyhow::Result<ResponseStream>;

    /// Send a completion request and collect the full response.
    ///
    /// Default implementation drives [`stream_chat`](ChatService::stream_chat)
    /// to completion and assembles the events.
    async fn chat(
        &self,
        req: CompletionRequest,
        signal: CancelToken,
    ) -> anyhow::Result<ChatResponse> {
        let stream = self.stream_chat(req, signal).await?;
        collect_response(stream).await
    }
}

/// Drive a response stream to completion and assemble a [`ChatResponse`].
///
/// Tool-call fragments are accumulated by index and flushed in index order,
/// matching the order the model listed them.
pub(crate) async fn collect_response(mut stream: ResponseStream) -> anyhow::Result<ChatResponse> {
    let mut resp = ChatResponse::default();
    let mut pending: HashMap<u32, AssembledToolCall> = HashMap::new();

    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(t) => resp.text.push_str(&t),
            ResponseEvent::ThinkingDelta(t) => resp.thinking.push_str(&t),
            ResponseEvent::ToolCall { index, id, name, arguments } => {
                let tc = pending.entry(index).or_insert_with(|| AssembledToolCall {
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                if !id.is_empty() {
                    tc.id = id;
                }
                if !name.is_empty() {
                    tc.name = name;
                }
                tc.arguments.push_str(&arguments);
            }
            ResponseEvent::Usage { input_tokens, output_tokens } => {
                resp.usage.input_tokens = resp.usage.input_tokens.max(input_tokens);
                resp.usage.output_tokens = resp.usage.output_tokens.max(output_tokens);
            }
            ResponseEvent::Done(reason) => {
                resp.finish_reason = Some(reason);
                break;
            }
            ResponseEvent::Error(e) => {
                tracing::warn!("model stream error: {e}");
            }
        }
    }

    let mut calls: Vec<(u32, AssembledToolCall)> = pending.into_iter().collect();
    calls.sort_by_key(|(idx, _)| *idx);
    resp.tool_calls = calls.into_iter().map(|(_, tc)| tc).collect();
    Ok(resp)
}

/// Wrap a response stream so it terminates with [`ProviderError::Aborted`]
/// as soon as `signal` fires, even mid-response.
pub(crate) fn abortable_stream(inner: ResponseStream, signal: CancelToken) -> ResponseStream {
    let stream = futures::stream::unfold(
        (inner, signal, false),
        |(mut inner, signal, done)| async move {
            if done {
                return None;
            }
            tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    Some((Err(ProviderError::Aborted.into()), (inner, signal, true)))
                }
                item = inner.next() => {
                    item.map(|ev| (ev, (inner, signal, false)))
                }
            }
        },
    );
    Box::pin(stream)
}

/// Build a chat driver from the user configuration.
pub fn from_config(cfg: &ProviderConfig) -> Arc<dyn ChatService> {
    match cfg.provider {
        ProviderKind::OpenaiCompat => Arc::new(crate::OpenAiCompatService::new(
            cfg.model.clone(),
            cfg.api_key.clone(),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
        )),
        ProviderKind::Anthropic => Arc::new(crate::AnthropicService::new(
            cfg.model.clone(),
            cfg.api_key.clone(),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
        )),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
