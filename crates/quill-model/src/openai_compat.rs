// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Chat driver for OpenAI-compatible `/chat/completions` endpoints.
//!
//! The same SSE wire format is spoken by OpenAI itself and by a long tail
//! of local servers and gateways (vLLM, llama.cpp, LiteLLM, OpenRouter),
//! so this driver takes the base URL from config and hard-codes nothing
//! endpoint-specific beyond the path.

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    cancel::CancelToken,
    retry::{retry_with_backoff, RetryConfig},
    sanitize::filter_orphan_tool_messages,
    service::{abortable_stream, ProviderError, ResponseStream},
    CompletionRequest, FinishReason, ResponseEvent, Role,
};

pub struct OpenAiCompatService {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl OpenAiCompatService {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".into());
        let base = base.trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            retry: RetryConfig::default(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ChatService for OpenAiCompatService {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        req: CompletionRequest,
        signal: CancelToken,
    ) -> anyhow::Result<ResponseStream> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey { env_var: "OPENAI_API_KEY" })?;

        let messages = build_openai_messages(&filter_orphan_tool_messages(req.messages));

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending openai-compat completion request"
        );

        // Connect with retry on transient failures; once the stream is open
        // no further retries happen (a broken stream surfaces as an error).
        let resp = retry_with_backoff(&self.retry, || {
            let body = body.clone();
            let signal = signal.clone();
            async move {
                let send = self
                    .client
                    .post(&self.chat_url)
                    .bearer_auth(key)
                    .json(&body)
                    .send();
                let resp = tokio::select! {
                    biased;
                    _ = signal.cancelled() => return Err(ProviderError::Aborted.into()),
                    r = send => r.context("openai-compat request failed")?,
                };
                if !resp.status().is_success() {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ProviderError::Api { provider: "openai-compat", status, body }
                        .into());
                }
                Ok(resp)
            }
        })
        .await?;

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so complete lines are
        // drained from a carry buffer.  `done_emitted` guarantees exactly one
        // Done event per response even when the provider sends both a
        // finish_reason chunk and the trailing [DONE] sentinel.
        let event_stream = byte_stream
            .scan((String::new(), false), |(buf, done_emitted), chunk| {
                let mut events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                events.retain(|ev| match ev {
                    Ok(ResponseEvent::Done(_)) => {
                        if *done_emitted {
                            false
                        } else {
                            *done_emitted = true;
                            true
                        }
                    }
                    _ => true,
                });
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(abortable_stream(Box::pin(event_stream), signal))
    }
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comments, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done(FinishReason::Stop)));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` to be extended by the
/// next TCP chunk — a single SSE event may be split across packets.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn map_finish_reason(s: &str) -> FinishReason {
    match s {
        "stop" => FinishReason::Stop,
        "tool_calls" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        other => FinishReason::Other(other.to_string()),
    }
}

fn parse_sse_chunk(v: &Value) -> Option<anyhow::Result<ResponseEvent>> {
    // Usage-only chunk (stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }

    let choice = &v["choices"][0];

    if let Some(reason) = choice["finish_reason"].as_str() {
        return Some(Ok(ResponseEvent::Done(map_finish_reason(reason))));
    }

    let delta = &choice["delta"];

    // Tool-call delta.  Parallel tool calls interleave chunks for different
    // calls; the index routes accumulation in the consumer and fragments for
    // different indices are never merged here.
    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            return Some(Ok(ResponseEvent::ToolCall { index, id, name, arguments: args }));
        }
    }

    // Reasoning deltas arrive as `reasoning_content` (llama.cpp, DeepSeek)
    // or `reasoning` (OpenRouter).
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(thinking) = thinking {
        if !thinking.is_empty() {
            return Some(Ok(ResponseEvent::ThinkingDelta(thinking.to_string())));
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return Some(Ok(ResponseEvent::TextDelta(text.to_string())));
        }
    }

    None
}

/// Convert a slice of [`Message`]s into the OpenAI wire-format JSON array.
///
/// **Parallel tool-call coalescing**: OpenAI requires all tool calls from
/// one assistant turn to appear inside a single assistant message as a
/// `tool_calls` array.  The history stores each tool call as a separate
/// `MessageContent::ToolCall` entry, so consecutive entries are merged into
/// one JSON object here.
pub(crate) fn build_openai_messages(messages: &[crate::Message]) -> Vec<Value> {
    use crate::{ContentPart, MessageContent};

    fn tool_call_to_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if let MessageContent::ToolCall { tool_call_id, function } = &m.content {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall { tool_call_id, function } = &messages[i].content {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::Parts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { image_url } => json!({
                            "type": "image_url",
                            "image_url": { "url": image_url },
                        }),
                    })
                    .collect();
                json!({ "role": role_str(&m.role), "content": content })
            }
            MessageContent::Parts(_) => {
                json!({ "role": role_str(&m.role), "content": "" })
            }
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
            MessageContent::ToolResult { tool_call_id, content } => {
                json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content })
            }
        };
        result.push(v);
        i += 1;
    }

    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
