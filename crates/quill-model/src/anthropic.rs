// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat driver for the Anthropic `/v1/messages` API.
//!
//! The wire shape differs from the OpenAI-compatible format in three ways
//! this driver has to reconcile:
//! - the system prompt is a top-level field, not a conversation turn;
//! - message content is a list of typed blocks (`text`, `image`,
//!   `tool_use`, `tool_result`), and a tool result is a *user* message
//!   carrying a `tool_result` block;
//! - the API requires strict user/assistant alternation, so adjacent
//!   same-role messages are merged and a placeholder user turn is
//!   prepended when the history would otherwise open with the assistant.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    cancel::CancelToken,
    retry::{retry_with_backoff, RetryConfig},
    sanitize::{collect_system_text, filter_orphan_tool_messages},
    service::{abortable_stream, ProviderError, ResponseStream},
    CompletionRequest, FinishReason, ResponseEvent,
};

pub struct AnthropicService {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl AnthropicService {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            retry: RetryConfig::default(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ChatService for AnthropicService {
    fn name(&self) -> &str {
        "anthropic"
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
            .ok_or(ProviderError::MissingApiKey { env_var: "ANTHROPIC_API_KEY" })?;

        let history = filter_orphan_tool_messages(req.messages);
        let system_text = collect_system_text(&history);
        let messages = build_anthropic_messages(&history);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": true,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending anthropic completion request"
        );

        let url = format!("{}/v1/messages", self.base_url);
        let resp = retry_with_backoff(&self.retry, || {
            let body = body.clone();
            let signal = signal.clone();
            let url = url.clone();
            async move {
                let send = self
                    .client
                    .post(&url)
                    .header("x-api-key", key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send();
                let resp = tokio::select! {
                    biased;
                    _ = signal.cancelled() => return Err(ProviderError::Aborted.into()),
                    r = send => r.context("anthropic request failed")?,
                };
                if !resp.status().is_success() {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ProviderError::Api { provider: "anthropic", status, body }.into());
                }
                Ok(resp)
            }
        })
        .await?;

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(
                (String::new(), StreamState::default()),
                |(buf, state), chunk| {
                    let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                        Ok(b) => {
                            buf.push_str(&String::from_utf8_lossy(&b));
                            let mut out = Vec::new();
                            while let Some(pos) = buf.find('\n') {
                                let line = buf[..pos].trim_end_matches('\r').to_string();
                                *buf = buf[pos + 1..].to_string();
                                if let Some(data) = line.strip_prefix("data: ") {
                                    if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                                        out.extend(state.handle_event(&v).into_iter().map(Ok));
                                    }
                                }
                            }
                            out
                        }
                        Err(e) => vec![Err(anyhow::anyhow!(e))],
                    };
                    std::future::ready(Some(events))
                },
            )
            .flat_map(futures::stream::iter);

        Ok(abortable_stream(Box::pin(event_stream), signal))
    }
}

fn map_stop_reason(s: &str) -> FinishReason {
    match s {
        "end_turn" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" => FinishReason::Length,
        other => FinishReason::Other(other.to_string()),
    }
}

/// Per-response stream state.
///
/// `tool_use` blocks arrive as a `content_block_start` carrying id + name
/// followed by `input_json_delta` fragments; the assembled call is emitted
/// as a single [`ResponseEvent::ToolCall`] when the block stops.  Fragments
/// for different block indices accumulate independently.
#[derive(Default)]
struct StreamState {
    pending: HashMap<u32, PendingToolUse>,
    stop_reason: Option<FinishReason>,
}

struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

impl StreamState {
    fn handle_event(&mut self, v: &Value) -> Vec<ResponseEvent> {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    return vec![ResponseEvent::Usage {
                        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                        output_tokens: 0,
                    }];
                }
                vec![]
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.pending.insert(
                        index,
                        PendingToolUse {
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                            input_json: String::new(),
                        },
                    );
                }
                vec![]
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if text.is_empty() {
                            vec![]
                        } else {
                            vec![ResponseEvent::TextDelta(text.to_string())]
                        }
                    }
                    "input_json_delta" => {
                        if let Some(p) = self.pending.get_mut(&index) {
                            p.input_json
                                .push_str(delta["partial_json"].as_str().unwrap_or(""));
                        } else {
                            warn!(index, "input_json_delta for unknown content block");
                        }
                        vec![]
                    }
                    "thinking_delta" => {
                        let thinking = delta["thinking"].as_str().unwrap_or("");
                        if thinking.is_empty() {
                            vec![]
                        } else {
                            vec![ResponseEvent::ThinkingDelta(thinking.to_string())]
                        }
                    }
                    // The encrypted signature blob closing a thinking block is
                    // not human-readable and must never surface.
                    "signature_delta" => vec![],
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                if let Some(p) = self.pending.remove(&index) {
                    if p.name.is_empty() {
                        warn!(index, "dropping assembled tool call with empty name");
                        return vec![];
                    }
                    let arguments = if p.input_json.is_empty() {
                        "{}".to_string()
                    } else {
                        p.input_json
                    };
                    return vec![ResponseEvent::ToolCall {
                        index,
                        id: p.id,
                        name: p.name,
                        arguments,
                    }];
                }
                vec![]
            }
            "message_delta" => {
                let mut out = Vec::new();
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
                if let Some(usage) = v.get("usage") {
                    out.push(ResponseEvent::Usage {
                        input_tokens: 0,
                        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                    });
                }
                out
            }
            "message_stop" => {
                vec![ResponseEvent::Done(
                    self.stop_reason.take().unwrap_or(FinishReason::Stop),
                )]
            }
            "error" => {
                let msg = v["error"]["message"].as_str().unwrap_or("unknown").to_string();
                vec![ResponseEvent::Error(msg)]
            }
            _ => vec![],
        }
    }
}

/// Convert the internal history into the Anthropic conversation array.
///
/// System messages are skipped (the caller lifts them into the top-level
/// `system` field).  Adjacent same-role messages are merged into one block
/// list, and a placeholder user turn is prepended when the first
/// conversation message would not be `user`.
pub(crate) fn build_anthropic_messages(messages: &[crate::Message]) -> Vec<Value> {
    use crate::{ContentPart, MessageContent, Role};

    // Phase 1: one block-list entry per non-system message.
    let mut entries: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for m in messages {
        if m.role == Role::System {
            continue;
        }
        let role = match m.role {
            Role::Assistant => "assistant",
            // Tool results ride in user messages on this wire shape.
            Role::User | Role::Tool => "user",
            Role::System => unreachable!(),
        };
        let blocks: Vec<Value> = match &m.content {
            MessageContent::Text(t) => {
                if t.is_empty() {
                    vec![]
                } else {
                    vec![json!({ "type": "text", "text": t })]
                }
            }
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::Image { image_url } => {
                        if let Ok((mime, data)) = crate::types::parse_data_url_parts(image_url) {
                            json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": mime,
                                    "data": data,
                                }
                            })
                        } else {
                            json!({
                                "type": "image",
                                "source": { "type": "url", "url": image_url }
                            })
                        }
                    }
                })
                .collect(),
            MessageContent::ToolCall { tool_call_id, function } => {
                // tool_use.id must match `^[a-zA-Z0-9_-]+$`; an empty id
                // would fail the whole request with a 400.
                let safe_id = if tool_call_id.is_empty() {
                    warn!(
                        tool_name = %function.name,
                        "tool call message has empty id; substituting fallback"
                    );
                    "tc_fallback".to_string()
                } else {
                    tool_call_id.clone()
                };
                vec![json!({
                    "type": "tool_use",
                    "id": safe_id,
                    "name": function.name,
                    "input": serde_json::from_str::<Value>(&function.arguments)
                        .unwrap_or(json!({})),
                })]
            }
            MessageContent::ToolResult { tool_call_id, content } => {
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                })]
            }
        };
        if blocks.is_empty() {
            continue;
        }
        entries.push((role, blocks));
    }

    // Phase 2: merge adjacent same-role entries (strict alternation).
    let mut merged: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for (role, blocks) in entries {
        match merged.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => {
                last_blocks.extend(blocks);
            }
            _ => merged.push((role, blocks)),
        }
    }

    // Phase 3: the conversation must open with a user turn.
    if merged.first().map(|(r, _)| *r) == Some("assistant") {
        merged.insert(
            0,
            ("user", vec![json!({ "type": "text", "text": "(continue)" })]),
        );
    }

    merged
        .into_iter()
        .map(|(role, blocks)| json!({ "role": role, "content": blocks }))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
