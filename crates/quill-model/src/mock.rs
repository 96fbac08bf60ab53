// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    cancel::CancelToken, service::ResponseStream, CompletionRequest, FinishReason, ResponseEvent,
    Role,
};

/// Deterministic mock driver for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockService;

#[async_trait]
impl crate::ChatService for MockService {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream_chat(
        &self,
        req: CompletionRequest,
        _signal: CancelToken,
    ) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage { input_tokens: 10, output_tokens: 10 }),
            Ok(ResponseEvent::Done(FinishReason::Stop)),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock driver.  Each `stream_chat` call pops the next
/// response script from the front of the queue, so tests can specify exact
/// event sequences — including tool calls — without network access.
pub struct ScriptedMockService {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    /// The last request seen, for tests that inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Number of `stream_chat` calls served so far.
    pub calls: Arc<Mutex<u32>>,
}

impl ScriptedMockService {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// event sequence emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Convenience: driver that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage { input_tokens: 5, output_tokens: 5 },
            ResponseEvent::Done(FinishReason::Stop),
        ]])
    }

    /// Convenience: driver that returns a tool call, then a text reply on
    /// the following round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done(FinishReason::ToolCalls),
            ],
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Done(FinishReason::Stop),
            ],
        ])
    }
}

#[async_trait]
impl crate::ChatService for ScriptedMockService {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn stream_chat(
        &self,
        req: CompletionRequest,
        _signal: CancelToken,
    ) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done(FinishReason::Stop),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ResponseEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
