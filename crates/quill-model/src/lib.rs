// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Model-facing types and chat drivers.
//!
//! Two wire shapes are supported behind one [`ChatService`] contract:
//! the OpenAI-compatible `/chat/completions` format and the Anthropic
//! `/v1/messages` content-block format.  Both drivers stream server-sent
//! events, honour the per-turn [`CancelToken`], filter orphan tool
//! messages before building a request, and retry transient HTTP failures
//! with exponential backoff.

mod anthropic;
pub mod cancel;
mod mock;
mod openai_compat;
pub mod retry;
pub mod sanitize;
mod service;
mod types;

pub use anthropic::AnthropicService;
pub use cancel::CancelToken;
pub use mock::{MockService, ScriptedMockService};
pub use openai_compat::OpenAiCompatService;
pub use service::{
    from_config, is_abort_error, ChatResponse, ChatService, ProviderError, ResponseStream,
};
pub use types::{
    AssembledToolCall, CompletionRequest, ContentPart, FinishReason, FunctionCall, Message,
    MessageContent, ResponseEvent, Role, ToolSchema, Usage,
};
