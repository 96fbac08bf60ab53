// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire-format tests: bind a minimal HTTP/1.1 mock server on loopback,
//! point each driver at it, issue a `CompletionRequest`, and assert both
//! the HTTP request the driver sent and the `ResponseEvent`s it emitted.
//!
//! No API keys, no external network — the full pipeline is exercised:
//! history sanitisation → serialisation → HTTP → SSE parsing.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use quill_model::{
    AnthropicService, CancelToken, ChatService, CompletionRequest, FinishReason, Message,
    OpenAiCompatService, ProviderError, ResponseEvent, ToolSchema,
};

// ── Minimal HTTP/1.1 mock server ──────────────────────────────────────────────

#[derive(Debug)]
struct CapturedRequest {
    path: String,
    headers: HashMap<String, String>,
    body: Value,
}

/// Bind a mock server that serves `responses` to sequential connections
/// (one request per connection).  Captured requests arrive on the channel
/// in order.
async fn mock_server(
    responses: Vec<(u16, &'static str, String)>,
) -> (u16, mpsc::UnboundedReceiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for (status, content_type, resp_body) in responses {
            let Ok((stream, _)) = listener.accept().await else { return };
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.unwrap();
            let path = request_line.split(' ').nth(1).unwrap_or("").to_string();

            let mut headers: HashMap<String, String> = HashMap::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    break;
                }
                if let Some((k, v)) = trimmed.split_once(": ") {
                    let key = k.to_lowercase();
                    if key == "content-length" {
                        content_length = v.parse().unwrap_or(0);
                    }
                    headers.insert(key, v.to_string());
                }
            }

            let mut body_bytes = vec![0u8; content_length];
            reader.read_exact(&mut body_bytes).await.unwrap();
            let body: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);

            let _ = tx.send(CapturedRequest { path, headers, body });

            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{resp_body}",
                resp_body.len(),
            );
            let _ = write_half.write_all(response.as_bytes()).await;
            let _ = write_half.shutdown().await;
        }
    });

    (port, rx)
}

fn sse(lines: &[&str]) -> String {
    lines.iter().map(|l| format!("data: {l}\n")).collect()
}

async fn collect(service: &dyn ChatService, req: CompletionRequest) -> Vec<ResponseEvent> {
    let mut stream = service.stream_chat(req, CancelToken::new()).await.unwrap();
    let mut events = Vec::new();
    while let Some(ev) = stream.next().await {
        events.push(ev.unwrap());
    }
    events
}

fn tool_schema() -> ToolSchema {
    ToolSchema {
        name: "read".into(),
        description: "read a file".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"],
        }),
    }
}

// ── OpenAI-compatible driver ──────────────────────────────────────────────────

#[tokio::test]
async fn openai_posts_chat_completions_with_bearer_auth() {
    let body = sse(&[
        r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
        r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        "[DONE]",
    ]);
    let (port, mut captured) = mock_server(vec![(200, "text/event-stream", body)]).await;
    let service = OpenAiCompatService::new(
        "test-model".into(),
        Some("sk-test".into()),
        Some(format!("http://127.0.0.1:{port}/v1")),
        None,
        None,
    );

    let events = collect(
        &service,
        CompletionRequest {
            messages: vec![Message::system("be terse"), Message::user("hi")],
            tools: vec![tool_schema()],
            stream: true,
        },
    )
    .await;

    let req = captured.recv().await.unwrap();
    assert_eq!(req.path, "/v1/chat/completions");
    assert_eq!(req.headers.get("authorization").unwrap(), "Bearer sk-test");
    assert_eq!(req.body["model"], "test-model");
    assert_eq!(req.body["messages"][0]["role"], "system");
    assert_eq!(req.body["messages"][1]["role"], "user");
    assert_eq!(req.body["tools"][0]["function"]["name"], "read");

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            ResponseEvent::TextDelta(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello");
    assert!(events
        .iter()
        .any(|e| matches!(e, ResponseEvent::Done(FinishReason::Stop))));
}

#[tokio::test]
async fn openai_coalesces_parallel_tool_calls_into_one_assistant_message() {
    let body = sse(&[r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#, "[DONE]"]);
    let (port, mut captured) = mock_server(vec![(200, "text/event-stream", body)]).await;
    let service = OpenAiCompatService::new(
        "m".into(),
        Some("k".into()),
        Some(format!("http://127.0.0.1:{port}/v1")),
        None,
        None,
    );

    collect(
        &service,
        CompletionRequest {
            messages: vec![
                Message::user("go"),
                Message::tool_call("a", "read", "{}"),
                Message::tool_call("b", "grep", "{}"),
                Message::tool_result("a", "one"),
                Message::tool_result("b", "two"),
            ],
            tools: vec![],
            stream: true,
        },
    )
    .await;

    let req = captured.recv().await.unwrap();
    let messages = req.body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 4); // user, assistant(tool_calls×2), tool, tool
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["tool_calls"].as_array().unwrap().len(), 2);
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[3]["role"], "tool");
}

#[tokio::test]
async fn openai_filters_orphan_tool_results_before_sending() {
    let body = sse(&["[DONE]"]);
    let (port, mut captured) = mock_server(vec![(200, "text/event-stream", body)]).await;
    let service = OpenAiCompatService::new(
        "m".into(),
        Some("k".into()),
        Some(format!("http://127.0.0.1:{port}/v1")),
        None,
        None,
    );

    collect(
        &service,
        CompletionRequest {
            messages: vec![
                Message::user("hi"),
                // No prior assistant tool call with this id exists.
                Message::tool_result("ghost", "stale"),
            ],
            tools: vec![],
            stream: true,
        },
    )
    .await;

    let req = captured.recv().await.unwrap();
    let messages = req.body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1, "orphan tool message leaked: {messages:?}");
}

#[tokio::test]
async fn openai_streams_tool_call_fragments_by_index() {
    let body = sse(&[
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c0","function":{"name":"read","arguments":"{\"pa"}}]}}]}"#,
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"/x\"}"}}]}}]}"#,
        r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        "[DONE]",
    ]);
    let (port, _captured) = mock_server(vec![(200, "text/event-stream", body)]).await;
    let service = OpenAiCompatService::new(
        "m".into(),
        Some("k".into()),
        Some(format!("http://127.0.0.1:{port}/v1")),
        None,
        None,
    );

    let resp = service
        .chat(
            CompletionRequest { messages: vec![Message::user("go")], tools: vec![], stream: true },
            CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resp.tool_calls.len(), 1);
    assert_eq!(resp.tool_calls[0].id, "c0");
    assert_eq!(resp.tool_calls[0].arguments, r#"{"path":"/x"}"#);
    assert_eq!(resp.finish_reason, Some(FinishReason::ToolCalls));
}

#[tokio::test]
async fn openai_retries_transient_500_then_succeeds() {
    let ok_body = sse(&[r#"{"choices":[{"delta":{"content":"ok"}}]}"#, "[DONE]"]);
    let (port, mut captured) = mock_server(vec![
        (500, "application/json", r#"{"error":"overloaded"}"#.to_string()),
        (200, "text/event-stream", ok_body),
    ])
    .await;
    let service = OpenAiCompatService::new(
        "m".into(),
        Some("k".into()),
        Some(format!("http://127.0.0.1:{port}/v1")),
        None,
        None,
    );

    let resp = service
        .chat(
            CompletionRequest { messages: vec![Message::user("hi")], tools: vec![], stream: true },
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(resp.text, "ok");

    // Both attempts reached the server.
    assert!(captured.recv().await.is_some());
    assert!(captured.recv().await.is_some());
}

#[tokio::test]
async fn openai_auth_failure_is_not_retried() {
    let (port, mut captured) = mock_server(vec![
        (401, "application/json", r#"{"error":"bad key"}"#.to_string()),
        (200, "text/event-stream", sse(&["[DONE]"])),
    ])
    .await;
    let service = OpenAiCompatService::new(
        "m".into(),
        Some("bad".into()),
        Some(format!("http://127.0.0.1:{port}/v1")),
        None,
        None,
    );

    let err = service
        .stream_chat(
            CompletionRequest { messages: vec![Message::user("hi")], tools: vec![], stream: true },
            CancelToken::new(),
        )
        .await
        .map(|_| ())
        .unwrap_err();
    match err.downcast_ref::<ProviderError>() {
        Some(ProviderError::Api { status, .. }) => assert_eq!(*status, 401),
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(captured.recv().await.is_some());
    assert!(captured.try_recv().is_err(), "401 must not be retried");
}

// ── Anthropic driver ──────────────────────────────────────────────────────────

#[tokio::test]
async fn anthropic_lifts_system_and_repairs_alternation() {
    let body = sse(&[r#"{"type":"message_stop"}"#]);
    let (port, mut captured) = mock_server(vec![(200, "text/event-stream", body)]).await;
    let service = AnthropicService::new(
        "claude-sonnet-4-20250514".into(),
        Some("sk-ant-test".into()),
        Some(format!("http://127.0.0.1:{port}")),
        None,
        None,
    );

    // [system, user, tool, tool, assistant, user] with valid call ids →
    // system field set, messages [user(+tool_result blocks), assistant, user].
    collect(
        &service,
        CompletionRequest {
            messages: vec![
                Message::system("be helpful"),
                Message::tool_call("a", "read", "{}"),
                Message::tool_call("b", "grep", "{}"),
                Message::user("please"),
                Message::tool_result("a", "one"),
                Message::tool_result("b", "two"),
                Message::assistant("ok"),
                Message::user("next"),
            ],
            tools: vec![tool_schema()],
            stream: true,
        },
    )
    .await;

    let req = captured.recv().await.unwrap();
    assert_eq!(req.path, "/v1/messages");
    assert_eq!(req.headers.get("x-api-key").unwrap(), "sk-ant-test");
    assert!(req.headers.contains_key("anthropic-version"));
    assert_eq!(req.body["system"], "be helpful");
    assert_eq!(req.body["tools"][0]["input_schema"]["type"], "object");

    let messages = req.body["messages"].as_array().unwrap();
    // user placeholder not needed: tool calls open an assistant turn after
    // a prepended user? Here the first non-system is the assistant tool
    // call, so the placeholder user comes first.
    let roles: Vec<&str> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant", "user"]);
    // The merged user turn carries text + both tool results.
    let merged = messages[2]["content"].as_array().unwrap();
    assert_eq!(merged.len(), 3);
    assert_eq!(merged[0]["type"], "text");
    assert_eq!(merged[1]["type"], "tool_result");
    assert_eq!(merged[1]["tool_use_id"], "a");
    assert_eq!(merged[2]["tool_use_id"], "b");
}

#[tokio::test]
async fn anthropic_assembles_tool_use_on_block_stop() {
    let body = sse(&[
        r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":0}}}"#,
        r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"read"}}"#,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"/x\"}"}}"#,
        r#"{"type":"content_block_stop","index":0}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
        r#"{"type":"message_stop"}"#,
    ]);
    let (port, _captured) = mock_server(vec![(200, "text/event-stream", body)]).await;
    let service = AnthropicService::new(
        "m".into(),
        Some("k".into()),
        Some(format!("http://127.0.0.1:{port}")),
        None,
        None,
    );

    let resp = service
        .chat(
            CompletionRequest { messages: vec![Message::user("go")], tools: vec![], stream: true },
            CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resp.tool_calls.len(), 1);
    assert_eq!(resp.tool_calls[0].id, "toolu_1");
    assert_eq!(resp.tool_calls[0].name, "read");
    assert_eq!(resp.tool_calls[0].arguments, r#"{"path":"/x"}"#);
    assert_eq!(resp.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(resp.usage.input_tokens, 12);
    assert_eq!(resp.usage.output_tokens, 9);
}

#[tokio::test]
async fn anthropic_maps_max_tokens_stop_reason_to_length() {
    let body = sse(&[
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"truncat"}}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"}}"#,
        r#"{"type":"message_stop"}"#,
    ]);
    let (port, _captured) = mock_server(vec![(200, "text/event-stream", body)]).await;
    let service = AnthropicService::new(
        "m".into(),
        Some("k".into()),
        Some(format!("http://127.0.0.1:{port}")),
        None,
        None,
    );

    let resp = service
        .chat(
            CompletionRequest { messages: vec![Message::user("go")], tools: vec![], stream: true },
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(resp.finish_reason, Some(FinishReason::Length));
    assert_eq!(resp.text, "truncat");
}

#[tokio::test]
async fn cancelled_token_aborts_before_any_request() {
    // No server at all — a request attempt would error differently.
    let service = OpenAiCompatService::new(
        "m".into(),
        Some("k".into()),
        Some("http://127.0.0.1:9/v1".into()),
        None,
        None,
    );
    let signal = CancelToken::new();
    signal.cancel();

    let err = service
        .stream_chat(
            CompletionRequest { messages: vec![Message::user("hi")], tools: vec![], stream: true },
            signal,
        )
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(quill_model::is_abort_error(&err), "expected abort, got: {err:#}");
}
