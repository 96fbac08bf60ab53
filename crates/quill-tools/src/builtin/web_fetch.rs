// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CHARS: usize = 50_000;

#[derive(Default)]
pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Network
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its content as readable text.\n\
         url: http/https only. method: GET (default) | POST | HEAD.\n\
         headers: object of request headers. body: request body for POST.\n\
         timeout_secs: default 30. max_chars: default 50000.\n\
         Redirects are followed; the final URL is reported when it differs.\n\
         HTML is converted to readable text; other content is returned as-is.\n\
         Status >= 400 is an error result that still carries the response body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "HEAD"],
                    "description": "HTTP method (default GET)"
                },
                "headers": {
                    "type": "object",
                    "description": "Request headers"
                },
                "body": {
                    "type": "string",
                    "description": "Request body (POST only)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Request timeout in seconds (default 30)"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return (default 50000)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("url").and_then(|v| v.as_str()).map(str::to_string)
    }

    fn abstract_rule(&self, args: &Value) -> Option<String> {
        let url = args.get("url").and_then(|v| v.as_str())?;
        let domain = url.split("//").nth(1)?.split('/').next()?;
        Some(format!("web_fetch(*{domain}*)"))
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let Some(url) = call.args.get("url").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'url'");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::Validation,
                "url must start with http:// or https://",
            );
        }
        let method = call
            .args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let max_chars = call
            .args
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);

        debug!(url, method = %method, "web_fetch tool");

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .user_agent("quill-agent/0.1")
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::Internal,
                    format!("http client build failed: {e}"),
                );
            }
        };

        let mut req = match method.as_str() {
            "GET" => client.get(url),
            "POST" => client.post(url),
            "HEAD" => client.head(url),
            other => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::Validation,
                    format!("unsupported method {other}"),
                );
            }
        };
        if let Some(headers) = call.args.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(val) = v.as_str() {
                    req = req.header(k.as_str(), val);
                }
            }
        }
        if let Some(body) = call.args.get("body").and_then(|v| v.as_str()) {
            req = req.body(body.to_string());
        }

        let started = Instant::now();
        let resp = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => {
                return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "fetch aborted");
            }
            r = req.send() => r,
        };
        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ExecutionError,
                    format!("request timed out after {timeout}s"),
                );
            }
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    ToolErrorKind::ProviderError,
                    format!("request failed: {e}"),
                );
            }
        };

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let redirected = final_url != url;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => {
                return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "fetch aborted");
            }
            b = resp.text() => b.unwrap_or_default(),
        };
        let response_time_ms = started.elapsed().as_millis() as u64;

        let mut text = if content_type.contains("text/html") {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };
        let truncated = text.chars().count() > max_chars;
        if truncated {
            text = text.chars().take(max_chars).collect();
            text.push_str("\n... [content truncated]");
        }

        let metadata = json!({
            "status": status,
            "redirected_to": if redirected { Some(final_url.clone()) } else { None },
            "response_time_ms": response_time_ms,
            "content_type": content_type,
            "truncated": truncated,
        });

        if status >= 400 {
            // The body often explains the failure — keep it for the model.
            return ToolOutput::err(
                &call.id,
                ToolErrorKind::ExecutionError,
                format!("HTTP {status} from {final_url}\n\n{text}"),
            )
            .with_metadata(metadata);
        }

        let mut out = String::new();
        if redirected {
            out.push_str(&format!("[redirected to {final_url}]\n\n"));
        }
        out.push_str(&text);
        ToolOutput::ok(&call.id, out).with_metadata(metadata)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
