// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Web search with keyless providers tried in order: the DuckDuckGo HTML
//! endpoint first, then a list of public SearXNG instances.  Results are
//! merged, domain-filtered, and capped at 8.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::tool::{ExecutionContext, Tool, ToolCall, ToolErrorKind, ToolKind, ToolOutput};

const MAX_RESULTS: usize = 8;

const SEARXNG_INSTANCES: &[&str] = &[
    "https://searx.be",
    "https://search.sapti.me",
    "https://searx.tiekoetter.com",
];

#[derive(Debug, Clone)]
struct SearchResult {
    title: String,
    url: String,
    snippet: String,
}

#[derive(Default)]
pub struct WebSearchTool {
    /// Override the provider endpoints (tests point this at a local server).
    pub searxng_instances: Option<Vec<String>>,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Network
    }

    fn description(&self) -> &str {
        "Search the web. query: the search terms.\n\
         allowed_domains / blocked_domains: optional lists applied to the\n\
         merged results. At most 8 results are returned, each with title,\n\
         URL, and snippet. Include the current year in queries about recent\n\
         events. Cite sources when answering from results."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "allowed_domains": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Only keep results from these domains"
                },
                "blocked_domains": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Drop results from these domains"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn signature_content(&self, args: &Value) -> Option<String> {
        args.get("query")
            .and_then(|v| v.as_str())
            .map(|q| format!("search:{}", q.to_lowercase()))
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let Some(query) = call.args.get("query").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, ToolErrorKind::Validation, "missing 'query'");
        };
        let allowed = string_list(&call.args, "allowed_domains");
        let blocked = string_list(&call.args, "blocked_domains");

        debug!(query, "web_search tool");

        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
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

        // Providers in order; the first one that yields results wins, the
        // rest are never contacted.
        let mut results: Vec<SearchResult> = Vec::new();
        let mut provider = "none";

        let ddg = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => {
                return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "search aborted");
            }
            r = duckduckgo_search(&client, query) => r,
        };
        match ddg {
            Ok(r) if !r.is_empty() => {
                provider = "duckduckgo";
                results = r;
            }
            Ok(_) => {}
            Err(e) => warn!("duckduckgo search failed: {e:#}"),
        }

        if results.is_empty() {
            let instances: Vec<String> = self
                .searxng_instances
                .clone()
                .unwrap_or_else(|| SEARXNG_INSTANCES.iter().map(|s| s.to_string()).collect());
            for instance in instances {
                if ctx.signal.is_cancelled() {
                    return ToolOutput::err(&call.id, ToolErrorKind::Aborted, "search aborted");
                }
                match searxng_search(&client, &instance, query).await {
                    Ok(r) if !r.is_empty() => {
                        provider = "searxng";
                        results = r;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(instance, "searxng search failed: {e:#}"),
                }
            }
        }

        // Domain filtering applies after the merge, then the cap.
        results.retain(|r| {
            let domain = domain_of(&r.url);
            if !allowed.is_empty() && !allowed.iter().any(|d| domain_matches(&domain, d)) {
                return false;
            }
            !blocked.iter().any(|d| domain_matches(&domain, d))
        });
        results.truncate(MAX_RESULTS);

        if results.is_empty() {
            return ToolOutput::ok(&call.id, "(no results)")
                .with_metadata(json!({ "provider": provider, "count": 0 }));
        }

        let count = results.len();
        let body: Vec<String> = results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. **{}**\n   {}\n   {}", i + 1, r.title, r.url, r.snippet))
            .collect();

        ToolOutput::ok(&call.id, body.join("\n\n"))
            .with_metadata(json!({ "provider": provider, "count": count }))
    }
}

fn string_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn domain_of(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("")
        .to_string()
}

/// `filter` matches `domain` exactly or as a parent domain on a label
/// boundary: `example.com` covers `docs.example.com` but never
/// `notexample.com`.
fn domain_matches(domain: &str, filter: &str) -> bool {
    domain == filter || domain.ends_with(&format!(".{filter}"))
}

/// Scrape the DuckDuckGo HTML endpoint (no API key required).
async fn duckduckgo_search(
    client: &reqwest::Client,
    query: &str,
) -> anyhow::Result<Vec<SearchResult>> {
    let url = format!("https://html.duckduckgo.com/html/?q={}", urlencode(query));
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("duckduckgo returned {}", resp.status());
    }
    let html = resp.text().await?;
    Ok(parse_duckduckgo_html(&html))
}

/// Extract `result__a` links and `result__snippet` text from the DDG HTML.
fn parse_duckduckgo_html(html: &str) -> Vec<SearchResult> {
    let link_re = regex::Regex::new(
        r#"<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#,
    )
    .expect("static regex");
    let snippet_re = regex::Regex::new(
        r#"<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#,
    )
    .expect("static regex");

    let snippets: Vec<String> = snippet_re
        .captures_iter(html)
        .map(|c| strip_tags(&c[1]))
        .collect();

    link_re
        .captures_iter(html)
        .enumerate()
        .map(|(i, c)| SearchResult {
            url: decode_ddg_redirect(&c[1]),
            title: strip_tags(&c[2]),
            snippet: snippets.get(i).cloned().unwrap_or_default(),
        })
        .filter(|r| !r.url.is_empty())
        .collect()
}

/// DDG wraps result URLs in a `/l/?uddg=<encoded>` redirect.
fn decode_ddg_redirect(href: &str) -> String {
    if let Some(pos) = href.find("uddg=") {
        let enc = &href[pos + 5..];
        let enc = enc.split('&').next().unwrap_or(enc);
        return urldecode(enc);
    }
    href.to_string()
}

/// Query a SearXNG instance's JSON API.
async fn searxng_search(
    client: &reqwest::Client,
    instance: &str,
    query: &str,
) -> anyhow::Result<Vec<SearchResult>> {
    let url = format!(
        "{}/search?q={}&format=json",
        instance.trim_end_matches('/'),
        urlencode(query)
    );
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("{instance} returned {}", resp.status());
    }
    let body: Value = resp.json().await?;
    let results = body
        .get("results")
        .and_then(|r| r.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[]);
    Ok(results
        .iter()
        .filter_map(|r| {
            Some(SearchResult {
                title: r.get("title")?.as_str()?.to_string(),
                url: r.get("url")?.as_str()?.to_string(),
                snippet: r
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .collect())
}

fn strip_tags(html: &str) -> String {
    let re = regex::Regex::new(r"<[^>]+>").expect("static regex");
    let text = re.replace_all(html, "");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_string()
}

fn urlencode(s: &str) -> String {
    let mut encoded = String::new();
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => encoded.push(c),
            ' ' => encoded.push('+'),
            c => {
                for byte in c.to_string().as_bytes() {
                    encoded.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    encoded
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                if let Ok(b) = u8::from_str_radix(hex, 16) {
                    out.push(b);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
