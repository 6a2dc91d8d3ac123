// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared base implementation for OpenAI-compatible chat completion APIs.
//!
//! All supported dialects speak the same `/chat/completions` SSE wire
//! format; they differ only in how the key is attached and which sampling
//! fields the endpoint accepts.  This module provides a single
//! `OpenAICompatProvider` that each named driver configures with its own
//! defaults.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (OpenAI, xAI)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure-hosted deployments)

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::ModelError, provider::ResponseStream, CompletionRequest, FinishKind, ResponseEvent,
    Timeouts,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — standard for most providers.
    Bearer,
    /// `api-key: <key>` — Azure style.
    ApiKeyHeader,
}

/// OpenAI-compatible chat completion provider.
///
/// Used as the implementation for every dialect that speaks the standard
/// `/chat/completions` SSE streaming wire format.
pub struct OpenAICompatProvider {
    /// Provider id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API when the request does not set one.
    model: String,
    /// API key (pre-resolved by the credential store).
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    /// Whether `presence_penalty` / `frequency_penalty` are sent.  xAI
    /// rejects them, so its driver turns this off.
    send_penalties: bool,
    client: reqwest::Client,
    auth_style: AuthStyle,
}

impl OpenAICompatProvider {
    /// Construct a provider from an API base URL (the part **before**
    /// `/chat/completions`).
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        timeouts: Timeouts,
        auth_style: AuthStyle,
        send_penalties: bool,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            send_penalties,
            client: build_client(timeouts),
            auth_style,
        }
    }

    /// Construct a provider from a **pre-built** chat completions URL.
    ///
    /// Use this when the full URL cannot be derived by appending
    /// `/chat/completions` to a base — e.g. Azure, where the configured
    /// endpoint already encodes the deployment name and API version.
    pub fn with_full_chat_url(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        chat_url: impl Into<String>,
        timeouts: Timeouts,
        auth_style: AuthStyle,
        send_penalties: bool,
    ) -> Self {
        Self {
            driver_name,
            model,
            api_key,
            chat_url: chat_url.into(),
            send_penalties,
            client: build_client(timeouts),
            auth_style,
        }
    }

    #[cfg(test)]
    pub(crate) fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

/// The request timeout bounds connection establishment; the stream timeout
/// bounds the whole response body, which for SSE is the entire generation.
fn build_client(timeouts: Timeouts) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(timeouts.request)
        .timeout(timeouts.stream)
        .build()
        .unwrap_or_default()
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let body = build_request_body(&self.model, &req, self.send_penalties);

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ModelError::MissingKey(self.model.clone()))?;
        http_req = match self.auth_style {
            AuthStyle::Bearer => http_req.bearer_auth(key),
            AuthStyle::ApiKeyHeader => http_req.header("api-key", key),
        };

        let resp = http_req.send().await.map_err(|e| ModelError::Network {
            provider: self.driver_name.to_string(),
            message: e.to_string(),
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Provider {
                provider: self.driver_name.to_string(),
                status,
                body,
            }
            .into());
        }

        let byte_stream = resp.bytes_stream();
        // Carry a line buffer from chunk to chunk; only finished lines are
        // parsed, so an event straddling a read boundary is never lost.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Build the JSON request body for a chat-completions call.
///
/// Extracted as a free function so the dialect differences (penalty fields)
/// can be unit-tested without making HTTP requests.
pub(crate) fn build_request_body(
    fallback_model: &str,
    req: &CompletionRequest,
    send_penalties: bool,
) -> Value {
    let model = if req.model.is_empty() {
        fallback_model
    } else {
        &req.model
    };
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
        "top_p": req.top_p,
        "stream_options": { "include_usage": true },
    });
    if send_penalties {
        body["presence_penalty"] = json!(req.presence_penalty);
        body["frequency_penalty"] = json!(req.frequency_penalty);
    }
    body
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, lines without the `data: `
/// prefix, or unparseable payloads (all skipped per the SSE contract).
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v).map(Ok)
}

/// Split every finished line out of `buf` and parse each into an event.
///
/// HTTP chunk boundaries do not respect SSE framing: one event can arrive
/// spread over several reads, and one read can carry several events.
/// Everything up to the last newline is consumed here; an unterminated tail
/// stays in `buf` until a later chunk completes it.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let Some(last_newline) = buf.rfind('\n') else {
        return Vec::new();
    };
    let finished: String = buf.drain(..=last_newline).collect();
    // `lines()` also absorbs the \r of CRLF-framed streams.
    finished.lines().filter_map(parse_sse_data_line).collect()
}

fn parse_sse_chunk(v: &Value) -> Option<ResponseEvent> {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
        let total = usage["total_tokens"]
            .as_u64()
            .map(|t| t as u32)
            .unwrap_or(prompt + completion);
        return Some(ResponseEvent::Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        });
    }

    let choice = &v["choices"][0];

    if let Some(reason) = choice["finish_reason"].as_str() {
        return Some(ResponseEvent::Finish(FinishKind::from_wire(reason)));
    }

    // Text delta.  Chunks with no content (role-only preamble chunks) are
    // skipped rather than surfaced as empty deltas.
    choice["delta"]
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|t| !t.is_empty())
        .map(|t| ResponseEvent::TextDelta(t.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
