// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! xAI driver.
//!
//! Speaks the standard wire format with two deviations: the penalty sampling
//! fields are rejected by the API and therefore omitted, and streams are
//! allowed to run much longer than other dialects (reasoning models may hold
//! a connection open for most of an hour).

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    openai_compat::{AuthStyle, OpenAICompatProvider},
    provider::ResponseStream,
    CompletionRequest, Timeouts,
};

/// Minimum stream timeout granted to xAI calls.
const XAI_STREAM_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub struct XaiProvider {
    inner: OpenAICompatProvider,
}

impl XaiProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        endpoint: Option<String>,
        mut timeouts: Timeouts,
    ) -> Self {
        timeouts.stream = timeouts.stream.max(XAI_STREAM_TIMEOUT);
        let inner = match endpoint {
            // A configured endpoint is the full chat-completions URL.
            Some(url) if !url.is_empty() => OpenAICompatProvider::with_full_chat_url(
                "xai",
                model,
                api_key,
                url,
                timeouts,
                AuthStyle::Bearer,
                false,
            ),
            _ => OpenAICompatProvider::with_full_chat_url(
                "xai",
                model,
                api_key,
                "https://api.x.ai/v1/chat/completions",
                timeouts,
                AuthStyle::Bearer,
                false,
            ),
        };
        Self { inner }
    }
}

#[async_trait]
impl crate::ModelProvider for XaiProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.inner.complete(req).await
    }
}
