// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Azure-style driver.
//!
//! Azure-hosted deployments authenticate with an `api-key` header instead of
//! a bearer token, and the configured endpoint is already deployment-specific
//! (it encodes the deployment name and API version), so the URL is used
//! verbatim rather than derived from a base.

use async_trait::async_trait;

use crate::{
    openai_compat::{AuthStyle, OpenAICompatProvider},
    provider::ResponseStream,
    CompletionRequest, Timeouts,
};

pub struct AzureProvider {
    inner: OpenAICompatProvider,
}

impl AzureProvider {
    /// `endpoint` is the full chat-completions URL of the deployment.
    pub fn new(
        model: String,
        api_key: Option<String>,
        endpoint: String,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            inner: OpenAICompatProvider::with_full_chat_url(
                "azure",
                model,
                api_key,
                endpoint,
                timeouts,
                AuthStyle::ApiKeyHeader,
                true,
            ),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for AzureProvider {
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
