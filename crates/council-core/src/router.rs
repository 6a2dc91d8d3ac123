// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Resolution of `(user, model name)` to a live provider stream.
//!
//! The router is the seam between orchestration and the provider layer: the
//! orchestrator only ever sees the [`CompletionRouter`] trait, so tests
//! substitute scripted streams without touching HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use council_model::{
    from_endpoint, CompletionRequest, EndpointConfig, ModelError, ResponseStream, Timeouts,
};
use council_store::{CredentialStore, StoreError};

/// Routes a completion request to the provider configured for
/// `(user, model_name)` and returns the live stream.
#[async_trait]
pub trait CompletionRouter: Send + Sync {
    async fn stream(
        &self,
        user: &str,
        model_name: &str,
        req: CompletionRequest,
    ) -> anyhow::Result<ResponseStream>;
}

#[derive(Debug, Error)]
pub enum RouterError {
    /// The model has no credential entry, or the entry has no key.
    #[error("model `{0}` is not configured with an API key")]
    NotConfigured(String),
}

/// Production router: credential store resolution + driver dispatch + a
/// bounded retry loop for transient call-establishment failures.
pub struct ProviderRouter {
    credentials: Arc<CredentialStore>,
    timeouts: Timeouts,
    max_retries: u32,
}

impl ProviderRouter {
    pub fn new(credentials: Arc<CredentialStore>, timeouts: Timeouts, max_retries: u32) -> Self {
        Self {
            credentials,
            timeouts,
            max_retries,
        }
    }
}

#[async_trait]
impl CompletionRouter for ProviderRouter {
    async fn stream(
        &self,
        user: &str,
        model_name: &str,
        req: CompletionRequest,
    ) -> anyhow::Result<ResponseStream> {
        let resolved = match self.credentials.resolve(user, model_name).await {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => {
                return Err(RouterError::NotConfigured(model_name.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };
        let api_key = resolved
            .api_key
            .ok_or_else(|| RouterError::NotConfigured(model_name.to_string()))?;

        let provider = from_endpoint(&EndpointConfig {
            provider: resolved.provider.as_str().to_string(),
            model: model_name.to_string(),
            endpoint: Some(resolved.endpoint),
            api_key: Some(api_key),
            timeouts: self.timeouts,
        })?;

        // Retries cover establishing the call only.  Once the first chunk
        // has been handed to the orchestrator the stream is never replayed:
        // the partial output is already persisted and published.
        let mut attempt: u32 = 0;
        loop {
            match provider.complete(req.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.max_retries && is_transient(&e) => {
                    attempt += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    warn!(
                        model = %model_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider failure, retrying: {e:#}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ModelError>()
        .map(ModelError::is_transient)
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
