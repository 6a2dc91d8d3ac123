// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod registry;
pub(crate) mod openai_compat;
mod azure;
mod error;
mod mock;
mod openai;
mod provider;
mod types;
mod xai;

pub use azure::AzureProvider;
pub use error::ModelError;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use openai::OpenAiProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use registry::{get_driver, list_drivers, DriverMeta};
pub use types::*;
pub use xai::XaiProvider;

/// Everything needed to construct a provider for one configured model.
///
/// Produced by the credential store's `resolve` (endpoint, provider tag,
/// unsealed key) plus process-level timeout settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Provider tag, e.g. `"openai"`.
    pub provider: String,
    /// Model name forwarded to the API.
    pub model: String,
    /// Configured chat-completions endpoint.  Empty → driver default.
    pub endpoint: Option<String>,
    /// Unsealed API key.  Lives only as long as this value; never logged.
    pub api_key: Option<String>,
    /// Connect/stream timeout pair for the call.
    pub timeouts: Timeouts,
}

/// Construct a boxed [`ModelProvider`] from a resolved endpoint.
///
/// Selects the driver implementation based on the provider tag.  Recognised
/// tags without an adapter (`google`, `anthropic`) fail with
/// [`ModelError::NotImplemented`], as do tags missing from the registry.
pub fn from_endpoint(cfg: &EndpointConfig) -> Result<Box<dyn ModelProvider>, ModelError> {
    let endpoint = cfg.endpoint.clone().filter(|e| !e.is_empty());
    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(
            cfg.model.clone(),
            cfg.api_key.clone(),
            // OpenAI credentials store the full chat URL; the driver derives
            // from a base, so strip the suffix when present.
            endpoint.map(|e| {
                e.trim_end_matches('/')
                    .trim_end_matches("/chat/completions")
                    .to_string()
            }),
            cfg.timeouts,
        ))),
        "azure" => {
            let url = endpoint.ok_or_else(|| {
                ModelError::Provider {
                    provider: "azure".into(),
                    status: 0,
                    body: format!("model `{}` has no configured endpoint", cfg.model),
                }
            })?;
            Ok(Box::new(AzureProvider::new(
                cfg.model.clone(),
                cfg.api_key.clone(),
                url,
                cfg.timeouts,
            )))
        }
        "xai" => Ok(Box::new(XaiProvider::new(
            cfg.model.clone(),
            cfg.api_key.clone(),
            endpoint,
            cfg.timeouts,
        ))),
        other => Err(ModelError::NotImplemented(other.to_string())),
    }
}
