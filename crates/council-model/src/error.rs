// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Typed failures from the provider layer.
///
/// Streams and `complete()` surface these wrapped in `anyhow::Error`; callers
/// that need to classify a failure (the retry loop in the router) recover the
/// typed value with `downcast_ref::<ModelError>()`.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Non-2xx response from an LLM endpoint.  The body is kept verbatim for
    /// diagnostics; it never contains key material.
    #[error("{provider} error {status}: {body}")]
    Provider {
        provider: String,
        status: u16,
        body: String,
    },

    /// The provider tag is recognised but has no adapter.
    #[error("provider `{0}` is not implemented")]
    NotImplemented(String),

    /// No API key was supplied for a provider that requires one.
    #[error("no API key configured for model `{0}`")]
    MissingKey(String),

    /// The HTTP request never produced a response (DNS, connect, timeout).
    #[error("network error calling {provider}: {message}")]
    Network { provider: String, message: String },
}

impl ModelError {
    /// True for failure classes worth retrying: rate limits and server-side
    /// errors.  Missing keys and unimplemented providers are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Provider { status, .. } => *status == 429 || *status >= 500,
            ModelError::Network { .. } => true,
            _ => false,
        }
    }
}
