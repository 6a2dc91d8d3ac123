// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Top-level process configuration.
///
/// Loaded once at startup by [`crate::load`]; every subsystem receives the
/// slice of it that it needs.  All fields have defaults so an empty config
/// file (or no config file at all) yields a runnable server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Model name used for the Creator persona when a session config leaves
    /// it unset.
    #[serde(default = "default_creator_model")]
    pub default_creator_model: String,
    /// Model name used for Reviewer personas when a session config leaves
    /// them unset.
    #[serde(default = "default_reviewer_model")]
    pub default_reviewer_model: String,
    /// Per-request timeout for non-streaming provider calls, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Total timeout for a streaming provider call, in seconds.  Streams are
    /// long-lived; this bounds a stalled connection, not a healthy one.
    /// xAI streams override this upward (they allow up to an hour).
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_seconds: u64,
    /// Retry budget for transient provider failures (network, 5xx, 429).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// HTTP listen address for the API server.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Pre-declared model endpoints.  Used as an endpoint catalog: when a
    /// user registers a model by name without an explicit endpoint, the
    /// matching entry here supplies endpoint and provider tag.
    #[serde(default)]
    pub models: Vec<ModelCatalogEntry>,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_creator_model: default_creator_model(),
            default_reviewer_model: default_reviewer_model(),
            request_timeout_seconds: default_request_timeout(),
            stream_timeout_seconds: default_stream_timeout(),
            max_retries: default_max_retries(),
            listen_addr: default_listen_addr(),
            models: Vec::new(),
            orchestration: OrchestrationConfig::default(),
            persistence: PersistenceConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

fn default_creator_model() -> String {
    "gpt-4o".into()
}
fn default_reviewer_model() -> String {
    "gpt-4o-mini".into()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_stream_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    2
}
fn default_listen_addr() -> String {
    "127.0.0.1:8700".into()
}

/// A pre-declared model endpoint (no key material — keys are always
/// registered per user through the credential store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    /// Model identifier forwarded to the provider API.
    pub model_name: String,
    /// Optional human-readable label.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Chat-completions endpoint URL.
    pub endpoint: String,
    /// Provider tag: "openai" | "azure" | "google" | "xai" | "anthropic".
    pub provider: String,
}

/// Knobs for the Creator–Reviewer iteration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Iteration ceiling applied when a session config leaves it unset.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    /// Literal substring whose first occurrence in a Creator draft ends the
    /// session.
    #[serde(default = "default_stop_marker")]
    pub default_stop_marker: String,
    /// Whether unanimous reviewer sign-off ends the session (after one final
    /// incorporation iteration).
    #[serde(default = "default_true")]
    pub stop_on_reviewer_approved: bool,
    /// Upper bound on the characters of any single prompt message sent to a
    /// provider.  Longer content is clipped to the budget before sending.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    /// Upper bound on the characters of a draft embedded into a reviewer
    /// prompt.
    #[serde(default = "default_max_draft_chars")]
    pub max_draft_chars: usize,
    /// How many recent session messages the Creator sees each iteration.
    /// Reviewers see half this many of their own prior critiques.
    #[serde(default = "default_context_turns")]
    pub context_turns_to_send: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            default_stop_marker: default_stop_marker(),
            stop_on_reviewer_approved: true,
            max_prompt_chars: default_max_prompt_chars(),
            max_draft_chars: default_max_draft_chars(),
            context_turns_to_send: default_context_turns(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_iterations() -> u32 {
    4
}
fn default_stop_marker() -> String {
    "FINAL:".into()
}
fn default_max_prompt_chars() -> usize {
    24_000
}
fn default_max_draft_chars() -> usize {
    60_000
}
fn default_context_turns() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// When false the server runs on a throwaway in-memory database.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database path.
    #[serde(default = "default_connection_string")]
    pub connection_string: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connection_string: default_connection_string(),
        }
    }
}

fn default_connection_string() -> String {
    "council.db".into()
}

/// GCRA rate limit applied to mutating API routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_permit_limit")]
    pub permit_limit: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permit_limit: default_permit_limit(),
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_permit_limit() -> u32 {
    60
}
fn default_window_seconds() -> u64 {
    60
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
