use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat-completions request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into() }
    }
}

/// Request sent to a model provider.
///
/// Carries the full sampling parameter set; dialects that do not accept a
/// parameter (xAI rejects the penalty fields) drop it at serialization time,
/// so callers never need provider-specific request shapes.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier forwarded verbatim to the API.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

/// Timeout pair applied to every provider call.
///
/// `request` bounds connection establishment; `stream` bounds the total
/// lifetime of the streaming response.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub request: std::time::Duration,
    pub stream: std::time::Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: std::time::Duration::from_secs(60),
            stream: std::time::Duration::from_secs(300),
        }
    }
}

// ─── Streamed response events ─────────────────────────────────────────────────

/// Why the provider stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishKind {
    /// Natural end of generation.
    Stop,
    /// The output-token limit was hit; the text is truncated.
    Length,
    /// The provider's content filter intervened.
    ContentFilter,
    /// Any finish reason this crate does not model explicitly.
    Other(String),
}

impl FinishKind {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single streamed event from the model.
///
/// The stream is finite and single-pass: consumers read it to exhaustion
/// exactly once.  `Done` corresponds to the SSE `[DONE]` sentinel and is
/// always the last meaningful event of a well-formed stream.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// The provider reported a finish reason for the choice.
    Finish(FinishKind),
    /// Final usage statistics.
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
    },
    /// The stream finished normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
