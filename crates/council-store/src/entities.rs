// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The `author` value used for Creator-persona messages.  Reviewer messages
/// use the reviewer's configured id instead.
pub const CREATOR_PERSONA: &str = "Creator";

// ─── Enumerations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Terminal states are sticky: no further iterations run unless an
    /// explicit re-iterate call re-opens the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    None,
    FinalMarkerDetected,
    UserStopped,
    MaxIterationsReached,
    ReviewerApproved,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FinalMarkerDetected => "final_marker_detected",
            Self::UserStopped => "user_stopped",
            Self::MaxIterationsReached => "max_iterations_reached",
            Self::ReviewerApproved => "reviewer_approved",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "final_marker_detected" => Some(Self::FinalMarkerDetected),
            "user_stopped" => Some(Self::UserStopped),
            "max_iterations_reached" => Some(Self::MaxIterationsReached),
            "reviewer_approved" => Some(Self::ReviewerApproved),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Iterate until a stop condition fires.
    Auto,
    /// Pause after every iteration and wait for an explicit step.
    Step,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Step => "step",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "step" => Some(Self::Step),
            _ => None,
        }
    }
}

/// Provider tag of a configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Azure,
    Google,
    XAI,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Azure => "azure",
            Self::Google => "google",
            Self::XAI => "xai",
            Self::Anthropic => "anthropic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAI),
            "azure" => Some(Self::Azure),
            "google" => Some(Self::Google),
            "xai" => Some(Self::XAI),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

// ─── Persona configuration ────────────────────────────────────────────────────

/// Sampling and prompt configuration for one persona.
///
/// Snapshotted into the session at creation; later edits of the user's model
/// roster never mutate an in-flight session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConfig {
    pub root_prompt: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl PersonaConfig {
    /// Range checks per the persona contract.  Returns a human-readable
    /// description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err("modelName must not be empty".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!("temperature {} out of range [0, 2]", self.temperature));
        }
        if self.max_output_tokens == 0 {
            return Err("maxOutputTokens must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("topP {} out of range [0, 1]", self.top_p));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(format!(
                "presencePenalty {} out of range [-2, 2]",
                self.presence_penalty
            ));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(format!(
                "frequencyPenalty {} out of range [-2, 2]",
                self.frequency_penalty
            ));
        }
        Ok(())
    }
}

/// A reviewer persona: sampling config plus a stable identity within the
/// session.  The ordered reviewer list defines reviewer identity across
/// iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerConfig {
    pub id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub persona: PersonaConfig,
}

// ─── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    pub stop_reason: StopReason,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub feedback_version: u32,
    pub stop_marker: String,
    pub stop_on_reviewer_approved: bool,
    pub run_mode: RunMode,
    pub topic: String,
    pub final_content: Option<String>,
    pub creator: PersonaConfig,
    pub reviewers: Vec<ReviewerConfig>,
    /// Set when every reviewer approved and one more Creator iteration must
    /// run before completing with `ReviewerApproved`.
    #[serde(skip)]
    pub needs_final_iteration: bool,
    /// User guidance queued by a post-completion re-iterate call; consumed
    /// by the next Creator prompt assembly.
    #[serde(skip)]
    pub pending_guidance: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Distinct model names referenced by this session's personas, in
    /// first-use order.  Used by the start gate to check for missing keys.
    pub fn referenced_models(&self) -> Vec<String> {
        let mut models = vec![self.creator.model_name.clone()];
        for r in &self.reviewers {
            if !models.contains(&r.persona.model_name) {
                models.push(r.persona.model_name.clone());
            }
        }
        models
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    /// `CREATOR_PERSONA` or a reviewer id.
    pub author: String,
    pub iteration: u32,
    pub content: String,
    pub model_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn is_creator(&self) -> bool {
        self.author == CREATOR_PERSONA
    }
}

// ─── Feedback rounds ──────────────────────────────────────────────────────────

/// One reviewer's contribution to a feedback round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerSummary {
    pub reviewer_id: String,
    pub reviewer_name: String,
    pub feedback: String,
    pub approved: bool,
}

/// One row per completed iteration: the draft, per-reviewer critiques, and
/// any user feedback attached afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRoundRecord {
    pub feedback_round_id: Uuid,
    pub session_id: Uuid,
    pub iteration: u32,
    pub draft_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_feedback_at: Option<DateTime<Utc>>,
    pub all_reviewers_approved: bool,
    pub reviewer_summaries: Vec<ReviewerSummary>,
    pub created_at: DateTime<Utc>,
}

// ─── Configured models / user settings ────────────────────────────────────────

/// A per-user model registration.  The key is stored only in sealed form.
#[derive(Debug, Clone)]
pub struct ConfiguredModel {
    pub model_id: Uuid,
    pub user_email: String,
    pub model_name: String,
    pub display_name: Option<String>,
    pub endpoint: String,
    pub provider: Provider,
    pub sealed_key: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_agent_model_id: Option<Uuid>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn persona() -> PersonaConfig {
        PersonaConfig {
            root_prompt: "You draft things.".into(),
            model_name: "gpt-4o".into(),
            temperature: 0.7,
            max_output_tokens: 1024,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            SessionStatus::Created,
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Stopped,
            SessionStatus::Error,
        ] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn stop_reason_round_trips_through_str() {
        for r in [
            StopReason::None,
            StopReason::FinalMarkerDetected,
            StopReason::UserStopped,
            StopReason::MaxIterationsReached,
            StopReason::ReviewerApproved,
            StopReason::Error,
        ] {
            assert_eq!(StopReason::parse(r.as_str()), Some(r));
        }
    }

    #[test]
    fn terminal_states_are_detected() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(!SessionStatus::Created.is_terminal());
    }

    #[test]
    fn persona_validation_accepts_sane_config() {
        assert!(persona().validate().is_ok());
    }

    #[test]
    fn persona_validation_rejects_out_of_range_fields() {
        let mut p = persona();
        p.temperature = 2.5;
        assert!(p.validate().is_err());

        let mut p = persona();
        p.top_p = -0.1;
        assert!(p.validate().is_err());

        let mut p = persona();
        p.max_output_tokens = 0;
        assert!(p.validate().is_err());

        let mut p = persona();
        p.presence_penalty = 3.0;
        assert!(p.validate().is_err());

        let mut p = persona();
        p.model_name = "  ".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn persona_boundary_values_are_accepted() {
        let mut p = persona();
        p.temperature = 2.0;
        p.top_p = 0.0;
        p.presence_penalty = -2.0;
        p.frequency_penalty = 2.0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn referenced_models_deduplicates_in_order() {
        let session = SessionRecord {
            session_id: Uuid::new_v4(),
            name: "s".into(),
            status: SessionStatus::Created,
            stop_reason: StopReason::None,
            max_iterations: 4,
            current_iteration: 0,
            feedback_version: 1,
            stop_marker: "FINAL:".into(),
            stop_on_reviewer_approved: true,
            run_mode: RunMode::Auto,
            topic: String::new(),
            final_content: None,
            creator: persona(),
            reviewers: vec![
                ReviewerConfig {
                    id: "r1".into(),
                    display_name: "Style".into(),
                    persona: PersonaConfig {
                        model_name: "grok-3".into(),
                        ..persona()
                    },
                },
                ReviewerConfig {
                    id: "r2".into(),
                    display_name: "Facts".into(),
                    persona: persona(),
                },
            ],
            needs_final_iteration: false,
            pending_guidance: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(session.referenced_models(), vec!["gpt-4o", "grok-3"]);
    }

    #[test]
    fn reviewer_config_serialises_flattened() {
        let r = ReviewerConfig {
            id: "r1".into(),
            display_name: "Style".into(),
            persona: persona(),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["id"], "r1");
        assert_eq!(json["displayName"], "Style");
        // Persona fields sit at the top level, not nested.
        assert_eq!(json["modelName"], "gpt-4o");
        assert!(json.get("persona").is_none());
    }
}
