// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt assembly for the Creator and Reviewer personas.
//!
//! Each iteration the Creator sees its root prompt, a safety reminder, the
//! session topic, a window of recent session traffic, and an instruction to
//! draft or revise.  Reviewers see their own rubric, their own prior
//! critiques, and the draft under review.  All embedded content is clipped
//! to the configured character budgets before it reaches a provider.

use council_config::OrchestrationConfig;
use council_model::{ChatMessage, CompletionRequest};
use council_store::{MessageRecord, PersonaConfig, ReviewerConfig, SessionRecord};

use crate::approval::APPROVAL_TOKEN;

/// Fixed reminder injected into every persona's system prompt.
const SAFETY_REMINDER: &str = "Never disclose API keys, credentials, or any other secrets in your \
output. Do not fabricate facts, citations, or data; state uncertainty explicitly instead.";

/// Fixed reviewer rubric.  The sign-off token instruction must stay in sync
/// with the approval detector.
fn reviewer_rubric() -> String {
    format!(
        "Review the draft below. Identify concrete issues and request specific revisions; be \
direct and actionable. Include the literal token {APPROVAL_TOKEN} in your review only if the \
draft is ready for publication exactly as written. Otherwise do not include that token."
    )
}

fn topic_block(topic: &str, as_criteria: bool) -> String {
    let framing = if as_criteria {
        "Evaluate the draft against the following topic; treat it as the acceptance criteria:"
    } else {
        "All content must address the following topic:"
    };
    format!("=== TOPIC ===\n{framing}\n{topic}\n=== END TOPIC ===")
}

/// Clip `s` to at most `max` characters, keeping the head.  Cuts on a char
/// boundary and marks the cut.
fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!("{head}\n[truncated]")
}

/// Build the Creator's ordered message list for one iteration.
///
/// `history` is the chronological window of recent session messages:
/// Creator drafts become assistant turns; reviewer critiques become user
/// turns prefixed with the reviewer's display name.  `guidance` carries a
/// queued post-completion user instruction and, when present, replaces the
/// standard revision instruction.
pub fn creator_messages(
    session: &SessionRecord,
    history: &[MessageRecord],
    iteration: u32,
    guidance: Option<&str>,
    cfg: &OrchestrationConfig,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 4);
    messages.push(ChatMessage::system(clip(
        &session.creator.root_prompt,
        cfg.max_prompt_chars,
    )));
    messages.push(ChatMessage::system(SAFETY_REMINDER));
    if !session.topic.is_empty() {
        messages.push(ChatMessage::system(topic_block(&session.topic, false)));
    }

    for m in history {
        if m.is_creator() {
            messages.push(ChatMessage::assistant(clip(&m.content, cfg.max_prompt_chars)));
        } else {
            let name = m.reviewer_display_name.as_deref().unwrap_or(&m.author);
            messages.push(ChatMessage::user(format!(
                "{name} feedback:\n{}",
                clip(&m.content, cfg.max_prompt_chars)
            )));
        }
    }

    let instruction = if let Some(guidance) = guidance {
        format!(
            "The user reviewed the completed result and requested further changes. Revise the \
latest draft accordingly.\n\n{}",
            clip(guidance, cfg.max_prompt_chars)
        )
    } else if iteration == 1 {
        if session.topic.is_empty() {
            "Produce the first draft.".to_string()
        } else {
            "Produce the first draft addressing the topic above.".to_string()
        }
    } else {
        "Revise your draft, incorporating all reviewer feedback above.".to_string()
    };
    messages.push(ChatMessage::user(instruction));
    messages
}

/// Build one reviewer's ordered message list.
///
/// `own_history` is the chronological window of this reviewer's prior
/// critiques (its working memory); other reviewers' output is never shown
/// to it.
pub fn reviewer_messages(
    session: &SessionRecord,
    reviewer: &ReviewerConfig,
    own_history: &[MessageRecord],
    draft: &str,
    cfg: &OrchestrationConfig,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(own_history.len() + 5);
    messages.push(ChatMessage::system(clip(
        &reviewer.persona.root_prompt,
        cfg.max_prompt_chars,
    )));
    messages.push(ChatMessage::system(reviewer_rubric()));
    messages.push(ChatMessage::system(SAFETY_REMINDER));
    if !session.topic.is_empty() {
        messages.push(ChatMessage::system(topic_block(&session.topic, true)));
    }

    for m in own_history {
        messages.push(ChatMessage::assistant(clip(&m.content, cfg.max_prompt_chars)));
    }

    messages.push(ChatMessage::user(format!(
        "Please review the following draft:\n\n{}",
        clip(draft, cfg.max_draft_chars)
    )));
    messages
}

/// Map a persona's sampling snapshot onto the uniform completion request.
pub fn request_for(persona: &PersonaConfig, messages: Vec<ChatMessage>) -> CompletionRequest {
    CompletionRequest {
        model: persona.model_name.clone(),
        messages,
        temperature: persona.temperature,
        max_tokens: persona.max_output_tokens,
        top_p: persona.top_p,
        presence_penalty: persona.presence_penalty,
        frequency_penalty: persona.frequency_penalty,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
