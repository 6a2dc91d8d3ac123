// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-session iteration state machine.
//!
//! One long-running task per actively running session drives
//! Creator → Reviewers → Creator cycles until a stop condition fires.  The
//! task serialises every message write and event publish for its session,
//! which is what gives subscribers their per-session FIFO guarantee.
//!
//! Stop conditions, in priority order:
//! 1. user stop — drain the in-flight stream, persist the partial message,
//!    transition to `Stopped`;
//! 2. stop marker in the Creator draft — complete without running reviewers;
//! 3. unanimous reviewer sign-off — run **one more** Creator iteration (which
//!    may exceed `max_iterations`) and then complete;
//! 4. iteration ceiling reached.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use council_config::OrchestrationConfig;
use council_model::{FinishKind, ResponseEvent};
use council_store::{
    FeedbackRoundRecord, MessageRecord, MessageRole, ReviewerSummary, RunMode, SessionRecord,
    SessionStatus, SqliteStore, StopReason, StoreError, CREATOR_PERSONA,
};

use crate::{
    approval,
    events::{EventHub, SessionEvent},
    prompts,
    router::CompletionRouter,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Post-completion re-iteration request.
#[derive(Debug, Clone)]
pub struct IterateWithFeedback {
    pub comments: String,
    pub tone: Option<String>,
    pub length: Option<String>,
    pub audience: Option<String>,
    pub max_additional_iterations: u32,
}

enum LoopOutcome {
    Finished,
    Paused,
}

struct PersonaOutcome {
    content: String,
    cancelled: bool,
}

pub struct Orchestrator {
    store: Arc<SqliteStore>,
    hub: Arc<EventHub>,
    router: Arc<dyn CompletionRouter>,
    cfg: OrchestrationConfig,
    /// One cancellation token per running session; inserted on start,
    /// removed on terminal transition or pause.
    cancel_tokens: DashMap<Uuid, CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        hub: Arc<EventHub>,
        router: Arc<dyn CompletionRouter>,
        cfg: OrchestrationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            router,
            cfg,
            cancel_tokens: DashMap::new(),
        })
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Begin (or resume) the loop.  `step` selects single-iteration
    /// semantics: the session pauses after the next completed iteration.
    pub async fn start(
        self: &Arc<Self>,
        session_id: Uuid,
        user: &str,
        step: bool,
    ) -> Result<(), OrchestratorError> {
        let mut session = self.store.get_session(session_id).await?;
        match session.status {
            SessionStatus::Created | SessionStatus::Paused => {}
            SessionStatus::Running => {
                return Err(OrchestratorError::Validation(
                    "session is already running".into(),
                ))
            }
            other => {
                return Err(OrchestratorError::Validation(format!(
                    "cannot start a {} session",
                    other.as_str()
                )))
            }
        }
        session.run_mode = if step { RunMode::Step } else { RunMode::Auto };
        session.status = SessionStatus::Running;
        self.store.update_session(&session).await?;
        self.hub
            .publish(SessionEvent::SessionStarted { session_id });
        self.spawn_loop(session_id, user.to_string());
        Ok(())
    }

    /// User stop.  Idempotent: terminal sessions are left untouched.  A
    /// running session's in-flight stream is drained by its own task; a
    /// session with no task (Created/Paused) transitions directly.
    pub async fn stop(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        let session = self.store.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Ok(());
        }
        if let Some(token) = self.cancel_tokens.get(&session_id) {
            token.cancel();
            return Ok(());
        }

        // No running task.  Re-read before transitioning directly: the task
        // may have reached a terminal state between the fetch above and the
        // token lookup.
        let mut session = self.store.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Ok(());
        }
        session.status = SessionStatus::Stopped;
        session.stop_reason = StopReason::UserStopped;
        session.final_content = self
            .store
            .last_content_by_author(session_id, CREATOR_PERSONA)
            .await?;
        self.store.update_session(&session).await?;
        self.hub.publish(SessionEvent::SessionStopped {
            session_id,
            reason: StopReason::UserStopped,
        });
        Ok(())
    }

    /// Cancel any in-flight work without a status transition.  Used by
    /// session deletion, which removes the rows immediately afterwards.
    pub fn cancel(&self, session_id: Uuid) {
        if let Some(token) = self.cancel_tokens.get(&session_id) {
            token.cancel();
        }
    }

    /// Remove all messages authored by one persona (§ memory reset).
    /// Session status and iteration counters are untouched.
    pub async fn reset_memory(
        &self,
        session_id: Uuid,
        persona_id: &str,
    ) -> Result<usize, OrchestratorError> {
        let session = self.store.get_session(session_id).await?;
        let known = persona_id == CREATOR_PERSONA
            || session.reviewers.iter().any(|r| r.id == persona_id);
        if !known {
            return Err(OrchestratorError::Validation(format!(
                "unknown persona `{persona_id}`"
            )));
        }
        let removed = self
            .store
            .delete_messages_by_author(session_id, persona_id)
            .await?;
        self.hub.publish(SessionEvent::PersonaMemoryReset {
            session_id,
            persona_id: persona_id.to_string(),
        });
        info!(session = %session_id, persona = %persona_id, removed, "persona memory reset");
        Ok(removed)
    }

    /// Re-open a completed session with user guidance (atomically: raise the
    /// iteration ceiling, bump the feedback version, queue the guidance for
    /// the next Creator prompt, re-enter Running).
    pub async fn iterate_with_feedback(
        self: &Arc<Self>,
        session_id: Uuid,
        user: &str,
        req: IterateWithFeedback,
    ) -> Result<SessionRecord, OrchestratorError> {
        if req.comments.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "comments must not be empty".into(),
            ));
        }
        if !(1..=3).contains(&req.max_additional_iterations) {
            return Err(OrchestratorError::Validation(
                "maxAdditionalIterations must be between 1 and 3".into(),
            ));
        }
        let mut session = self.store.get_session(session_id).await?;
        if session.status != SessionStatus::Completed {
            return Err(OrchestratorError::Validation(format!(
                "iterate-with-feedback requires a completed session, not {}",
                session.status.as_str()
            )));
        }

        session.pending_guidance = Some(build_guidance(&req));
        session.max_iterations += req.max_additional_iterations;
        session.feedback_version += 1;
        session.needs_final_iteration = false;
        session.stop_reason = StopReason::None;
        session.status = SessionStatus::Running;
        self.store.update_session(&session).await?;

        self.hub
            .publish(SessionEvent::SessionStarted { session_id });
        self.spawn_loop(session_id, user.to_string());
        Ok(session)
    }

    // ── The session task ──────────────────────────────────────────────────────

    fn spawn_loop(self: &Arc<Self>, session_id: Uuid, user: String) {
        let token = CancellationToken::new();
        self.cancel_tokens.insert(session_id, token.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.drive(session_id, &user, &token).await;
            this.cancel_tokens.remove(&session_id);
            if let Err(e) = outcome {
                error!(session = %session_id, "session loop failed: {e:#}");
                if let Err(persist) = this.mark_error(session_id).await {
                    error!(session = %session_id, "failed to persist error state: {persist}");
                }
                this.hub.publish(SessionEvent::SessionError {
                    session_id,
                    message: e.to_string(),
                });
            }
        });
    }

    async fn drive(
        &self,
        session_id: Uuid,
        user: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<LoopOutcome> {
        loop {
            let mut session = match self.store.get_session(session_id).await {
                Ok(s) => s,
                // Deleted out from under the task — nothing left to do.
                Err(StoreError::NotFound(_)) => return Ok(LoopOutcome::Finished),
                Err(e) => return Err(e.into()),
            };

            if cancel.is_cancelled() {
                return self.finish_stopped(session).await;
            }

            // Stop condition 4: iteration ceiling.  The pending "one more"
            // iteration after unanimous approval is allowed to exceed it.
            if !session.needs_final_iteration
                && session.current_iteration >= session.max_iterations
            {
                let final_content = self
                    .store
                    .last_content_by_author(session_id, CREATOR_PERSONA)
                    .await?;
                return self
                    .finish_completed(session, StopReason::MaxIterationsReached, final_content)
                    .await;
            }

            let iteration = session.current_iteration + 1;
            session.current_iteration = iteration;
            self.store.update_session(&session).await?;
            self.hub.publish(SessionEvent::IterationStarted {
                session_id,
                iteration,
            });
            info!(session = %session_id, iteration, "iteration started");

            // ── Creator turn ─────────────────────────────────────────────────
            let history = self
                .store
                .recent_messages(session_id, self.cfg.context_turns_to_send)
                .await?;
            let guidance = session.pending_guidance.clone();
            let messages = prompts::creator_messages(
                &session,
                &history,
                iteration,
                guidance.as_deref(),
                &self.cfg,
            );
            let request = prompts::request_for(&session.creator, messages);
            let creator = self
                .stream_persona(
                    &session,
                    CREATOR_PERSONA,
                    None,
                    &session.creator.model_name,
                    request,
                    user,
                    iteration,
                    cancel,
                )
                .await?;

            if guidance.is_some() {
                // Consumed by this iteration's prompt; don't replay it.
                session.pending_guidance = None;
                self.store.update_session(&session).await?;
            }
            if creator.cancelled {
                return self.finish_stopped(session).await;
            }
            let draft = creator.content;

            // Stop condition 2: stop marker.  Reviewers do not run.
            if let Some(pos) = draft.find(&session.stop_marker) {
                let final_content = draft[pos + session.stop_marker.len()..].trim().to_string();
                self.hub.publish(SessionEvent::IterationCompleted {
                    session_id,
                    iteration,
                });
                return self
                    .finish_completed(session, StopReason::FinalMarkerDetected, Some(final_content))
                    .await;
            }

            // Stop condition 3, second half: this was the extra iteration
            // granted after unanimous approval.  The Creator has incorporated
            // the final feedback; complete without consulting reviewers.
            if session.needs_final_iteration {
                self.hub.publish(SessionEvent::IterationCompleted {
                    session_id,
                    iteration,
                });
                return self
                    .finish_completed(session, StopReason::ReviewerApproved, Some(draft))
                    .await;
            }

            // ── Reviewer turns, in configuration order ───────────────────────
            let mut summaries = Vec::with_capacity(session.reviewers.len());
            for reviewer in session.reviewers.clone() {
                let own_history = self
                    .store
                    .recent_messages_by_author(
                        session_id,
                        &reviewer.id,
                        (self.cfg.context_turns_to_send / 2).max(1),
                    )
                    .await?;
                let messages =
                    prompts::reviewer_messages(&session, &reviewer, &own_history, &draft, &self.cfg);
                let request = prompts::request_for(&reviewer.persona, messages);
                let out = self
                    .stream_persona(
                        &session,
                        &reviewer.id,
                        Some(&reviewer.display_name),
                        &reviewer.persona.model_name,
                        request,
                        user,
                        iteration,
                        cancel,
                    )
                    .await?;
                if out.cancelled {
                    return self.finish_stopped(session).await;
                }
                let approved = approval::is_approved(&out.content);
                debug!(session = %session_id, reviewer = %reviewer.id, approved, "review complete");
                summaries.push(ReviewerSummary {
                    reviewer_id: reviewer.id.clone(),
                    reviewer_name: reviewer.display_name.clone(),
                    feedback: out.content,
                    approved,
                });
            }

            // Stop condition 3, first half: unanimous approval arms one more
            // Creator iteration instead of stopping here.
            let all_approved = !summaries.is_empty() && summaries.iter().all(|s| s.approved);
            if session.stop_on_reviewer_approved && all_approved {
                session.needs_final_iteration = true;
                info!(session = %session_id, iteration, "all reviewers approved; running final iteration");
            }

            self.store
                .insert_feedback_round(&FeedbackRoundRecord {
                    feedback_round_id: Uuid::new_v4(),
                    session_id,
                    iteration,
                    draft_content: draft,
                    user_feedback: None,
                    user_feedback_at: None,
                    all_reviewers_approved: all_approved,
                    reviewer_summaries: summaries,
                    created_at: Utc::now(),
                })
                .await?;
            self.store.update_session(&session).await?;
            self.hub.publish(SessionEvent::IterationCompleted {
                session_id,
                iteration,
            });

            if session.run_mode == RunMode::Step {
                session.status = SessionStatus::Paused;
                self.store.update_session(&session).await?;
                self.hub
                    .publish(SessionEvent::SessionPaused { session_id });
                return Ok(LoopOutcome::Paused);
            }
        }
    }

    /// Stream one persona's completion: publish `MessageStarted`, forward
    /// each delta to the hub, and persist the resulting message.
    ///
    /// On cancellation the accumulated partial content is persisted (when
    /// any chunk arrived) so a stopped session keeps its partial draft.  On
    /// a mid-stream provider failure the partial content is persisted and
    /// the error propagates.
    #[allow(clippy::too_many_arguments)]
    async fn stream_persona(
        &self,
        session: &SessionRecord,
        persona_id: &str,
        display_name: Option<&str>,
        model_name: &str,
        request: council_model::CompletionRequest,
        user: &str,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PersonaOutcome> {
        let session_id = session.session_id;
        let message_id = Uuid::new_v4();
        self.hub.publish(SessionEvent::MessageStarted {
            session_id,
            message_id,
            persona_id: persona_id.to_string(),
            iteration,
        });

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.router.stream(user, model_name, request) => Some(res),
        };
        let mut stream = match started {
            // Cancelled before the call was established: nothing to persist.
            None => {
                return Ok(PersonaOutcome {
                    content: String::new(),
                    cancelled: true,
                })
            }
            Some(Ok(s)) => s,
            Some(Err(e)) => return Err(e),
        };

        let mut content = String::new();
        let mut cancelled = false;
        let mut stream_err: Option<anyhow::Error> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                ev = stream.next() => match ev {
                    None => break,
                    Some(Ok(ResponseEvent::TextDelta(delta))) => {
                        content.push_str(&delta);
                        self.hub.publish(SessionEvent::MessageChunk {
                            session_id,
                            message_id,
                            delta,
                        });
                    }
                    Some(Ok(ResponseEvent::Usage { prompt_tokens, completion_tokens, total_tokens })) => {
                        debug!(
                            session = %session_id,
                            persona = %persona_id,
                            model = %model_name,
                            prompt_tokens,
                            completion_tokens,
                            total_tokens,
                            "token usage"
                        );
                    }
                    Some(Ok(ResponseEvent::Finish(kind))) => {
                        if kind == FinishKind::Length {
                            warn!(session = %session_id, persona = %persona_id, "output truncated at the token limit");
                        }
                    }
                    Some(Ok(ResponseEvent::Done)) => break,
                    Some(Err(e)) => {
                        stream_err = Some(e);
                        break;
                    }
                }
            }
        }

        let completed_normally = !cancelled && stream_err.is_none();
        if completed_normally || !content.is_empty() {
            self.store
                .insert_message(&MessageRecord {
                    message_id,
                    session_id,
                    role: MessageRole::Assistant,
                    author: persona_id.to_string(),
                    iteration,
                    content: content.clone(),
                    model_used: model_name.to_string(),
                    reviewer_display_name: display_name.map(String::from),
                    created_at: Utc::now(),
                })
                .await?;
        }
        if let Some(e) = stream_err {
            return Err(e);
        }
        if completed_normally {
            self.hub.publish(SessionEvent::MessageCompleted {
                session_id,
                message_id,
                content: content.clone(),
            });
        }
        Ok(PersonaOutcome { content, cancelled })
    }

    // ── Terminal transitions ──────────────────────────────────────────────────

    async fn finish_stopped(&self, mut session: SessionRecord) -> anyhow::Result<LoopOutcome> {
        let session_id = session.session_id;
        session.status = SessionStatus::Stopped;
        session.stop_reason = StopReason::UserStopped;
        session.final_content = self
            .store
            .last_content_by_author(session_id, CREATOR_PERSONA)
            .await
            .unwrap_or(None);
        match self.store.update_session(&session).await {
            Ok(()) => {}
            // Deleted while stopping: swallow, the rows are gone anyway.
            Err(StoreError::NotFound(_)) => return Ok(LoopOutcome::Finished),
            Err(e) => return Err(e.into()),
        }
        self.hub.publish(SessionEvent::SessionStopped {
            session_id,
            reason: StopReason::UserStopped,
        });
        info!(session = %session_id, "session stopped by user");
        Ok(LoopOutcome::Finished)
    }

    async fn finish_completed(
        &self,
        mut session: SessionRecord,
        reason: StopReason,
        final_content: Option<String>,
    ) -> anyhow::Result<LoopOutcome> {
        let session_id = session.session_id;
        session.status = SessionStatus::Completed;
        session.stop_reason = reason;
        session.final_content = final_content.clone();
        session.needs_final_iteration = false;
        self.store.update_session(&session).await?;
        self.hub.publish(SessionEvent::SessionCompleted {
            session_id,
            final_content: final_content.unwrap_or_default(),
            stop_reason: reason,
        });
        info!(session = %session_id, reason = reason.as_str(), "session completed");
        Ok(LoopOutcome::Finished)
    }

    async fn mark_error(&self, session_id: Uuid) -> Result<(), StoreError> {
        let mut session = match self.store.get_session(session_id).await {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        session.status = SessionStatus::Error;
        session.stop_reason = StopReason::Error;
        self.store.update_session(&session).await
    }
}

fn build_guidance(req: &IterateWithFeedback) -> String {
    let mut guidance = String::new();
    if let Some(tone) = req.tone.as_deref().filter(|s| !s.is_empty()) {
        guidance.push_str(&format!("Desired tone: {tone}.\n"));
    }
    if let Some(length) = req.length.as_deref().filter(|s| !s.is_empty()) {
        guidance.push_str(&format!("Desired length: {length}.\n"));
    }
    if let Some(audience) = req.audience.as_deref().filter(|s| !s.is_empty()) {
        guidance.push_str(&format!("Target audience: {audience}.\n"));
    }
    guidance.push_str(&req.comments);
    guidance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guidance_contains_literal_comments_and_attributes() {
        let g = build_guidance(&IterateWithFeedback {
            comments: "Shorten.".into(),
            tone: Some("casual".into()),
            length: Some("one page".into()),
            audience: Some("executives".into()),
            max_additional_iterations: 2,
        });
        assert!(g.contains("Shorten."));
        assert!(g.contains("Desired tone: casual."));
        assert!(g.contains("Desired length: one page."));
        assert!(g.contains("Target audience: executives."));
    }

    #[test]
    fn guidance_skips_absent_attributes() {
        let g = build_guidance(&IterateWithFeedback {
            comments: "More examples.".into(),
            tone: None,
            length: None,
            audience: None,
            max_additional_iterations: 1,
        });
        assert_eq!(g, "More examples.");
    }
}
