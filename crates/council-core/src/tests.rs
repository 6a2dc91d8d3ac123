// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end orchestration scenarios against a scripted router and an
//! in-memory store.  No network, no real providers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use uuid::Uuid;

use council_config::OrchestrationConfig;
use council_model::{CompletionRequest, ResponseEvent, ResponseStream, Role};
use council_store::{
    PersonaConfig, ReviewerConfig, RunMode, SessionRecord, SessionStatus, SqliteStore, StopReason,
    CREATOR_PERSONA,
};

use crate::approval::APPROVAL_TOKEN;
use crate::events::{EventHub, SessionEvent};
use crate::orchestrator::{IterateWithFeedback, Orchestrator, OrchestratorError};
use crate::router::CompletionRouter;

// ─── Scripted router ──────────────────────────────────────────────────────────

enum Script {
    /// Emit these events, then end the stream.
    Events(Vec<ResponseEvent>),
    /// Emit one delta, then never produce another event (for cancel tests).
    DeltaThenHang(String),
    /// Fail to establish the call.
    Fail(String),
}

/// Test double for the provider router: scripts are keyed by model name and
/// consumed in order; every request is recorded for inspection.
struct ScriptedRouter {
    scripts: StdMutex<HashMap<String, VecDeque<Script>>>,
    requests: StdMutex<Vec<(String, CompletionRequest)>>,
}

impl ScriptedRouter {
    fn new(scripts: Vec<(&str, Vec<Script>)>) -> Arc<Self> {
        let mut map = HashMap::new();
        for (model, list) in scripts {
            map.insert(model.to_string(), VecDeque::from(list));
        }
        Arc::new(Self {
            scripts: StdMutex::new(map),
            requests: StdMutex::new(Vec::new()),
        })
    }

    fn requests_for(&self, model: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionRouter for ScriptedRouter {
    async fn stream(
        &self,
        _user: &str,
        model_name: &str,
        req: CompletionRequest,
    ) -> anyhow::Result<ResponseStream> {
        self.requests
            .lock()
            .unwrap()
            .push((model_name.to_string(), req));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model_name)
            .and_then(|q| q.pop_front());
        match script {
            Some(Script::Events(events)) => {
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
            Some(Script::DeltaThenHang(text)) => {
                let head = stream::iter(vec![Ok(ResponseEvent::TextDelta(text))]);
                Ok(Box::pin(head.chain(stream::pending())))
            }
            Some(Script::Fail(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(Box::pin(stream::iter(vec![
                Ok(ResponseEvent::TextDelta("[out of script]".into())),
                Ok(ResponseEvent::Done),
            ]))),
        }
    }
}

fn text(s: &str) -> Script {
    Script::Events(vec![
        ResponseEvent::TextDelta(s.to_string()),
        ResponseEvent::Done,
    ])
}

fn approve(s: &str) -> Script {
    text(&format!("{s} {APPROVAL_TOKEN}"))
}

// ─── Harness ──────────────────────────────────────────────────────────────────

const USER: &str = "tester@example.com";
const CREATOR_MODEL: &str = "creator-model";

struct Harness {
    orch: Arc<Orchestrator>,
    store: Arc<SqliteStore>,
    hub: Arc<EventHub>,
    router: Arc<ScriptedRouter>,
}

fn harness(router: Arc<ScriptedRouter>) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let hub = Arc::new(EventHub::new(1024));
    let orch = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        router.clone(),
        OrchestrationConfig::default(),
    );
    Harness {
        orch,
        store,
        hub,
        router,
    }
}

fn persona(model: &str) -> PersonaConfig {
    PersonaConfig {
        root_prompt: "You are a persona.".into(),
        model_name: model.into(),
        temperature: 0.7,
        max_output_tokens: 1024,
        top_p: 1.0,
        presence_penalty: 0.0,
        frequency_penalty: 0.0,
    }
}

fn make_session(
    reviewers: &[(&str, &str)],
    max_iterations: u32,
    stop_on_reviewer_approved: bool,
    topic: &str,
) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        session_id: Uuid::new_v4(),
        name: "test session".into(),
        status: SessionStatus::Created,
        stop_reason: StopReason::None,
        max_iterations,
        current_iteration: 0,
        feedback_version: 1,
        stop_marker: "FINAL:".into(),
        stop_on_reviewer_approved,
        run_mode: RunMode::Auto,
        topic: topic.into(),
        final_content: None,
        creator: persona(CREATOR_MODEL),
        reviewers: reviewers
            .iter()
            .map(|(id, model)| ReviewerConfig {
                id: id.to_string(),
                display_name: id.to_uppercase(),
                persona: persona(model),
            })
            .collect(),
        needs_final_iteration: false,
        pending_guidance: None,
        created_at: now,
        updated_at: now,
    }
}

async fn wait_for<F>(store: &Arc<SqliteStore>, id: Uuid, pred: F) -> SessionRecord
where
    F: Fn(&SessionRecord) -> bool,
{
    for _ in 0..1000 {
        let s = store.get_session(id).await.unwrap();
        if pred(&s) {
            return s;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never reached the expected state");
}

async fn wait_terminal(store: &Arc<SqliteStore>, id: Uuid) -> SessionRecord {
    wait_for(store, id, |s| s.status.is_terminal()).await
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

// ─── Scenario 1: happy-path consensus ────────────────────────────────────────

#[tokio::test]
async fn consensus_runs_one_more_iteration_then_completes() {
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![text("D1"), text("D2"), text("D3")]),
        ("rev-a-model", vec![text("R1a needs work"), approve("R2a good")]),
        ("rev-b-model", vec![text("R1b needs work"), approve("R2b good")]),
    ]);
    let h = harness(router);
    let session = make_session(
        &[("rev-a", "rev-a-model"), ("rev-b", "rev-b-model")],
        4,
        true,
        "Summarize TCP congestion control",
    );
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.stop_reason, StopReason::ReviewerApproved);
    assert_eq!(done.final_content.as_deref(), Some("D3"));
    assert_eq!(done.current_iteration, 3, "one-more rule ran iteration 3");

    let messages = h.store.messages_for_session(id).await.unwrap();
    let creator: Vec<_> = messages.iter().filter(|m| m.is_creator()).collect();
    let reviewers: Vec<_> = messages.iter().filter(|m| !m.is_creator()).collect();
    assert_eq!(creator.len(), 3);
    assert_eq!(reviewers.len(), 4, "reviewers ran only in iterations 1 and 2");

    // One feedback round per reviewed iteration; the final incorporation
    // iteration has none.
    let rounds = h.store.feedback_rounds_for_session(id).await.unwrap();
    assert_eq!(rounds.len(), 2);
    assert!(!rounds[0].all_reviewers_approved);
    assert!(rounds[1].all_reviewers_approved);
    assert_eq!(rounds[1].reviewer_summaries.len(), 2);
    assert!(rounds[1].reviewer_summaries.iter().all(|s| s.approved));
}

// ─── Scenario 2: final marker short-circuit ──────────────────────────────────

#[tokio::test]
async fn stop_marker_completes_without_running_reviewers() {
    let router = ScriptedRouter::new(vec![
        (
            CREATOR_MODEL,
            vec![text("D1"), text("…analysis.\nFINAL: the final answer")],
        ),
        ("rev-a-model", vec![text("R1 needs work"), text("never used")]),
    ]);
    let h = harness(router);
    let session = make_session(&[("rev-a", "rev-a-model")], 4, true, "topic");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.stop_reason, StopReason::FinalMarkerDetected);
    assert_eq!(done.final_content.as_deref(), Some("the final answer"));
    assert_eq!(done.current_iteration, 2);

    let messages = h.store.messages_for_session(id).await.unwrap();
    let iter2_reviews = messages
        .iter()
        .filter(|m| !m.is_creator() && m.iteration == 2)
        .count();
    assert_eq!(iter2_reviews, 0, "marker stops the iteration before reviewers");
    assert_eq!(messages.iter().filter(|m| !m.is_creator()).count(), 1);
}

// ─── Scenario 3: max-iterations floor (and P1/P2/P8) ─────────────────────────

#[tokio::test]
async fn max_iterations_completes_with_last_draft() {
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![text("D1"), text("D2")]),
        ("rev-a-model", vec![text("R1a no"), text("R2a no")]),
        ("rev-b-model", vec![text("R1b no"), text("R2b no")]),
    ]);
    let h = harness(router);
    let session = make_session(
        &[("rev-a", "rev-a-model"), ("rev-b", "rev-b-model")],
        2,
        true,
        "",
    );
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    let mut rx = h.hub.subscribe(id);
    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.stop_reason, StopReason::MaxIterationsReached);
    assert_eq!(done.final_content.as_deref(), Some("D2"));
    assert_eq!(done.current_iteration, 2);

    // P1: exactly one Creator message and one message per reviewer at every
    // iteration.
    let messages = h.store.messages_for_session(id).await.unwrap();
    for i in 1..=2u32 {
        assert_eq!(
            messages
                .iter()
                .filter(|m| m.is_creator() && m.iteration == i)
                .count(),
            1
        );
        for reviewer in ["rev-a", "rev-b"] {
            assert_eq!(
                messages
                    .iter()
                    .filter(|m| m.author == reviewer && m.iteration == i)
                    .count(),
                1
            );
        }
    }

    // P2: messages of iteration 1 are not newer than messages of iteration 2.
    let max_iter1 = messages
        .iter()
        .filter(|m| m.iteration == 1)
        .map(|m| m.created_at)
        .max()
        .unwrap();
    let min_iter2 = messages
        .iter()
        .filter(|m| m.iteration == 2)
        .map(|m| m.created_at)
        .min()
        .unwrap();
    assert!(max_iter1 <= min_iter2);

    // P8: per-session FIFO — IterationStarted(i) precedes that iteration's
    // message events, IterationCompleted(i) follows its last completion.
    let events = drain_events(&mut rx);
    assert_event_fifo(&events);
    assert!(matches!(
        events.last(),
        Some(SessionEvent::SessionCompleted { .. })
    ));
}

fn assert_event_fifo(events: &[SessionEvent]) {
    let mut message_iteration: HashMap<Uuid, u32> = HashMap::new();
    let mut started_at: HashMap<u32, usize> = HashMap::new();
    let mut completed_at: HashMap<u32, usize> = HashMap::new();

    for (idx, ev) in events.iter().enumerate() {
        match ev {
            SessionEvent::IterationStarted { iteration, .. } => {
                started_at.insert(*iteration, idx);
            }
            SessionEvent::IterationCompleted { iteration, .. } => {
                completed_at.insert(*iteration, idx);
            }
            SessionEvent::MessageStarted {
                message_id,
                iteration,
                ..
            } => {
                message_iteration.insert(*message_id, *iteration);
                let started = started_at
                    .get(iteration)
                    .unwrap_or_else(|| panic!("message before IterationStarted({iteration})"));
                assert!(*started < idx);
            }
            SessionEvent::MessageChunk { message_id, .. }
            | SessionEvent::MessageCompleted { message_id, .. } => {
                let iteration = message_iteration
                    .get(message_id)
                    .expect("chunk before MessageStarted");
                assert!(
                    !completed_at.contains_key(iteration),
                    "message event after IterationCompleted({iteration})"
                );
            }
            _ => {}
        }
    }
}

// ─── Scenario 4: user stop mid-stream ────────────────────────────────────────

#[tokio::test]
async fn user_stop_persists_partial_creator_message() {
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![Script::DeltaThenHang("partial draft ".into())]),
        ("rev-a-model", vec![text("never used")]),
    ]);
    let h = harness(router);
    let session = make_session(&[("rev-a", "rev-a-model")], 4, true, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    let mut rx = h.hub.subscribe(id);
    h.orch.start(id, USER, false).await.unwrap();

    // Wait for the first streamed chunk, then stop.
    loop {
        match rx.recv().await.unwrap() {
            SessionEvent::MessageChunk { .. } => break,
            _ => {}
        }
    }
    h.orch.stop(id).await.unwrap();
    let done = wait_terminal(&h.store, id).await;

    assert_eq!(done.status, SessionStatus::Stopped);
    assert_eq!(done.stop_reason, StopReason::UserStopped);
    assert_eq!(done.final_content.as_deref(), Some("partial draft "));

    let messages = h.store.messages_for_session(id).await.unwrap();
    assert_eq!(messages.len(), 1, "only the partial creator message");
    assert!(messages[0].is_creator());
    assert_eq!(messages[0].content, "partial draft ");
}

#[tokio::test]
async fn stop_is_idempotent_on_terminal_sessions() {
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![text("FINAL: done")]),
    ]);
    let h = harness(router);
    let session = make_session(&[], 2, false, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();
    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;
    assert_eq!(done.status, SessionStatus::Completed);

    // A second stop must not disturb the completed state.
    h.orch.stop(id).await.unwrap();
    let after = h.store.get_session(id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Completed);
    assert_eq!(after.stop_reason, StopReason::FinalMarkerDetected);
}

// ─── Scenario 6: post-completion re-iterate ──────────────────────────────────

#[tokio::test]
async fn iterate_with_feedback_reopens_completed_session() {
    let router = ScriptedRouter::new(vec![
        (
            CREATOR_MODEL,
            vec![text("D1"), text("D2"), text("D3"), text("D4")],
        ),
        (
            "rev-a-model",
            vec![approve("R1 fine"), approve("R3 fine")],
        ),
    ]);
    let h = harness(router.clone());
    let session = make_session(&[("rev-a", "rev-a-model")], 4, true, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    // First run: approval at iteration 1, incorporation at iteration 2.
    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;
    assert_eq!(done.stop_reason, StopReason::ReviewerApproved);
    assert_eq!(done.final_content.as_deref(), Some("D2"));
    assert_eq!(done.current_iteration, 2);

    // Re-open with user guidance.
    let reopened = h
        .orch
        .iterate_with_feedback(
            id,
            USER,
            IterateWithFeedback {
                comments: "Shorten.".into(),
                tone: Some("crisp".into()),
                length: None,
                audience: None,
                max_additional_iterations: 2,
            },
        )
        .await
        .unwrap();
    assert_eq!(reopened.max_iterations, 6);
    assert_eq!(reopened.feedback_version, 2);
    assert_eq!(reopened.status, SessionStatus::Running);

    let done = wait_terminal(&h.store, id).await;
    assert_eq!(done.stop_reason, StopReason::ReviewerApproved);
    assert_eq!(done.final_content.as_deref(), Some("D4"));
    assert!(done.pending_guidance.is_none(), "guidance is consumed");

    // The first Creator prompt after re-opening carries the literal comments
    // in its trailing user turn.
    let creator_requests = h.router.requests_for(CREATOR_MODEL);
    assert_eq!(creator_requests.len(), 4);
    let reopen_prompt = &creator_requests[2];
    let last_turn = reopen_prompt.messages.last().unwrap();
    assert_eq!(last_turn.role, Role::User);
    assert!(last_turn.content.contains("Shorten."));
    assert!(last_turn.content.contains("crisp"));
    // The following iteration reverts to the standard revision instruction.
    let next_prompt = &creator_requests[3];
    assert!(!next_prompt.messages.last().unwrap().content.contains("Shorten."));
}

#[tokio::test]
async fn iterate_with_feedback_validates_inputs() {
    let router = ScriptedRouter::new(vec![(CREATOR_MODEL, vec![text("FINAL: x")])]);
    let h = harness(router);
    let session = make_session(&[], 2, false, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    let feedback = |comments: &str, extra: u32| IterateWithFeedback {
        comments: comments.into(),
        tone: None,
        length: None,
        audience: None,
        max_additional_iterations: extra,
    };

    // Not completed yet.
    let err = h
        .orch
        .iterate_with_feedback(id, USER, feedback("x", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    h.orch.start(id, USER, false).await.unwrap();
    wait_terminal(&h.store, id).await;

    // Empty comments.
    let err = h
        .orch
        .iterate_with_feedback(id, USER, feedback("   ", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    // Out-of-range budget.
    let err = h
        .orch
        .iterate_with_feedback(id, USER, feedback("x", 4))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    // No state was disturbed by the rejected calls.
    let s = h.store.get_session(id).await.unwrap();
    assert_eq!(s.status, SessionStatus::Completed);
    assert_eq!(s.feedback_version, 1);
}

// ─── Step mode ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn step_mode_pauses_after_each_iteration() {
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![text("D1"), text("D2")]),
        ("rev-a-model", vec![text("R1 no"), text("R2 no")]),
    ]);
    let h = harness(router);
    let session = make_session(&[("rev-a", "rev-a-model")], 4, true, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    let mut rx = h.hub.subscribe(id);
    h.orch.start(id, USER, true).await.unwrap();
    let paused = wait_for(&h.store, id, |s| s.status == SessionStatus::Paused).await;
    assert_eq!(paused.current_iteration, 1);

    // Step again: one more iteration, then paused again.
    h.orch.start(id, USER, true).await.unwrap();
    let paused = wait_for(&h.store, id, |s| {
        s.status == SessionStatus::Paused && s.current_iteration == 2
    })
    .await;
    assert_eq!(paused.current_iteration, 2);

    let events = drain_events(&mut rx);
    let paused_events = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::SessionPaused { .. }))
        .count();
    assert_eq!(paused_events, 2);
}

// ─── Error handling ───────────────────────────────────────────────────────────

#[tokio::test]
async fn provider_failure_transitions_session_to_error() {
    let router = ScriptedRouter::new(vec![(
        CREATOR_MODEL,
        vec![Script::Fail("provider exploded".into())],
    )]);
    let h = harness(router);
    let session = make_session(&[], 4, false, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    let mut rx = h.hub.subscribe(id);
    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;

    assert_eq!(done.status, SessionStatus::Error);
    assert_eq!(done.stop_reason, StopReason::Error);

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::SessionError { message, .. } if message.contains("provider exploded"))));
}

#[tokio::test]
async fn start_rejects_wrong_states() {
    let router = ScriptedRouter::new(vec![(
        CREATOR_MODEL,
        vec![Script::DeltaThenHang("x".into())],
    )]);
    let h = harness(router);
    let session = make_session(&[], 4, false, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();

    h.orch.start(id, USER, false).await.unwrap();
    wait_for(&h.store, id, |s| s.status == SessionStatus::Running).await;

    // Starting a running session is a validation error.
    let err = h.orch.start(id, USER, false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    h.orch.stop(id).await.unwrap();
    let done = wait_terminal(&h.store, id).await;
    assert_eq!(done.status, SessionStatus::Stopped);

    // Starting a stopped session is too.
    let err = h.orch.start(id, USER, false).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

// ─── Memory reset ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn reset_memory_removes_one_personas_messages() {
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![text("D1"), text("D2")]),
        ("rev-a-model", vec![text("R1 no"), text("R2 no")]),
    ]);
    let h = harness(router);
    let session = make_session(&[("rev-a", "rev-a-model")], 2, false, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();
    h.orch.start(id, USER, false).await.unwrap();
    let before = wait_terminal(&h.store, id).await;
    assert_eq!(before.status, SessionStatus::Completed);

    let mut rx = h.hub.subscribe(id);
    let removed = h.orch.reset_memory(id, "rev-a").await.unwrap();
    assert_eq!(removed, 2);

    let messages = h.store.messages_for_session(id).await.unwrap();
    assert!(messages.iter().all(|m| m.author == CREATOR_PERSONA));

    // Status and counters untouched.
    let after = h.store.get_session(id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Completed);
    assert_eq!(after.current_iteration, before.current_iteration);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::PersonaMemoryReset { persona_id, .. } if persona_id == "rev-a"
    )));

    // Unknown persona is rejected.
    let err = h.orch.reset_memory(id, "rev-z").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

// ─── P5: the one-more rule in isolation ──────────────────────────────────────

#[tokio::test]
async fn approval_without_stop_flag_does_not_end_session() {
    // stop_on_reviewer_approved = false: unanimous approval is recorded but
    // the loop runs to the iteration ceiling.
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![text("D1"), text("D2")]),
        ("rev-a-model", vec![approve("R1"), approve("R2")]),
    ]);
    let h = harness(router);
    let session = make_session(&[("rev-a", "rev-a-model")], 2, false, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();
    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;

    assert_eq!(done.stop_reason, StopReason::MaxIterationsReached);
    let rounds = h.store.feedback_rounds_for_session(id).await.unwrap();
    assert!(rounds.iter().all(|r| r.all_reviewers_approved));
}

#[tokio::test]
async fn one_more_rule_may_exceed_max_iterations() {
    // Approval on the final allowed iteration still grants the extra one.
    let router = ScriptedRouter::new(vec![
        (CREATOR_MODEL, vec![text("D1"), text("D2"), text("D3")]),
        ("rev-a-model", vec![text("R1 no"), approve("R2")]),
    ]);
    let h = harness(router);
    let session = make_session(&[("rev-a", "rev-a-model")], 2, true, "");
    let id = session.session_id;
    h.store.insert_session(&session).await.unwrap();
    h.orch.start(id, USER, false).await.unwrap();
    let done = wait_terminal(&h.store, id).await;

    assert_eq!(done.stop_reason, StopReason::ReviewerApproved);
    assert_eq!(done.current_iteration, 3, "exceeds max_iterations by one");
    assert_eq!(done.final_content.as_deref(), Some("D3"));
}
