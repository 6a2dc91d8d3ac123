// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The HTTP request surface.
//!
//! Thin verbs over the orchestrator, stores, and event hub.  Handlers
//! validate, delegate, and translate errors; no orchestration logic lives
//! here.  The caller's identity arrives in the `x-user-email` header (the
//! identity provider in front of this service is out of scope).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use council_config::Config;
use council_core::{EventHub, IterateWithFeedback, Orchestrator};
use council_model::registry::get_driver;
use council_store::{
    ConfiguredModelSummary, ConfiguredModelUpdate, CredentialStore, FeedbackRoundRecord,
    MessageRecord, NewConfiguredModel, PersonaConfig, Provider, ReviewerConfig, RunMode,
    SessionRecord, SessionStatus, SqliteStore, StopReason,
};

use crate::error::ApiError;
use crate::rate_limit::{self, SharedRateLimiter};
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub credentials: Arc<CredentialStore>,
    pub hub: Arc<EventHub>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
    pub rate_limiter: SharedRateLimiter,
}

impl AppState {
    pub fn new(
        store: Arc<SqliteStore>,
        credentials: Arc<CredentialStore>,
        hub: Arc<EventHub>,
        orchestrator: Arc<Orchestrator>,
        config: Arc<Config>,
    ) -> Self {
        let rate_limiter = rate_limit::build(&config.rate_limit);
        Self {
            store,
            credentials,
            hub,
            orchestrator,
            config,
            rate_limiter,
        }
    }
}

/// Request bodies beyond this are rejected before deserialization.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Assemble the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/session", post(create_session))
        .route("/sessions", get(list_sessions))
        .route("/session/:id", get(get_session).delete(delete_session))
        .route("/session/:id/start", post(start_session))
        .route("/session/:id/step", post(step_session))
        .route("/session/:id/stop", post(stop_session))
        .route("/session/:id/reset-memory/:persona", post(reset_memory))
        .route("/session/:id/messages", get(get_messages))
        .route("/session/:id/feedback-rounds", get(get_feedback_rounds))
        .route("/session/:id/feedback", post(post_feedback))
        .route(
            "/session/:id/iterate-with-feedback",
            post(iterate_with_feedback),
        )
        .route("/models", get(list_models).post(create_model))
        .route("/models/:id", put(update_model).delete(delete_model))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit_mutations,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is shut down.
pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-email")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ApiError::Validation("missing x-user-email header".into()))
}

async fn healthz() -> &'static str {
    "ok"
}

// ─── Session DTOs ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaDto {
    pub root_prompt: String,
    pub model_name: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

impl PersonaDto {
    fn into_config(self, default_model: &str) -> PersonaConfig {
        PersonaConfig {
            root_prompt: self.root_prompt,
            model_name: self
                .model_name
                .unwrap_or_else(|| default_model.to_string()),
            temperature: self.temperature.unwrap_or(0.7),
            max_output_tokens: self.max_output_tokens.unwrap_or(2048),
            top_p: self.top_p.unwrap_or(1.0),
            presence_penalty: self.presence_penalty.unwrap_or(0.0),
            frequency_penalty: self.frequency_penalty.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerDto {
    pub id: Option<String>,
    pub display_name: String,
    #[serde(flatten)]
    pub persona: PersonaDto,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub max_iterations: Option<u32>,
    pub stop_marker: Option<String>,
    pub stop_on_reviewer_approved: Option<bool>,
    pub run_mode: Option<RunMode>,
    pub creator: PersonaDto,
    pub reviewers: Vec<ReviewerDto>,
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionRecord>, ApiError> {
    require_user(&headers)?;

    let max_iterations = req
        .max_iterations
        .unwrap_or(state.config.orchestration.default_max_iterations);
    if max_iterations == 0 {
        return Err(ApiError::Validation("maxIterations must be positive".into()));
    }
    if req.reviewers.is_empty() {
        return Err(ApiError::Validation(
            "at least one reviewer is required".into(),
        ));
    }

    let creator = req.creator.into_config(&state.config.default_creator_model);
    creator.validate().map_err(ApiError::Validation)?;

    let mut reviewers = Vec::with_capacity(req.reviewers.len());
    for (idx, dto) in req.reviewers.into_iter().enumerate() {
        let id = dto
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("reviewer-{}", idx + 1));
        if reviewers.iter().any(|r: &ReviewerConfig| r.id == id) {
            return Err(ApiError::Validation(format!(
                "duplicate reviewer id `{id}`"
            )));
        }
        let persona = dto
            .persona
            .into_config(&state.config.default_reviewer_model);
        persona.validate().map_err(ApiError::Validation)?;
        reviewers.push(ReviewerConfig {
            id,
            display_name: dto.display_name,
            persona,
        });
    }

    let now = Utc::now();
    let session = SessionRecord {
        session_id: Uuid::new_v4(),
        name: req.name.unwrap_or_else(|| "Untitled session".into()),
        status: SessionStatus::Created,
        stop_reason: StopReason::None,
        max_iterations,
        current_iteration: 0,
        feedback_version: 1,
        stop_marker: req
            .stop_marker
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| state.config.orchestration.default_stop_marker.clone()),
        stop_on_reviewer_approved: req
            .stop_on_reviewer_approved
            .unwrap_or(state.config.orchestration.stop_on_reviewer_approved),
        run_mode: req.run_mode.unwrap_or(RunMode::Auto),
        topic: req.topic.unwrap_or_default(),
        final_content: None,
        creator,
        reviewers,
        needs_final_iteration: false,
        pending_guidance: None,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_session(&session).await?;
    info!(session = %session.session_id, name = %session.name, "session created");
    Ok(Json(session))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.store.get_session(id).await?))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionRecord>>, ApiError> {
    Ok(Json(state.store.list_sessions().await?))
}

/// Precondition for start/step: every distinct model referenced by the
/// session has a stored key for this user.
async fn require_keys(
    state: &AppState,
    user: &str,
    session: &SessionRecord,
) -> Result<(), ApiError> {
    let mut missing = Vec::new();
    for model in session.referenced_models() {
        match state.credentials.get(user, &model).await? {
            Some(summary) if summary.has_key => {}
            _ => missing.push(model),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ApiError::MissingKeys(missing.join(", ")))
    }
}

async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<SessionRecord>, ApiError> {
    let user = require_user(&headers)?;
    let session = state.store.get_session(id).await?;
    require_keys(&state, &user, &session).await?;
    state.orchestrator.start(id, &user, false).await?;
    Ok(Json(state.store.get_session(id).await?))
}

async fn step_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<SessionRecord>, ApiError> {
    let user = require_user(&headers)?;
    let session = state.store.get_session(id).await?;
    require_keys(&state, &user, &session).await?;
    state.orchestrator.start(id, &user, true).await?;
    Ok(Json(state.store.get_session(id).await?))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<SessionRecord>, ApiError> {
    require_user(&headers)?;
    state.orchestrator.stop(id).await?;
    Ok(Json(state.store.get_session(id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_user(&headers)?;
    state.orchestrator.cancel(id);
    if !state.store.delete_session(id).await? {
        return Err(ApiError::NotFound(format!("session {id}")));
    }
    info!(session = %id, "session deleted");
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn reset_memory(
    State(state): State<AppState>,
    Path((id, persona)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_user(&headers)?;
    let removed = state.orchestrator.reset_memory(id, &persona).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    // 404 for unknown sessions rather than an empty list.
    state.store.get_session(id).await?;
    Ok(Json(state.store.messages_for_session(id).await?))
}

async fn get_feedback_rounds(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<FeedbackRoundRecord>>, ApiError> {
    state.store.get_session(id).await?;
    Ok(Json(state.store.feedback_rounds_for_session(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFeedbackRequest {
    pub iteration: u32,
    pub feedback: String,
}

async fn post_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<UserFeedbackRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_user(&headers)?;
    if req.feedback.trim().is_empty() {
        return Err(ApiError::Validation("feedback must not be empty".into()));
    }
    state
        .store
        .set_user_feedback(id, req.iteration, &req.feedback)
        .await?;
    Ok(Json(serde_json::json!({ "iteration": req.iteration })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterateRequest {
    pub comments: String,
    pub tone: Option<String>,
    pub length: Option<String>,
    pub audience: Option<String>,
    #[serde(default = "default_additional_iterations")]
    pub max_additional_iterations: u32,
}

fn default_additional_iterations() -> u32 {
    1
}

async fn iterate_with_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<IterateRequest>,
) -> Result<Json<SessionRecord>, ApiError> {
    let user = require_user(&headers)?;
    let session = state.store.get_session(id).await?;
    require_keys(&state, &user, &session).await?;
    let session = state
        .orchestrator
        .iterate_with_feedback(
            id,
            &user,
            IterateWithFeedback {
                comments: req.comments,
                tone: req.tone,
                length: req.length,
                audience: req.audience,
                max_additional_iterations: req.max_additional_iterations,
            },
        )
        .await?;
    Ok(Json(session))
}

// ─── Model roster ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateModelRequest {
    pub model_name: String,
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
    pub provider: Provider,
    /// Write-only: stored sealed, never echoed back.
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateModelRequest {
    pub model_name: Option<String>,
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
    pub provider: Option<Provider>,
    pub api_key: Option<String>,
}

/// Endpoint fallback: the config catalog entry for this model name, then the
/// driver registry default.
fn default_endpoint(config: &Config, model_name: &str, provider: Provider) -> Option<String> {
    config
        .models
        .iter()
        .find(|m| m.model_name == model_name && m.provider == provider.as_str())
        .map(|m| m.endpoint.clone())
        .or_else(|| {
            get_driver(provider.as_str())
                .and_then(|d| d.default_endpoint)
                .map(String::from)
        })
}

async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConfiguredModelSummary>>, ApiError> {
    let user = require_user(&headers)?;
    Ok(Json(state.credentials.list(&user).await?))
}

async fn create_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateModelRequest>,
) -> Result<Json<ConfiguredModelSummary>, ApiError> {
    let user = require_user(&headers)?;
    if req.model_name.trim().is_empty() {
        return Err(ApiError::Validation("modelName must not be empty".into()));
    }
    let endpoint = req
        .endpoint
        .filter(|e| !e.is_empty())
        .or_else(|| default_endpoint(&state.config, &req.model_name, req.provider))
        .ok_or_else(|| {
            ApiError::Validation(format!(
                "no endpoint given and no default known for provider `{}`",
                req.provider.as_str()
            ))
        })?;
    let created = state
        .credentials
        .add(
            &user,
            NewConfiguredModel {
                model_name: req.model_name,
                display_name: req.display_name,
                endpoint,
                provider: req.provider,
                api_key: req.api_key,
            },
        )
        .await?;
    info!(user = %user, model = %created.model_name, "model registered");
    Ok(Json(created))
}

async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<UpdateModelRequest>,
) -> Result<Json<ConfiguredModelSummary>, ApiError> {
    let user = require_user(&headers)?;
    let updated = state
        .credentials
        .update(
            &user,
            id,
            ConfiguredModelUpdate {
                model_name: req.model_name,
                display_name: req.display_name,
                endpoint: req.endpoint,
                provider: req.provider,
                api_key: req.api_key,
            },
        )
        .await?;
    Ok(Json(updated))
}

async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = require_user(&headers)?;
    if !state.credentials.delete(&user, id).await? {
        return Err(ApiError::NotFound(format!("model {id}")));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}
