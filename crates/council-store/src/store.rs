// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite-backed persistence for sessions, messages, feedback rounds,
//! configured models, and user settings.
//!
//! A single connection guarded by an async mutex serialises all access, so
//! read-modify-write sequences performed under one lock acquisition are
//! atomic with respect to other callers.  Persona snapshots and reviewer
//! summaries are stored as JSON columns; timestamps are RFC 3339 text.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::entities::*;

/// Errors produced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub struct SqliteStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
            }
        }
        let conn = rusqlite::Connection::open(path)?;

        // WAL mode for concurrent access.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::init_connection(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Open an in-memory store (useful for tests and `persistence.enabled =
    /// false`).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_connection(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        // Cascade deletes rely on this; SQLite leaves it off by default.
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(conn)
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id       TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                status           TEXT NOT NULL,
                stop_reason      TEXT NOT NULL DEFAULT 'none',
                max_iterations   INTEGER NOT NULL,
                current_iteration INTEGER NOT NULL DEFAULT 0,
                feedback_version INTEGER NOT NULL DEFAULT 1,
                stop_marker      TEXT NOT NULL,
                stop_on_reviewer_approved INTEGER NOT NULL,
                run_mode         TEXT NOT NULL,
                topic            TEXT NOT NULL DEFAULT '',
                final_content    TEXT,
                creator_json     TEXT NOT NULL,
                reviewers_json   TEXT NOT NULL,
                needs_final_iteration INTEGER NOT NULL DEFAULT 0,
                pending_guidance TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

            CREATE TABLE IF NOT EXISTS messages (
                message_id   TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL,
                role         TEXT NOT NULL,
                author       TEXT NOT NULL,
                iteration    INTEGER NOT NULL,
                content      TEXT NOT NULL,
                model_used   TEXT NOT NULL,
                reviewer_display_name TEXT,
                created_at   TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session_iteration
                ON messages(session_id, iteration);

            CREATE TABLE IF NOT EXISTS feedback_rounds (
                feedback_round_id TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL,
                iteration    INTEGER NOT NULL,
                draft_content TEXT NOT NULL,
                user_feedback TEXT,
                user_feedback_at TEXT,
                all_reviewers_approved INTEGER NOT NULL,
                reviewer_summaries_json TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                UNIQUE (session_id, iteration),
                FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_feedback_session_iteration
                ON feedback_rounds(session_id, iteration);

            CREATE TABLE IF NOT EXISTS configured_models (
                model_id     TEXT PRIMARY KEY,
                user_email   TEXT NOT NULL,
                model_name   TEXT NOT NULL,
                display_name TEXT,
                endpoint     TEXT NOT NULL,
                provider     TEXT NOT NULL,
                sealed_key   BLOB,
                created_at   TEXT NOT NULL,
                UNIQUE (user_email, model_name)
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id               TEXT PRIMARY KEY,
                native_agent_model_id TEXT
            );",
        )?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub async fn insert_session(&self, s: &SessionRecord) -> Result<(), StoreError> {
        let creator_json = serde_json::to_string(&s.creator)?;
        let reviewers_json = serde_json::to_string(&s.reviewers)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions
                (session_id, name, status, stop_reason, max_iterations,
                 current_iteration, feedback_version, stop_marker,
                 stop_on_reviewer_approved, run_mode, topic, final_content,
                 creator_json, reviewers_json, needs_final_iteration,
                 pending_guidance, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                s.session_id.to_string(),
                s.name,
                s.status.as_str(),
                s.stop_reason.as_str(),
                s.max_iterations,
                s.current_iteration,
                s.feedback_version,
                s.stop_marker,
                s.stop_on_reviewer_approved as i32,
                s.run_mode.as_str(),
                s.topic,
                s.final_content,
                creator_json,
                reviewers_json,
                s.needs_final_iteration as i32,
                s.pending_guidance,
                s.created_at.to_rfc3339(),
                s.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Rewrite every mutable session field and bump `updated_at`.
    pub async fn update_session(&self, s: &SessionRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE sessions SET
                name = ?2, status = ?3, stop_reason = ?4, max_iterations = ?5,
                current_iteration = ?6, feedback_version = ?7,
                final_content = ?8, needs_final_iteration = ?9,
                pending_guidance = ?10, run_mode = ?11, updated_at = ?12
             WHERE session_id = ?1",
            params![
                s.session_id.to_string(),
                s.name,
                s.status.as_str(),
                s.stop_reason.as_str(),
                s.max_iterations,
                s.current_iteration,
                s.feedback_version,
                s.final_content,
                s.needs_final_iteration as i32,
                s.pending_guidance,
                s.run_mode.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", s.session_id)));
        }
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<SessionRecord, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE session_id = ?1"),
                params![id.to_string()],
                read_session_row,
            )
            .optional()?;
        raw.ok_or_else(|| StoreError::NotFound(format!("session {id}")))?
            .into_record()
    }

    /// All sessions, newest-updated first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map([], read_session_row)?;
        let mut sessions = Vec::new();
        for raw in rows {
            sessions.push(raw?.into_record()?);
        }
        Ok(sessions)
    }

    /// Delete a session; messages and feedback rounds cascade.
    pub async fn delete_session(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub async fn insert_message(&self, m: &MessageRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages
                (message_id, session_id, role, author, iteration, content,
                 model_used, reviewer_display_name, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                m.message_id.to_string(),
                m.session_id.to_string(),
                m.role.as_str(),
                m.author,
                m.iteration,
                m.content,
                m.model_used,
                m.reviewer_display_name,
                m.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All messages of a session in insertion order.
    pub async fn messages_for_session(&self, id: Uuid) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages WHERE session_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![id.to_string()], read_message_row)?;
        collect_messages(rows)
    }

    /// The most recent `limit` messages of a session, in chronological order.
    pub async fn recent_messages(
        &self,
        id: Uuid,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM (
                 SELECT *, rowid AS rid FROM messages
                 WHERE session_id = ?1 ORDER BY rid DESC LIMIT ?2
             ) ORDER BY rid ASC"
        ))?;
        let rows = stmt.query_map(params![id.to_string(), limit as i64], read_message_row)?;
        collect_messages(rows)
    }

    /// The most recent `limit` messages of one author, in chronological order.
    pub async fn recent_messages_by_author(
        &self,
        id: Uuid,
        author: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM (
                 SELECT *, rowid AS rid FROM messages
                 WHERE session_id = ?1 AND author = ?2 ORDER BY rid DESC LIMIT ?3
             ) ORDER BY rid ASC"
        ))?;
        let rows = stmt.query_map(
            params![id.to_string(), author, limit as i64],
            read_message_row,
        )?;
        collect_messages(rows)
    }

    /// Content of the most recent message by `author`, if any.
    pub async fn last_content_by_author(
        &self,
        id: Uuid,
        author: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        let content = conn
            .query_row(
                "SELECT content FROM messages
                 WHERE session_id = ?1 AND author = ?2
                 ORDER BY rowid DESC LIMIT 1",
                params![id.to_string(), author],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(content)
    }

    /// Remove every message authored by one persona.  Returns the number of
    /// rows removed.
    pub async fn delete_messages_by_author(
        &self,
        id: Uuid,
        author: &str,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM messages WHERE session_id = ?1 AND author = ?2",
            params![id.to_string(), author],
        )?;
        Ok(changed)
    }

    // ── Feedback rounds ───────────────────────────────────────────────────────

    /// Insert a feedback round.  At most one round may exist per
    /// `(session, iteration)`; the connection lock makes the check-and-insert
    /// atomic.
    pub async fn insert_feedback_round(
        &self,
        r: &FeedbackRoundRecord,
    ) -> Result<(), StoreError> {
        let summaries_json = serde_json::to_string(&r.reviewer_summaries)?;
        let conn = self.conn.lock().await;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM feedback_rounds WHERE session_id = ?1 AND iteration = ?2",
                params![r.session_id.to_string(), r.iteration],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!(
                "feedback round for session {} iteration {} already exists",
                r.session_id, r.iteration
            )));
        }
        conn.execute(
            "INSERT INTO feedback_rounds
                (feedback_round_id, session_id, iteration, draft_content,
                 user_feedback, user_feedback_at, all_reviewers_approved,
                 reviewer_summaries_json, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                r.feedback_round_id.to_string(),
                r.session_id.to_string(),
                r.iteration,
                r.draft_content,
                r.user_feedback,
                r.user_feedback_at.map(|t| t.to_rfc3339()),
                r.all_reviewers_approved as i32,
                summaries_json,
                r.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Rounds of a session in iteration order.
    pub async fn feedback_rounds_for_session(
        &self,
        id: Uuid,
    ) -> Result<Vec<FeedbackRoundRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUND_COLS} FROM feedback_rounds
             WHERE session_id = ?1 ORDER BY iteration ASC"
        ))?;
        let rows = stmt.query_map(params![id.to_string()], read_round_row)?;
        let mut rounds = Vec::new();
        for raw in rows {
            rounds.push(raw?.into_record()?);
        }
        Ok(rounds)
    }

    /// Attach user feedback text to one iteration's round.
    pub async fn set_user_feedback(
        &self,
        id: Uuid,
        iteration: u32,
        feedback: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE feedback_rounds SET user_feedback = ?3, user_feedback_at = ?4
             WHERE session_id = ?1 AND iteration = ?2",
            params![
                id.to_string(),
                iteration,
                feedback,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "feedback round for session {id} iteration {iteration}"
            )));
        }
        Ok(())
    }

    // ── Configured models ─────────────────────────────────────────────────────

    /// Insert a model registration.  Fails with `Conflict` when the user
    /// already has an entry with the same model name.
    pub async fn insert_model(&self, m: &ConfiguredModel) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM configured_models WHERE user_email = ?1 AND model_name = ?2",
                params![m.user_email, m.model_name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!(
                "model `{}` already configured for {}",
                m.model_name, m.user_email
            )));
        }
        conn.execute(
            "INSERT INTO configured_models
                (model_id, user_email, model_name, display_name, endpoint,
                 provider, sealed_key, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                m.model_id.to_string(),
                m.user_email,
                m.model_name,
                m.display_name,
                m.endpoint,
                m.provider.as_str(),
                m.sealed_key,
                m.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Overwrite a model registration.  Fails with `Conflict` when renaming
    /// would collide with another of the user's entries.
    pub async fn update_model(&self, m: &ConfiguredModel) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let colliding: Option<String> = conn
            .query_row(
                "SELECT model_id FROM configured_models
                 WHERE user_email = ?1 AND model_name = ?2 AND model_id != ?3",
                params![m.user_email, m.model_name, m.model_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if colliding.is_some() {
            return Err(StoreError::Conflict(format!(
                "model `{}` already configured for {}",
                m.model_name, m.user_email
            )));
        }
        let changed = conn.execute(
            "UPDATE configured_models SET
                model_name = ?3, display_name = ?4, endpoint = ?5,
                provider = ?6, sealed_key = ?7
             WHERE model_id = ?1 AND user_email = ?2",
            params![
                m.model_id.to_string(),
                m.user_email,
                m.model_name,
                m.display_name,
                m.endpoint,
                m.provider.as_str(),
                m.sealed_key,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("model {}", m.model_id)));
        }
        Ok(())
    }

    pub async fn list_models(&self, user: &str) -> Result<Vec<ConfiguredModel>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODEL_COLS} FROM configured_models
             WHERE user_email = ?1 ORDER BY model_name ASC"
        ))?;
        let rows = stmt.query_map(params![user], read_model_row)?;
        let mut models = Vec::new();
        for raw in rows {
            models.push(raw?.into_record()?);
        }
        Ok(models)
    }

    pub async fn get_model_by_name(
        &self,
        user: &str,
        model_name: &str,
    ) -> Result<Option<ConfiguredModel>, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {MODEL_COLS} FROM configured_models
                     WHERE user_email = ?1 AND model_name = ?2"
                ),
                params![user, model_name],
                read_model_row,
            )
            .optional()?;
        raw.map(|r| r.into_record()).transpose()
    }

    pub async fn get_model(
        &self,
        user: &str,
        id: Uuid,
    ) -> Result<Option<ConfiguredModel>, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {MODEL_COLS} FROM configured_models
                     WHERE user_email = ?1 AND model_id = ?2"
                ),
                params![user, id.to_string()],
                read_model_row,
            )
            .optional()?;
        raw.map(|r| r.into_record()).transpose()
    }

    pub async fn delete_model(&self, user: &str, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM configured_models WHERE user_email = ?1 AND model_id = ?2",
            params![user, id.to_string()],
        )?;
        Ok(changed > 0)
    }

    // ── User settings ─────────────────────────────────────────────────────────

    pub async fn get_user_settings(&self, user: &str) -> Result<Option<UserSettings>, StoreError> {
        let conn = self.conn.lock().await;
        let raw: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT user_id, native_agent_model_id FROM user_settings WHERE user_id = ?1",
                params![user],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        raw.map(|(user_id, model_id)| {
            let native_agent_model_id = model_id
                .map(|s| parse_uuid(&s))
                .transpose()?;
            Ok(UserSettings {
                user_id,
                native_agent_model_id,
            })
        })
        .transpose()
    }

    pub async fn put_user_settings(&self, settings: &UserSettings) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_settings (user_id, native_agent_model_id)
             VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET native_agent_model_id = excluded.native_agent_model_id",
            params![
                settings.user_id,
                settings.native_agent_model_id.map(|u| u.to_string()),
            ],
        )?;
        Ok(())
    }
}

// ─── Row mapping ──────────────────────────────────────────────────────────────
//
// Closures passed to rusqlite must return `rusqlite::Result`, so rows are
// first read into raw tuples of plain column types, then converted with
// proper error mapping outside the closure.

const SESSION_COLS: &str = "session_id, name, status, stop_reason, max_iterations, \
    current_iteration, feedback_version, stop_marker, stop_on_reviewer_approved, \
    run_mode, topic, final_content, creator_json, reviewers_json, \
    needs_final_iteration, pending_guidance, created_at, updated_at";

const MESSAGE_COLS: &str = "message_id, session_id, role, author, iteration, \
    content, model_used, reviewer_display_name, created_at";

const ROUND_COLS: &str = "feedback_round_id, session_id, iteration, draft_content, \
    user_feedback, user_feedback_at, all_reviewers_approved, \
    reviewer_summaries_json, created_at";

const MODEL_COLS: &str = "model_id, user_email, model_name, display_name, endpoint, \
    provider, sealed_key, created_at";

struct RawSession {
    session_id: String,
    name: String,
    status: String,
    stop_reason: String,
    max_iterations: u32,
    current_iteration: u32,
    feedback_version: u32,
    stop_marker: String,
    stop_on_reviewer_approved: bool,
    run_mode: String,
    topic: String,
    final_content: Option<String>,
    creator_json: String,
    reviewers_json: String,
    needs_final_iteration: bool,
    pending_guidance: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok(RawSession {
        session_id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        stop_reason: row.get(3)?,
        max_iterations: row.get(4)?,
        current_iteration: row.get(5)?,
        feedback_version: row.get(6)?,
        stop_marker: row.get(7)?,
        stop_on_reviewer_approved: row.get(8)?,
        run_mode: row.get(9)?,
        topic: row.get(10)?,
        final_content: row.get(11)?,
        creator_json: row.get(12)?,
        reviewers_json: row.get(13)?,
        needs_final_iteration: row.get(14)?,
        pending_guidance: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

impl RawSession {
    fn into_record(self) -> Result<SessionRecord, StoreError> {
        Ok(SessionRecord {
            session_id: parse_uuid(&self.session_id)?,
            name: self.name,
            status: SessionStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Serialization(format!("status `{}`", self.status)))?,
            stop_reason: StopReason::parse(&self.stop_reason).ok_or_else(|| {
                StoreError::Serialization(format!("stop reason `{}`", self.stop_reason))
            })?,
            max_iterations: self.max_iterations,
            current_iteration: self.current_iteration,
            feedback_version: self.feedback_version,
            stop_marker: self.stop_marker,
            stop_on_reviewer_approved: self.stop_on_reviewer_approved,
            run_mode: RunMode::parse(&self.run_mode)
                .ok_or_else(|| StoreError::Serialization(format!("run mode `{}`", self.run_mode)))?,
            topic: self.topic,
            final_content: self.final_content,
            creator: serde_json::from_str(&self.creator_json)?,
            reviewers: serde_json::from_str(&self.reviewers_json)?,
            needs_final_iteration: self.needs_final_iteration,
            pending_guidance: self.pending_guidance,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

type RawMessage = (
    String,
    String,
    String,
    String,
    u32,
    String,
    String,
    Option<String>,
    String,
);

fn read_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn message_from_raw(raw: RawMessage) -> Result<MessageRecord, StoreError> {
    let (message_id, session_id, role, author, iteration, content, model_used, reviewer, created) =
        raw;
    Ok(MessageRecord {
        message_id: parse_uuid(&message_id)?,
        session_id: parse_uuid(&session_id)?,
        role: MessageRole::parse(&role)
            .ok_or_else(|| StoreError::Serialization(format!("role `{role}`")))?,
        author,
        iteration,
        content,
        model_used,
        reviewer_display_name: reviewer,
        created_at: parse_ts(&created)?,
    })
}

fn collect_messages(
    rows: impl Iterator<Item = rusqlite::Result<RawMessage>>,
) -> Result<Vec<MessageRecord>, StoreError> {
    let mut messages = Vec::new();
    for raw in rows {
        messages.push(message_from_raw(raw?)?);
    }
    Ok(messages)
}

struct RawRound {
    feedback_round_id: String,
    session_id: String,
    iteration: u32,
    draft_content: String,
    user_feedback: Option<String>,
    user_feedback_at: Option<String>,
    all_reviewers_approved: bool,
    reviewer_summaries_json: String,
    created_at: String,
}

fn read_round_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRound> {
    Ok(RawRound {
        feedback_round_id: row.get(0)?,
        session_id: row.get(1)?,
        iteration: row.get(2)?,
        draft_content: row.get(3)?,
        user_feedback: row.get(4)?,
        user_feedback_at: row.get(5)?,
        all_reviewers_approved: row.get(6)?,
        reviewer_summaries_json: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl RawRound {
    fn into_record(self) -> Result<FeedbackRoundRecord, StoreError> {
        Ok(FeedbackRoundRecord {
            feedback_round_id: parse_uuid(&self.feedback_round_id)?,
            session_id: parse_uuid(&self.session_id)?,
            iteration: self.iteration,
            draft_content: self.draft_content,
            user_feedback: self.user_feedback,
            user_feedback_at: self.user_feedback_at.as_deref().map(parse_ts).transpose()?,
            all_reviewers_approved: self.all_reviewers_approved,
            reviewer_summaries: serde_json::from_str(&self.reviewer_summaries_json)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RawModel {
    model_id: String,
    user_email: String,
    model_name: String,
    display_name: Option<String>,
    endpoint: String,
    provider: String,
    sealed_key: Option<Vec<u8>>,
    created_at: String,
}

fn read_model_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawModel> {
    Ok(RawModel {
        model_id: row.get(0)?,
        user_email: row.get(1)?,
        model_name: row.get(2)?,
        display_name: row.get(3)?,
        endpoint: row.get(4)?,
        provider: row.get(5)?,
        sealed_key: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl RawModel {
    fn into_record(self) -> Result<ConfiguredModel, StoreError> {
        Ok(ConfiguredModel {
            model_id: parse_uuid(&self.model_id)?,
            user_email: self.user_email,
            model_name: self.model_name,
            display_name: self.display_name,
            endpoint: self.endpoint,
            provider: Provider::parse(&self.provider)
                .ok_or_else(|| StoreError::Serialization(format!("provider `{}`", self.provider)))?,
            sealed_key: self.sealed_key,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("uuid `{s}`: {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp `{s}`: {e}")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
