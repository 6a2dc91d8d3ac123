// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use council_store::StopReason;

/// Events emitted while orchestrating a session.
/// Consumers (WebSocket bridge, tests) subscribe per session to drive their
/// output.  Serialised with a `type` tag for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    SessionStarted { session_id: Uuid },
    #[serde(rename_all = "camelCase")]
    SessionPaused { session_id: Uuid },
    #[serde(rename_all = "camelCase")]
    SessionStopped { session_id: Uuid, reason: StopReason },
    #[serde(rename_all = "camelCase")]
    SessionCompleted {
        session_id: Uuid,
        final_content: String,
        stop_reason: StopReason,
    },
    #[serde(rename_all = "camelCase")]
    SessionError { session_id: Uuid, message: String },
    #[serde(rename_all = "camelCase")]
    IterationStarted { session_id: Uuid, iteration: u32 },
    #[serde(rename_all = "camelCase")]
    IterationCompleted { session_id: Uuid, iteration: u32 },
    /// A persona began producing a message (`persona_id` is `"Creator"` or a
    /// reviewer id).
    #[serde(rename_all = "camelCase")]
    MessageStarted {
        session_id: Uuid,
        message_id: Uuid,
        persona_id: String,
        iteration: u32,
    },
    #[serde(rename_all = "camelCase")]
    MessageChunk {
        session_id: Uuid,
        message_id: Uuid,
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageCompleted {
        session_id: Uuid,
        message_id: Uuid,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    PersonaMemoryReset { session_id: Uuid, persona_id: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::SessionStarted { session_id }
            | Self::SessionPaused { session_id }
            | Self::SessionStopped { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionError { session_id, .. }
            | Self::IterationStarted { session_id, .. }
            | Self::IterationCompleted { session_id, .. }
            | Self::MessageStarted { session_id, .. }
            | Self::MessageChunk { session_id, .. }
            | Self::MessageCompleted { session_id, .. }
            | Self::PersonaMemoryReset { session_id, .. } => *session_id,
        }
    }
}

/// Process-wide publish/subscribe registry keyed by session id.
///
/// Each session gets its own broadcast channel, so per-session FIFO order is
/// exactly the publish order of the single orchestrator task.  Publishing is
/// non-blocking: a subscriber that falls more than `capacity` events behind
/// observes `Lagged` on its receiver instead of slowing the orchestrator.
pub struct EventHub {
    capacity: usize,
    channels: DashMap<Uuid, broadcast::Sender<SessionEvent>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one session's event stream.  Only events published after
    /// this call are delivered; history is served by the persistence layer.
    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        self.channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to the session's subscribers.  A session with no
    /// subscribers has its channel entry dropped to keep the table small.
    pub fn publish(&self, event: SessionEvent) {
        let id = event.session_id();
        let sender = self.channels.get(&id).map(|e| e.value().clone());
        if let Some(tx) = sender {
            if tx.send(event).is_err() {
                self.channels.remove(&id);
            }
        }
    }

    /// Number of sessions with a live channel (test/diagnostic helper).
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
