//! Coordinator State
//!
//! The participant registry shared by every component: who is connected,
//! how to reach them, and which session (if any) they occupy. Passed
//! explicitly to the session managers, the probe coordinator and the sync
//! coordinator.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::matchmaking::{GroupHistory, MatchCandidate};
use crate::network::protocol::ServerMessage;
use crate::session::{ParticipantId, SessionError, SessionId};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Transport is up.
    Connected,
    /// Transport dropped; may come back.
    Disconnected {
        /// When the drop happened.
        since: Instant,
    },
}

/// A known participant.
#[derive(Debug)]
pub struct Participant {
    /// Identifier.
    pub id: ParticipantId,
    /// Scene the participant joined.
    pub scene_id: Option<String>,
    /// Session occupied, if any.
    pub session: Option<SessionId>,
    /// Connection state.
    pub liveness: Liveness,
    /// Last message received.
    pub last_seen: Instant,
    /// Latest server round-trip (ms).
    pub rtt_ms: Option<u32>,
    /// Previous group, for re-pairing.
    pub group_history: Option<GroupHistory>,
    /// When the client was backgrounded, if it is.
    pub hidden_since: Option<Instant>,
    sender: Option<mpsc::Sender<ServerMessage>>,
}

impl Participant {
    /// Check if the participant is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.liveness, Liveness::Connected)
    }
}

/// Result of registering a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// First connection for this id.
    New,
    /// A dropped participant came back; carries its scene and session.
    Reattached {
        /// Scene joined before the drop.
        scene_id: Option<String>,
        /// Session occupied before the drop.
        session: Option<SessionId>,
    },
}

/// Registry of participants.
#[derive(Debug, Default)]
pub struct CoordinatorState {
    participants: RwLock<BTreeMap<ParticipantId, Participant>>,
}

impl CoordinatorState {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, or reattach a disconnected participant.
    pub async fn register(
        &self,
        id: ParticipantId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<Registration, SessionError> {
        let mut participants = self.participants.write().await;

        if let Some(existing) = participants.get_mut(&id) {
            if existing.is_connected() {
                return Err(SessionError::AlreadyConnected(id));
            }
            existing.liveness = Liveness::Connected;
            existing.sender = Some(sender);
            existing.last_seen = Instant::now();
            existing.hidden_since = None;
            debug!(participant = %id, "Participant reattached");
            return Ok(Registration::Reattached {
                scene_id: existing.scene_id.clone(),
                session: existing.session,
            });
        }

        participants.insert(
            id.clone(),
            Participant {
                id,
                scene_id: None,
                session: None,
                liveness: Liveness::Connected,
                last_seen: Instant::now(),
                rtt_ms: None,
                group_history: None,
                hidden_since: None,
                sender: Some(sender),
            },
        );
        Ok(Registration::New)
    }

    /// Forget a participant entirely.
    pub async fn unregister(&self, id: &ParticipantId) -> bool {
        self.participants.write().await.remove(id).is_some()
    }

    /// Whether the id is known.
    pub async fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.read().await.contains_key(id)
    }

    /// Record join details used for matchmaking.
    pub async fn set_join_info(
        &self,
        id: &ParticipantId,
        scene_id: &str,
        rtt_ms: Option<u32>,
        group_history: Option<GroupHistory>,
    ) {
        if let Some(p) = self.participants.write().await.get_mut(id) {
            p.scene_id = Some(scene_id.to_string());
            if rtt_ms.is_some() {
                p.rtt_ms = rtt_ms;
            }
            p.group_history = group_history;
        }
    }

    /// Build a fresh matchmaking candidate.
    pub async fn candidate(&self, id: &ParticipantId) -> MatchCandidate {
        let participants = self.participants.read().await;
        match participants.get(id) {
            Some(p) => MatchCandidate {
                participant_id: id.clone(),
                rtt_ms: p.rtt_ms,
                group_history: p.group_history.clone(),
            },
            None => MatchCandidate::new(id.clone()),
        }
    }

    /// Update the server round-trip.
    pub async fn set_rtt(&self, id: &ParticipantId, rtt_ms: u32) {
        if let Some(p) = self.participants.write().await.get_mut(id) {
            p.rtt_ms = Some(rtt_ms);
        }
    }

    /// Mark a message received.
    pub async fn touch(&self, id: &ParticipantId) {
        if let Some(p) = self.participants.write().await.get_mut(id) {
            p.last_seen = Instant::now();
        }
    }

    /// Bind a participant to a session.
    ///
    /// A participant occupies at most one session across the process.
    pub async fn attach_session(
        &self,
        id: &ParticipantId,
        session: SessionId,
    ) -> Result<(), SessionError> {
        let mut participants = self.participants.write().await;
        let p = participants
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownParticipant(id.clone()))?;
        match p.session {
            Some(current) if current != session => Err(SessionError::AlreadyInSession(id.clone())),
            _ => {
                p.session = Some(session);
                Ok(())
            }
        }
    }

    /// Unbind a participant from `session`. No-op if bound elsewhere.
    pub async fn detach_session(&self, id: &ParticipantId, session: SessionId) {
        if let Some(p) = self.participants.write().await.get_mut(id) {
            if p.session == Some(session) {
                p.session = None;
            }
        }
    }

    /// Session a participant occupies.
    pub async fn session_of(&self, id: &ParticipantId) -> Option<SessionId> {
        self.participants.read().await.get(id).and_then(|p| p.session)
    }

    /// Scene a participant joined.
    pub async fn scene_of(&self, id: &ParticipantId) -> Option<String> {
        self.participants
            .read()
            .await
            .get(id)
            .and_then(|p| p.scene_id.clone())
    }

    /// Mark the transport dropped. Returns the instant recorded.
    pub async fn mark_disconnected(&self, id: &ParticipantId) -> Option<Instant> {
        let mut participants = self.participants.write().await;
        let p = participants.get_mut(id)?;
        let since = Instant::now();
        p.liveness = Liveness::Disconnected { since };
        p.sender = None;
        Some(since)
    }

    /// Current liveness.
    pub async fn liveness(&self, id: &ParticipantId) -> Option<Liveness> {
        self.participants.read().await.get(id).map(|p| p.liveness)
    }

    /// Record a visibility change. Returns the hidden instant when hidden.
    pub async fn set_hidden(&self, id: &ParticipantId, hidden: bool) -> Option<Instant> {
        let mut participants = self.participants.write().await;
        let p = participants.get_mut(id)?;
        if hidden {
            Some(*p.hidden_since.get_or_insert_with(Instant::now))
        } else {
            p.hidden_since = None;
            None
        }
    }

    /// When the participant was backgrounded, if still hidden.
    pub async fn hidden_since(&self, id: &ParticipantId) -> Option<Instant> {
        self.participants.read().await.get(id).and_then(|p| p.hidden_since)
    }

    /// Send a message to one participant. Returns `false` if unreachable.
    pub async fn send(&self, id: &ParticipantId, message: ServerMessage) -> bool {
        let sender = {
            let participants = self.participants.read().await;
            participants.get(id).and_then(|p| p.sender.clone())
        };

        match sender {
            Some(sender) => {
                if sender.send(message).await.is_err() {
                    warn!(participant = %id, "Outbound channel closed");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Send a message to several participants.
    pub async fn broadcast<'a, I>(&self, ids: I, message: &ServerMessage)
    where
        I: IntoIterator<Item = &'a ParticipantId>,
    {
        for id in ids {
            self.send(id, message.clone()).await;
        }
    }

    /// Number of known participants.
    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Read-only view for observers.
    pub async fn snapshot(&self) -> Vec<ParticipantSnapshot> {
        self.participants
            .read()
            .await
            .values()
            .map(|p| ParticipantSnapshot {
                participant_id: p.id.clone(),
                scene_id: p.scene_id.clone(),
                session: p.session,
                connected: p.is_connected(),
                idle_ms: p.last_seen.elapsed().as_millis() as u64,
                rtt_ms: p.rtt_ms,
                hidden: p.hidden_since.is_some(),
            })
            .collect()
    }
}

/// Serializable view of a participant.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSnapshot {
    /// Identifier.
    pub participant_id: ParticipantId,
    /// Scene joined.
    pub scene_id: Option<String>,
    /// Session occupied.
    pub session: Option<SessionId>,
    /// Transport up.
    pub connected: bool,
    /// Time since the last message.
    pub idle_ms: u64,
    /// Server round-trip.
    pub rtt_ms: Option<u32>,
    /// Client backgrounded.
    pub hidden: bool,
}
