//! Session Manager
//!
//! One manager per scene. It owns the waitroom, asks the matchmaker for
//! groups, gates proposals on peer probes when configured, creates sessions
//! and drives them from countdown to teardown.
//!
//! ## Admission
//!
//! Every admission decision runs under one coarse lock over the waitroom and
//! the pending-match table, so concurrent arrivals are decided one at a time.
//!
//! ## Session task
//!
//! Each session gets one task that runs the countdown, the validation phase
//! and then the simulation driver for its execution mode (server tick loop,
//! or the authoritative mirror of a client-run session). The task watches the
//! session's end signal and exits as soon as the session is torn down.
//!
//! ## Disconnects
//!
//! Removing a member from a session resolves by (was running) x (now empty):
//!
//! | running | empty | action |
//! |---------|-------|--------|
//! | any     | yes   | cleanup |
//! | no      | no    | `end_session {lobby_ended}` to the rest, cleanup |
//! | yes     | no    | `end_session {partner_disconnected}` to the rest, cleanup |
//!
//! unless the scene's disconnect policy lets a running session continue.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::rng::derive_session_seed;
use crate::env::EnvFactory;
use crate::matchmaking::{build_matchmaker, is_valid_proposal, Matchmaker};
use crate::network::protocol::{
    ActionSubmission, EndReason, FullStateUpload, LogSubmission, ServerMessage,
    SessionStartInfo, StateHashReport, WaitroomStatus,
};
use crate::probe::ProbeCoordinator;
use crate::scene::{DisconnectPolicy, ExecutionMode, SceneConfig};
use crate::session::server_run::ServerRunLoop;
use crate::session::{
    CoordinatorState, LifecycleState, Liveness, ParticipantId, Session, SessionError, SessionId,
    SessionSnapshot, SlotId,
};
use crate::sync::{
    run_authoritative, ClientSyncCoordinator, LogEntry, RunOutcome, ServerGameRunner, SlotRemoval,
};

/// Outcome of [`SessionManager::add_participant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No group yet; in the waitroom.
    Waiting,
    /// A group was proposed and is waiting on a peer probe.
    Probing,
    /// A session was created.
    Matched(SessionId),
}

/// Events for observers (dashboards, data collectors).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// A participant entered the waitroom.
    ParticipantWaiting {
        /// Scene.
        scene_id: String,
        /// Participant.
        participant_id: ParticipantId,
        /// Waitroom size after the arrival.
        waiting: usize,
    },
    /// A proposal is being probed.
    ProbeStarted {
        /// Scene.
        scene_id: String,
        /// Proposed group.
        members: Vec<ParticipantId>,
    },
    /// A probed proposal was rejected.
    MatchRejected {
        /// Scene.
        scene_id: String,
        /// Proposed group.
        members: Vec<ParticipantId>,
        /// Measured peer RTT.
        rtt_ms: Option<u32>,
    },
    /// A session was created.
    SessionCreated {
        /// Scene.
        scene_id: String,
        /// Session.
        session_id: SessionId,
        /// Members in slot order.
        members: Vec<ParticipantId>,
    },
    /// Every member confirmed readiness; the simulation is starting.
    SessionStarted {
        /// Session.
        session_id: SessionId,
    },
    /// A session was torn down.
    SessionEnded {
        /// Session.
        session_id: SessionId,
        /// Why, when known.
        reason: Option<EndReason>,
    },
    /// Host telemetry collected from a client-run session at teardown.
    SessionLogs {
        /// Session.
        session_id: SessionId,
        /// Entries in arrival order.
        entries: Vec<LogEntry>,
    },
    /// A participant left the waitroom or a session.
    ParticipantRemoved {
        /// Participant.
        participant_id: ParticipantId,
        /// Session left, if any.
        session_id: Option<SessionId>,
    },
    /// A participant's transport dropped mid-session.
    ParticipantDisconnected {
        /// Participant.
        participant_id: ParticipantId,
    },
    /// A dropped participant came back.
    ParticipantReconnected {
        /// Participant.
        participant_id: ParticipantId,
    },
    /// A participant waited too long.
    WaitroomExpired {
        /// Participant.
        participant_id: ParticipantId,
    },
}

#[derive(Debug, Clone)]
struct WaitroomEntry {
    participant_id: ParticipantId,
    joined_at: Instant,
}

/// A proposed group waiting on a probe.
#[derive(Debug, Clone)]
struct PendingMatch {
    members: Vec<ParticipantId>,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct Waitroom {
    entries: Vec<WaitroomEntry>,
    pending: BTreeMap<Uuid, PendingMatch>,
}

impl Waitroom {
    fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.iter().any(|e| &e.participant_id == id)
    }

    fn remove(&mut self, id: &ParticipantId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.participant_id != id);
        self.entries.len() != before
    }

    fn is_reserved(&self, id: &ParticipantId) -> bool {
        self.pending.values().any(|m| m.members.contains(id))
    }

    fn push(&mut self, id: ParticipantId) {
        self.entries.push(WaitroomEntry {
            participant_id: id,
            joined_at: Instant::now(),
        });
    }
}

/// A waiting participant as seen by observers.
#[derive(Debug, Clone, Serialize)]
pub struct WaitingSnapshot {
    /// Participant.
    pub participant_id: ParticipantId,
    /// Time in the waitroom.
    pub waited_ms: u64,
    /// Part of a proposal being probed.
    pub reserved: bool,
}

/// Read-only view of a manager.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    /// Scene.
    pub scene_id: String,
    /// Matchmaking strategy.
    pub matchmaker: String,
    /// Waitroom in arrival order.
    pub waiting: Vec<WaitingSnapshot>,
    /// Proposals waiting on probes.
    pub pending_matches: Vec<Vec<ParticipantId>>,
    /// Live sessions.
    pub sessions: Vec<SessionSnapshot>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Orchestrates one scene.
pub struct SessionManager {
    scene: Arc<SceneConfig>,
    state: Arc<CoordinatorState>,
    matchmaker: Arc<dyn Matchmaker>,
    probes: Option<Arc<ProbeCoordinator>>,
    sync: Arc<ClientSyncCoordinator>,
    env_factory: EnvFactory,
    waitroom: Mutex<Waitroom>,
    sessions: RwLock<BTreeMap<SessionId, Arc<RwLock<Session>>>>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl SessionManager {
    /// Create a manager for `scene`.
    pub fn new(
        scene: SceneConfig,
        state: Arc<CoordinatorState>,
        sync: Arc<ClientSyncCoordinator>,
        probes: Option<Arc<ProbeCoordinator>>,
        env_factory: EnvFactory,
    ) -> Arc<Self> {
        let matchmaker = build_matchmaker(&scene.matchmaker);
        let (events, _) = broadcast::channel(256);

        Arc::new(Self {
            scene: Arc::new(scene),
            state,
            matchmaker,
            probes,
            sync,
            env_factory,
            waitroom: Mutex::new(Waitroom::default()),
            sessions: RwLock::new(BTreeMap::new()),
            events,
        })
    }

    /// Scene descriptor.
    pub fn scene(&self) -> &Arc<SceneConfig> {
        &self.scene
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Probe coordinator, when proposals must pass a peer-latency gate.
    fn probe_gate(&self) -> Option<&Arc<ProbeCoordinator>> {
        if self.scene.group_size < 2 || self.matchmaker.max_p2p_rtt_ms().is_none() {
            return None;
        }
        self.probes.as_ref()
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admit a registered participant: wait, probe, or start a session.
    #[instrument(skip(self), fields(scene = %self.scene.scene_id))]
    pub async fn add_participant(
        self: &Arc<Self>,
        participant: ParticipantId,
    ) -> Result<Admission, SessionError> {
        if !self.state.contains(&participant).await {
            return Err(SessionError::UnknownParticipant(participant));
        }
        if self.state.session_of(&participant).await.is_some() {
            return Err(SessionError::AlreadyInSession(participant));
        }

        let mut room = self.waitroom.lock().await;
        if room.contains(&participant) {
            return Err(SessionError::AlreadyInSession(participant));
        }

        let arriving = self.state.candidate(&participant).await;
        let mut waiting = Vec::with_capacity(room.entries.len());
        for entry in &room.entries {
            if !room.is_reserved(&entry.participant_id) {
                waiting.push(self.state.candidate(&entry.participant_id).await);
            }
        }

        let group_size = self.scene.group_size;
        let proposal = self
            .matchmaker
            .find_match(&arriving, &waiting, group_size)
            .filter(|group| {
                let valid = is_valid_proposal(&arriving, group, group_size);
                if !valid {
                    warn!(matchmaker = self.matchmaker.name(), "Discarded malformed proposal");
                }
                valid
            });

        let Some(group) = proposal else {
            room.push(participant.clone());
            let count = room.entries.len();
            drop(room);

            debug!(participant = %participant, waiting = count, "Participant waiting");
            self.emit(CoordinatorEvent::ParticipantWaiting {
                scene_id: self.scene.scene_id.clone(),
                participant_id: participant,
                waiting: count,
            });
            self.broadcast_waitroom_status().await;
            return Ok(Admission::Waiting);
        };

        let members: Vec<ParticipantId> = group.into_iter().map(|c| c.participant_id).collect();

        if let Some(probes) = self.probe_gate().cloned() {
            let match_id = Uuid::new_v4();
            room.push(participant.clone());
            room.pending.insert(
                match_id,
                PendingMatch {
                    members: members.clone(),
                    created_at: Instant::now(),
                },
            );
            drop(room);

            let peer = members
                .iter()
                .find(|m| **m != participant)
                .cloned()
                .unwrap_or_else(|| participant.clone());
            let manager = Arc::clone(self);
            probes
                .start_probe(
                    participant.clone(),
                    peer,
                    Box::new(move |rtt| {
                        tokio::spawn(async move { manager.on_probe_complete(match_id, rtt).await });
                    }),
                )
                .await;

            info!(participant = %participant, members = members.len(), "Proposal sent to probe");
            self.emit(CoordinatorEvent::ProbeStarted {
                scene_id: self.scene.scene_id.clone(),
                members,
            });
            return Ok(Admission::Probing);
        }

        let session_id = self.create_session(&mut room, &members).await?;
        drop(room);
        self.broadcast_waitroom_status().await;
        self.spawn_session_task(session_id);
        Ok(Admission::Matched(session_id))
    }

    /// Resolve a probed proposal.
    ///
    /// Members may have left while the probe ran; if any is gone the match is
    /// dropped and the rest stay in the waitroom.
    async fn on_probe_complete(self: Arc<Self>, match_id: Uuid, rtt: Option<u32>) {
        let mut room = self.waitroom.lock().await;
        let Some(pending) = room.pending.remove(&match_id) else {
            return;
        };

        if self.matchmaker.should_reject_for_rtt(rtt) {
            drop(room);
            info!(rtt_ms = ?rtt, members = ?pending.members, "Proposal rejected after probe");
            self.emit(CoordinatorEvent::MatchRejected {
                scene_id: self.scene.scene_id.clone(),
                members: pending.members,
                rtt_ms: rtt,
            });
            self.broadcast_waitroom_status().await;
            return;
        }

        if !pending.members.iter().all(|m| room.contains(m)) {
            debug!(
                members = ?pending.members,
                probed_ms = pending.created_at.elapsed().as_millis() as u64,
                "Proposal aborted: member left during probe"
            );
            return;
        }

        match self.create_session(&mut room, &pending.members).await {
            Ok(session_id) => {
                drop(room);
                self.broadcast_waitroom_status().await;
                self.spawn_session_task(session_id);
            }
            Err(e) => warn!(error = %e, "Probed proposal could not be seated"),
        }
    }

    /// Allocate a session for `members` and take them out of the waitroom.
    async fn create_session(
        &self,
        room: &mut Waitroom,
        members: &[ParticipantId],
    ) -> Result<SessionId, SessionError> {
        let session_id = Uuid::new_v4();
        let seed = derive_session_seed(rand::random(), session_id.as_bytes(), members);
        let mut session = Session::new(session_id, self.scene.clone(), seed);
        for member in members {
            session.assign_slot(member.clone())?;
        }

        // A member seated elsewhere in the meantime rejects the whole group
        let mut attached = Vec::with_capacity(members.len());
        for member in members {
            if let Err(e) = self.state.attach_session(member, session_id).await {
                for m in &attached {
                    self.state.detach_session(m, session_id).await;
                }
                warn!(participant = %member, error = %e, "Admission race; group dropped");
                return Err(e);
            }
            attached.push(member.clone());
        }

        for member in members {
            room.remove(member);
        }
        session.transition(LifecycleState::Matched)?;
        self.sessions
            .write()
            .await
            .insert(session_id, Arc::new(RwLock::new(session)));

        info!(session = %session_id, members = ?members, "Session created");
        self.emit(CoordinatorEvent::SessionCreated {
            scene_id: self.scene.scene_id.clone(),
            session_id,
            members: members.to_vec(),
        });
        Ok(session_id)
    }

    /// Send every waiting participant its waitroom status.
    async fn broadcast_waitroom_status(&self) {
        let timeout = self.scene.waitroom_timeout();
        let statuses: Vec<(ParticipantId, WaitroomStatus)> = {
            let room = self.waitroom.lock().await;
            let count = room.entries.len();
            room.entries
                .iter()
                .map(|e| {
                    let remaining = timeout.saturating_sub(e.joined_at.elapsed());
                    (
                        e.participant_id.clone(),
                        WaitroomStatus {
                            count,
                            needed: self.scene.group_size.saturating_sub(count),
                            ms_remaining: remaining.as_millis() as u64,
                        },
                    )
                })
                .collect()
        };

        for (participant, status) in statuses {
            self.state
                .send(&participant, ServerMessage::WaitingRoom(status))
                .await;
        }
    }

    /// Send `waitroom_expired` to everyone who waited past the timeout.
    ///
    /// Participants in a proposal being probed are left alone.
    pub async fn expire_waitroom(&self) -> usize {
        let timeout = self.scene.waitroom_timeout();
        let expired: Vec<ParticipantId> = {
            let mut room = self.waitroom.lock().await;
            let expired: Vec<ParticipantId> = room
                .entries
                .iter()
                .filter(|e| e.joined_at.elapsed() >= timeout && !room.is_reserved(&e.participant_id))
                .map(|e| e.participant_id.clone())
                .collect();
            for id in &expired {
                room.remove(id);
            }
            expired
        };

        for id in &expired {
            info!(participant = %id, "Waitroom expired");
            let msg = ServerMessage::WaitroomExpired {
                redirect_url: self.scene.waitroom_redirect_url.clone(),
            };
            self.state.send(id, msg).await;
            self.emit(CoordinatorEvent::WaitroomExpired { participant_id: id.clone() });
        }
        if !expired.is_empty() {
            self.broadcast_waitroom_status().await;
        }
        expired.len()
    }

    // -------------------------------------------------------------------------
    // Session task
    // -------------------------------------------------------------------------

    fn spawn_session_task(self: &Arc<Self>, session_id: SessionId) {
        tokio::spawn(Arc::clone(self).session_task(session_id));
    }

    /// Boxed so the task can re-admit participants, which spawns further
    /// session tasks.
    fn session_task(self: Arc<Self>, session_id: SessionId) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.run_session(session_id).await })
    }

    async fn run_session(self: &Arc<Self>, session_id: SessionId) {
        let Some(session) = self.session(session_id).await else {
            return;
        };
        let (members, mut ended) = {
            let s = session.read().await;
            (s.members(), s.subscribe_end())
        };

        if self.scene.is_multi_party() && self.scene.countdown_secs > 0 {
            let msg = ServerMessage::MatchFoundCountdown { seconds: self.scene.countdown_secs };
            self.state.broadcast(members.iter(), &msg).await;
            tokio::select! {
                _ = sleep(self.scene.countdown()) => {}
                _ = ended.changed() => return,
            }
        }

        // Validation
        let (occupied, all_ready) = {
            let mut s = session.write().await;
            if s.transition(LifecycleState::Validating).is_err() {
                return;
            }
            (s.occupied(), s.all_ready_signal())
        };
        for (slot_id, participant) in &occupied {
            let msg = ServerMessage::StartSession(SessionStartInfo {
                session_id,
                slot_id: *slot_id,
                metadata: self.scene.client_metadata(),
            });
            self.state.send(participant, msg).await;
        }

        let validated = tokio::select! {
            _ = all_ready.notified() => true,
            _ = sleep(self.scene.validation_timeout()) => false,
            _ = ended.changed() => return,
        };
        if !validated {
            self.fail_validation(session_id).await;
            return;
        }

        if session.write().await.transition(LifecycleState::Playing).is_err() {
            return;
        }
        info!(session = %session_id, "Session playing");
        self.emit(CoordinatorEvent::SessionStarted { session_id });

        let outcome = match self.scene.execution {
            ExecutionMode::Server => {
                let env = (self.env_factory)(self.scene.group_size);
                ServerRunLoop::new(session.clone(), env, self.state.clone(), self.scene.clone())
                    .run(ended)
                    .await
            }
            ExecutionMode::Client => match self.start_client_sync(session_id, &session).await {
                Some(runner) => run_authoritative(runner, self.sync.clone(), session_id, ended).await,
                None => return,
            },
        };

        if outcome == RunOutcome::Completed {
            self.finish_session(session_id, EndReason::Complete).await;
        }
    }

    /// Validation window elapsed: ready members go back to the waitroom,
    /// the others are told the session ended.
    async fn fail_validation(self: &Arc<Self>, session_id: SessionId) {
        let Some(session) = self.session(session_id).await else {
            return;
        };
        let (ready, stragglers) = {
            let mut s = session.write().await;
            let ready = s.ready_members();
            let stragglers: Vec<ParticipantId> =
                s.members().into_iter().filter(|m| !ready.contains(m)).collect();
            if s.transition(LifecycleState::Waiting).is_err() {
                return;
            }
            (ready, stragglers)
        };

        warn!(session = %session_id, ready = ready.len(), missing = stragglers.len(), "Validation timed out");
        let msg = ServerMessage::EndSession { reason: EndReason::ValidationTimeout };
        self.state.broadcast(stragglers.iter(), &msg).await;
        self.teardown(session_id, Some(EndReason::ValidationTimeout)).await;

        for participant in ready {
            if let Err(e) = self.add_participant(participant.clone()).await {
                warn!(participant = %participant, error = %e, "Re-admission failed");
            }
        }
    }

    /// Seat every member in the relay protocol. Returns the authoritative
    /// mirror when the scene runs one.
    async fn start_client_sync(
        &self,
        session_id: SessionId,
        session: &Arc<RwLock<Session>>,
    ) -> Option<Arc<Mutex<ServerGameRunner>>> {
        let (seed, occupied) = {
            let s = session.read().await;
            (s.seed, s.occupied())
        };

        let runner = self.scene.server_authoritative.then(|| {
            let env = (self.env_factory)(self.scene.group_size);
            let slots = (0..self.scene.group_size as SlotId).collect();
            Arc::new(Mutex::new(ServerGameRunner::new(env, self.scene.clone(), slots, seed)))
        });

        self.sync
            .add_game(session_id, self.scene.clone(), seed, runner.clone())
            .await;
        for (slot, participant) in occupied {
            if let Err(e) = self.sync.add_player(session_id, slot, participant).await {
                warn!(session = %session_id, error = %e, "Could not seat player");
            }
        }
        runner
    }

    /// End a session for everyone with `reason`, then clean it up.
    pub async fn finish_session(&self, session_id: SessionId, reason: EndReason) {
        let Some(session) = self.session(session_id).await else {
            return;
        };
        let members = session.read().await.members();
        let msg = ServerMessage::EndSession { reason };
        self.state.broadcast(members.iter(), &msg).await;
        self.teardown(session_id, Some(reason)).await;
    }

    /// Tear a session down. Idempotent: an unknown id returns `false`.
    pub async fn cleanup_game(&self, session_id: SessionId) -> bool {
        self.teardown(session_id, None).await
    }

    async fn teardown(&self, session_id: SessionId, reason: Option<EndReason>) -> bool {
        let Some(session) = self.sessions.write().await.remove(&session_id) else {
            return false;
        };

        let members = {
            let mut s = session.write().await;
            if s.lifecycle() != LifecycleState::Ended {
                let _ = s.transition(LifecycleState::Ended);
            }
            let members = s.members();
            for m in &members {
                s.remove_participant(m);
            }
            members
        };
        for m in &members {
            self.state.detach_session(m, session_id).await;
        }

        let entries = self.sync.drain_logs(session_id).await;
        self.sync.remove_game(session_id).await;
        if !entries.is_empty() {
            self.emit(CoordinatorEvent::SessionLogs { session_id, entries });
        }

        info!(session = %session_id, reason = ?reason, "Session cleaned up");
        self.emit(CoordinatorEvent::SessionEnded { session_id, reason });
        true
    }

    // -------------------------------------------------------------------------
    // Departures
    // -------------------------------------------------------------------------

    /// Remove a participant from the waitroom or its session.
    ///
    /// `reason`, when given, is sent to the departing participant.
    #[instrument(skip(self), fields(scene = %self.scene.scene_id))]
    pub async fn remove_participant(
        &self,
        participant: &ParticipantId,
        reason: Option<EndReason>,
    ) -> bool {
        let was_waiting = self.waitroom.lock().await.remove(participant);
        if let Some(probes) = &self.probes {
            probes.participant_left(participant).await;
        }
        if let Some(reason) = reason {
            self.state
                .send(participant, ServerMessage::EndSession { reason })
                .await;
        }

        if was_waiting {
            self.emit(CoordinatorEvent::ParticipantRemoved {
                participant_id: participant.clone(),
                session_id: None,
            });
            self.broadcast_waitroom_status().await;
            return true;
        }

        let Some(session_id) = self.state.session_of(participant).await else {
            return false;
        };
        let Some(session) = self.session(session_id).await else {
            self.state.detach_session(participant, session_id).await;
            return false;
        };

        let (was_running, remaining) = {
            let mut s = session.write().await;
            let was_running = s.is_running();
            s.remove_participant(participant);
            (was_running, s.members())
        };
        self.state.detach_session(participant, session_id).await;
        info!(session = %session_id, participant = %participant, running = was_running, "Participant left session");
        self.emit(CoordinatorEvent::ParticipantRemoved {
            participant_id: participant.clone(),
            session_id: Some(session_id),
        });

        if remaining.is_empty() {
            self.teardown(session_id, reason).await;
            return true;
        }

        if was_running && self.scene.disconnect_policy == DisconnectPolicy::Continue {
            let continues = match self.scene.execution {
                ExecutionMode::Server => true,
                ExecutionMode::Client => matches!(
                    self.sync.remove_player(session_id, participant).await,
                    SlotRemoval::Continue { .. }
                ),
            };
            if continues {
                return true;
            }
        }

        let notice = if was_running {
            EndReason::PartnerDisconnected
        } else {
            EndReason::LobbyEnded
        };
        let msg = ServerMessage::EndSession { reason: notice };
        self.state.broadcast(remaining.iter(), &msg).await;
        self.teardown(session_id, Some(notice)).await;
        true
    }

    /// Transport dropped. Running sessions keep the seat for the
    /// reconnection window; anything else removes the participant now.
    pub async fn handle_disconnect(self: &Arc<Self>, participant: &ParticipantId) {
        let running = match self.state.session_of(participant).await {
            Some(id) => match self.session(id).await {
                Some(session) => session.read().await.is_running(),
                None => false,
            },
            None => false,
        };

        let window = match (running, self.scene.reconnection_timeout()) {
            (true, Some(window)) => window,
            _ => {
                self.remove_participant(participant, None).await;
                self.state.unregister(participant).await;
                return;
            }
        };

        let since = self.state.mark_disconnected(participant).await;
        info!(participant = %participant, window_ms = window.as_millis() as u64, "Holding seat for reconnection");
        self.emit(CoordinatorEvent::ParticipantDisconnected {
            participant_id: participant.clone(),
        });

        let manager = Arc::clone(self);
        let participant = participant.clone();
        tokio::spawn(async move {
            sleep(window).await;
            let still_gone = matches!(
                manager.state.liveness(&participant).await,
                Some(Liveness::Disconnected { since: s }) if Some(s) == since
            );
            if still_gone {
                info!(participant = %participant, "Reconnection window elapsed");
                manager
                    .remove_participant(&participant, Some(EndReason::ReconnectTimeout))
                    .await;
                manager.state.unregister(&participant).await;
            }
        });
    }

    /// Bring a reattached participant back up to date.
    pub async fn reconnect(&self, participant: &ParticipantId) -> Result<(), SessionError> {
        let session_id = self
            .state
            .session_of(participant)
            .await
            .ok_or(SessionError::NotInSession)?;
        let session = self
            .session(session_id)
            .await
            .ok_or(SessionError::NotFound(session_id))?;
        let (slot_id, owed_reset) = {
            let s = session.read().await;
            let slot_id = s
                .slot_of(participant)
                .ok_or_else(|| SessionError::NotAMember(participant.clone()))?;
            (slot_id, s.awaiting_reset_ack(participant))
        };

        let start = ServerMessage::StartSession(SessionStartInfo {
            session_id,
            slot_id,
            metadata: self.scene.client_metadata(),
        });
        self.state.send(participant, start).await;
        if let Some(info) = self.sync.host_info(session_id, participant).await {
            self.state
                .send(participant, ServerMessage::HostElected(info))
                .await;
        }
        // The request sent while they were away was dropped
        if let Some(episode) = owed_reset {
            self.state
                .send(participant, ServerMessage::ResetRequest { episode })
                .await;
        }

        info!(participant = %participant, session = %session_id, "Participant reconnected");
        self.emit(CoordinatorEvent::ParticipantReconnected {
            participant_id: participant.clone(),
        });
        Ok(())
    }

    /// Page visibility changed. A participant hidden for longer than the
    /// focus-loss window is removed from its session.
    pub async fn handle_focus(self: &Arc<Self>, participant: &ParticipantId, visible: bool) {
        let Some(window) = self.scene.focus_loss_timeout() else {
            return;
        };
        let Some(since) = self.state.set_hidden(participant, !visible).await else {
            return;
        };
        if self.state.session_of(participant).await.is_none() {
            return;
        }

        let manager = Arc::clone(self);
        let participant = participant.clone();
        tokio::spawn(async move {
            sleep(window).await;
            if manager.state.hidden_since(&participant).await == Some(since) {
                info!(participant = %participant, "Focus lost for too long");
                manager
                    .remove_participant(&participant, Some(EndReason::FocusLoss))
                    .await;
            }
        });
    }

    // -------------------------------------------------------------------------
    // In-session messages
    // -------------------------------------------------------------------------

    async fn session_for(
        &self,
        participant: &ParticipantId,
    ) -> Result<(SessionId, Arc<RwLock<Session>>), SessionError> {
        let session_id = self
            .state
            .session_of(participant)
            .await
            .ok_or(SessionError::NotInSession)?;
        let session = self
            .session(session_id)
            .await
            .ok_or(SessionError::NotFound(session_id))?;
        Ok((session_id, session))
    }

    /// Confirm readiness during validation.
    pub async fn mark_ready(&self, participant: &ParticipantId) -> Result<bool, SessionError> {
        let (_, session) = self.session_for(participant).await?;
        let all = session.write().await.mark_ready(participant)?;
        Ok(all)
    }

    /// Submit an action. Server-run scenes queue it for the next tick;
    /// client-run scenes relay it.
    pub async fn submit_action(
        &self,
        participant: &ParticipantId,
        submission: ActionSubmission,
    ) -> Result<(), SessionError> {
        let (session_id, session) = self.session_for(participant).await?;

        match self.scene.execution {
            ExecutionMode::Server => {
                let mut s = session.write().await;
                if !s.is_running() {
                    return Ok(());
                }
                if s.slot_of(participant) != Some(submission.slot_id) {
                    return Err(SessionError::SlotNotOccupied(submission.slot_id));
                }
                s.submit_action(submission.slot_id, submission.action)?;
                Ok(())
            }
            ExecutionMode::Client => {
                let finished = self.sync.relay_action(session_id, participant, submission).await?;
                if finished {
                    self.finish_session(session_id, EndReason::Complete).await;
                }
                Ok(())
            }
        }
    }

    /// Acknowledge a reset request.
    pub async fn ack_reset(
        &self,
        participant: &ParticipantId,
        episode: u32,
    ) -> Result<bool, SessionError> {
        let (_, session) = self.session_for(participant).await?;
        let mut s = session.write().await;
        if episode != s.episode() + 1 {
            debug!(participant = %participant, episode, "Ack for another reset ignored");
            return Ok(false);
        }
        Ok(s.ack_reset(participant))
    }

    /// Relay a state hash.
    pub async fn relay_state_hash(
        &self,
        participant: &ParticipantId,
        report: StateHashReport,
    ) -> Result<(), SessionError> {
        let (session_id, _) = self.session_for(participant).await?;
        self.sync.relay_state_hash(session_id, participant, report).await?;
        Ok(())
    }

    /// Report a desync.
    pub async fn desync_detected(
        &self,
        participant: &ParticipantId,
        frame_number: u64,
    ) -> Result<(), SessionError> {
        let (session_id, _) = self.session_for(participant).await?;
        self.sync.desync_detected(session_id, participant, frame_number).await?;
        Ok(())
    }

    /// Host full-state upload.
    pub async fn receive_full_state(
        &self,
        participant: &ParticipantId,
        upload: FullStateUpload,
    ) -> Result<(), SessionError> {
        let (session_id, _) = self.session_for(participant).await?;
        self.sync.receive_full_state(session_id, participant, upload).await?;
        Ok(())
    }

    /// Telemetry submission.
    pub async fn receive_log(
        &self,
        participant: &ParticipantId,
        log: LogSubmission,
    ) -> Result<bool, SessionError> {
        let (session_id, _) = self.session_for(participant).await?;
        Ok(self.sync.receive_log(session_id, participant, log).await?)
    }

    /// Hand over host telemetry collected so far.
    pub async fn drain_logs(&self, session_id: SessionId) -> Vec<LogEntry> {
        self.sync.drain_logs(session_id).await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Get a session by id.
    pub async fn session(&self, session_id: SessionId) -> Option<Arc<RwLock<Session>>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Waitroom members in arrival order.
    pub async fn waitroom(&self) -> Vec<ParticipantId> {
        self.waitroom
            .lock()
            .await
            .entries
            .iter()
            .map(|e| e.participant_id.clone())
            .collect()
    }

    /// Proposals waiting on probes.
    pub async fn pending_match_count(&self) -> usize {
        self.waitroom.lock().await.pending.len()
    }

    /// End every session (server shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.finish_session(id, EndReason::ServerShutdown).await;
        }
    }

    /// Read-only view for observers.
    pub async fn snapshot(&self) -> ManagerSnapshot {
        let (waiting, pending_matches) = {
            let room = self.waitroom.lock().await;
            let waiting = room
                .entries
                .iter()
                .map(|e| WaitingSnapshot {
                    participant_id: e.participant_id.clone(),
                    waited_ms: e.joined_at.elapsed().as_millis() as u64,
                    reserved: room.is_reserved(&e.participant_id),
                })
                .collect();
            let pending = room.pending.values().map(|m| m.members.clone()).collect();
            (waiting, pending)
        };

        let sessions: Vec<Arc<RwLock<Session>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut session_snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            session_snapshots.push(session.read().await.snapshot());
        }

        ManagerSnapshot {
            scene_id: self.scene.scene_id.clone(),
            matchmaker: self.matchmaker.name().to_string(),
            waiting,
            pending_matches,
            sessions: session_snapshots,
            taken_at: Utc::now(),
        }
    }
}
