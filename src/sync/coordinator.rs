//! Client Sync Coordinator
//!
//! For sessions whose simulation runs in every browser. The coordinator never
//! steps the simulation itself; it moves actions, hashes and state between
//! slots and decides who the host is.
//!
//! ## Protocol
//!
//! - **Action relay**: an action from any slot goes straight to every other
//!   slot. No slot waits for the others, so a slow peer cannot block anyone.
//! - **State verification**: `state_hash` reports are relayed; clients compare
//!   them. On `desync_detected` the host is asked for its full state, which is
//!   pushed to every non-host slot.
//! - **Logging**: only the host's `log_data` is kept. Every slot runs the same
//!   simulation, so accepting the others would duplicate data.
//! - **Host**: the first slot to join. What happens when a slot leaves is the
//!   scene's [`DisconnectPolicy`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::network::protocol::{
    ActionSubmission, FullStateUpload, HostInfo, LogSubmission, RelayedAction, ServerMessage,
    StateHashReport,
};
use crate::scene::{DisconnectPolicy, SceneConfig};
use crate::session::{CoordinatorState, ParticipantId, SessionId, SlotId};
use crate::sync::ServerGameRunner;

/// Sync errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// No sync state for the session.
    #[error("No sync state for session {0}")]
    UnknownSession(SessionId),

    /// Sender holds no slot in the session.
    #[error("{0} holds no slot")]
    NotInSession(ParticipantId),

    /// Sender claimed a slot that is not theirs.
    #[error("Slot {slot} does not belong to {participant}")]
    WrongSlot {
        /// Claimed slot.
        slot: SlotId,
        /// Sender.
        participant: ParticipantId,
    },

    /// Slot already taken.
    #[error("Slot {0} already taken")]
    SlotTaken(SlotId),

    /// Only the host may send this.
    #[error("{0} is not the host")]
    NotHost(ParticipantId),
}

/// A host telemetry record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Submitting slot.
    pub slot_id: SlotId,
    /// Frame the data belongs to.
    pub frame_number: u64,
    /// Opaque telemetry.
    pub payload: serde_json::Value,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// What removing a slot means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotRemoval {
    /// The participant held no slot.
    NotFound,
    /// The session must end for everyone.
    EndSession,
    /// Play continues; carries the new host if the old one left.
    Continue {
        /// Newly promoted host.
        new_host: Option<ParticipantId>,
    },
}

/// Per-session sync state.
struct ClientSyncState {
    scene: Arc<SceneConfig>,
    players: BTreeMap<SlotId, ParticipantId>,
    host_slot: Option<SlotId>,
    seed: u64,
    /// Highest frame any slot reported.
    frame_counter: u64,
    /// Latest frame per slot.
    slot_frames: BTreeMap<SlotId, u64>,
    logs: Vec<LogEntry>,
    runner: Option<Arc<Mutex<ServerGameRunner>>>,
    resync_frame: Option<u64>,
}

impl ClientSyncState {
    fn slot_of(&self, participant: &ParticipantId) -> Option<SlotId> {
        self.players
            .iter()
            .find(|(_, p)| *p == participant)
            .map(|(slot, _)| *slot)
    }

    fn host(&self) -> Option<&ParticipantId> {
        self.host_slot.and_then(|slot| self.players.get(&slot))
    }

    fn host_info(&self, slot: SlotId) -> Option<HostInfo> {
        let host = self.host()?;
        let me = self.players.get(&slot)?;
        Some(HostInfo {
            is_host: host == me,
            host_id: host.clone(),
            slot_id: slot,
            seed: self.seed,
            slot_count: self.scene.group_size,
        })
    }

    fn others(&self, slot: SlotId) -> Vec<ParticipantId> {
        self.players
            .iter()
            .filter(|(s, _)| **s != slot)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Without a server mirror, a session is complete once every slot has
    /// submitted its action for the last frame.
    fn all_slots_finished(&self) -> bool {
        let total = self.scene.max_episodes as u64 * self.scene.max_steps as u64;
        total > 0
            && !self.players.is_empty()
            && self
                .players
                .keys()
                .all(|slot| self.slot_frames.get(slot).is_some_and(|f| f + 1 >= total))
    }
}

/// Coordinates browser-executed sessions.
pub struct ClientSyncCoordinator {
    state: Arc<CoordinatorState>,
    games: RwLock<BTreeMap<SessionId, Arc<Mutex<ClientSyncState>>>>,
}

impl ClientSyncCoordinator {
    /// Create a coordinator.
    pub fn new(state: Arc<CoordinatorState>) -> Self {
        Self {
            state,
            games: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a session.
    pub async fn add_game(
        &self,
        session_id: SessionId,
        scene: Arc<SceneConfig>,
        seed: u64,
        runner: Option<Arc<Mutex<ServerGameRunner>>>,
    ) {
        let game = ClientSyncState {
            scene,
            players: BTreeMap::new(),
            host_slot: None,
            seed,
            frame_counter: 0,
            slot_frames: BTreeMap::new(),
            logs: Vec::new(),
            runner,
            resync_frame: None,
        };
        self.games
            .write()
            .await
            .insert(session_id, Arc::new(Mutex::new(game)));
        debug!(session = %session_id, "Sync state created");
    }

    async fn game(&self, session_id: SessionId) -> Result<Arc<Mutex<ClientSyncState>>, SyncError> {
        self.games
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(SyncError::UnknownSession(session_id))
    }

    /// Seat a participant. The first to join becomes host.
    ///
    /// Sends `host_elected` to the joiner.
    pub async fn add_player(
        &self,
        session_id: SessionId,
        slot: SlotId,
        participant: ParticipantId,
    ) -> Result<HostInfo, SyncError> {
        let info = {
            let game = self.game(session_id).await?;
            let mut game = game.lock().await;
            if game.players.contains_key(&slot) {
                return Err(SyncError::SlotTaken(slot));
            }
            game.players.insert(slot, participant.clone());
            if game.host_slot.is_none() {
                game.host_slot = Some(slot);
                info!(session = %session_id, host = %participant, slot, "Host elected");
            }
            game.host_info(slot)
                .ok_or_else(|| SyncError::NotInSession(participant.clone()))?
        };

        self.state
            .send(&participant, ServerMessage::HostElected(info.clone()))
            .await;
        Ok(info)
    }

    /// Host information for a seated participant (used on reconnect).
    pub async fn host_info(
        &self,
        session_id: SessionId,
        participant: &ParticipantId,
    ) -> Option<HostInfo> {
        let game = self.game(session_id).await.ok()?;
        let game = game.lock().await;
        let slot = game.slot_of(participant)?;
        game.host_info(slot)
    }

    /// Relay an action to every other slot and feed the server mirror.
    ///
    /// Returns `true` once a session without a mirror has finished.
    pub async fn relay_action(
        &self,
        session_id: SessionId,
        from: &ParticipantId,
        submission: ActionSubmission,
    ) -> Result<bool, SyncError> {
        let (recipients, runner, finished) = {
            let game = self.game(session_id).await?;
            let mut game = game.lock().await;
            let slot = game
                .slot_of(from)
                .ok_or_else(|| SyncError::NotInSession(from.clone()))?;
            if slot != submission.slot_id {
                return Err(SyncError::WrongSlot {
                    slot: submission.slot_id,
                    participant: from.clone(),
                });
            }

            game.frame_counter = game.frame_counter.max(submission.frame_number);
            let frame = game.slot_frames.entry(slot).or_insert(0);
            *frame = (*frame).max(submission.frame_number);

            let finished = game.runner.is_none() && game.all_slots_finished();
            (game.others(slot), game.runner.clone(), finished)
        };

        let relayed = ServerMessage::OtherPlayerAction(RelayedAction {
            slot_id: submission.slot_id,
            participant_id: from.clone(),
            action: submission.action,
            frame_number: submission.frame_number,
            sync_epoch: submission.sync_epoch,
        });
        self.state.broadcast(recipients.iter(), &relayed).await;

        if let Some(runner) = runner {
            runner.lock().await.receive_action(
                submission.slot_id,
                submission.action,
                submission.sync_epoch,
            );
        }
        Ok(finished)
    }

    /// Relay a state hash to every other slot. Hashes are not compared here.
    pub async fn relay_state_hash(
        &self,
        session_id: SessionId,
        from: &ParticipantId,
        report: StateHashReport,
    ) -> Result<(), SyncError> {
        let recipients = {
            let game = self.game(session_id).await?;
            let game = game.lock().await;
            let slot = game
                .slot_of(from)
                .ok_or_else(|| SyncError::NotInSession(from.clone()))?;
            if slot != report.slot_id {
                return Err(SyncError::WrongSlot {
                    slot: report.slot_id,
                    participant: from.clone(),
                });
            }
            game.others(slot)
        };

        self.state
            .broadcast(recipients.iter(), &ServerMessage::StateHash(report))
            .await;
        Ok(())
    }

    /// A slot saw a mismatching hash: ask the host for its full state.
    ///
    /// Repeated reports for a frame already being resynced are ignored.
    pub async fn desync_detected(
        &self,
        session_id: SessionId,
        from: &ParticipantId,
        frame_number: u64,
    ) -> Result<(), SyncError> {
        let host = {
            let game = self.game(session_id).await?;
            let mut game = game.lock().await;
            if game.slot_of(from).is_none() {
                return Err(SyncError::NotInSession(from.clone()));
            }
            if game.resync_frame.is_some_and(|f| f >= frame_number) {
                debug!(session = %session_id, frame_number, "Resync already requested");
                return Ok(());
            }
            game.resync_frame = Some(frame_number);
            game.host().cloned()
        };

        if let Some(host) = host {
            warn!(session = %session_id, reporter = %from, frame_number, "Desync reported");
            self.state
                .send(&host, ServerMessage::RequestFullState { frame_number })
                .await;
        }
        Ok(())
    }

    /// Push the host's full state to every non-host slot.
    ///
    /// Returns the number of recipients.
    pub async fn receive_full_state(
        &self,
        session_id: SessionId,
        from: &ParticipantId,
        upload: FullStateUpload,
    ) -> Result<usize, SyncError> {
        let recipients = {
            let game = self.game(session_id).await?;
            let mut game = game.lock().await;
            if game.host() != Some(from) {
                return Err(SyncError::NotHost(from.clone()));
            }
            game.resync_frame = None;
            let host_slot = game.host_slot.unwrap_or_default();
            game.others(host_slot)
        };

        let msg = ServerMessage::ApplyFullState {
            state: upload.state,
            frame_number: upload.frame_number,
        };
        self.state.broadcast(recipients.iter(), &msg).await;
        Ok(recipients.len())
    }

    /// Keep host telemetry; silently drop everyone else's.
    ///
    /// Returns whether the entry was kept.
    pub async fn receive_log(
        &self,
        session_id: SessionId,
        from: &ParticipantId,
        log: LogSubmission,
    ) -> Result<bool, SyncError> {
        let game = self.game(session_id).await?;
        let mut game = game.lock().await;
        let Some(slot) = game.slot_of(from) else {
            return Ok(false);
        };
        if game.host_slot != Some(slot) {
            return Ok(false);
        }

        game.logs.push(LogEntry {
            slot_id: slot,
            frame_number: log.frame_number,
            payload: log.payload,
            received_at: Utc::now(),
        });
        Ok(true)
    }

    /// Hand over collected host telemetry.
    pub async fn drain_logs(&self, session_id: SessionId) -> Vec<LogEntry> {
        match self.game(session_id).await {
            Ok(game) => std::mem::take(&mut game.lock().await.logs),
            Err(_) => Vec::new(),
        }
    }

    /// Remove a participant's slot and apply the scene's disconnect policy.
    pub async fn remove_player(
        &self,
        session_id: SessionId,
        participant: &ParticipantId,
    ) -> SlotRemoval {
        let (removal, recipients) = {
            let Ok(game) = self.game(session_id).await else {
                return SlotRemoval::NotFound;
            };
            let mut game = game.lock().await;
            let Some(slot) = game.slot_of(participant) else {
                return SlotRemoval::NotFound;
            };

            if game.scene.disconnect_policy == DisconnectPolicy::EndSession {
                return SlotRemoval::EndSession;
            }

            game.players.remove(&slot);
            game.slot_frames.remove(&slot);
            if game.players.is_empty() {
                return SlotRemoval::EndSession;
            }
            if game.host_slot != Some(slot) {
                return SlotRemoval::Continue { new_host: None };
            }

            // Promote the lowest remaining slot
            game.host_slot = game.players.keys().next().copied();
            let new_host = game.host().cloned();
            let infos: Vec<(ParticipantId, HostInfo)> = game
                .players
                .iter()
                .filter_map(|(slot, p)| game.host_info(*slot).map(|info| (p.clone(), info)))
                .collect();
            (SlotRemoval::Continue { new_host }, infos)
        };

        if let SlotRemoval::Continue { new_host: Some(host) } = &removal {
            info!(session = %session_id, host = %host, "Host migrated");
        }
        for (participant, info) in recipients {
            self.state
                .send(&participant, ServerMessage::HostElected(info))
                .await;
        }
        removal
    }

    /// Drop a session's sync state and stop its mirror. Idempotent.
    pub async fn remove_game(&self, session_id: SessionId) -> bool {
        let removed = self.games.write().await.remove(&session_id);
        match removed {
            Some(game) => {
                if let Some(runner) = &game.lock().await.runner {
                    runner.lock().await.stop();
                }
                debug!(session = %session_id, "Sync state removed");
                true
            }
            None => false,
        }
    }

    /// Send a message to every slot of a session.
    pub async fn broadcast(&self, session_id: SessionId, message: ServerMessage) {
        let recipients: Vec<ParticipantId> = match self.game(session_id).await {
            Ok(game) => game.lock().await.players.values().cloned().collect(),
            Err(_) => return,
        };
        self.state.broadcast(recipients.iter(), &message).await;
    }

    /// Whether a session has sync state.
    pub async fn has_game(&self, session_id: SessionId) -> bool {
        self.games.read().await.contains_key(&session_id)
    }

    /// Number of sessions with sync state.
    pub async fn game_count(&self) -> usize {
        self.games.read().await.len()
    }

    /// Highest frame reported in a session.
    pub async fn frame_counter(&self, session_id: SessionId) -> Option<u64> {
        let game = self.game(session_id).await.ok()?;
        let frame = game.lock().await.frame_counter;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    fn action(slot_id: SlotId, action: i64, frame_number: u64) -> ActionSubmission {
        ActionSubmission {
            slot_id,
            action,
            frame_number,
            client_timestamp: 0,
            sync_epoch: 0,
        }
    }

    struct Harness {
        sync: ClientSyncCoordinator,
        session: SessionId,
        rx: Vec<mpsc::Receiver<ServerMessage>>,
    }

    async fn harness(policy: DisconnectPolicy, players: usize) -> Harness {
        let state = Arc::new(CoordinatorState::new());
        let sync = ClientSyncCoordinator::new(state.clone());
        let scene = Arc::new(SceneConfig {
            group_size: players,
            max_steps: 5,
            max_episodes: 1,
            disconnect_policy: policy,
            ..Default::default()
        });
        let session = uuid::Uuid::new_v4();
        sync.add_game(session, scene, 1234, None).await;

        let mut rx = Vec::new();
        for i in 0..players {
            let (tx, r) = mpsc::channel(32);
            let id = pid(&format!("p{i}"));
            state.register(id.clone(), tx).await.unwrap();
            sync.add_player(session, i as SlotId, id).await.unwrap();
            rx.push(r);
        }
        Harness { sync, session, rx }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_first_joiner_is_host() {
        let mut h = harness(DisconnectPolicy::EndSession, 2).await;

        match drain(&mut h.rx[0]).as_slice() {
            [ServerMessage::HostElected(info)] => {
                assert!(info.is_host);
                assert_eq!(info.seed, 1234);
                assert_eq!(info.slot_count, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        match drain(&mut h.rx[1]).as_slice() {
            [ServerMessage::HostElected(info)] => {
                assert!(!info.is_host);
                assert_eq!(info.host_id, pid("p0"));
                assert_eq!(info.slot_id, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_action_relayed_to_others_only() {
        let mut h = harness(DisconnectPolicy::EndSession, 3).await;
        for rx in h.rx.iter_mut() {
            drain(rx);
        }

        h.sync.relay_action(h.session, &pid("p1"), action(1, 2, 0)).await.unwrap();
        h.sync.relay_action(h.session, &pid("p1"), action(1, 1, 1)).await.unwrap();

        assert!(drain(&mut h.rx[1]).is_empty());
        for i in [0, 2] {
            let frames: Vec<u64> = drain(&mut h.rx[i])
                .into_iter()
                .map(|m| match m {
                    ServerMessage::OtherPlayerAction(a) => a.frame_number,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            // Per-sender order preserved
            assert_eq!(frames, vec![0, 1]);
        }
        assert_eq!(h.sync.frame_counter(h.session).await, Some(1));
    }

    #[tokio::test]
    async fn test_wrong_slot_rejected() {
        let h = harness(DisconnectPolicy::EndSession, 2).await;
        let err = h.sync.relay_action(h.session, &pid("p0"), action(1, 0, 0)).await;
        assert!(matches!(err, Err(SyncError::WrongSlot { slot: 1, .. })));
    }

    #[tokio::test]
    async fn test_resync_flow() {
        let mut h = harness(DisconnectPolicy::EndSession, 2).await;
        for rx in h.rx.iter_mut() {
            drain(rx);
        }

        h.sync.desync_detected(h.session, &pid("p1"), 40).await.unwrap();
        h.sync.desync_detected(h.session, &pid("p1"), 40).await.unwrap();
        let host_msgs = drain(&mut h.rx[0]);
        assert_eq!(host_msgs.len(), 1);
        assert!(matches!(host_msgs[0], ServerMessage::RequestFullState { frame_number: 40 }));

        // Only the host may upload
        let upload = FullStateUpload { state: json!({"pos": [1, 2]}), frame_number: 40 };
        assert!(matches!(
            h.sync.receive_full_state(h.session, &pid("p1"), upload.clone()).await,
            Err(SyncError::NotHost(_))
        ));

        assert_eq!(h.sync.receive_full_state(h.session, &pid("p0"), upload).await.unwrap(), 1);
        match drain(&mut h.rx[1]).as_slice() {
            [ServerMessage::ApplyFullState { state, frame_number: 40 }] => {
                assert_eq!(state["pos"][1], 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(drain(&mut h.rx[0]).is_empty());
    }

    #[tokio::test]
    async fn test_only_host_logs_kept() {
        let h = harness(DisconnectPolicy::EndSession, 2).await;
        let log = |slot_id| LogSubmission { slot_id, payload: json!({"r": 1}), frame_number: 3 };

        assert!(h.sync.receive_log(h.session, &pid("p0"), log(0)).await.unwrap());
        assert!(!h.sync.receive_log(h.session, &pid("p1"), log(1)).await.unwrap());

        let logs = h.sync.drain_logs(h.session).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].slot_id, 0);
        assert!(h.sync.drain_logs(h.session).await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_ends_session_by_default() {
        let h = harness(DisconnectPolicy::EndSession, 2).await;
        assert_eq!(h.sync.remove_player(h.session, &pid("p0")).await, SlotRemoval::EndSession);
        assert_eq!(h.sync.remove_player(h.session, &pid("zz")).await, SlotRemoval::NotFound);
    }

    #[tokio::test]
    async fn test_continue_policy_promotes_host() {
        let mut h = harness(DisconnectPolicy::Continue, 3).await;
        for rx in h.rx.iter_mut() {
            drain(rx);
        }

        let removal = h.sync.remove_player(h.session, &pid("p0")).await;
        assert_eq!(removal, SlotRemoval::Continue { new_host: Some(pid("p1")) });

        match drain(&mut h.rx[1]).as_slice() {
            [ServerMessage::HostElected(info)] => assert!(info.is_host),
            other => panic!("unexpected {other:?}"),
        }
        match drain(&mut h.rx[2]).as_slice() {
            [ServerMessage::HostElected(info)] => assert_eq!(info.host_id, pid("p1")),
            other => panic!("unexpected {other:?}"),
        }

        // Non-host departure keeps the host
        let removal = h.sync.remove_player(h.session, &pid("p2")).await;
        assert_eq!(removal, SlotRemoval::Continue { new_host: None });

        // Last one out ends it
        assert_eq!(h.sync.remove_player(h.session, &pid("p1")).await, SlotRemoval::EndSession);
    }

    #[tokio::test]
    async fn test_finished_when_every_slot_reaches_last_frame() {
        let h = harness(DisconnectPolicy::EndSession, 2).await;
        assert!(!h.sync.relay_action(h.session, &pid("p0"), action(0, 0, 4)).await.unwrap());
        assert!(h.sync.relay_action(h.session, &pid("p1"), action(1, 0, 4)).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_game_idempotent() {
        let h = harness(DisconnectPolicy::EndSession, 1).await;
        assert!(h.sync.remove_game(h.session).await);
        assert!(!h.sync.remove_game(h.session).await);
        assert!(!h.sync.has_game(h.session).await);
        assert!(matches!(
            h.sync.relay_action(h.session, &pid("p0"), action(0, 0, 0)).await,
            Err(SyncError::UnknownSession(_))
        ));
    }
}
