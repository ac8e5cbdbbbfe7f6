//! Session State
//!
//! One matched group running one scene instance: slot occupancy, the
//! capacity-1 action slot per player, and the two state machines that govern
//! it (lifecycle and tick status).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::env::Action;
use crate::scene::{ActionPopulation, SceneConfig};
use crate::session::{ParticipantId, SessionId, SlotId};
use crate::sync::SyncError;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Created, slots being filled.
    Waiting,
    /// Group formed, countdown running.
    Matched,
    /// Waiting for every member to confirm readiness.
    Validating,
    /// Simulation running.
    Playing,
    /// Torn down. Terminal.
    Ended,
}

impl LifecycleState {
    /// Whether `self -> next` is a declared edge.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Waiting, Matched)
                | (Waiting, Ended)
                | (Matched, Validating)
                | (Matched, Ended)
                | (Validating, Playing)
                | (Validating, Waiting)
                | (Validating, Ended)
                | (Playing, Ended)
        )
    }
}

/// Tick-loop status, orthogonal to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    /// Loop not started.
    Inactive,
    /// Stepping.
    Active,
    /// Between episodes.
    Reset,
    /// Finished.
    Done,
}

impl TickStatus {
    /// Whether the loop should stop.
    pub fn is_terminal(self) -> bool {
        self == TickStatus::Done
    }
}

/// Per-participant readiness flag for an episode reset.
///
/// A fresh flag is issued for every reset, so an acknowledgment for an old
/// reset can never release a new one.
#[derive(Debug, Default)]
pub struct ResetFlag {
    set: AtomicBool,
    notify: Notify,
}

impl ResetFlag {
    /// Raise the flag and wake the waiter.
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the flag is raised.
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the flag is raised.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// Capacity-1 action slot. A put never blocks and overwrites what is there.
#[derive(Debug, Clone, Copy, Default)]
struct ActionSlot(Option<Action>);

impl ActionSlot {
    /// Store `action`, returning whether an untaken action was overwritten.
    fn put(&mut self, action: Action) -> bool {
        self.0.replace(action).is_some()
    }

    fn take(&mut self) -> Option<Action> {
        self.0.take()
    }
}

/// A matched group occupying one scene instance.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Scene descriptor.
    pub scene: Arc<SceneConfig>,
    /// Shared simulation seed.
    pub seed: u64,
    lifecycle: LifecycleState,
    tick_status: TickStatus,
    slots: BTreeMap<SlotId, Option<ParticipantId>>,
    pending: BTreeMap<SlotId, ActionSlot>,
    last_actions: BTreeMap<SlotId, Action>,
    ready: BTreeSet<ParticipantId>,
    all_ready: Arc<Notify>,
    reset_flags: BTreeMap<ParticipantId, Arc<ResetFlag>>,
    episode: u32,
    ended_tx: watch::Sender<bool>,
    created_at: Instant,
    started_at: Option<Instant>,
}

impl Session {
    /// Create an empty session with `scene.group_size` slots.
    pub fn new(id: SessionId, scene: Arc<SceneConfig>, seed: u64) -> Self {
        let slots = (0..scene.group_size as SlotId).map(|s| (s, None)).collect();
        let (ended_tx, _) = watch::channel(false);

        Self {
            id,
            scene,
            seed,
            lifecycle: LifecycleState::Waiting,
            tick_status: TickStatus::Inactive,
            slots,
            pending: BTreeMap::new(),
            last_actions: BTreeMap::new(),
            ready: BTreeSet::new(),
            all_ready: Arc::new(Notify::new()),
            reset_flags: BTreeMap::new(),
            episode: 0,
            ended_tx,
            created_at: Instant::now(),
            started_at: None,
        }
    }

    // -------------------------------------------------------------------------
    // Slots
    // -------------------------------------------------------------------------

    /// Put a participant in the lowest empty slot.
    pub fn assign_slot(&mut self, participant: ParticipantId) -> Result<SlotId, SessionError> {
        if self.lifecycle == LifecycleState::Ended {
            return Err(SessionError::Ended(self.id));
        }
        if self.slot_of(&participant).is_some() {
            return Err(SessionError::AlreadyInSession(participant));
        }

        let slot = self
            .slots
            .iter()
            .find(|(_, occupant)| occupant.is_none())
            .map(|(slot, _)| *slot)
            .ok_or(SessionError::SessionFull(self.id))?;

        self.slots.insert(slot, Some(participant));
        Ok(slot)
    }

    /// Vacate a participant's slot. Returns the slot it held.
    ///
    /// Releases the participant's reset flag so a reset never waits on
    /// someone who is gone.
    pub fn remove_participant(&mut self, participant: &ParticipantId) -> Option<SlotId> {
        let slot = self.slot_of(participant)?;
        self.slots.insert(slot, None);
        self.pending.remove(&slot);
        self.last_actions.remove(&slot);
        self.ready.remove(participant);
        if let Some(flag) = self.reset_flags.remove(participant) {
            flag.set();
        }
        if self.lifecycle == LifecycleState::Validating && self.all_members_ready() {
            self.all_ready.notify_one();
        }
        Some(slot)
    }

    /// Slot held by `participant`.
    pub fn slot_of(&self, participant: &ParticipantId) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|(_, occupant)| occupant.as_ref() == Some(participant))
            .map(|(slot, _)| *slot)
    }

    /// Participant in `slot`.
    pub fn participant_in(&self, slot: SlotId) -> Option<&ParticipantId> {
        self.slots.get(&slot).and_then(|o| o.as_ref())
    }

    /// Members in slot order.
    pub fn members(&self) -> Vec<ParticipantId> {
        self.slots.values().flatten().cloned().collect()
    }

    /// `(slot, participant)` pairs for occupied slots.
    pub fn occupied(&self) -> Vec<(SlotId, ParticipantId)> {
        self.slots
            .iter()
            .filter_map(|(slot, o)| o.as_ref().map(|p| (*slot, p.clone())))
            .collect()
    }

    /// Number of occupied slots.
    pub fn cur_num_participants(&self) -> usize {
        self.slots.values().filter(|o| o.is_some()).count()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.cur_num_participants() == 0
    }

    // -------------------------------------------------------------------------
    // State machines
    // -------------------------------------------------------------------------

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    /// Move along a declared lifecycle edge.
    ///
    /// Anything else is logged and rejected; the state is left unchanged.
    pub fn transition(&mut self, next: LifecycleState) -> Result<(), SessionError> {
        if !self.lifecycle.can_transition_to(next) {
            warn!(
                session = %self.id,
                from = ?self.lifecycle,
                to = ?next,
                "Rejected lifecycle transition"
            );
            return Err(SessionError::InvalidTransition {
                from: self.lifecycle,
                to: next,
            });
        }

        self.lifecycle = next;
        match next {
            LifecycleState::Playing => {
                self.started_at = Some(Instant::now());
                self.tick_status = TickStatus::Active;
            }
            LifecycleState::Waiting => self.ready.clear(),
            LifecycleState::Ended => {
                self.tick_status = TickStatus::Done;
                self.ended_tx.send_replace(true);
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether the simulation has started.
    pub fn is_running(&self) -> bool {
        self.lifecycle == LifecycleState::Playing
    }

    /// Current tick status.
    pub fn tick_status(&self) -> TickStatus {
        self.tick_status
    }

    /// Set the tick status. `Done` is sticky.
    pub fn set_tick_status(&mut self, status: TickStatus) {
        if !self.tick_status.is_terminal() {
            self.tick_status = status;
        }
    }

    /// Receiver that flips to `true` when the session ends.
    pub fn subscribe_end(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// Queue an action for the next tick. Latest write wins.
    pub fn submit_action(&mut self, slot: SlotId, action: Action) -> Result<bool, SessionError> {
        if self.participant_in(slot).is_none() {
            return Err(SessionError::SlotNotOccupied(slot));
        }
        Ok(self.pending.entry(slot).or_default().put(action))
    }

    /// Take one action per occupied slot for the next step.
    ///
    /// An empty queue falls back to the scene's population policy.
    pub fn collect_actions(&mut self) -> BTreeMap<SlotId, Action> {
        let default = self.scene.default_action;
        let population = self.scene.action_population;

        let occupied: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, o)| o.is_some())
            .map(|(slot, _)| *slot)
            .collect();

        let mut actions = BTreeMap::new();
        for slot in occupied {
            let action = match self.pending.get_mut(&slot).and_then(ActionSlot::take) {
                Some(action) => {
                    self.last_actions.insert(slot, action);
                    action
                }
                None => match population {
                    ActionPopulation::DefaultAction => default,
                    ActionPopulation::PreviousSubmittedAction => {
                        self.last_actions.get(&slot).copied().unwrap_or(default)
                    }
                },
            };
            actions.insert(slot, action);
        }
        actions
    }

    // -------------------------------------------------------------------------
    // Validation and resets
    // -------------------------------------------------------------------------

    /// Record that a member confirmed readiness. Returns whether everyone has.
    pub fn mark_ready(&mut self, participant: &ParticipantId) -> Result<bool, SessionError> {
        if self.slot_of(participant).is_none() {
            return Err(SessionError::NotAMember(participant.clone()));
        }
        self.ready.insert(participant.clone());

        let all = self.all_members_ready();
        if all {
            self.all_ready.notify_one();
        }
        Ok(all)
    }

    fn all_members_ready(&self) -> bool {
        let members = self.members();
        !members.is_empty() && members.iter().all(|m| self.ready.contains(m))
    }

    /// Members that confirmed readiness.
    pub fn ready_members(&self) -> Vec<ParticipantId> {
        self.members()
            .into_iter()
            .filter(|m| self.ready.contains(m))
            .collect()
    }

    /// Notified once every member is ready.
    pub fn all_ready_signal(&self) -> Arc<Notify> {
        self.all_ready.clone()
    }

    /// Issue fresh reset flags for every present member.
    pub fn begin_reset(&mut self) -> Vec<Arc<ResetFlag>> {
        self.tick_status = TickStatus::Reset;
        self.reset_flags = self
            .members()
            .into_iter()
            .map(|m| (m, Arc::new(ResetFlag::default())))
            .collect();
        self.reset_flags.values().cloned().collect()
    }

    /// Acknowledge the current reset. Returns `false` if none is pending.
    pub fn ack_reset(&mut self, participant: &ParticipantId) -> bool {
        match self.reset_flags.get(participant) {
            Some(flag) => {
                flag.set();
                true
            }
            None => false,
        }
    }

    /// Episode `participant` still owes a `reset_ack` for, if any.
    pub fn awaiting_reset_ack(&self, participant: &ParticipantId) -> Option<u32> {
        if self.tick_status != TickStatus::Reset {
            return None;
        }
        self.reset_flags
            .get(participant)
            .filter(|flag| !flag.is_set())
            .map(|_| self.episode + 1)
    }

    /// Finish a reset and start the next episode.
    pub fn end_reset(&mut self) {
        self.reset_flags.clear();
        self.pending.clear();
        self.last_actions.clear();
        self.episode += 1;
        self.set_tick_status(TickStatus::Active);
    }

    /// Current episode (0-based).
    pub fn episode(&self) -> u32 {
        self.episode
    }

    /// Read-only view for observers.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            scene_id: self.scene.scene_id.clone(),
            lifecycle: self.lifecycle,
            tick_status: self.tick_status,
            slots: self.slots.clone(),
            episode: self.episode,
            age_ms: self.created_at.elapsed().as_millis() as u64,
            playing_ms: self.started_at.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: SessionId,
    /// Scene.
    pub scene_id: String,
    /// Lifecycle state.
    pub lifecycle: LifecycleState,
    /// Tick status.
    pub tick_status: TickStatus,
    /// Slot occupancy.
    pub slots: BTreeMap<SlotId, Option<ParticipantId>>,
    /// Current episode.
    pub episode: u32,
    /// Time since creation.
    pub age_ms: u64,
    /// Time since the simulation started.
    pub playing_ms: Option<u64>,
}

/// Session errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Every slot is taken.
    #[error("Session {0} is full")]
    SessionFull(SessionId),

    /// Participant already holds a slot or a waitroom place.
    #[error("{0} is already in a session")]
    AlreadyInSession(ParticipantId),

    /// Participant is connected on another channel.
    #[error("{0} is already connected")]
    AlreadyConnected(ParticipantId),

    /// Participant not known to the coordinator.
    #[error("Unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    /// Participant is not in this session.
    #[error("{0} is not a member of the session")]
    NotAMember(ParticipantId),

    /// Slot belongs to someone else or nobody.
    #[error("Slot {0} is not occupied by the sender")]
    SlotNotOccupied(SlotId),

    /// Session not found (or already cleaned up).
    #[error("Session {0} not found")]
    NotFound(SessionId),

    /// Session already ended.
    #[error("Session {0} has ended")]
    Ended(SessionId),

    /// Participant is not in any session.
    #[error("Not in a session")]
    NotInSession,

    /// Lifecycle edge not declared.
    #[error("Invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },

    /// Relay protocol error.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scene(group_size: usize, population: ActionPopulation) -> Arc<SceneConfig> {
        Arc::new(SceneConfig {
            group_size,
            default_action: 0,
            action_population: population,
            ..Default::default()
        })
    }

    fn session(group_size: usize) -> Session {
        Session::new(uuid::Uuid::new_v4(), scene(group_size, ActionPopulation::DefaultAction), 7)
    }

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    #[test]
    fn test_assign_and_remove_slots() {
        let mut s = session(2);
        assert_eq!(s.assign_slot(pid("a")).unwrap(), 0);
        assert_eq!(s.assign_slot(pid("b")).unwrap(), 1);
        assert_eq!(s.cur_num_participants(), 2);

        assert_eq!(s.remove_participant(&pid("a")), Some(0));
        assert_eq!(s.cur_num_participants(), 1);
        assert_eq!(s.remove_participant(&pid("a")), None);

        // Freed slot is reused
        assert_eq!(s.assign_slot(pid("c")).unwrap(), 0);
        assert_eq!(s.members(), vec![pid("c"), pid("b")]);
    }

    #[test]
    fn test_no_over_allocation() {
        let mut s = session(2);
        s.assign_slot(pid("a")).unwrap();
        assert!(matches!(s.assign_slot(pid("a")), Err(SessionError::AlreadyInSession(_))));
        s.assign_slot(pid("b")).unwrap();
        assert!(matches!(s.assign_slot(pid("c")), Err(SessionError::SessionFull(_))));
        assert!(s.cur_num_participants() <= s.scene.group_size);
    }

    #[test]
    fn test_lifecycle_edges() {
        let mut s = session(2);
        assert!(s.transition(LifecycleState::Playing).is_err());
        assert_eq!(s.lifecycle(), LifecycleState::Waiting);

        s.transition(LifecycleState::Matched).unwrap();
        s.transition(LifecycleState::Validating).unwrap();
        s.transition(LifecycleState::Playing).unwrap();
        assert_eq!(s.tick_status(), TickStatus::Active);
        assert!(s.transition(LifecycleState::Waiting).is_err());

        s.transition(LifecycleState::Ended).unwrap();
        assert_eq!(s.tick_status(), TickStatus::Done);
        assert!(matches!(
            s.transition(LifecycleState::Ended),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert_eq!(s.lifecycle(), LifecycleState::Ended);
    }

    #[test]
    fn test_latest_action_wins() {
        let mut s = session(2);
        s.assign_slot(pid("a")).unwrap();
        s.assign_slot(pid("b")).unwrap();

        assert!(!s.submit_action(0, 1).unwrap());
        assert!(s.submit_action(0, 2).unwrap());

        let actions = s.collect_actions();
        assert_eq!(actions[&0], 2);
        assert_eq!(actions[&1], 0);

        // Queue drained; default population falls back to the default action
        assert_eq!(s.collect_actions()[&0], 0);
    }

    #[test]
    fn test_previous_submitted_action_population() {
        let mut s = Session::new(
            uuid::Uuid::new_v4(),
            scene(1, ActionPopulation::PreviousSubmittedAction),
            7,
        );
        s.assign_slot(pid("a")).unwrap();

        assert_eq!(s.collect_actions()[&0], 0);
        s.submit_action(0, 2).unwrap();
        assert_eq!(s.collect_actions()[&0], 2);
        assert_eq!(s.collect_actions()[&0], 2);
    }

    #[test]
    fn test_submit_to_empty_slot_rejected() {
        let mut s = session(2);
        s.assign_slot(pid("a")).unwrap();
        assert!(matches!(s.submit_action(1, 1), Err(SessionError::SlotNotOccupied(1))));
    }

    #[test]
    fn test_mark_ready() {
        let mut s = session(2);
        s.assign_slot(pid("a")).unwrap();
        s.assign_slot(pid("b")).unwrap();

        assert!(!s.mark_ready(&pid("a")).unwrap());
        assert!(s.mark_ready(&pid("b")).unwrap());
        assert!(s.mark_ready(&pid("z")).is_err());
        assert_eq!(s.ready_members().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_flags_renewed_and_released() {
        let mut s = session(2);
        s.assign_slot(pid("a")).unwrap();
        s.assign_slot(pid("b")).unwrap();

        let flags = s.begin_reset();
        assert_eq!(s.tick_status(), TickStatus::Reset);
        assert_eq!(s.awaiting_reset_ack(&pid("a")), Some(1));
        assert!(s.ack_reset(&pid("a")));
        assert_eq!(s.awaiting_reset_ack(&pid("a")), None);
        assert_eq!(s.awaiting_reset_ack(&pid("b")), Some(1));

        // Departure releases the remaining flag
        s.remove_participant(&pid("b"));
        let all = futures_util::future::join_all(flags.iter().map(|f| f.wait()));
        tokio::time::timeout(Duration::from_secs(1), all).await.unwrap();

        s.end_reset();
        assert_eq!(s.episode(), 1);
        assert!(!s.ack_reset(&pid("a")));

        let fresh = s.begin_reset();
        assert!(fresh.iter().all(|f| !f.is_set()));
    }

    #[tokio::test]
    async fn test_end_signal() {
        let mut s = session(1);
        let mut ended = s.subscribe_end();
        s.transition(LifecycleState::Ended).unwrap();
        ended.changed().await.unwrap();
        assert!(*ended.borrow());
    }
}
