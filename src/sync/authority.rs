//! Server Authoritative Mirror
//!
//! A server-side copy of a client-executed simulation, seeded like the
//! browsers and stepped on a fixed-rate timer. It never waits for actions:
//! each tick uses the latest action received per slot (or the fallback), so
//! a slow client cannot stall it. Periodic snapshots let clients verify or
//! repair their own copy.
//!
//! ## Sync epochs
//!
//! `sync_epoch` increments only when an episode resets. Clients tag each
//! action with the epoch they believe they are in; anything tagged with an
//! old epoch was sent before the reset and is discarded.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::hash::{hash_json, ActionSequenceHash};
use crate::core::rng::derive_episode_seed;
use crate::env::{Action, Environment};
use crate::network::protocol::{AuthoritativeState, FrameActions, ServerMessage, SnapshotKind};
use crate::scene::{ActionPopulation, SceneConfig};
use crate::session::{SessionId, SlotId};
use crate::sync::ClientSyncCoordinator;

/// Result of one tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Snapshot due on this frame.
    pub snapshot: Option<AuthoritativeState>,
    /// The episode finished on this frame.
    pub episode_over: bool,
    /// The step failed; counters did not advance.
    pub failed: bool,
}

/// How a runner loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every episode finished.
    Completed,
    /// Stopped from outside (session ended).
    Stopped,
}

/// Server-side authoritative simulation.
pub struct ServerGameRunner {
    env: Box<dyn Environment>,
    scene: Arc<SceneConfig>,
    slots: Vec<SlotId>,
    session_seed: u64,
    /// Latest received action per slot.
    sticky: BTreeMap<SlotId, Action>,
    /// Actions received since the last tick (default-action population).
    fresh: BTreeMap<SlotId, Action>,
    history: VecDeque<FrameActions>,
    sync_epoch: u64,
    cumulative_rewards: BTreeMap<SlotId, f64>,
    action_hash: ActionSequenceHash,
    episode: u32,
    step: u32,
    frame: u64,
    running: bool,
}

impl ServerGameRunner {
    /// Create a runner. Call [`start`](Self::start) before ticking.
    pub fn new(
        env: Box<dyn Environment>,
        scene: Arc<SceneConfig>,
        slots: Vec<SlotId>,
        session_seed: u64,
    ) -> Self {
        let cumulative_rewards = slots.iter().map(|s| (*s, 0.0)).collect();
        Self {
            env,
            scene,
            slots,
            session_seed,
            sticky: BTreeMap::new(),
            fresh: BTreeMap::new(),
            history: VecDeque::new(),
            sync_epoch: 0,
            cumulative_rewards,
            action_hash: ActionSequenceHash::new(),
            episode: 0,
            step: 0,
            frame: 0,
            running: false,
        }
    }

    /// Reset to episode 0 and start. Returns the `episode_start` snapshot.
    pub fn start(&mut self) -> AuthoritativeState {
        self.env.reset(derive_episode_seed(self.session_seed, 0));
        self.running = true;
        info!(slots = self.slots.len(), "Authoritative runner started");
        self.snapshot(SnapshotKind::EpisodeStart)
    }

    /// Record an action. Returns `false` if it was discarded.
    pub fn receive_action(&mut self, slot: SlotId, action: Action, sync_epoch: u64) -> bool {
        if sync_epoch != self.sync_epoch {
            debug!(slot, sync_epoch, current = self.sync_epoch, "Discarded stale-epoch action");
            return false;
        }
        if !self.slots.contains(&slot) {
            return false;
        }
        self.sticky.insert(slot, action);
        self.fresh.insert(slot, action);
        true
    }

    /// Action each slot will use on the next tick.
    pub fn actions_for_tick(&self) -> BTreeMap<SlotId, Action> {
        let default = self.scene.default_action;
        self.slots
            .iter()
            .map(|slot| {
                let action = match self.scene.action_population {
                    ActionPopulation::PreviousSubmittedAction => self.sticky.get(slot),
                    ActionPopulation::DefaultAction => self.fresh.get(slot),
                };
                (*slot, action.copied().unwrap_or(default))
            })
            .collect()
    }

    /// Advance one frame.
    ///
    /// A failed step is logged and leaves every counter unchanged.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.running {
            return TickOutcome::default();
        }

        let actions = self.actions_for_tick();
        let outcome = match self.env.step(&actions) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(frame = self.frame, error = %e, "Authoritative step failed");
                return TickOutcome { failed: true, ..Default::default() };
            }
        };
        self.fresh.clear();

        self.frame += 1;
        self.step += 1;
        for (slot, reward) in &outcome.rewards {
            *self.cumulative_rewards.entry(*slot).or_insert(0.0) += reward;
        }
        self.action_hash.record(self.frame, actions.iter().map(|(s, a)| (*s, *a)));

        self.history.push_back(FrameActions { frame: self.frame, actions });
        while self.history.len() > self.scene.input_buffer_frames {
            self.history.pop_front();
        }

        let episode_over = outcome.episode_over() || self.step >= self.scene.max_steps;
        let snapshot = if self.frame % self.scene.state_broadcast_interval.max(1) as u64 == 0 {
            Some(self.snapshot(SnapshotKind::Periodic))
        } else {
            None
        };

        TickOutcome { snapshot, episode_over, failed: false }
    }

    /// Move to the next episode.
    ///
    /// Returns the `episode_start` snapshot, or `None` when the episode
    /// budget is spent (the runner stops).
    pub fn reset_episode(&mut self) -> Option<AuthoritativeState> {
        if self.episode + 1 >= self.scene.max_episodes {
            self.running = false;
            info!(episodes = self.episode + 1, frame = self.frame, "Authoritative runner finished");
            return None;
        }

        self.episode += 1;
        self.sync_epoch += 1;
        self.step = 0;
        self.sticky.clear();
        self.fresh.clear();
        self.history.clear();
        self.env.reset(derive_episode_seed(self.session_seed, self.episode));

        debug!(episode = self.episode, sync_epoch = self.sync_epoch, "Authoritative episode reset");
        Some(self.snapshot(SnapshotKind::EpisodeStart))
    }

    /// Build a snapshot of the current frame.
    pub fn snapshot(&self, kind: SnapshotKind) -> AuthoritativeState {
        let state = self.env.export_state();
        let state_hash = state.as_ref().map(|s| hex::encode(hash_json(s)));
        let recent_actions = if state.is_some() {
            self.history.iter().cloned().collect()
        } else {
            Vec::new()
        };

        AuthoritativeState {
            kind,
            episode: self.episode,
            step: self.step,
            frame: self.frame,
            sync_epoch: self.sync_epoch,
            cumulative_rewards: self.cumulative_rewards.clone(),
            action_hash: self.action_hash.to_hex(),
            state,
            state_hash,
            recent_actions,
        }
    }

    /// Stop ticking.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Whether the runner is ticking.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current sync epoch.
    pub fn sync_epoch(&self) -> u64 {
        self.sync_epoch
    }

    /// Frames since start.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Current episode.
    pub fn episode(&self) -> u32 {
        self.episode
    }

    /// Reward per slot since start.
    pub fn cumulative_rewards(&self) -> &BTreeMap<SlotId, f64> {
        &self.cumulative_rewards
    }
}

/// Drive a runner at the scene frame rate until it finishes or `ended` fires.
///
/// Snapshots go to every slot of `session_id` through `sync`. Episode
/// completion pauses the timer for the grace delay.
pub async fn run_authoritative(
    runner: Arc<Mutex<ServerGameRunner>>,
    sync: Arc<ClientSyncCoordinator>,
    session_id: SessionId,
    mut ended: watch::Receiver<bool>,
) -> RunOutcome {
    let (frame_duration, grace, first) = {
        let mut r = runner.lock().await;
        (r.scene.frame_duration(), r.scene.episode_grace(), r.start())
    };
    sync.broadcast(session_id, ServerMessage::ServerAuthoritativeState(first)).await;

    let mut ticker = interval(frame_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = ended.changed() => return RunOutcome::Stopped,
        }

        let outcome = {
            let mut r = runner.lock().await;
            if !r.is_running() {
                return RunOutcome::Stopped;
            }
            r.tick()
        };

        if let Some(snapshot) = outcome.snapshot {
            sync.broadcast(session_id, ServerMessage::ServerAuthoritativeState(snapshot)).await;
        }
        if !outcome.episode_over {
            continue;
        }

        let next = runner.lock().await.reset_episode();
        match next {
            None => return RunOutcome::Completed,
            Some(start) => {
                sync.broadcast(session_id, ServerMessage::ServerAuthoritativeState(start)).await;
                tokio::select! {
                    _ = sleep(grace) => {}
                    _ = ended.changed() => return RunOutcome::Stopped,
                }
                ticker.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvError, Observation, StepOutcome, TokenChase};
    use serde_json::json;

    /// Records every action map it is stepped with.
    struct Recorder {
        log: Arc<std::sync::Mutex<Vec<BTreeMap<SlotId, Action>>>>,
        fail_next: bool,
    }

    impl Environment for Recorder {
        fn reset(&mut self, _seed: u64) -> Observation {
            json!(null)
        }

        fn step(&mut self, actions: &BTreeMap<SlotId, Action>) -> Result<StepOutcome, EnvError> {
            if self.fail_next {
                self.fail_next = false;
                return Err(EnvError::Failure("boom".into()));
            }
            self.log.lock().unwrap().push(actions.clone());
            Ok(StepOutcome::default())
        }
    }

    fn scene(population: ActionPopulation) -> Arc<SceneConfig> {
        Arc::new(SceneConfig {
            max_steps: 10,
            max_episodes: 2,
            default_action: 0,
            action_population: population,
            state_broadcast_interval: 5,
            input_buffer_frames: 4,
            ..Default::default()
        })
    }

    fn recorder_runner(
        population: ActionPopulation,
    ) -> (ServerGameRunner, Arc<std::sync::Mutex<Vec<BTreeMap<SlotId, Action>>>>) {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let env = Recorder { log: log.clone(), fail_next: false };
        let mut runner = ServerGameRunner::new(Box::new(env), scene(population), vec![0, 1], 42);
        runner.start();
        (runner, log)
    }

    #[test]
    fn test_sticky_action_until_reset() {
        let (mut runner, log) = recorder_runner(ActionPopulation::PreviousSubmittedAction);

        // Slot 0 never submits; slot 1 submits once
        runner.tick();
        assert_eq!(log.lock().unwrap()[0][&0], 0);

        assert!(runner.receive_action(1, 2, 0));
        for _ in 0..5 {
            runner.tick();
        }
        let steps = log.lock().unwrap().clone();
        assert!(steps[1..].iter().all(|a| a[&1] == 2 && a[&0] == 0));

        // Run out the episode and reset
        let mut over = false;
        while !over {
            over = runner.tick().episode_over;
        }
        assert!(runner.reset_episode().is_some());
        runner.tick();
        let last = log.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last[&1], 0);
    }

    #[test]
    fn test_default_population_uses_action_once() {
        let (mut runner, log) = recorder_runner(ActionPopulation::DefaultAction);
        runner.receive_action(0, 1, 0);
        runner.tick();
        runner.tick();

        let steps = log.lock().unwrap().clone();
        assert_eq!(steps[0][&0], 1);
        assert_eq!(steps[1][&0], 0);
    }

    #[test]
    fn test_stale_epoch_discarded() {
        let (mut runner, _log) = recorder_runner(ActionPopulation::PreviousSubmittedAction);
        for _ in 0..10 {
            runner.tick();
        }
        runner.reset_episode().unwrap();
        assert_eq!(runner.sync_epoch(), 1);

        assert!(!runner.receive_action(0, 2, 0));
        assert_eq!(runner.actions_for_tick()[&0], 0);
        assert!(runner.receive_action(0, 2, 1));
        assert!(!runner.receive_action(9, 2, 1));
    }

    #[test]
    fn test_episode_budget() {
        let (mut runner, _log) = recorder_runner(ActionPopulation::DefaultAction);
        for _ in 0..10 {
            runner.tick();
        }
        assert!(runner.reset_episode().is_some());
        for _ in 0..10 {
            runner.tick();
        }
        assert!(runner.reset_episode().is_none());
        assert!(!runner.is_running());
        assert!(runner.tick().snapshot.is_none());
    }

    #[test]
    fn test_failed_step_leaves_counters() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let env = Recorder { log, fail_next: true };
        let mut runner = ServerGameRunner::new(
            Box::new(env),
            scene(ActionPopulation::DefaultAction),
            vec![0],
            1,
        );
        runner.start();

        let outcome = runner.tick();
        assert!(outcome.failed);
        assert_eq!(runner.frame(), 0);

        assert!(!runner.tick().failed);
        assert_eq!(runner.frame(), 1);
    }

    #[test]
    fn test_snapshots_with_exported_state() {
        let mut runner = ServerGameRunner::new(
            Box::new(TokenChase::new(2)),
            scene(ActionPopulation::PreviousSubmittedAction),
            vec![0, 1],
            9,
        );
        let start = runner.start();
        assert_eq!(start.kind, SnapshotKind::EpisodeStart);
        assert!(start.state.is_some());

        let mut snapshots = Vec::new();
        for _ in 0..10 {
            if let Some(s) = runner.tick().snapshot {
                snapshots.push(s);
            }
        }

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].frame, 5);
        assert_eq!(snapshots[1].frame, 10);
        assert!(snapshots[0].state_hash.is_some());
        assert_eq!(snapshots[1].recent_actions.len(), 4);
        assert_eq!(snapshots[1].recent_actions[0].frame, 7);
        assert_ne!(snapshots[0].action_hash, snapshots[1].action_hash);
    }

    #[test]
    fn test_identical_runners_agree() {
        let make = || {
            let mut r = ServerGameRunner::new(
                Box::new(TokenChase::new(2)),
                scene(ActionPopulation::PreviousSubmittedAction),
                vec![0, 1],
                77,
            );
            r.start();
            r
        };
        let mut a = make();
        let mut b = make();

        for frame in 0..10 {
            let action = (frame % 3) as Action;
            a.receive_action(0, action, 0);
            b.receive_action(0, action, 0);
            a.tick();
            b.tick();
        }

        let sa = a.snapshot(SnapshotKind::Periodic);
        let sb = b.snapshot(SnapshotKind::Periodic);
        assert_eq!(sa.action_hash, sb.action_hash);
        assert_eq!(sa.state_hash, sb.state_hash);
    }
}
