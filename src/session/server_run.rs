//! Server-Run Tick Loop
//!
//! For scenes whose simulation executes on the server only. One task per
//! session: reset, then each frame take one action per slot, step, broadcast
//! the result and wait for the next frame boundary. Between episodes the loop
//! freezes, asks every member for `reset_ack`, and waits for all of them.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::core::rng::derive_episode_seed;
use crate::env::Environment;
use crate::network::protocol::{EnvironmentFrame, ServerMessage};
use crate::scene::SceneConfig;
use crate::session::{CoordinatorState, Session, TickStatus};
use crate::sync::RunOutcome;

/// The tick loop of one server-run session.
pub struct ServerRunLoop {
    session: Arc<RwLock<Session>>,
    env: Box<dyn Environment>,
    state: Arc<CoordinatorState>,
    scene: Arc<SceneConfig>,
}

impl ServerRunLoop {
    /// Create a loop for `session`.
    pub fn new(
        session: Arc<RwLock<Session>>,
        env: Box<dyn Environment>,
        state: Arc<CoordinatorState>,
        scene: Arc<SceneConfig>,
    ) -> Self {
        Self { session, env, state, scene }
    }

    async fn broadcast(
        session: &RwLock<Session>,
        state: &CoordinatorState,
        message: ServerMessage,
    ) {
        let members = session.read().await.members();
        state.broadcast(members.iter(), &message).await;
    }

    /// Run every episode, or until `ended` fires.
    ///
    /// A failed step is logged and retried on the next frame; the tick
    /// status is left as it was.
    pub async fn run(self, mut ended: watch::Receiver<bool>) -> RunOutcome {
        let Self { session, mut env, state, scene } = self;
        let (session_id, seed) = {
            let s = session.read().await;
            (s.id, s.seed)
        };
        let max_steps = scene.max_steps;
        let max_episodes = scene.max_episodes;

        for episode in 0..max_episodes {
            let observation = env.reset(derive_episode_seed(seed, episode));
            Self::broadcast(&session, &state, ServerMessage::EnvironmentState(EnvironmentFrame {
                episode,
                step: 0,
                observation,
                rewards: Default::default(),
                episode_over: false,
            }))
            .await;

            let mut ticker = interval(scene.frame_duration());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            let mut step = 0;
            while step < max_steps {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = ended.changed() => return RunOutcome::Stopped,
                }

                let actions = {
                    let mut s = session.write().await;
                    if s.tick_status().is_terminal() {
                        return RunOutcome::Stopped;
                    }
                    s.collect_actions()
                };

                let outcome = match env.step(&actions) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(session = %session_id, episode, step, error = %e, "Step failed");
                        continue;
                    }
                };

                step += 1;
                let episode_over = outcome.episode_over() || step >= max_steps;
                Self::broadcast(&session, &state, ServerMessage::EnvironmentState(EnvironmentFrame {
                    episode,
                    step,
                    observation: outcome.observation,
                    rewards: outcome.rewards,
                    episode_over,
                }))
                .await;

                if episode_over {
                    break;
                }
            }

            if episode + 1 >= max_episodes {
                break;
            }

            // Inter-episode freeze, then wait for every member
            session.write().await.set_tick_status(TickStatus::Reset);
            tokio::select! {
                _ = sleep(scene.reset_freeze()) => {}
                _ = ended.changed() => return RunOutcome::Stopped,
            }

            let flags = session.write().await.begin_reset();
            let request = ServerMessage::ResetRequest { episode: episode + 1 };
            Self::broadcast(&session, &state, request).await;
            debug!(session = %session_id, episode = episode + 1, waiting = flags.len(), "Awaiting reset acks");

            tokio::select! {
                _ = join_all(flags.iter().map(|f| f.wait())) => {}
                _ = ended.changed() => return RunOutcome::Stopped,
            }
            session.write().await.end_reset();
        }

        info!(session = %session_id, episodes = max_episodes, "Server-run session finished");
        RunOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Action, EnvError, Observation, StepOutcome, TokenChase};
    use crate::session::{LifecycleState, ParticipantId, SlotId};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Fails its first `failures` steps.
    struct Flaky {
        failures: u32,
    }

    impl Environment for Flaky {
        fn reset(&mut self, _seed: u64) -> Observation {
            serde_json::json!(null)
        }

        fn step(&mut self, _actions: &BTreeMap<SlotId, Action>) -> Result<StepOutcome, EnvError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(EnvError::Failure("transient".into()));
            }
            Ok(StepOutcome::default())
        }
    }

    fn scene(max_episodes: u32) -> Arc<SceneConfig> {
        Arc::new(SceneConfig {
            group_size: 2,
            fps: 10,
            max_steps: 3,
            max_episodes,
            reset_freeze_ms: 500,
            ..Default::default()
        })
    }

    async fn setup(
        max_episodes: u32,
    ) -> (ServerRunLoop, Arc<RwLock<Session>>, Vec<mpsc::Receiver<ServerMessage>>) {
        setup_with(max_episodes, Box::new(TokenChase::new(2))).await
    }

    async fn setup_with(
        max_episodes: u32,
        env: Box<dyn Environment>,
    ) -> (ServerRunLoop, Arc<RwLock<Session>>, Vec<mpsc::Receiver<ServerMessage>>) {
        let scene = scene(max_episodes);
        let state = Arc::new(CoordinatorState::new());
        let mut session = Session::new(uuid::Uuid::new_v4(), scene.clone(), 11);

        let mut rxs = Vec::new();
        for name in ["a", "b"] {
            let (tx, rx) = mpsc::channel(64);
            state.register(ParticipantId::from(name), tx).await.unwrap();
            session.assign_slot(ParticipantId::from(name)).unwrap();
            rxs.push(rx);
        }
        session.transition(LifecycleState::Matched).unwrap();
        session.transition(LifecycleState::Validating).unwrap();
        session.transition(LifecycleState::Playing).unwrap();

        let session = Arc::new(RwLock::new(session));
        let run = ServerRunLoop::new(session.clone(), env, state, scene);
        (run, session, rxs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_episode_streams_frames() {
        let (run, session, mut rxs) = setup(1).await;
        session.write().await.submit_action(0, 2).unwrap();

        let ended = session.read().await.subscribe_end();
        assert_eq!(run.run(ended).await, RunOutcome::Completed);

        let mut steps = Vec::new();
        while let Ok(msg) = rxs[1].try_recv() {
            if let ServerMessage::EnvironmentState(frame) = msg {
                steps.push((frame.step, frame.episode_over));
            }
        }
        assert_eq!(steps, vec![(0, false), (1, false), (2, false), (3, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_is_retried() {
        let (run, session, mut rxs) = setup_with(1, Box::new(Flaky { failures: 2 })).await;
        let ended = session.read().await.subscribe_end();
        let handle = tokio::spawn(run.run(ended));

        // Two failed frames, nothing broadcast past the reset frame
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(session.read().await.tick_status(), TickStatus::Active);
        let mut early = Vec::new();
        while let Ok(ServerMessage::EnvironmentState(frame)) = rxs[0].try_recv() {
            early.push(frame.step);
        }
        assert_eq!(early, vec![0]);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        let mut steps = Vec::new();
        while let Ok(ServerMessage::EnvironmentState(frame)) = rxs[0].try_recv() {
            steps.push((frame.step, frame.episode_over));
        }
        assert_eq!(steps, vec![(1, false), (2, false), (3, true)]);
    }

    #[tokio::test]
    async fn test_run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (run, session, _rxs) = setup(1).await;
        let fut = run.run(session.read().await.subscribe_end());
        assert_send(&fut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_waits_for_every_ack() {
        let (run, session, mut rxs) = setup(2).await;
        let ended = session.read().await.subscribe_end();
        let handle = tokio::spawn(run.run(ended));

        // Three frames plus the freeze
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let mut saw_reset = false;
        while let Ok(msg) = rxs[0].try_recv() {
            saw_reset |= matches!(msg, ServerMessage::ResetRequest { episode: 1 });
        }
        assert!(saw_reset);
        assert_eq!(session.read().await.tick_status(), TickStatus::Reset);

        session.write().await.ack_reset(&ParticipantId::from("a"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        session.write().await.ack_reset(&ParticipantId::from("b"));
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.read().await.episode(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_session_ends() {
        let (run, session, _rxs) = setup(5).await;
        let ended = session.read().await.subscribe_end();
        let handle = tokio::spawn(run.run(ended));

        tokio::time::sleep(Duration::from_millis(150)).await;
        session.write().await.transition(LifecycleState::Ended).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
    }
}
