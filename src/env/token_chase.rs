//! Token Chase
//!
//! A tiny deterministic multi-agent environment used by the demo binary and
//! the test suites. Every slot walks on a ring; a token sits on one cell and
//! whoever lands on it scores a point, after which the token respawns at a
//! position drawn from the seeded RNG.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};
use serde_json::json;

use crate::core::rng::DeterministicRng;
use crate::env::{Action, EnvError, Environment, Observation, StepOutcome};
use crate::session::SlotId;

/// Ring length.
pub const TRACK_LEN: i32 = 16;

/// Stay in place.
pub const ACTION_STAY: Action = 0;
/// Move one cell counter-clockwise.
pub const ACTION_LEFT: Action = 1;
/// Move one cell clockwise.
pub const ACTION_RIGHT: Action = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChaseState {
    positions: BTreeMap<SlotId, i32>,
    token: i32,
    step: u32,
    rng: [u64; 2],
}

/// The Token Chase environment.
pub struct TokenChase {
    slots: usize,
    rng: DeterministicRng,
    state: Option<ChaseState>,
}

impl TokenChase {
    /// Create an environment for `slots` agents.
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            rng: DeterministicRng::default(),
            state: None,
        }
    }

    fn observation(state: &ChaseState) -> Observation {
        json!({
            "positions": state.positions,
            "token": state.token,
            "step": state.step,
        })
    }

    fn spawn_token(&mut self, positions: &BTreeMap<SlotId, i32>) -> i32 {
        // Never spawn on an occupied cell unless the ring is full
        for _ in 0..TRACK_LEN {
            let cell = self.rng.next_int(TRACK_LEN as u32) as i32;
            if !positions.values().any(|&p| p == cell) {
                return cell;
            }
        }
        self.rng.next_int(TRACK_LEN as u32) as i32
    }
}

impl Environment for TokenChase {
    fn reset(&mut self, seed: u64) -> Observation {
        self.rng = DeterministicRng::new(seed);

        let spacing = (TRACK_LEN / self.slots.max(1) as i32).max(1);
        let positions: BTreeMap<SlotId, i32> = (0..self.slots as SlotId)
            .map(|slot| (slot, (slot as i32 * spacing) % TRACK_LEN))
            .collect();
        let token = self.spawn_token(&positions);

        let state = ChaseState {
            positions,
            token,
            step: 0,
            rng: self.rng.state(),
        };
        let obs = Self::observation(&state);
        self.state = Some(state);
        obs
    }

    fn step(&mut self, actions: &BTreeMap<SlotId, Action>) -> Result<StepOutcome, EnvError> {
        if self.state.is_none() {
            return Err(EnvError::NotReset);
        }

        // Validate the whole frame before touching state
        let mut deltas = Vec::with_capacity(actions.len());
        for (&slot, &action) in actions {
            let delta = match action {
                ACTION_STAY => 0,
                ACTION_LEFT => -1,
                ACTION_RIGHT => 1,
                other => return Err(EnvError::InvalidAction { slot, action: other }),
            };
            deltas.push((slot, delta));
        }

        let mut state = self.state.take().ok_or(EnvError::NotReset)?;
        for (slot, delta) in deltas {
            if let Some(pos) = state.positions.get_mut(&slot) {
                *pos = (*pos + delta).rem_euclid(TRACK_LEN);
            }
        }

        let mut rewards: BTreeMap<SlotId, f64> =
            state.positions.keys().map(|&slot| (slot, 0.0)).collect();
        let mut collected = false;
        for (slot, pos) in &state.positions {
            if *pos == state.token {
                rewards.insert(*slot, 1.0);
                collected = true;
            }
        }
        if collected {
            state.token = self.spawn_token(&state.positions);
        }

        state.step += 1;
        state.rng = self.rng.state();
        let observation = Self::observation(&state);
        self.state = Some(state);

        Ok(StepOutcome {
            observation,
            rewards,
            terminated: false,
            truncated: false,
        })
    }

    fn export_state(&self) -> Option<serde_json::Value> {
        self.state.as_ref().and_then(|s| serde_json::to_value(s).ok())
    }
}
