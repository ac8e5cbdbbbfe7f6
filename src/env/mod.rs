//! Simulation Environments
//!
//! The coordinator never looks inside a simulation. It only needs to reset it
//! with a seed, step it with one action per slot, and optionally export a
//! serialized state for resynchronization.
//!
//! ## Determinism
//!
//! Implementations must be deterministic: given the same seed and the same
//! per-frame action maps, every copy (browser or server) must produce the same
//! observations, rewards and exported state. Action maps are `BTreeMap`s so
//! iteration order is stable.

pub mod token_chase;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::session::SlotId;

pub use token_chase::TokenChase;

/// A discrete action submitted by a participant.
pub type Action = i64;

/// Observation emitted by an environment (opaque to the coordinator).
pub type Observation = serde_json::Value;

/// Result of a single environment step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Observation after the step.
    pub observation: Observation,
    /// Reward earned by each slot this step.
    pub rewards: BTreeMap<SlotId, f64>,
    /// Episode ended by the environment's own rules.
    pub terminated: bool,
    /// Episode cut short (time limit inside the environment).
    pub truncated: bool,
}

impl StepOutcome {
    /// Whether the episode is over for either reason.
    pub fn episode_over(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Environment errors.
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// The action map did not match the environment's slots.
    #[error("invalid action for slot {slot}: {action}")]
    InvalidAction {
        /// Offending slot.
        slot: SlotId,
        /// Offending action.
        action: Action,
    },

    /// Step called before reset.
    #[error("environment not reset")]
    NotReset,

    /// Any other failure inside the simulation.
    #[error("simulation failure: {0}")]
    Failure(String),
}

/// A deterministic, step-based simulation.
pub trait Environment: Send {
    /// Reset to the start of an episode.
    fn reset(&mut self, seed: u64) -> Observation;

    /// Advance one frame.
    fn step(&mut self, actions: &BTreeMap<SlotId, Action>) -> Result<StepOutcome, EnvError>;

    /// Serialize the full state, if the environment supports it.
    fn export_state(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Builds a fresh environment for a session.
pub type EnvFactory = Arc<dyn Fn(usize) -> Box<dyn Environment> + Send + Sync>;

/// Factory for the built-in demo environment.
pub fn token_chase_factory() -> EnvFactory {
    Arc::new(|slots| Box::new(TokenChase::new(slots)) as Box<dyn Environment>)
}
