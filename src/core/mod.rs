//! Core deterministic primitives.
//!
//! Seeds and hashes that every copy of a simulation must agree on, whether it
//! runs in a browser or in the server-side authoritative mirror.

pub mod hash;
pub mod rng;

// Re-export core types
pub use hash::{hash_json, ActionSequenceHash, StateHash, StateHasher};
pub use rng::{derive_episode_seed, derive_session_seed, DeterministicRng};
