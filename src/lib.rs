//! # Coplay Coordinator
//!
//! Session coordination and synchronization for multi-party simulations that
//! run in participants' browsers, on the server, or both.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    COPLAY COORDINATOR                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Xorshift128+ PRNG, session/episode seeds  │
//! │  └── hash.rs     - Action-sequence and state hashing         │
//! │                                                              │
//! │  env/            - Simulation interface + demo environment   │
//! │  scene.rs        - Scene descriptors                         │
//! │  matchmaking/    - FIFO, latency-aware, group reunion        │
//! │  probe.rs        - Peer-latency probes gating proposals      │
//! │                                                              │
//! │  session/        - Session lifecycle                         │
//! │  ├── registry.rs - Participants and their channels           │
//! │  ├── state.rs    - Slots, lifecycle, action slots, resets    │
//! │  ├── manager.rs  - Waitroom, admission, teardown             │
//! │  └── server_run.rs - Server-run tick loop                    │
//! │                                                              │
//! │  sync/           - Client-run sessions                       │
//! │  ├── coordinator.rs - Action relay, hashes, resync, logs     │
//! │  └── authority.rs   - Server-side authoritative mirror       │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - Join token validation                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! `core/`, `env/` and the authoritative runner never read the wall clock and
//! iterate `BTreeMap`s only. Given the same seed and the same per-frame
//! actions, every copy of a session computes the same states and hashes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod env;
pub mod matchmaking;
pub mod network;
pub mod probe;
pub mod scene;
pub mod session;
pub mod sync;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use env::{Action, EnvFactory, Environment};
pub use matchmaking::{Matchmaker, MatchCandidate};
pub use probe::ProbeCoordinator;
pub use scene::SceneConfig;
pub use session::{CoordinatorState, ParticipantId, SessionId, SessionManager, SlotId};
pub use sync::{ClientSyncCoordinator, ServerGameRunner};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
