//! Synchronization
//!
//! Keeps independently executed copies of a simulation consistent:
//!
//! - `coordinator`: action relay, state-hash relay, resync and host-only
//!   logging for browser-executed sessions
//! - `authority`: optional server-side mirror that ticks on its own clock and
//!   broadcasts verifiable snapshots

pub mod authority;
pub mod coordinator;

pub use authority::{run_authoritative, RunOutcome, ServerGameRunner, TickOutcome};
pub use coordinator::{ClientSyncCoordinator, LogEntry, SlotRemoval, SyncError};
