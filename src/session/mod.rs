//! Session Coordination
//!
//! Everything that turns waiting participants into a running session and
//! tears it down again:
//!
//! - `registry`: the explicit [`CoordinatorState`] every component receives
//! - `state`: one session's slots, action queues and state machines
//! - `manager`: waitroom, admission, lifecycle and disconnect handling
//! - `server_run`: the per-session tick loop for server-executed scenes

pub mod manager;
pub mod registry;
pub mod server_run;
pub mod state;

use std::fmt;

use serde::{Serialize, Deserialize};

pub use crate::network::protocol::EndReason;
pub use manager::{Admission, CoordinatorEvent, ManagerSnapshot, SessionManager};
pub use registry::{CoordinatorState, Liveness, Participant, Registration};
pub use state::{
    LifecycleState, ResetFlag, Session, SessionError, SessionSnapshot, TickStatus,
};

/// Unique session identifier.
pub type SessionId = uuid::Uuid;

/// A logical role within a session (player 1, player 2, ...).
pub type SlotId = u32;

/// Opaque participant identifier supplied by the client.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
