//! Network Layer
//!
//! WebSocket transport, wire messages and join authentication.
//! Everything here is I/O; coordination decisions live in `session/`,
//! `probe` and `sync/`.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{authorize_join, validate_token, AuthConfig, AuthError, TokenClaims};
pub use protocol::{
    ActionSubmission, AuthoritativeState, ClientMessage, EndReason, ErrorCode, HostInfo,
    JoinRequest, ServerMessage,
};
pub use server::{CoordinatorServer, CoordinatorServerError, ServerConfig};
