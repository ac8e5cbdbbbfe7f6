//! Protocol Messages
//!
//! Wire format for client-coordinator communication over WebSocket.
//! Messages are JSON objects tagged by `type`; action submissions may also
//! arrive as bincode binary frames.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::env::Action;
use crate::matchmaking::GroupHistory;
use crate::session::{ParticipantId, SessionId, SlotId};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a scene's waitroom (or reattach after a drop).
    Join(JoinRequest),

    /// Leave the current scene.
    Leave,

    /// Action for a frame.
    Action(ActionSubmission),

    /// Periodic hash of the client's local state.
    StateHash(StateHashReport),

    /// The client saw a hash that differs from its own.
    DesyncDetected { slot_id: SlotId, frame_number: u64 },

    /// Host's serialized state, sent after `request_full_state`.
    FullState(FullStateUpload),

    /// Telemetry for the data collector (host only).
    LogData(LogSubmission),

    /// Client finished loading and is ready to play.
    Ready,

    /// Client finished showing the inter-episode screen.
    ResetAck { episode: u32 },

    /// Page visibility changed.
    Focus { visible: bool },

    /// Updated server round-trip measurement.
    LatencyReport { rtt_ms: u32 },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Peer connection set up, waiting for `probe_start`.
    ProbeReady { probe_id: String },

    /// Opaque signaling payload for the probe peer.
    ProbeSignal {
        probe_id: String,
        target: ParticipantId,
        signal_type: String,
        payload: serde_json::Value,
    },

    /// Measured peer round-trip, or `null` when no channel could be opened.
    ProbeResult { probe_id: String, rtt_ms: Option<u32> },
}

/// Join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Participant identifier.
    pub participant_id: ParticipantId,
    /// Scene to join.
    pub scene_id: String,
    /// Session token (JWT when auth is configured).
    #[serde(default)]
    pub token: Option<String>,
    /// Server round-trip measured by the client (ms).
    #[serde(default)]
    pub rtt_ms: Option<u32>,
    /// Group from an earlier scene.
    #[serde(default)]
    pub group_history: Option<GroupHistory>,
}

/// Action submission.
///
/// Flat so it can also travel as a bincode frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSubmission {
    /// Submitting slot.
    pub slot_id: SlotId,
    /// The action.
    pub action: Action,
    /// Client frame the action was taken on.
    pub frame_number: u64,
    /// Client wall-clock (ms).
    pub client_timestamp: u64,
    /// Episode generation the client believes it is in.
    #[serde(default)]
    pub sync_epoch: u64,
}

impl ActionSubmission {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// State hash report. Relayed verbatim to the other slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHashReport {
    /// Reporting slot.
    pub slot_id: SlotId,
    /// Hex digest of the local state.
    pub hash: String,
    /// Frame the hash was taken on.
    pub frame_number: u64,
}

/// Full state uploaded by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullStateUpload {
    /// Serialized simulation state.
    pub state: serde_json::Value,
    /// Frame the state was captured on.
    #[serde(default)]
    pub frame_number: u64,
}

/// Telemetry submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSubmission {
    /// Submitting slot.
    pub slot_id: SlotId,
    /// Opaque telemetry.
    pub payload: serde_json::Value,
    /// Frame the data belongs to.
    pub frame_number: u64,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from coordinator to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Host designation and shared seed.
    HostElected(HostInfo),

    /// Group formed; the session starts after the countdown.
    MatchFoundCountdown { seconds: u32 },

    /// Session is starting.
    StartSession(SessionStartInfo),

    /// Still waiting for a group.
    WaitingRoom(WaitroomStatus),

    /// Waited too long; leave for `redirect_url`.
    WaitroomExpired { redirect_url: Option<String> },

    /// Authoritative snapshot from the server mirror.
    ServerAuthoritativeState(AuthoritativeState),

    /// One frame of a server-run session.
    EnvironmentState(EnvironmentFrame),

    /// Another slot's action.
    OtherPlayerAction(RelayedAction),

    /// Another slot's state hash.
    StateHash(StateHashReport),

    /// Host: upload your full state.
    RequestFullState { frame_number: u64 },

    /// Non-host: replace your state with the host's.
    ApplyFullState { state: serde_json::Value, frame_number: u64 },

    /// Episode over; acknowledge with `reset_ack` to continue.
    ResetRequest { episode: u32 },

    /// Session over.
    EndSession { reason: EndReason },

    /// Prepare a peer-latency probe.
    ProbePrepare(ProbePrepareInfo),

    /// Both sides ready; start measuring.
    ProbeStart { probe_id: String },

    /// Opaque signaling payload from the probe peer.
    ProbeSignal {
        probe_id: String,
        from: ParticipantId,
        signal_type: String,
        payload: serde_json::Value,
    },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Host designation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Whether the receiver is the host.
    pub is_host: bool,
    /// Host participant.
    pub host_id: ParticipantId,
    /// Receiver's slot.
    pub slot_id: SlotId,
    /// Shared simulation seed.
    pub seed: u64,
    /// Slots in the session.
    pub slot_count: usize,
}

/// Session start information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartInfo {
    /// Session identifier.
    pub session_id: SessionId,
    /// Receiver's slot.
    pub slot_id: SlotId,
    /// Scene settings the client needs.
    pub metadata: serde_json::Value,
}

/// Waitroom status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitroomStatus {
    /// Participants waiting.
    pub count: usize,
    /// Participants still needed for a group.
    pub needed: usize,
    /// Time left before the receiver's wait expires (ms).
    pub ms_remaining: u64,
}

/// Why a snapshot was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Regular interval.
    Periodic,
    /// First frame of a new episode.
    EpisodeStart,
}

/// One frame of applied actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameActions {
    /// Frame number.
    pub frame: u64,
    /// Action per slot.
    pub actions: BTreeMap<SlotId, Action>,
}

/// Authoritative snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritativeState {
    /// Why this was sent.
    pub kind: SnapshotKind,
    /// Episode number (0-based).
    pub episode: u32,
    /// Step within the episode.
    pub step: u32,
    /// Frame since session start.
    pub frame: u64,
    /// Current sync epoch.
    pub sync_epoch: u64,
    /// Reward per slot since session start.
    pub cumulative_rewards: BTreeMap<SlotId, f64>,
    /// Hex digest of every applied action.
    pub action_hash: String,
    /// Exported simulation state, if supported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    /// Hex digest of `state`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
    /// Recent frames, oldest first (only with `state`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_actions: Vec<FrameActions>,
}

/// Server-run frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentFrame {
    /// Episode number (0-based).
    pub episode: u32,
    /// Step within the episode.
    pub step: u32,
    /// Observation after the step.
    pub observation: serde_json::Value,
    /// Rewards this step.
    pub rewards: BTreeMap<SlotId, f64>,
    /// Episode finished on this step.
    pub episode_over: bool,
}

/// A relayed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedAction {
    /// Submitting slot.
    pub slot_id: SlotId,
    /// Submitting participant.
    pub participant_id: ParticipantId,
    /// The action.
    pub action: Action,
    /// Sender's frame.
    pub frame_number: u64,
    /// Sender's epoch.
    pub sync_epoch: u64,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Every episode finished.
    Complete,
    /// A member left before the session started.
    LobbyEnded,
    /// A member left a running session.
    PartnerDisconnected,
    /// Not every member confirmed readiness in time.
    ValidationTimeout,
    /// The receiver stayed backgrounded too long.
    FocusLoss,
    /// The receiver did not come back in time.
    ReconnectTimeout,
    /// The receiver left.
    Left,
    /// Coordinator shutting down.
    ServerShutdown,
}

/// TURN relay credentials for the probe peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCredentials {
    /// Relay URLs.
    pub urls: Vec<String>,
    /// Username.
    pub username: String,
    /// Credential.
    pub credential: String,
}

/// Probe preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbePrepareInfo {
    /// Probe identifier.
    pub probe_id: String,
    /// The other side.
    pub peer_id: ParticipantId,
    /// Whether the receiver opens the connection.
    pub initiator: bool,
    /// Relay credentials, if configured.
    pub relay: Option<RelayCredentials>,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// First message was not a join.
    NotJoined,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Malformed message.
    InvalidMessage,
    /// Unknown scene.
    SceneNotFound,
    /// Participant id already connected.
    AlreadyConnected,
    /// Not in a session.
    NotInSession,
    /// Slot does not belong to the sender.
    WrongSlot,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl ServerMessage {
    /// Shorthand for an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_json_shape() {
        let msg = ClientMessage::from_json(
            r#"{"type":"action","slot_id":1,"action":2,"frame_number":40,"client_timestamp":99,"sync_epoch":3}"#,
        )
        .unwrap();

        if let ClientMessage::Action(a) = msg {
            assert_eq!(a.slot_id, 1);
            assert_eq!(a.action, 2);
            assert_eq!(a.sync_epoch, 3);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_join_optional_fields() {
        let msg = ClientMessage::from_json(
            r#"{"type":"join","participant_id":"p1","scene_id":"lobby"}"#,
        )
        .unwrap();

        if let ClientMessage::Join(join) = msg {
            assert_eq!(join.participant_id.as_str(), "p1");
            assert!(join.token.is_none());
            assert!(join.rtt_ms.is_none());
            assert!(join.group_history.is_none());
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_probe_result_null_rtt() {
        let msg = ClientMessage::from_json(
            r#"{"type":"probe_result","probe_id":"x","rtt_ms":null}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::ProbeResult { rtt_ms: None, .. }));
    }

    #[test]
    fn test_end_session_reason() {
        let msg = ServerMessage::EndSession { reason: EndReason::PartnerDisconnected };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"end_session""#));
        assert!(json.contains("partner_disconnected"));
    }

    #[test]
    fn test_snapshot_omits_missing_state() {
        let msg = ServerMessage::ServerAuthoritativeState(AuthoritativeState {
            kind: SnapshotKind::Periodic,
            episode: 0,
            step: 30,
            frame: 30,
            sync_epoch: 0,
            cumulative_rewards: BTreeMap::new(),
            action_hash: "00".to_string(),
            state: None,
            state_hash: None,
            recent_actions: Vec::new(),
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "server_authoritative_state");
        assert_eq!(value["kind"], "periodic");
        assert!(value.get("state").is_none());
        assert!(value.get("recent_actions").is_none());
    }

    #[test]
    fn test_probe_signal_payload_is_opaque() {
        let payload = json!({"sdp": "v=0...", "nested": [1, 2, 3]});
        let msg = ServerMessage::ProbeSignal {
            probe_id: "p".to_string(),
            from: ParticipantId::from("a"),
            signal_type: "offer".to_string(),
            payload: payload.clone(),
        };
        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        if let ServerMessage::ProbeSignal { payload: got, .. } = parsed {
            assert_eq!(got, payload);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_binary_action_submission() {
        // Binary frames carry only the flat action struct
        let action = ActionSubmission {
            slot_id: 0,
            action: -1,
            frame_number: 1000,
            client_timestamp: 123456,
            sync_epoch: 2,
        };

        let bytes = action.to_bytes().unwrap();
        let parsed = ActionSubmission::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn test_error_codes() {
        let msg = ServerMessage::error(ErrorCode::SceneNotFound, "no such scene");
        let json = msg.to_json().unwrap();
        assert!(json.contains("scene_not_found"));
    }
}
