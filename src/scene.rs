//! Scene Descriptors
//!
//! A scene describes how one kind of session runs: how many slots it has,
//! how fast it ticks, where the simulation executes and how participants are
//! grouped. Scenes are loaded from JSON; every field has a default so a
//! descriptor only needs to list what it changes.

use std::time::Duration;

use serde::{Serialize, Deserialize};
use serde_json::json;
use thiserror::Error;

use crate::env::Action;

/// How a missing action is filled in on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPopulation {
    /// Use the scene's default action.
    DefaultAction,
    /// Repeat the slot's last submitted action (default action until one arrives).
    PreviousSubmittedAction,
}

/// Where the simulation executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The server steps the simulation and streams state to clients.
    Server,
    /// Every browser steps its own copy; the server relays actions.
    Client,
}

/// What happens to a running session when a member leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// End the session for everyone.
    EndSession,
    /// Keep playing with the remaining members; promote a new host if needed.
    Continue,
}

/// Matchmaking strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchmakerStrategy {
    /// First come, first served.
    Fifo,
    /// FIFO restricted to pairs whose summed server RTT is within bounds.
    LatencyFifo {
        /// Maximum summed server round-trip time (ms), inclusive.
        max_server_rtt_ms: u32,
    },
    /// Reunite participants who played together in an earlier scene.
    GroupReunion {
        /// Fall back to FIFO when no previous partner is waiting.
        fallback_to_fifo: bool,
    },
}

/// Matchmaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerConfig {
    /// Strategy.
    pub strategy: MatchmakerStrategy,
    /// Peer-to-peer RTT gate (ms). `None` disables probing.
    pub max_p2p_rtt_ms: Option<u32>,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            strategy: MatchmakerStrategy::Fifo,
            max_p2p_rtt_ms: None,
        }
    }
}

/// Scene configuration errors.
#[derive(Debug, Clone, Error)]
pub enum SceneError {
    /// Group size must be at least one.
    #[error("scene {0}: group_size must be >= 1")]
    EmptyGroup(String),
    /// Frame rate must be positive.
    #[error("scene {0}: fps must be > 0")]
    ZeroFps(String),
    /// A frame interval must be positive.
    #[error("scene {scene}: {field} must be > 0")]
    ZeroInterval {
        /// Scene id.
        scene: String,
        /// Offending field.
        field: &'static str,
    },
}

/// A scene descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Scene identifier (clients join by this id).
    pub scene_id: String,
    /// Number of slots per session.
    pub group_size: usize,
    /// Simulation frame rate.
    pub fps: u32,
    /// Episodes per session.
    pub max_episodes: u32,
    /// Steps per episode.
    pub max_steps: u32,
    /// Action used when none is available.
    pub default_action: Action,
    /// Missing-action policy.
    pub action_population: ActionPopulation,
    /// Where the simulation runs.
    pub execution: ExecutionMode,
    /// Run a server-side authoritative mirror for client-executed sessions.
    pub server_authoritative: bool,
    /// Frames between authoritative snapshots.
    pub state_broadcast_interval: u32,
    /// Frames between client state-hash reports.
    pub state_hash_interval: u32,
    /// Client-side input delay (frames).
    pub input_delay: u32,
    /// Capacity of the recent-actions ring (frames).
    pub input_buffer_frames: usize,
    /// Countdown before a multi-party session starts (seconds).
    pub countdown_secs: u32,
    /// How long members have to confirm readiness after matching (ms).
    pub validation_timeout_ms: u64,
    /// Window to rejoin after a transport drop (ms). `None` removes immediately.
    pub reconnection_timeout_ms: Option<u64>,
    /// How long a client may stay backgrounded (ms). `None` disables the check.
    pub focus_loss_timeout_ms: Option<u64>,
    /// How long a participant may wait for a group (ms).
    pub waitroom_timeout_ms: u64,
    /// Where to send participants whose wait expired.
    pub waitroom_redirect_url: Option<String>,
    /// Freeze between episodes in server-run sessions (ms).
    pub reset_freeze_ms: u64,
    /// Pause after an authoritative episode reset (ms).
    pub episode_grace_ms: u64,
    /// Behavior when a member leaves a running session.
    pub disconnect_policy: DisconnectPolicy,
    /// Matchmaking.
    pub matchmaker: MatchmakerConfig,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            scene_id: "default".to_string(),
            group_size: 2,
            fps: 10,
            max_episodes: 1,
            max_steps: 300,
            default_action: 0,
            action_population: ActionPopulation::DefaultAction,
            execution: ExecutionMode::Client,
            server_authoritative: false,
            state_broadcast_interval: 30,
            state_hash_interval: 30,
            input_delay: 0,
            input_buffer_frames: 60,
            countdown_secs: 3,
            validation_timeout_ms: 30_000,
            reconnection_timeout_ms: None,
            focus_loss_timeout_ms: None,
            waitroom_timeout_ms: 120_000,
            waitroom_redirect_url: None,
            reset_freeze_ms: 1_000,
            episode_grace_ms: 3_000,
            disconnect_policy: DisconnectPolicy::EndSession,
            matchmaker: MatchmakerConfig::default(),
        }
    }
}

impl SceneConfig {
    /// Check invariants the coordinator relies on.
    pub fn validate(&self) -> Result<(), SceneError> {
        if self.group_size == 0 {
            return Err(SceneError::EmptyGroup(self.scene_id.clone()));
        }
        if self.fps == 0 {
            return Err(SceneError::ZeroFps(self.scene_id.clone()));
        }
        for (field, value) in [
            ("state_broadcast_interval", self.state_broadcast_interval as usize),
            ("state_hash_interval", self.state_hash_interval as usize),
            ("input_buffer_frames", self.input_buffer_frames),
        ] {
            if value == 0 {
                return Err(SceneError::ZeroInterval {
                    scene: self.scene_id.clone(),
                    field,
                });
            }
        }
        Ok(())
    }

    /// Duration of one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros((1_000_000 / self.fps.max(1) as u64).max(1))
    }

    /// Countdown length.
    pub fn countdown(&self) -> Duration {
        Duration::from_secs(self.countdown_secs as u64)
    }

    /// Validation window.
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// Reconnection window.
    pub fn reconnection_timeout(&self) -> Option<Duration> {
        self.reconnection_timeout_ms.map(Duration::from_millis)
    }

    /// Focus-loss window.
    pub fn focus_loss_timeout(&self) -> Option<Duration> {
        self.focus_loss_timeout_ms.map(Duration::from_millis)
    }

    /// Waitroom expiry.
    pub fn waitroom_timeout(&self) -> Duration {
        Duration::from_millis(self.waitroom_timeout_ms)
    }

    /// Inter-episode freeze for server-run sessions.
    pub fn reset_freeze(&self) -> Duration {
        Duration::from_millis(self.reset_freeze_ms)
    }

    /// Grace delay after an authoritative reset.
    pub fn episode_grace(&self) -> Duration {
        Duration::from_millis(self.episode_grace_ms)
    }

    /// Whether sessions need a countdown.
    pub fn is_multi_party(&self) -> bool {
        self.group_size > 1
    }

    /// Settings clients need to run their copy, sent with `start_session`.
    pub fn client_metadata(&self) -> serde_json::Value {
        json!({
            "scene_id": self.scene_id,
            "slot_count": self.group_size,
            "fps": self.fps,
            "max_episodes": self.max_episodes,
            "max_steps": self.max_steps,
            "default_action": self.default_action,
            "execution": self.execution,
            "server_authoritative": self.server_authoritative,
            "state_hash_interval": self.state_hash_interval,
            "input_delay": self.input_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let scene = SceneConfig::default();
        assert!(scene.validate().is_ok());
        assert_eq!(scene.frame_duration(), Duration::from_millis(100));
        assert!(scene.is_multi_party());
    }

    #[test]
    fn test_frame_duration_never_zero() {
        let scene = SceneConfig { fps: u32::MAX, ..Default::default() };
        assert!(scene.validate().is_ok());
        assert_eq!(scene.frame_duration(), Duration::from_micros(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "scene_id": "cramped_room",
            "group_size": 2,
            "execution": "server",
            "matchmaker": {
                "strategy": { "kind": "latency_fifo", "max_server_rtt_ms": 200 },
                "max_p2p_rtt_ms": 150
            }
        }"#;
        let scene: SceneConfig = serde_json::from_str(json).unwrap();

        assert_eq!(scene.scene_id, "cramped_room");
        assert_eq!(scene.execution, ExecutionMode::Server);
        assert_eq!(scene.fps, 10);
        assert_eq!(
            scene.matchmaker.strategy,
            MatchmakerStrategy::LatencyFifo { max_server_rtt_ms: 200 }
        );
        assert_eq!(scene.matchmaker.max_p2p_rtt_ms, Some(150));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let scene = SceneConfig { group_size: 0, ..Default::default() };
        assert!(matches!(scene.validate(), Err(SceneError::EmptyGroup(_))));

        let scene = SceneConfig { fps: 0, ..Default::default() };
        assert!(matches!(scene.validate(), Err(SceneError::ZeroFps(_))));

        let scene = SceneConfig { input_buffer_frames: 0, ..Default::default() };
        assert!(matches!(
            scene.validate(),
            Err(SceneError::ZeroInterval { field: "input_buffer_frames", .. })
        ));
    }

    #[test]
    fn test_client_metadata() {
        let meta = SceneConfig::default().client_metadata();
        assert_eq!(meta["slot_count"], 2);
        assert_eq!(meta["execution"], "client");
    }
}
