//! Peer Latency Probing
//!
//! Before a proposed match is committed, two candidates may be asked to open
//! a direct peer channel and measure its round-trip time. The coordinator
//! only relays: it tells each side who its peer is, waits for both to be
//! ready, forwards opaque signaling payloads by target id, and collects the
//! results.
//!
//! ```text
//! probe_prepare ──► probe_ready (both) ──► probe_start ──► probe_signal* ──► probe_result
//!   Preparing          Preparing            Connecting        Connecting       Measuring → Complete
//! ```
//!
//! Every probe resolves exactly once: on results, on failure, on a member
//! leaving, or after [`PROBE_TIMEOUT`] via [`ProbeCoordinator::cleanup_stale`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::network::protocol::{ProbePrepareInfo, RelayCredentials, ServerMessage};
use crate::session::{CoordinatorState, ParticipantId};

/// Unresolved probes fail after this long.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Completion callback; receives the measured RTT or `None` on failure.
pub type ProbeCallback = Box<dyn FnOnce(Option<u32>) + Send>;

/// Probe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    /// Waiting for both sides to be ready.
    Preparing,
    /// Both ready; peers establishing the channel.
    Connecting,
    /// At least one result in.
    Measuring,
    /// Resolved with a measurement.
    Complete,
    /// Resolved without one.
    Failed,
}

/// Probe errors.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    /// No probe with this id (already resolved or never existed).
    #[error("Unknown probe {0}")]
    UnknownProbe(String),

    /// Sender is not one of the two sides.
    #[error("{participant} is not part of probe {probe_id}")]
    NotAMember {
        /// Probe.
        probe_id: String,
        /// Sender.
        participant: ParticipantId,
    },

    /// Signal target is not the sender's peer.
    #[error("Invalid signal target {0}")]
    InvalidTarget(ParticipantId),
}

struct ProbeSession {
    a: ParticipantId,
    b: ParticipantId,
    state: ProbeState,
    created_at: Instant,
    ready: BTreeSet<ParticipantId>,
    results: BTreeMap<ParticipantId, Option<u32>>,
    callback: Option<ProbeCallback>,
}

impl fmt::Debug for ProbeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSession")
            .field("a", &self.a)
            .field("b", &self.b)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl ProbeSession {
    fn is_member(&self, id: &ParticipantId) -> bool {
        &self.a == id || &self.b == id
    }

    fn peer_of(&self, id: &ParticipantId) -> &ParticipantId {
        if &self.a == id { &self.b } else { &self.a }
    }

    /// Conservative measurement: the larger of the two reports.
    fn measurement(&self) -> Option<u32> {
        let mut rtts = self.results.values();
        let first = (*rtts.next()?)?;
        rtts.try_fold(first, |acc, r| r.map(|r| acc.max(r)))
    }
}

/// Serializable view of a probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeSnapshot {
    /// Probe identifier.
    pub probe_id: String,
    /// The two sides.
    pub participants: [ParticipantId; 2],
    /// Current state.
    pub state: ProbeState,
    /// Time since creation.
    pub age_ms: u64,
}

/// Orchestrates peer latency probes.
pub struct ProbeCoordinator {
    state: Arc<CoordinatorState>,
    relay: Option<RelayCredentials>,
    timeout: Duration,
    probes: Mutex<BTreeMap<String, ProbeSession>>,
}

impl fmt::Debug for ProbeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeCoordinator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProbeCoordinator {
    /// Create a coordinator with the standard timeout.
    pub fn new(state: Arc<CoordinatorState>, relay: Option<RelayCredentials>) -> Self {
        Self::with_timeout(state, relay, PROBE_TIMEOUT)
    }

    /// Create a coordinator with a custom timeout.
    pub fn with_timeout(
        state: Arc<CoordinatorState>,
        relay: Option<RelayCredentials>,
        timeout: Duration,
    ) -> Self {
        Self {
            state,
            relay,
            timeout,
            probes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start a probe between `a` (initiator) and `b`.
    ///
    /// If either side cannot be reached the probe fails at once.
    pub async fn start_probe(
        &self,
        a: ParticipantId,
        b: ParticipantId,
        callback: ProbeCallback,
    ) -> String {
        let probe_id = uuid::Uuid::new_v4().to_string();

        self.probes.lock().await.insert(
            probe_id.clone(),
            ProbeSession {
                a: a.clone(),
                b: b.clone(),
                state: ProbeState::Preparing,
                created_at: Instant::now(),
                ready: BTreeSet::new(),
                results: BTreeMap::new(),
                callback: Some(callback),
            },
        );
        info!(probe = %probe_id, a = %a, b = %b, "Probe started");

        let mut reached = true;
        for (me, peer, initiator) in [(&a, &b, true), (&b, &a, false)] {
            let prepare = ServerMessage::ProbePrepare(ProbePrepareInfo {
                probe_id: probe_id.clone(),
                peer_id: peer.clone(),
                initiator,
                relay: self.relay.clone(),
            });
            reached &= self.state.send(me, prepare).await;
        }

        if !reached {
            warn!(probe = %probe_id, "Probe side unreachable");
            self.resolve(&probe_id, ProbeState::Failed, None).await;
        }
        probe_id
    }

    /// A side reports its peer connection is set up.
    pub async fn handle_ready(
        &self,
        probe_id: &str,
        from: &ParticipantId,
    ) -> Result<(), ProbeError> {
        let start = {
            let mut probes = self.probes.lock().await;
            let probe = Self::member_probe(&mut probes, probe_id, from)?;
            probe.ready.insert(from.clone());

            if probe.state == ProbeState::Preparing && probe.ready.len() == 2 {
                probe.state = ProbeState::Connecting;
                Some([probe.a.clone(), probe.b.clone()])
            } else {
                None
            }
        };

        if let Some(sides) = start {
            debug!(probe = %probe_id, "Probe sides ready");
            let msg = ServerMessage::ProbeStart { probe_id: probe_id.to_string() };
            self.state.broadcast(sides.iter(), &msg).await;
        }
        Ok(())
    }

    /// Forward an opaque signaling payload to the sender's peer.
    pub async fn relay_signal(
        &self,
        probe_id: &str,
        from: &ParticipantId,
        target: &ParticipantId,
        signal_type: String,
        payload: serde_json::Value,
    ) -> Result<(), ProbeError> {
        {
            let mut probes = self.probes.lock().await;
            let probe = Self::member_probe(&mut probes, probe_id, from)?;
            if probe.peer_of(from) != target {
                return Err(ProbeError::InvalidTarget(target.clone()));
            }
        }

        let msg = ServerMessage::ProbeSignal {
            probe_id: probe_id.to_string(),
            from: from.clone(),
            signal_type,
            payload,
        };
        self.state.send(target, msg).await;
        Ok(())
    }

    /// A side reports its measurement (`None` = could not connect).
    pub async fn handle_result(
        &self,
        probe_id: &str,
        from: &ParticipantId,
        rtt_ms: Option<u32>,
    ) -> Result<(), ProbeError> {
        let outcome = {
            let mut probes = self.probes.lock().await;
            let probe = Self::member_probe(&mut probes, probe_id, from)?;
            probe.results.insert(from.clone(), rtt_ms);
            if probe.state != ProbeState::Measuring {
                probe.state = ProbeState::Measuring;
            }

            if rtt_ms.is_none() {
                Some((ProbeState::Failed, None))
            } else if probe.results.len() == 2 {
                Some((ProbeState::Complete, probe.measurement()))
            } else {
                None
            }
        };

        if let Some((state, rtt)) = outcome {
            self.resolve(probe_id, state, rtt).await;
        }
        Ok(())
    }

    /// Fail every probe `participant` is part of.
    pub async fn participant_left(&self, participant: &ParticipantId) -> usize {
        let ids: Vec<String> = {
            let probes = self.probes.lock().await;
            probes
                .iter()
                .filter(|(_, p)| p.is_member(participant))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &ids {
            debug!(probe = %id, participant = %participant, "Probe cancelled by departure");
            self.resolve(id, ProbeState::Failed, None).await;
        }
        ids.len()
    }

    /// Fail probes older than the timeout. Returns how many were purged.
    pub async fn cleanup_stale(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let probes = self.probes.lock().await;
            probes
                .iter()
                .filter(|(_, p)| now.duration_since(p.created_at) >= self.timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &expired {
            info!(probe = %id, "Probe timed out");
            self.resolve(id, ProbeState::Failed, None).await;
        }
        expired.len()
    }

    /// State of an in-flight probe.
    pub async fn probe_state(&self, probe_id: &str) -> Option<ProbeState> {
        self.probes.lock().await.get(probe_id).map(|p| p.state)
    }

    /// Number of in-flight probes.
    pub async fn active_count(&self) -> usize {
        self.probes.lock().await.len()
    }

    /// Read-only view for observers.
    pub async fn snapshot(&self) -> Vec<ProbeSnapshot> {
        self.probes
            .lock()
            .await
            .iter()
            .map(|(id, p)| ProbeSnapshot {
                probe_id: id.clone(),
                participants: [p.a.clone(), p.b.clone()],
                state: p.state,
                age_ms: p.created_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    fn member_probe<'a>(
        probes: &'a mut BTreeMap<String, ProbeSession>,
        probe_id: &str,
        from: &ParticipantId,
    ) -> Result<&'a mut ProbeSession, ProbeError> {
        let probe = probes
            .get_mut(probe_id)
            .ok_or_else(|| ProbeError::UnknownProbe(probe_id.to_string()))?;
        if !probe.is_member(from) {
            return Err(ProbeError::NotAMember {
                probe_id: probe_id.to_string(),
                participant: from.clone(),
            });
        }
        Ok(probe)
    }

    /// Remove a probe and run its callback outside the lock.
    async fn resolve(&self, probe_id: &str, state: ProbeState, rtt: Option<u32>) {
        let removed = self.probes.lock().await.remove(probe_id);
        let Some(mut probe) = removed else {
            return;
        };
        probe.state = state;
        info!(probe = %probe_id, state = ?state, rtt_ms = ?rtt, "Probe resolved");

        if let Some(callback) = probe.callback.take() {
            callback(rtt);
        }
    }
}
