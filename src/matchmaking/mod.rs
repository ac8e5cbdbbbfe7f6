//! Matchmaking
//!
//! A [`Matchmaker`] is a pure decision function: given the participant who
//! just arrived, the participants already waiting and the group size, it
//! either proposes a complete group or says "keep waiting". It never mutates
//! the pool; the [`SessionManager`](crate::session::SessionManager) owns the
//! waitroom and applies the decision.
//!
//! ## Contract
//!
//! A `Some(group)` result must contain the arriving candidate and exactly
//! `group_size` entries. [`is_valid_proposal`] checks this, and the session
//! manager refuses proposals that violate it.

pub mod fifo;
pub mod latency;
pub mod reunion;

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Deserialize};

use crate::scene::{MatchmakerConfig, MatchmakerStrategy};
use crate::session::ParticipantId;

pub use fifo::FifoMatchmaker;
pub use latency::LatencyFifoMatchmaker;
pub use reunion::GroupReunionMatchmaker;

/// Who a participant played with in an earlier scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupHistory {
    /// Partner ids from the previous group.
    pub previous_partners: Vec<ParticipantId>,
    /// Scene the group was formed in.
    pub source_scene_id: String,
    /// Identifier of the previous group.
    pub group_id: String,
}

impl GroupHistory {
    /// Whether `id` was a partner in the previous group.
    pub fn names(&self, id: &ParticipantId) -> bool {
        self.previous_partners.iter().any(|p| p == id)
    }
}

/// A participant as seen by a matchmaker.
///
/// Built fresh for every matchmaking attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCandidate {
    /// Participant identifier.
    pub participant_id: ParticipantId,
    /// Round-trip time to the server (ms), if measured.
    pub rtt_ms: Option<u32>,
    /// Previous group, for re-pairing.
    pub group_history: Option<GroupHistory>,
}

impl MatchCandidate {
    /// Candidate with no latency or history information.
    pub fn new(participant_id: impl Into<ParticipantId>) -> Self {
        Self {
            participant_id: participant_id.into(),
            rtt_ms: None,
            group_history: None,
        }
    }

    /// Attach a server RTT.
    pub fn with_rtt(mut self, rtt_ms: u32) -> Self {
        self.rtt_ms = Some(rtt_ms);
        self
    }

    /// Attach a group history.
    pub fn with_history(mut self, history: GroupHistory) -> Self {
        self.group_history = Some(history);
        self
    }
}

/// Grouping strategy.
pub trait Matchmaker: Send + Sync + fmt::Debug {
    /// Short name for logs and snapshots.
    fn name(&self) -> &'static str;

    /// Propose a group including `arriving`, or `None` to keep waiting.
    ///
    /// Must not depend on anything but its arguments and configuration.
    fn find_match(
        &self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<MatchCandidate>>;

    /// Peer-to-peer RTT gate (ms); `None` disables probing.
    fn max_p2p_rtt_ms(&self) -> Option<u32>;

    /// Decide whether a measured peer RTT rules the proposal out.
    ///
    /// A missing measurement rejects: a failed probe usually means the peers
    /// could not open a direct channel at all.
    fn should_reject_for_rtt(&self, measured: Option<u32>) -> bool {
        match self.max_p2p_rtt_ms() {
            None => false,
            Some(max) => measured.map_or(true, |rtt| rtt > max),
        }
    }
}

/// Check the matchmaker contract for a proposal.
pub fn is_valid_proposal(
    arriving: &MatchCandidate,
    group: &[MatchCandidate],
    group_size: usize,
) -> bool {
    if group.len() != group_size {
        return false;
    }
    if !group.iter().any(|c| c.participant_id == arriving.participant_id) {
        return false;
    }
    // No participant twice
    let mut ids: Vec<&ParticipantId> = group.iter().map(|c| &c.participant_id).collect();
    ids.sort();
    ids.dedup();
    ids.len() == group.len()
}

/// Build the matchmaker a scene asks for.
pub fn build_matchmaker(config: &MatchmakerConfig) -> Arc<dyn Matchmaker> {
    match config.strategy {
        MatchmakerStrategy::Fifo => Arc::new(FifoMatchmaker::new(config.max_p2p_rtt_ms)),
        MatchmakerStrategy::LatencyFifo { max_server_rtt_ms } => Arc::new(
            LatencyFifoMatchmaker::new(max_server_rtt_ms, config.max_p2p_rtt_ms),
        ),
        MatchmakerStrategy::GroupReunion { fallback_to_fifo } => Arc::new(
            GroupReunionMatchmaker::new(fallback_to_fifo, config.max_p2p_rtt_ms),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool(rtts: &[Option<u32>]) -> Vec<MatchCandidate> {
        rtts.iter()
            .enumerate()
            .map(|(i, rtt)| MatchCandidate {
                participant_id: ParticipantId::from(format!("w{i}")),
                rtt_ms: *rtt,
                group_history: None,
            })
            .collect()
    }

    fn all_strategies() -> Vec<Arc<dyn Matchmaker>> {
        vec![
            Arc::new(FifoMatchmaker::new(None)),
            Arc::new(LatencyFifoMatchmaker::new(120, None)),
            Arc::new(GroupReunionMatchmaker::new(true, None)),
            Arc::new(GroupReunionMatchmaker::new(false, None)),
        ]
    }

    #[test]
    fn test_should_reject_for_rtt() {
        let gated = FifoMatchmaker::new(Some(100));
        assert!(gated.should_reject_for_rtt(None));
        assert!(!gated.should_reject_for_rtt(Some(100)));
        assert!(gated.should_reject_for_rtt(Some(101)));

        let open = FifoMatchmaker::new(None);
        assert!(!open.should_reject_for_rtt(None));
        assert!(!open.should_reject_for_rtt(Some(10_000)));
    }

    #[test]
    fn test_is_valid_proposal() {
        let a = MatchCandidate::new("a");
        let b = MatchCandidate::new("b");
        assert!(is_valid_proposal(&a, &[b.clone(), a.clone()], 2));
        assert!(!is_valid_proposal(&a, &[b.clone()], 1));
        assert!(!is_valid_proposal(&a, &[a.clone(), a.clone()], 2));
        assert!(!is_valid_proposal(&a, &[b, a.clone()], 3));
    }

    #[test]
    fn test_build_matchmaker() {
        let config = MatchmakerConfig {
            strategy: MatchmakerStrategy::LatencyFifo { max_server_rtt_ms: 80 },
            max_p2p_rtt_ms: Some(50),
        };
        let mm = build_matchmaker(&config);
        assert_eq!(mm.name(), "latency_fifo");
        assert_eq!(mm.max_p2p_rtt_ms(), Some(50));
    }

    proptest! {
        #[test]
        fn prop_proposals_honor_contract(
            rtts in prop::collection::vec(prop::option::of(0u32..300), 0..10),
            arriving_rtt in prop::option::of(0u32..300),
            group_size in 1usize..5,
        ) {
            let waiting = pool(&rtts);
            let arriving = MatchCandidate {
                participant_id: ParticipantId::from("arriving"),
                rtt_ms: arriving_rtt,
                group_history: None,
            };
            let before = waiting.clone();

            for mm in all_strategies() {
                if let Some(group) = mm.find_match(&arriving, &waiting, group_size) {
                    prop_assert!(is_valid_proposal(&arriving, &group, group_size));
                    for member in &group {
                        prop_assert!(
                            member.participant_id == arriving.participant_id
                                || waiting.contains(member)
                        );
                    }
                }
                prop_assert_eq!(&waiting, &before);
            }
        }

        #[test]
        fn prop_fifo_matches_whenever_enough_wait(n in 0usize..8, group_size in 1usize..5) {
            let waiting = pool(&vec![None; n]);
            let arriving = MatchCandidate::new("arriving");
            let result = FifoMatchmaker::new(None).find_match(&arriving, &waiting, group_size);
            prop_assert_eq!(result.is_some(), n + 1 >= group_size);
        }
    }
}
