//! Group-reunion grouping.
//!
//! Participants arriving from an earlier multi-party scene carry a
//! [`GroupHistory`](crate::matchmaking::GroupHistory). This strategy tries to
//! put the same people back together before falling back to plain FIFO.

use crate::matchmaking::{FifoMatchmaker, MatchCandidate, Matchmaker};

/// Reunites previous partners.
#[derive(Debug, Clone)]
pub struct GroupReunionMatchmaker {
    fallback_to_fifo: bool,
    max_p2p_rtt_ms: Option<u32>,
}

impl GroupReunionMatchmaker {
    /// Create a reunion matchmaker.
    pub fn new(fallback_to_fifo: bool, max_p2p_rtt_ms: Option<u32>) -> Self {
        Self {
            fallback_to_fifo,
            max_p2p_rtt_ms,
        }
    }

    /// Waiting partners the arriving candidate names itself.
    fn own_partners<'a>(
        arriving: &MatchCandidate,
        waiting: &'a [MatchCandidate],
    ) -> Vec<&'a MatchCandidate> {
        match &arriving.group_history {
            Some(history) => waiting
                .iter()
                .filter(|c| history.names(&c.participant_id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Waiting candidates who name the arriving candidate, followed by the
    /// waiting partners those candidates name.
    fn claiming_partners<'a>(
        arriving: &MatchCandidate,
        waiting: &'a [MatchCandidate],
    ) -> Vec<&'a MatchCandidate> {
        let claimants: Vec<&MatchCandidate> = waiting
            .iter()
            .filter(|c| {
                c.group_history
                    .as_ref()
                    .is_some_and(|h| h.names(&arriving.participant_id))
            })
            .collect();

        let mut group = claimants.clone();
        for candidate in waiting {
            if group.iter().any(|g| g.participant_id == candidate.participant_id) {
                continue;
            }
            let named = claimants.iter().any(|c| {
                c.group_history
                    .as_ref()
                    .is_some_and(|h| h.names(&candidate.participant_id))
            });
            if named {
                group.push(candidate);
            }
        }
        group
    }

    fn assemble(
        arriving: &MatchCandidate,
        members: Vec<&MatchCandidate>,
        needed: usize,
    ) -> Option<Vec<MatchCandidate>> {
        if members.len() < needed {
            return None;
        }
        let mut group: Vec<MatchCandidate> = members.into_iter().take(needed).cloned().collect();
        group.push(arriving.clone());
        Some(group)
    }
}

impl Matchmaker for GroupReunionMatchmaker {
    fn name(&self) -> &'static str {
        "group_reunion"
    }

    fn find_match(
        &self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<MatchCandidate>> {
        if group_size == 0 || waiting.len() + 1 < group_size {
            return None;
        }
        let needed = group_size - 1;
        if needed == 0 {
            return Some(vec![arriving.clone()]);
        }

        if let Some(group) = Self::assemble(arriving, Self::own_partners(arriving, waiting), needed) {
            return Some(group);
        }
        if let Some(group) =
            Self::assemble(arriving, Self::claiming_partners(arriving, waiting), needed)
        {
            return Some(group);
        }

        if self.fallback_to_fifo {
            FifoMatchmaker::take_front(arriving, waiting, group_size)
        } else {
            None
        }
    }

    fn max_p2p_rtt_ms(&self) -> Option<u32> {
        self.max_p2p_rtt_ms
    }
}
