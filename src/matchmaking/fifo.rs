//! First-in, first-out grouping.

use crate::matchmaking::{MatchCandidate, Matchmaker};

/// Groups the longest-waiting participants with the new arrival.
#[derive(Debug, Clone, Default)]
pub struct FifoMatchmaker {
    max_p2p_rtt_ms: Option<u32>,
}

impl FifoMatchmaker {
    /// Create a FIFO matchmaker with an optional peer RTT gate.
    pub fn new(max_p2p_rtt_ms: Option<u32>) -> Self {
        Self { max_p2p_rtt_ms }
    }

    /// `waiting[..group_size-1] + [arriving]`, shared with the other strategies.
    pub(crate) fn take_front(
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<MatchCandidate>> {
        if group_size == 0 || waiting.len() + 1 < group_size {
            return None;
        }
        let mut group: Vec<MatchCandidate> = waiting[..group_size - 1].to_vec();
        group.push(arriving.clone());
        Some(group)
    }
}

impl Matchmaker for FifoMatchmaker {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn find_match(
        &self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<MatchCandidate>> {
        Self::take_front(arriving, waiting, group_size)
    }

    fn max_p2p_rtt_ms(&self) -> Option<u32> {
        self.max_p2p_rtt_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(group: &[MatchCandidate]) -> Vec<&str> {
        group.iter().map(|c| c.participant_id.as_str()).collect()
    }

    #[test]
    fn test_first_arrival_waits() {
        let mm = FifoMatchmaker::default();
        assert!(mm.find_match(&MatchCandidate::new("a"), &[], 2).is_none());
    }

    #[test]
    fn test_second_arrival_forms_group() {
        let mm = FifoMatchmaker::default();
        let waiting = vec![MatchCandidate::new("a")];
        let group = mm.find_match(&MatchCandidate::new("b"), &waiting, 2).unwrap();
        assert_eq!(ids(&group), vec!["a", "b"]);
    }

    #[test]
    fn test_takes_oldest_waiters_in_order() {
        let mm = FifoMatchmaker::default();
        let waiting: Vec<_> = ["a", "b", "c", "d"].iter().map(|id| MatchCandidate::new(*id)).collect();
        let group = mm.find_match(&MatchCandidate::new("e"), &waiting, 3).unwrap();
        assert_eq!(ids(&group), vec!["a", "b", "e"]);
    }

    #[test]
    fn test_single_party_matches_alone() {
        let mm = FifoMatchmaker::default();
        let waiting = vec![MatchCandidate::new("a")];
        let group = mm.find_match(&MatchCandidate::new("solo"), &waiting, 1).unwrap();
        assert_eq!(ids(&group), vec!["solo"]);
    }
}
