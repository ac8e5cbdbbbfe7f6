//! Latency-filtered FIFO grouping.

use crate::matchmaking::{MatchCandidate, Matchmaker};

/// FIFO restricted to waiting candidates whose server RTT, summed with the
/// arriving candidate's, stays within a threshold.
///
/// Candidates with unknown RTT (on either side) always pass the filter.
#[derive(Debug, Clone)]
pub struct LatencyFifoMatchmaker {
    max_server_rtt_ms: u32,
    max_p2p_rtt_ms: Option<u32>,
}

impl LatencyFifoMatchmaker {
    /// Create a latency-filtered matchmaker.
    pub fn new(max_server_rtt_ms: u32, max_p2p_rtt_ms: Option<u32>) -> Self {
        Self {
            max_server_rtt_ms,
            max_p2p_rtt_ms,
        }
    }

    fn compatible(&self, arriving: &MatchCandidate, candidate: &MatchCandidate) -> bool {
        match (arriving.rtt_ms, candidate.rtt_ms) {
            (Some(a), Some(b)) => a.saturating_add(b) <= self.max_server_rtt_ms,
            _ => true,
        }
    }
}

impl Matchmaker for LatencyFifoMatchmaker {
    fn name(&self) -> &'static str {
        "latency_fifo"
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

        let mut group: Vec<MatchCandidate> = waiting
            .iter()
            .filter(|c| self.compatible(arriving, c))
            .take(needed)
            .cloned()
            .collect();

        if group.len() < needed {
            return None;
        }
        group.push(arriving.clone());
        Some(group)
    }

    fn max_p2p_rtt_ms(&self) -> Option<u32> {
        self.max_p2p_rtt_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_is_inclusive() {
        let mm = LatencyFifoMatchmaker::new(100, None);
        let waiting = vec![MatchCandidate::new("a").with_rtt(40)];
        let group = mm.find_match(&MatchCandidate::new("b").with_rtt(60), &waiting, 2);
        assert!(group.is_some());

        let group = mm.find_match(&MatchCandidate::new("b").with_rtt(61), &waiting, 2);
        assert!(group.is_none());
    }

    #[test]
    fn test_skips_slow_candidates_in_order() {
        let mm = LatencyFifoMatchmaker::new(100, None);
        let waiting = vec![
            MatchCandidate::new("slow").with_rtt(300),
            MatchCandidate::new("fast").with_rtt(20),
            MatchCandidate::new("fast2").with_rtt(10),
        ];
        let group = mm.find_match(&MatchCandidate::new("me").with_rtt(50), &waiting, 2).unwrap();
        assert_eq!(group[0].participant_id.as_str(), "fast");
        assert_eq!(group[1].participant_id.as_str(), "me");
    }

    #[test]
    fn test_unknown_rtt_fails_open() {
        let mm = LatencyFifoMatchmaker::new(10, None);

        let waiting = vec![MatchCandidate::new("unknown")];
        assert!(mm.find_match(&MatchCandidate::new("me").with_rtt(500), &waiting, 2).is_some());

        let waiting = vec![MatchCandidate::new("slow").with_rtt(500)];
        assert!(mm.find_match(&MatchCandidate::new("me"), &waiting, 2).is_some());
    }

    #[test]
    fn test_enough_waiting_but_none_compatible() {
        let mm = LatencyFifoMatchmaker::new(100, None);
        let waiting = vec![
            MatchCandidate::new("a").with_rtt(200),
            MatchCandidate::new("b").with_rtt(250),
        ];
        assert!(mm.find_match(&MatchCandidate::new("me").with_rtt(10), &waiting, 2).is_none());
    }
}
