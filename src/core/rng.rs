//! Deterministic Random Number Generator
//!
//! Xorshift128+ seeded through SplitMix64. Every browser copy of a simulation
//! and the server-side authoritative mirror draw from the same seed, so the
//! generator must produce the same sequence on every platform.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use crate::session::ParticipantId;

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use coplay::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random u32.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        (self.next_u64() % max as u64) as u32
    }

    /// Generate a random integer in range [min, max].
    #[inline]
    pub fn next_int_range(&mut self, min: i32, max: i32) -> i32 {
        if min >= max {
            return min;
        }
        let range = (max - min + 1) as u32;
        min + self.next_int(range) as i32
    }

    /// Current internal state, for checkpointing.
    pub fn state(&self) -> [u64; 2] {
        self.state
    }

    /// Restore from a checkpoint.
    pub fn set_state(&mut self, state: [u64; 2]) {
        self.state = state;
    }
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Seeds travel to browsers as JSON numbers; keep them within the integer
/// range JavaScript represents exactly.
pub const SEED_MASK: u64 = (1 << 53) - 1;

fn first_u64(hash: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(bytes) & SEED_MASK
}

/// Derive the shared seed for a session.
///
/// Mixes fresh server entropy with the session id and the sorted member ids,
/// so two sessions never share a seed even when entropy collides.
pub fn derive_session_seed(
    entropy: u64,
    session_id: &[u8; 16],
    participants: &[ParticipantId],
) -> u64 {
    let mut sorted: Vec<&ParticipantId> = participants.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(b"COPLAY_SESSION_SEED_V1");
    hasher.update(entropy.to_le_bytes());
    hasher.update(session_id);
    for pid in sorted {
        hasher.update((pid.as_str().len() as u32).to_le_bytes());
        hasher.update(pid.as_str().as_bytes());
    }

    first_u64(&hasher.finalize())
}

/// Derive the seed for a given episode of a session.
///
/// Episode 0 uses the session seed unchanged so clients that only know the
/// shared seed start in lockstep with the server.
pub fn derive_episode_seed(session_seed: u64, episode: u32) -> u64 {
    if episode == 0 {
        return session_seed;
    }

    let mut hasher = Sha256::new();
    hasher.update(b"COPLAY_EPISODE_SEED_V1");
    hasher.update(session_seed.to_le_bytes());
    hasher.update(episode.to_le_bytes());
    first_u64(&hasher.finalize())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_determinism() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(12345);

        for _ in 0..1000 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_different_seeds() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(54321);

        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_next_int() {
        let mut rng = DeterministicRng::new(1234);

        for _ in 0..1000 {
            assert!(rng.next_int(100) < 100);
        }

        assert_eq!(rng.next_int(0), 0);
        assert_eq!(rng.next_int(1), 0);
    }

    #[test]
    fn test_next_int_range() {
        let mut rng = DeterministicRng::new(5678);

        for _ in 0..1000 {
            let val = rng.next_int_range(-10, 10);
            assert!((-10..=10).contains(&val));
        }

        assert_eq!(rng.next_int_range(5, 5), 5);
    }

    #[test]
    fn test_state_checkpoint() {
        let mut rng = DeterministicRng::new(5555);
        for _ in 0..50 {
            rng.next_u64();
        }

        let saved = rng.state();
        let next_values: Vec<u64> = (0..10).map(|_| rng.next_u64()).collect();
        rng.set_state(saved);

        for expected in next_values {
            assert_eq!(rng.next_u64(), expected);
        }
    }

    #[test]
    fn test_session_seed_ignores_member_order() {
        let a = ParticipantId::from("alice");
        let b = ParticipantId::from("bob");
        let id = [7u8; 16];

        let seed1 = derive_session_seed(99, &id, &[a.clone(), b.clone()]);
        let seed2 = derive_session_seed(99, &id, &[b, a.clone()]);
        assert_eq!(seed1, seed2);

        let seed3 = derive_session_seed(99, &[8u8; 16], &[a]);
        assert_ne!(seed1, seed3);
    }

    #[test]
    fn test_episode_seed() {
        assert_eq!(derive_episode_seed(42, 0), 42);
        assert!(derive_episode_seed(42, 5) <= SEED_MASK);
        assert_eq!(derive_episode_seed(42, 3), derive_episode_seed(42, 3));
        assert_ne!(derive_episode_seed(42, 1), derive_episode_seed(42, 2));
    }
}
