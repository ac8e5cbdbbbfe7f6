//! State Hashing for Verification
//!
//! Deterministic SHA-256 hashing used for:
//! - the running action-sequence hash in authoritative snapshots
//! - full-state hashes clients compare against their own copy

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Deterministic hasher with a domain separator.
///
/// Order of updates is significant.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for exported simulation state.
    pub fn for_env_state() -> Self {
        Self::new(b"COPLAY_STATE_V1")
    }

    /// Create hasher for the action sequence chain.
    pub fn for_action_sequence() -> Self {
        Self::new(b"COPLAY_ACTIONS_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i64 value (little-endian).
    #[inline]
    pub fn update_i64(&mut self, value: i64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Hash a JSON value.
///
/// `serde_json` maps are ordered by key, so the rendering is canonical.
pub fn hash_json(value: &serde_json::Value) -> StateHash {
    let mut hasher = StateHasher::for_env_state();
    hasher.update_bytes(value.to_string().as_bytes());
    hasher.finalize()
}

/// Running hash over every applied frame of actions.
///
/// Each frame folds the previous digest, the frame number and the
/// `(slot, action)` pairs in slot order, so two runners agree on the digest
/// only if they applied identical actions on identical frames.
#[derive(Debug, Clone, Default)]
pub struct ActionSequenceHash {
    current: StateHash,
}

impl ActionSequenceHash {
    /// Start an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame of actions into the chain.
    pub fn record<I>(&mut self, frame: u64, actions: I)
    where
        I: IntoIterator<Item = (u32, i64)>,
    {
        let mut hasher = StateHasher::for_action_sequence();
        hasher.update_bytes(&self.current);
        hasher.update_u64(frame);
        for (slot, action) in actions {
            hasher.update_u32(slot);
            hasher.update_i64(action);
        }
        self.current = hasher.finalize();
    }

    /// Current digest.
    pub fn digest(&self) -> StateHash {
        self.current
    }

    /// Current digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.current)
    }

    /// Reset to the empty chain (new episode).
    pub fn reset(&mut self) {
        self.current = StateHash::default();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(1);
            h.update_u32(2);
            h.finalize()
        };

        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(2);
            h.update_u32(1);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_json_hash_is_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":[1,2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y":[1,2],"x":1}"#).unwrap();
        assert_eq!(hash_json(&a), hash_json(&b));
    }

    #[test]
    fn test_action_chain_diverges_on_different_action() {
        let mut left = ActionSequenceHash::new();
        let mut right = ActionSequenceHash::new();

        left.record(1, [(0, 3), (1, 4)]);
        right.record(1, [(0, 3), (1, 4)]);
        assert_eq!(left.digest(), right.digest());

        left.record(2, [(0, 1), (1, 1)]);
        right.record(2, [(0, 1), (1, 2)]);
        assert_ne!(left.digest(), right.digest());

        left.reset();
        assert_eq!(left.digest(), StateHash::default());
        assert_eq!(left.to_hex().len(), 64);
    }
}
