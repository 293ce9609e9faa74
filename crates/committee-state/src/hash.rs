// Structural hash of a committee state, embedded in beacon block headers.

use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Sha3_256};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// SHA3-256 over the concatenation of `items`.
pub fn hash_string_list<S: AsRef<str>>(items: &[S]) -> Digest {
    let mut hasher = Sha3_256::new();
    for item in items {
        hasher.update(item.as_ref().as_bytes());
    }
    Digest(hasher.finalize().into())
}

/// SHA3-256 over a list of digests.
pub fn hash_digests(items: &[Digest]) -> Digest {
    let mut hasher = Sha3_256::new();
    for item in items {
        hasher.update(item.0);
    }
    Digest(hasher.finalize().into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHash {
    /// Beacon committee, then pending and locking in V4
    pub beacon_committee_and_validator_hash: Digest,

    /// Beacon waiting list (V4), empty otherwise
    pub beacon_candidate_hash: Digest,

    pub shard_sync_validators_hash: Digest,

    /// Unassigned shard candidates
    pub shard_candidate_hash: Digest,

    pub shard_committee_and_validator_hash: Digest,

    pub auto_stake_hash: Digest,
}

impl StateHash {
    /// Single digest over all components.
    pub fn digest(&self) -> Digest {
        hash_digests(&[
            self.beacon_committee_and_validator_hash,
            self.beacon_candidate_hash,
            self.shard_sync_validators_hash,
            self.shard_candidate_hash,
            self.shard_committee_and_validator_hash,
            self.auto_stake_hash,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_sensitive() {
        let a = hash_string_list(&["x", "y"]);
        let b = hash_string_list(&["y", "x"]);
        assert_ne!(a, b);
        assert_eq!(a, hash_string_list(&["x".to_string(), "y".to_string()]));
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn test_state_digest_changes_with_any_component() {
        let base = StateHash::default();
        let mut changed = base.clone();
        changed.auto_stake_hash = hash_string_list(&["k:true"]);
        assert_ne!(base.digest(), changed.digest());
    }
}
