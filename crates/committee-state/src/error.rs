// Error types for committee state processing.
//
// Every failure aborts the whole instruction batch. `severity()` tells the
// caller whether to reject the block or stop the node.

use committee_rules::{RuleError, ShardId};
use thiserror::Error;

/// How the surrounding chain must react to a failed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recomputed outcome disagrees with the block: reject it, never retry
    Consensus,

    /// Store data is missing or unreadable: the local node is corrupt
    Fatal,

    /// Operation on an empty or unprepared state
    Guard,
}

/// Wire-level instruction decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstructionError {
    #[error("Empty instruction")]
    Empty,

    #[error("{opcode}: expected {expected} fields, got {got}")]
    WrongArity {
        opcode: String,
        expected: usize,
        got: usize,
    },

    #[error("{opcode}: invalid {field}: {value}")]
    InvalidField {
        opcode: String,
        field: &'static str,
        value: String,
    },

    #[error("{opcode}: list lengths do not match")]
    LengthMismatch { opcode: String },
}

/// Staker store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store codec error: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitteeStateError {
    #[error("Malformed instruction: {0}")]
    MalformedInstruction(#[from] InstructionError),

    #[error(
        "Swap mismatch on shard {shard}: expected in {expected_in:?} out {expected_out:?}, \
         got in {got_in:?} out {got_out:?}"
    )]
    SwapMismatch {
        shard: ShardId,
        expected_in: Vec<String>,
        expected_out: Vec<String>,
        got_in: Vec<String>,
        got_out: Vec<String>,
    },

    #[error("Staker info not found: {0}")]
    StakerNotFound(String),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Committee state is empty")]
    EmptyState,

    #[error("Cannot decode committee key: {0}")]
    KeyDecode(String),

    #[error("Rule failure: {0}")]
    Rule(#[from] RuleError),

    #[error("Shard {shard} is outside the {active_shards} active shards")]
    UnknownShard { shard: ShardId, active_shards: usize },

    #[error("Key {key} is not syncing on shard {shard}")]
    InvalidSyncValidator { shard: ShardId, key: String },

    #[error("Cannot upgrade committee state from V{from} to V{to}")]
    Upgrade { from: u8, to: u8 },

    #[error("No uncommitted committee state")]
    NoUncommittedState,

    #[error("State hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },
}

impl CommitteeStateError {
    pub fn severity(&self) -> Severity {
        match self {
            CommitteeStateError::MalformedInstruction(_)
            | CommitteeStateError::SwapMismatch { .. }
            | CommitteeStateError::KeyDecode(_)
            | CommitteeStateError::Rule(_)
            | CommitteeStateError::InvalidSyncValidator { .. }
            | CommitteeStateError::UnknownShard { .. }
            | CommitteeStateError::HashMismatch { .. } => Severity::Consensus,
            CommitteeStateError::StakerNotFound(_) | CommitteeStateError::Store(_) => {
                Severity::Fatal
            }
            CommitteeStateError::EmptyState
            | CommitteeStateError::Upgrade { .. }
            | CommitteeStateError::NoUncommittedState => Severity::Guard,
        }
    }
}

pub type Result<T> = std::result::Result<T, CommitteeStateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        let mismatch = CommitteeStateError::SwapMismatch {
            shard: ShardId(1),
            expected_in: vec![],
            expected_out: vec!["a".into()],
            got_in: vec![],
            got_out: vec![],
        };
        assert_eq!(mismatch.severity(), Severity::Consensus);
        assert_eq!(
            CommitteeStateError::from(InstructionError::Empty).severity(),
            Severity::Consensus
        );
        assert_eq!(
            CommitteeStateError::StakerNotFound("k".into()).severity(),
            Severity::Fatal
        );
        assert_eq!(
            CommitteeStateError::from(StoreError::Backend("down".into())).severity(),
            Severity::Fatal
        );
        assert_eq!(CommitteeStateError::EmptyState.severity(), Severity::Guard);
    }

    #[test]
    fn test_error_messages() {
        let err = InstructionError::WrongArity {
            opcode: "STAKE".into(),
            expected: 6,
            got: 2,
        };
        assert_eq!(err.to_string(), "STAKE: expected 6 fields, got 2");
        let err = CommitteeStateError::Upgrade { from: 4, to: 5 };
        assert_eq!(err.to_string(), "Cannot upgrade committee state from V4 to V5");
    }
}
