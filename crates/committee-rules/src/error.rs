use thiserror::Error;

/// Failures raised by the pure committee rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Signer index {index} out of range for committee of {committee_size}")]
    SignerIndexOutOfRange { index: usize, committee_size: usize },

    #[error("Removed validators ({removed}) exceed current validators ({current})")]
    RemovalTooLong { removed: usize, current: usize },

    #[error("Removed validators are not a prefix of the current list")]
    NotAPrefix,
}
