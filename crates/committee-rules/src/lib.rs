pub mod types;
pub mod error;
pub mod assign_rule;
pub mod swap_rule;
pub mod signature_counter;

pub use types::{ChainId, ShardId, BEACON_CHAIN_ID};
pub use error::RuleError;
pub use assign_rule::{
    assign_rule_for_version, calculate_candidate_position, AssignRule, AssignRuleV2, AssignRuleV3,
    HashBucketAssignment,
};
pub use swap_rule::{
    swap_rule_for_version, SwapInput, SwapOutcome, SwapRule, SwapRuleV1, SwapRuleV2, SwapRuleV3,
};
pub use signature_counter::{
    default_penalties, penalties_for, slashing_penalty, MissingSignature, MissingSignatureCounter,
    Penalty,
};
