pub mod error;
pub mod key;
pub mod instruction;
pub mod environment;
pub mod committee_change;
pub mod store;
pub mod hash;
pub mod reward;
pub mod state;
pub mod engine;

pub use error::{CommitteeStateError, InstructionError, Result, Severity, StoreError};
pub use key::{keys_to_strings, strings_to_keys, CommitteePublicKey};
pub use instruction::{parse_instructions, Instruction, ReturnReason, SwapShardInstruction, SwapType};
pub use environment::{CommitteeEnvironment, CommitteeEnvironmentBuilder, CommitteeParams};
pub use committee_change::CommitteeChange;
pub use store::{BeaconStakerInfo, InMemoryStakerStore, StagedStore, StakerInfo, StakerStore};
pub use hash::{Digest, StateHash};
pub use reward::{split_reward, RewardSplit};
pub use state::{CommitteeState, CommitteeUpdate, GenesisCommittee, LATEST_VERSION};
pub use engine::{CommitteeEngine, CommitteeReader};

pub use committee_rules::{ChainId, MissingSignatureCounter, Penalty, ShardId};
