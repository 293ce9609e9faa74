// VERSIONED COMMITTEE STATE
// State Module - One tagged union over the four committee state generations
//
// SAFETY INVARIANTS:
// 1. update_committee_state is the only mutator; a failed call leaves the
//    state unusable and the caller must discard it
// 2. Versions only move forward (V1 -> V2 -> V3 -> V4)
// 3. The state hash is a pure function of the pools and auto-stake flags

pub mod base;
pub mod v1;
pub mod v2;
pub mod v3;
pub mod v4;

pub use base::{CommitteeBase, GenesisCommittee, ShardSnapshot, GENESIS_STAKING_TX};
pub use v1::CommitteeStateV1;
pub use v2::CommitteeStateV2;
pub use v3::CommitteeStateV3;
pub use v4::{
    BeaconStaker, CommitteeStateV4, LockingInfo, DECREASE_PERFORMING, DEFAULT_PERFORMING,
    INCREASE_PERFORMING, LOCKING_PERIOD, MAX_PERFORMING, MIN_ACTIVE_SHARD, MIN_PERFORMANCE,
};

use crate::committee_change::CommitteeChange;
use crate::environment::{CommitteeEnvironment, CommitteeParams};
use crate::error::{CommitteeStateError, Result};
use crate::hash::{hash_string_list, Digest, StateHash};
use crate::instruction::{
    parse_instructions, Instruction, ReturnBeaconStakeInstruction, ReturnStakingInstruction,
    SwapShardInstruction, SwapType,
};
use crate::key::CommitteePublicKey;
use crate::store::StakerStore;
use committee_rules::{swap_rule_for_version, ChainId, ShardId, SwapRule, SwapRuleV1};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Newest state generation.
pub const LATEST_VERSION: u8 = 4;

/// Everything handlers accumulate while one block is processed.
#[derive(Debug, Default)]
pub(crate) struct UpdateContext {
    pub(crate) change: CommitteeChange,

    /// One refund instruction per chain
    returns: BTreeMap<ChainId, ReturnStakingInstruction>,

    pub(crate) beacon_returns: ReturnBeaconStakeInstruction,
}

impl UpdateContext {
    pub(crate) fn return_stake(&mut self, chain: ChainId, key: &str, tx_staking_id: String) {
        self.returns
            .entry(chain)
            .or_insert_with(|| ReturnStakingInstruction::new(chain))
            .add(key.to_string(), tx_staking_id);
    }

    /// The normalized change and the emitted instructions in wire form:
    /// RETURN per chain (beacon first), then RETURN_BEACON_STAKE.
    pub(crate) fn finish(self) -> (CommitteeChange, Vec<Vec<String>>) {
        let mut change = self.change;
        change.normalize();

        let mut emitted: Vec<Vec<String>> = self
            .returns
            .into_values()
            .filter(|r| !r.is_empty())
            .map(|r| Instruction::Return(r).to_raw())
            .collect();
        if !self.beacon_returns.is_empty() {
            emitted.push(Instruction::ReturnBeaconStake(self.beacon_returns).to_raw());
        }
        (change, emitted)
    }
}

/// Result of processing one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeUpdate {
    pub state_hash: StateHash,

    pub committee_change: CommitteeChange,

    /// Instructions the block producer must include, in wire form
    pub instructions: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitteeState {
    V1(CommitteeStateV1),
    V2(CommitteeStateV2),
    V3(CommitteeStateV3),
    V4(CommitteeStateV4),
}

impl CommitteeState {
    /// An uninitialized state of the given version.
    pub fn empty(version: u8) -> Result<Self> {
        match version {
            1 => Ok(CommitteeState::V1(CommitteeStateV1::default())),
            2 => Ok(CommitteeState::V2(CommitteeStateV2::default())),
            3 => Ok(CommitteeState::V3(CommitteeStateV3::default())),
            4 => Ok(CommitteeState::V4(CommitteeStateV4::default())),
            _ => Err(CommitteeStateError::Upgrade {
                from: 0,
                to: version,
            }),
        }
    }

    /// Build the genesis committees as V1 and upgrade up to `version`.
    pub fn from_genesis(
        version: u8,
        genesis: &GenesisCommittee,
        params: &CommitteeParams,
        store: &dyn StakerStore,
    ) -> Result<Self> {
        if version == 0 || version > LATEST_VERSION {
            return Err(CommitteeStateError::Upgrade {
                from: 0,
                to: version,
            });
        }
        let base = CommitteeBase::from_genesis(genesis, params, store)?;
        let mut state = CommitteeState::V1(CommitteeStateV1::new(base));
        while state.version() < version {
            state = state.upgrade(params, store)?;
        }
        Ok(state)
    }

    pub fn version(&self) -> u8 {
        match self {
            CommitteeState::V1(_) => 1,
            CommitteeState::V2(_) => 2,
            CommitteeState::V3(_) => 3,
            CommitteeState::V4(_) => 4,
        }
    }

    pub fn base(&self) -> &CommitteeBase {
        match self {
            CommitteeState::V1(s) => &s.base,
            CommitteeState::V2(s) => &s.base,
            CommitteeState::V3(s) => &s.v2.base,
            CommitteeState::V4(s) => s.base(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.base().is_initialized()
    }

    /// Apply one block's instructions.
    ///
    /// Fails on the first bad instruction; `self` must then be dropped.
    pub fn update_committee_state(
        &mut self,
        env: &CommitteeEnvironment,
        instructions: &[Vec<String>],
        store: &dyn StakerStore,
    ) -> Result<CommitteeUpdate> {
        if !self.is_initialized() {
            return Err(CommitteeStateError::EmptyState);
        }
        let parsed = parse_instructions(instructions)?;
        let mut ctx = UpdateContext::default();

        match self {
            CommitteeState::V1(s) => s.process(env, &parsed, store, &mut ctx)?,
            CommitteeState::V2(s) => s.process(env, &parsed, store, &mut ctx)?,
            CommitteeState::V3(s) => s.process(env, &parsed, store, &mut ctx)?,
            CommitteeState::V4(s) => s.process(env, &parsed, store, &mut ctx)?,
        }

        let state_hash = self.hash()?;
        let (committee_change, instructions) = ctx.finish();
        info!(
            "Committee V{} at height {}: {} instructions in, {} out",
            self.version(),
            env.beacon_height,
            parsed.len(),
            instructions.len()
        );
        Ok(CommitteeUpdate {
            state_hash,
            committee_change,
            instructions,
        })
    }

    pub fn hash(&self) -> Result<StateHash> {
        if !self.is_initialized() {
            return Err(CommitteeStateError::EmptyState);
        }
        let base = self.base();
        let empty: Digest = hash_string_list::<&str>(&[]);

        let (beacon, beacon_candidate, sync, candidate) = match self {
            CommitteeState::V1(s) => (base.beacon_hash()?, empty, empty, s.candidate_hash()?),
            CommitteeState::V2(s) => (base.beacon_hash()?, empty, empty, s.candidate_hash()?),
            CommitteeState::V3(s) => (
                base.beacon_hash()?,
                empty,
                s.sync_hash(),
                s.v2.candidate_hash()?,
            ),
            CommitteeState::V4(s) => (
                s.beacon_hash()?,
                s.candidate_hash(),
                s.v3.sync_hash(),
                s.v3.v2.candidate_hash()?,
            ),
        };

        Ok(StateHash {
            beacon_committee_and_validator_hash: beacon,
            beacon_candidate_hash: beacon_candidate,
            shard_sync_validators_hash: sync,
            shard_candidate_hash: candidate,
            shard_committee_and_validator_hash: base.shard_committee_and_validator_hash()?,
            auto_stake_hash: base.auto_stake_hash(),
        })
    }

    /// Move to the next generation.
    pub fn upgrade(self, params: &CommitteeParams, store: &dyn StakerStore) -> Result<Self> {
        let from = self.version();
        let next = match self {
            CommitteeState::V1(s) => CommitteeState::V2(CommitteeStateV2::from_v1(s)),
            CommitteeState::V2(s) => {
                CommitteeState::V3(CommitteeStateV3::from_v2(s, params.active_shards))
            }
            CommitteeState::V3(s) => CommitteeState::V4(CommitteeStateV4::from_v3(s, params, store)?),
            CommitteeState::V4(_) => {
                return Err(CommitteeStateError::Upgrade {
                    from,
                    to: from + 1,
                })
            }
        };
        info!("Committee state upgraded V{} -> V{}", from, next.version());
        Ok(next)
    }

    /// The swap a block producer includes for `shard`, or None when the
    /// shard does not rotate. Validators recompute the same value.
    pub fn generate_swap_shard_instruction(
        &self,
        env: &CommitteeEnvironment,
        shard: ShardId,
    ) -> Result<Option<SwapShardInstruction>> {
        let no_rounds = BTreeMap::new();
        let rule: Box<dyn SwapRule> = match self {
            CommitteeState::V1(_) => Box::new(SwapRuleV1),
            _ => swap_rule_for_version(env.params.swap_rule_version),
        };
        let outcome = self.base().compute_swap(
            shard,
            env,
            rule.as_ref(),
            self.number_of_round().unwrap_or(&no_rounds),
        )?;
        if outcome.is_noop() {
            debug!("Shard {} has nothing to swap", shard);
            return Ok(None);
        }
        let swap_type = if outcome.slashed.is_empty() {
            SwapType::EndEpoch
        } else {
            SwapType::Slashing
        };
        Ok(Some(SwapShardInstruction {
            in_public_keys: outcome.in_keys,
            out_public_keys: outcome.out_keys,
            shard_id: shard,
            swap_type,
        }))
    }

    pub fn beacon_committee(&self) -> &[CommitteePublicKey] {
        &self.base().beacon_committee
    }

    pub fn shard_committee(&self, shard: ShardId) -> &[CommitteePublicKey] {
        self.base().committee(shard)
    }

    pub fn shard_substitute(&self, shard: ShardId) -> &[CommitteePublicKey] {
        self.base().substitute(shard)
    }

    pub fn all_shard_committees(&self) -> &BTreeMap<ShardId, Vec<CommitteePublicKey>> {
        &self.base().shard_committee
    }

    pub fn all_shard_substitutes(&self) -> &BTreeMap<ShardId, Vec<CommitteePublicKey>> {
        &self.base().shard_substitute
    }

    /// Unassigned shard candidates. V1 lists current then next epoch.
    pub fn shard_common_pool(&self) -> Vec<CommitteePublicKey> {
        match self {
            CommitteeState::V1(s) => {
                let mut pool = s.current_epoch_shard_candidate().to_vec();
                pool.extend_from_slice(s.next_epoch_shard_candidate());
                pool
            }
            CommitteeState::V2(s) => s.shard_common_pool().to_vec(),
            CommitteeState::V3(s) => s.v2.shard_common_pool().to_vec(),
            CommitteeState::V4(s) => s.v3.v2.shard_common_pool().to_vec(),
        }
    }

    pub fn number_of_assigned_candidates(&self) -> usize {
        match self {
            CommitteeState::V1(_) => 0,
            CommitteeState::V2(s) => s.number_of_assigned_candidates(),
            CommitteeState::V3(s) => s.v2.number_of_assigned_candidates(),
            CommitteeState::V4(s) => s.v3.v2.number_of_assigned_candidates(),
        }
    }

    pub fn number_of_round(&self) -> Option<&BTreeMap<String, u32>> {
        match self {
            CommitteeState::V1(_) => None,
            CommitteeState::V2(s) => Some(s.number_of_round()),
            CommitteeState::V3(s) => Some(s.v2.number_of_round()),
            CommitteeState::V4(s) => Some(s.v3.v2.number_of_round()),
        }
    }

    /// Empty before V3.
    pub fn sync_pool(&self, shard: ShardId) -> &[String] {
        match self {
            CommitteeState::V3(s) => s.sync_pool(shard),
            CommitteeState::V4(s) => s.v3.sync_pool(shard),
            _ => &[],
        }
    }

    pub fn auto_stake(&self) -> &BTreeMap<String, bool> {
        &self.base().auto_stake
    }

    pub fn reward_receiver(&self) -> &BTreeMap<String, String> {
        &self.base().reward_receiver
    }

    pub fn staking_tx(&self) -> &BTreeMap<String, String> {
        &self.base().staking_tx
    }

    /// Beacon staking view, V4 only.
    pub fn beacon_staking(&self) -> Option<&CommitteeStateV4> {
        match self {
            CommitteeState::V4(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStakerStore;

    fn key_str(b: u8) -> String {
        CommitteePublicKey::new(vec![b]).to_base58().unwrap()
    }

    fn genesis() -> GenesisCommittee {
        let mut shard_committee = BTreeMap::new();
        shard_committee.insert(ShardId(0), (1..=4).map(key_str).collect());
        shard_committee.insert(ShardId(1), (5..=8).map(key_str).collect());
        GenesisCommittee {
            beacon_committee: (20..=23).map(key_str).collect(),
            shard_committee,
            reward_receiver: "dao".into(),
        }
    }

    fn params() -> CommitteeParams {
        CommitteeParams::new(2, 4, 8, 2, 10).unwrap()
    }

    #[test]
    fn test_empty_state_guards() {
        let store = InMemoryStakerStore::new();
        let mut state = CommitteeState::empty(3).unwrap();
        assert_eq!(state.hash().unwrap_err(), CommitteeStateError::EmptyState);
        let env = CommitteeEnvironment::builder(&params()).build();
        assert_eq!(
            state.update_committee_state(&env, &[], &store).unwrap_err(),
            CommitteeStateError::EmptyState
        );
        assert!(CommitteeState::empty(9).is_err());
    }

    #[test]
    fn test_genesis_upgrades_to_requested_version() {
        let store = InMemoryStakerStore::new();
        for version in 1..=LATEST_VERSION {
            let state = CommitteeState::from_genesis(version, &genesis(), &params(), &store).unwrap();
            assert_eq!(state.version(), version);
            assert_eq!(state.shard_committee(ShardId(1)).len(), 4);
            assert_eq!(state.beacon_committee().len(), 4);
        }
        let v4 = CommitteeState::from_genesis(4, &genesis(), &params(), &store).unwrap();
        assert_eq!(v4.beacon_staking().unwrap().beacon_committee().len(), 4);
        assert_eq!(
            v4.upgrade(&params(), &store).unwrap_err(),
            CommitteeStateError::Upgrade { from: 4, to: 5 }
        );
    }

    #[test]
    fn test_hash_is_stable_and_tracks_changes() {
        let store = InMemoryStakerStore::new();
        let mut state = CommitteeState::from_genesis(3, &genesis(), &params(), &store).unwrap();
        let before = state.hash().unwrap();
        assert_eq!(before, state.clone().hash().unwrap());

        let env = CommitteeEnvironment::builder(&params()).beacon_height(2).build();
        let stake = vec![
            "STAKE".to_string(),
            key_str(40),
            "shard".to_string(),
            "tx40".to_string(),
            "r".to_string(),
            "true".to_string(),
        ];
        let update = state.update_committee_state(&env, &[stake], &store).unwrap();
        assert_ne!(update.state_hash.shard_candidate_hash, before.shard_candidate_hash);
        assert_ne!(update.state_hash.auto_stake_hash, before.auto_stake_hash);
        assert_eq!(
            update.state_hash.shard_committee_and_validator_hash,
            before.shard_committee_and_validator_hash
        );
    }

    #[test]
    fn test_malformed_instruction_fails_whole_batch() {
        let store = InMemoryStakerStore::new();
        let mut state = CommitteeState::from_genesis(2, &genesis(), &params(), &store).unwrap();
        let env = CommitteeEnvironment::builder(&params()).beacon_height(2).build();
        let batch = vec![
            vec!["UNKNOWN_OPCODE".to_string()],
            vec!["RANDOM".to_string(), "not-a-number".to_string()],
        ];
        let err = state.update_committee_state(&env, &batch, &store).unwrap_err();
        assert!(matches!(err, CommitteeStateError::MalformedInstruction(_)));
    }

    #[test]
    fn test_generate_swap_for_stable_shard_is_none() {
        let store = InMemoryStakerStore::new();
        let state = CommitteeState::from_genesis(3, &genesis(), &params(), &store).unwrap();
        let env = CommitteeEnvironment::builder(&params()).beacon_height(10).build();
        assert_eq!(state.generate_swap_shard_instruction(&env, ShardId(0)).unwrap(), None);
    }
}
