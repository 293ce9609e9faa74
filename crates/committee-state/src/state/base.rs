// SHARED COMMITTEE POOLS
// Base Module - Pools and per-key metadata common to every state version
//
// SAFETY INVARIANTS:
// 1. A key sits in at most one shard pool at a time
// 2. Metadata maps (auto stake, reward receiver, staking tx) and the store
//    record of a key are created and deleted together
// 3. Auto-stake decisions on departure read the store record, never the cache

use crate::committee_change::CommitteeChange;
use crate::environment::{CommitteeEnvironment, CommitteeParams};
use crate::error::{CommitteeStateError, Result};
use crate::hash::{hash_string_list, Digest};
use crate::instruction::SwapShardInstruction;
use crate::key::{keys_to_strings, strings_to_keys, CommitteePublicKey};
use crate::store::{StakerInfo, StakerStore};
use committee_rules::{calculate_candidate_position, ShardId, SwapInput, SwapOutcome, SwapRule};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Staking tx id recorded for genesis validators.
pub const GENESIS_STAKING_TX: &str = "genesis";

/// Committees at chain start, keys in base58 form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisCommittee {
    pub beacon_committee: Vec<String>,

    pub shard_committee: BTreeMap<ShardId, Vec<String>>,

    pub reward_receiver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitteeBase {
    pub(crate) beacon_committee: Vec<CommitteePublicKey>,
    pub(crate) shard_committee: BTreeMap<ShardId, Vec<CommitteePublicKey>>,
    pub(crate) shard_substitute: BTreeMap<ShardId, Vec<CommitteePublicKey>>,
    pub(crate) auto_stake: BTreeMap<String, bool>,
    pub(crate) reward_receiver: BTreeMap<String, String>,
    pub(crate) staking_tx: BTreeMap<String, String>,
    pub(crate) initialized: bool,
}

impl CommitteeBase {
    /// Build the genesis pools and persist a staker record per validator.
    pub fn from_genesis(
        genesis: &GenesisCommittee,
        params: &CommitteeParams,
        store: &dyn StakerStore,
    ) -> Result<Self> {
        let mut base = CommitteeBase::default();

        for key in &genesis.beacon_committee {
            base.beacon_committee.push(CommitteePublicKey::from_base58(key)?);
            base.record_stake(key, &genesis.reward_receiver, GENESIS_STAKING_TX, true, 1, store)?;
        }
        for shard in ShardId::all(params.active_shards) {
            let keys = genesis.shard_committee.get(&shard).cloned().unwrap_or_default();
            let mut committee = Vec::with_capacity(keys.len());
            for key in &keys {
                committee.push(CommitteePublicKey::from_base58(key)?);
                base.record_stake(key, &genesis.reward_receiver, GENESIS_STAKING_TX, true, 1, store)?;
            }
            base.shard_committee.insert(shard, committee);
            base.shard_substitute.insert(shard, Vec::new());
        }

        base.initialized = true;
        info!(
            "Genesis committee: {} beacon, {} shards",
            base.beacon_committee.len(),
            base.shard_committee.len()
        );
        Ok(base)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn committee(&self, shard: ShardId) -> &[CommitteePublicKey] {
        self.shard_committee.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn substitute(&self, shard: ShardId) -> &[CommitteePublicKey] {
        self.shard_substitute.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Shard holding `key` as committee member or substitute.
    pub fn assigned_shard(&self, key: &CommitteePublicKey) -> Option<ShardId> {
        self.shard_committee
            .iter()
            .chain(self.shard_substitute.iter())
            .find(|(_, keys)| keys.contains(key))
            .map(|(shard, _)| *shard)
    }

    /// Committee plus substitute count per shard.
    pub fn shard_loads(&self, active_shards: usize) -> Vec<usize> {
        ShardId::all(active_shards)
            .map(|s| self.committee(s).len() + self.substitute(s).len())
            .collect()
    }

    pub fn record_stake(
        &mut self,
        key: &str,
        reward_receiver: &str,
        tx_staking_id: &str,
        auto_staking: bool,
        beacon_height: u64,
        store: &dyn StakerStore,
    ) -> Result<()> {
        let info = StakerInfo {
            reward_receiver: reward_receiver.to_string(),
            auto_staking,
            tx_staking_id: tx_staking_id.to_string(),
            beacon_confirm_height: beacon_height,
        };
        store.store_staker_info(key, &info)?;
        self.auto_stake.insert(key.to_string(), auto_staking);
        self.reward_receiver
            .insert(key.to_string(), reward_receiver.to_string());
        self.staking_tx
            .insert(key.to_string(), tx_staking_id.to_string());
        Ok(())
    }

    /// A key is already staked when it has cached metadata or a store record.
    pub fn is_known_staker(&self, key: &str, store: &dyn StakerStore) -> Result<bool> {
        if self.auto_stake.contains_key(key) {
            return Ok(true);
        }
        Ok(store.get_staker_info(key)?.is_some())
    }

    pub fn staker_info(&self, key: &str, store: &dyn StakerStore) -> Result<StakerInfo> {
        store
            .get_staker_info(key)?
            .ok_or_else(|| CommitteeStateError::StakerNotFound(key.to_string()))
    }

    /// Turn off auto-stake for a key that keeps its current role.
    pub fn stop_auto_stake(
        &mut self,
        key: &str,
        store: &dyn StakerStore,
        change: &mut CommitteeChange,
    ) -> Result<()> {
        if let Some(mut info) = store.get_staker_info(key)? {
            if info.auto_staking {
                info.auto_staking = false;
                store.store_staker_info(key, &info)?;
            }
        }
        self.auto_stake.insert(key.to_string(), false);
        change.add_stop_auto_stake(key);
        debug!("Auto stake off for {}", key);
        Ok(())
    }

    /// Remove every trace of a staker. Returns its staking tx id for the
    /// refund instruction.
    pub fn delete_staker(
        &mut self,
        key: &str,
        store: &dyn StakerStore,
        change: &mut CommitteeChange,
    ) -> Result<String> {
        let info = self.staker_info(key, store)?;
        store.delete_staker_info(key)?;
        self.auto_stake.remove(key);
        self.reward_receiver.remove(key);
        self.staking_tx.remove(key);
        change.add_removed_staker(key);
        Ok(info.tx_staking_id)
    }

    /// Insert `key` into the shard's substitutes at its seeded position.
    pub fn insert_substitute_at_position(
        &mut self,
        shard: ShardId,
        key: CommitteePublicKey,
        key_str: &str,
        rand: i64,
        change: &mut CommitteeChange,
    ) {
        let substitutes = self.shard_substitute.entry(shard).or_default();
        let offset = if substitutes.is_empty() {
            0
        } else {
            calculate_candidate_position(key_str, rand, substitutes.len()).min(substitutes.len())
        };
        change.add_shard_substitute(shard, &key);
        substitutes.insert(offset, key);
    }

    /// Run `rule` over the shard's current pools.
    pub fn compute_swap(
        &self,
        shard: ShardId,
        env: &CommitteeEnvironment,
        rule: &dyn SwapRule,
        number_of_round: &BTreeMap<String, u32>,
    ) -> Result<SwapOutcome> {
        let committees = keys_to_strings(self.committee(shard))?;
        let substitutes = keys_to_strings(self.substitute(shard))?;
        Ok(run_swap_rule(shard, &committees, &substitutes, env, rule, number_of_round))
    }

    /// Freeze the shard pools and loads before a block's first instruction.
    pub fn snapshot_shards(&self, active_shards: usize) -> Result<ShardSnapshot> {
        let mut snapshot = ShardSnapshot {
            loads: self.shard_loads(active_shards),
            ..Default::default()
        };
        for shard in ShardId::all(active_shards) {
            snapshot
                .committees
                .insert(shard, keys_to_strings(self.committee(shard))?);
            snapshot
                .substitutes
                .insert(shard, keys_to_strings(self.substitute(shard))?);
        }
        Ok(snapshot)
    }

    /// Apply a verified swap. The committee becomes the outcome's list; the
    /// live substitutes lose the swapped-in prefix and gain the keys sent
    /// back. Slashed and normally swapped-out keys are left to the caller.
    pub fn apply_swap_outcome(
        &mut self,
        shard: ShardId,
        outcome: &SwapOutcome,
        change: &mut CommitteeChange,
    ) -> Result<()> {
        for key in strings_to_keys(&outcome.in_keys)? {
            change.remove_shard_substitute(shard, &key);
            change.add_shard_committee(shard, &key);
        }
        for key in strings_to_keys(&outcome.out_keys)? {
            change.remove_shard_committee(shard, &key);
        }
        for key in strings_to_keys(&outcome.back_to_substitutes)? {
            change.add_shard_substitute(shard, &key);
        }
        self.shard_committee
            .insert(shard, strings_to_keys(&outcome.new_committees)?);
        let substitutes = self.shard_substitute.entry(shard).or_default();
        let taken = outcome.in_keys.len().min(substitutes.len());
        substitutes.drain(..taken);
        substitutes.extend(strings_to_keys(&outcome.back_to_substitutes)?);
        Ok(())
    }

    pub fn beacon_hash(&self) -> Result<Digest> {
        Ok(hash_string_list(&keys_to_strings(&self.beacon_committee)?))
    }

    /// Per shard, in shard order: committee then substitutes.
    pub fn shard_committee_and_validator_hash(&self) -> Result<Digest> {
        let mut all = Vec::new();
        for (shard, committee) in &self.shard_committee {
            all.extend(keys_to_strings(committee)?);
            all.extend(keys_to_strings(self.substitute(*shard))?);
        }
        Ok(hash_string_list(&all))
    }

    pub fn auto_stake_hash(&self) -> Digest {
        let entries: Vec<String> = self
            .auto_stake
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        hash_string_list(&entries)
    }
}

/// Shard pools and assignment loads as they stood when a block started.
///
/// Every SWAP_SHARD and RANDOM instruction of the block reads this view, so
/// their order inside the block does not change the outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardSnapshot {
    committees: BTreeMap<ShardId, Vec<String>>,
    substitutes: BTreeMap<ShardId, Vec<String>>,
    loads: Vec<usize>,
}

impl ShardSnapshot {
    pub fn committees(&self, shard: ShardId) -> &[String] {
        self.committees.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn substitutes(&self, shard: ShardId) -> &[String] {
        self.substitutes.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn loads(&self) -> &[usize] {
        &self.loads
    }

    /// Count `extra` more validators against `shard` when assigning.
    pub fn add_load(&mut self, shard: ShardId, extra: usize) {
        if let Some(load) = self.loads.get_mut(shard.as_usize()) {
            *load += extra;
        }
    }

    pub fn compute_swap(
        &self,
        shard: ShardId,
        env: &CommitteeEnvironment,
        rule: &dyn SwapRule,
        number_of_round: &BTreeMap<String, u32>,
    ) -> SwapOutcome {
        run_swap_rule(
            shard,
            self.committees(shard),
            self.substitutes(shard),
            env,
            rule,
            number_of_round,
        )
    }
}

fn run_swap_rule(
    shard: ShardId,
    committees: &[String],
    substitutes: &[String],
    env: &CommitteeEnvironment,
    rule: &dyn SwapRule,
    number_of_round: &BTreeMap<String, u32>,
) -> SwapOutcome {
    let input = SwapInput {
        shard_id: shard,
        committees,
        substitutes,
        min_committee_size: env.params.min_shard_committee_size,
        max_committee_size: env.params.max_shard_committee_size,
        number_of_fixed_validators: env.params.number_of_fixed_shard_block_validator,
        penalties: &env.missing_signature_penalty,
        number_of_round,
    };
    rule.process(&input)
}

/// Swaps may only name one of the active shards.
pub fn check_active_shard(shard: ShardId, active_shards: usize) -> Result<()> {
    if shard.as_usize() < active_shards {
        return Ok(());
    }
    error!("Swap names shard {} but only {} are active", shard, active_shards);
    Err(CommitteeStateError::UnknownShard {
        shard,
        active_shards,
    })
}

/// The block's claimed swap must equal the recomputed one.
pub fn verify_swap(inst: &SwapShardInstruction, outcome: &SwapOutcome) -> Result<()> {
    if inst.in_public_keys == outcome.in_keys && inst.out_public_keys == outcome.out_keys {
        return Ok(());
    }
    error!(
        "Swap mismatch on shard {}: block has {} in / {} out, recomputed {} in / {} out",
        inst.shard_id,
        inst.in_public_keys.len(),
        inst.out_public_keys.len(),
        outcome.in_keys.len(),
        outcome.out_keys.len()
    );
    Err(CommitteeStateError::SwapMismatch {
        shard: inst.shard_id,
        expected_in: outcome.in_keys.clone(),
        expected_out: outcome.out_keys.clone(),
        got_in: inst.in_public_keys.clone(),
        got_out: inst.out_public_keys.clone(),
    })
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
        shard_committee.insert(ShardId(0), vec![key_str(1), key_str(2)]);
        shard_committee.insert(ShardId(1), vec![key_str(3)]);
        GenesisCommittee {
            beacon_committee: vec![key_str(9)],
            shard_committee,
            reward_receiver: "dao".to_string(),
        }
    }

    #[test]
    fn test_from_genesis_records_stakers() {
        let store = InMemoryStakerStore::new();
        let params = CommitteeParams::new(2, 1, 8, 1, 10).unwrap();
        let base = CommitteeBase::from_genesis(&genesis(), &params, &store).unwrap();

        assert!(base.is_initialized());
        assert_eq!(base.committee(ShardId(0)).len(), 2);
        assert_eq!(base.shard_loads(2), vec![2, 1]);
        assert_eq!(store.staker_count(), 4);
        assert_eq!(base.auto_stake.get(&key_str(3)), Some(&true));
        assert_eq!(
            base.assigned_shard(&CommitteePublicKey::new(vec![3])),
            Some(ShardId(1))
        );
    }

    #[test]
    fn test_delete_staker_requires_record() {
        let store = InMemoryStakerStore::new();
        let mut base = CommitteeBase::default();
        let mut change = CommitteeChange::default();
        assert!(matches!(
            base.delete_staker("ghost", &store, &mut change),
            Err(CommitteeStateError::StakerNotFound(_))
        ));

        base.record_stake("k", "r", "tx9", true, 5, &store).unwrap();
        assert!(base.is_known_staker("k", &store).unwrap());
        assert_eq!(base.delete_staker("k", &store, &mut change).unwrap(), "tx9");
        assert!(!base.is_known_staker("k", &store).unwrap());
        assert_eq!(change.removed_staker, vec!["k"]);
    }

    #[test]
    fn test_stop_auto_stake_updates_store() {
        let store = InMemoryStakerStore::new();
        let mut base = CommitteeBase::default();
        let mut change = CommitteeChange::default();
        base.record_stake("k", "r", "tx", true, 1, &store).unwrap();
        base.stop_auto_stake("k", &store, &mut change).unwrap();
        assert!(!store.get_staker_info("k").unwrap().unwrap().auto_staking);
        assert_eq!(base.auto_stake.get("k"), Some(&false));
    }

    #[test]
    fn test_insert_substitute_at_position_into_empty_list() {
        let mut base = CommitteeBase::default();
        let mut change = CommitteeChange::default();
        let key = CommitteePublicKey::new(vec![4]);
        base.insert_substitute_at_position(ShardId(0), key.clone(), &key_str(4), 7, &mut change);
        assert_eq!(base.substitute(ShardId(0)), &[key]);
    }

    #[test]
    fn test_verify_swap_rejects_different_out_list() {
        use crate::instruction::SwapType;
        let outcome = SwapOutcome {
            in_keys: vec!["a".into()],
            out_keys: vec!["b".into()],
            ..Default::default()
        };
        let mut inst = SwapShardInstruction {
            in_public_keys: vec!["a".into()],
            out_public_keys: vec!["b".into()],
            shard_id: ShardId(0),
            swap_type: SwapType::EndEpoch,
        };
        assert!(verify_swap(&inst, &outcome).is_ok());

        inst.out_public_keys = vec!["c".into()];
        let err = verify_swap(&inst, &outcome).unwrap_err();
        assert!(matches!(err, CommitteeStateError::SwapMismatch { .. }));
    }
}
