// SLASHING COMMITTEE STATE
// V2 Module - Common candidate pool, load-balanced assignment, slashing swaps
//
// SAFETY INVARIANTS:
// 1. number_of_assigned_candidates <= shard_common_pool.len() at all times
// 2. The reserved prefix is consumed in full by the next RANDOM instruction
// 3. A swap is applied only when the block's in/out lists equal the
//    recomputed ones
// 4. Slashed keys never auto-stake: their record is deleted and stake returned

use super::base::{check_active_shard, verify_swap, CommitteeBase, ShardSnapshot};
use super::v1::CommitteeStateV1;
use super::UpdateContext;
use crate::environment::CommitteeEnvironment;
use crate::error::Result;
use crate::hash::{hash_string_list, Digest};
use crate::instruction::{
    Instruction, RandomInstruction, StakeInstruction, StopAutoStakeInstruction,
    SwapShardInstruction, UnstakeInstruction,
};
use crate::key::{keys_to_strings, strings_to_keys, CommitteePublicKey};
use crate::store::StakerStore;
use committee_rules::{assign_rule_for_version, swap_rule_for_version, ChainId, ShardId};
use log::{debug, info};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitteeStateV2 {
    pub(crate) base: CommitteeBase,

    /// Staked, not yet assigned candidates in arrival order
    pub(crate) shard_common_pool: Vec<CommitteePublicKey>,

    /// Length of the pool prefix reserved for the next RANDOM instruction
    pub(crate) number_of_assigned_candidates: usize,

    /// Rotations a key has spent going back to substitutes
    pub(crate) number_of_round: BTreeMap<String, u32>,
}

impl CommitteeStateV2 {
    pub(crate) fn from_v1(v1: CommitteeStateV1) -> Self {
        let (base, shard_common_pool) = v1.into_parts();
        CommitteeStateV2 {
            base,
            shard_common_pool,
            number_of_assigned_candidates: 0,
            number_of_round: BTreeMap::new(),
        }
    }

    pub fn shard_common_pool(&self) -> &[CommitteePublicKey] {
        &self.shard_common_pool
    }

    pub fn number_of_assigned_candidates(&self) -> usize {
        self.number_of_assigned_candidates
    }

    pub fn number_of_round(&self) -> &BTreeMap<String, u32> {
        &self.number_of_round
    }

    pub(crate) fn process(
        &mut self,
        env: &CommitteeEnvironment,
        instructions: &[Instruction],
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let no_sync = BTreeMap::new();
        if env.is_beacon_random_time {
            self.reserve_assigned_candidates(env);
        }
        let snapshot = self.base.snapshot_shards(env.params.active_shards)?;

        for inst in instructions {
            match inst {
                Instruction::Stake(stake) => self.process_stake(stake, env, store, ctx)?,
                Instruction::Random(random) => self.process_random(random, env, &snapshot, ctx)?,
                Instruction::SwapShard(swap) => {
                    self.process_swap_shard(swap, env, &snapshot, store, ctx)?
                }
                Instruction::Unstake(unstake) => {
                    self.process_unstake(unstake, store, ctx, &no_sync)?
                }
                Instruction::StopAutoStake(stop) => {
                    self.process_stop_auto_stake(stop, store, ctx, &no_sync)?
                }
                other => debug!("V2 ignores {}", other.opcode()),
            }
        }
        Ok(())
    }

    /// Reserve the pool prefix the coming RANDOM instruction will assign.
    pub(crate) fn reserve_assigned_candidates(&mut self, env: &CommitteeEnvironment) {
        let rule = swap_rule_for_version(env.params.swap_rule_version);
        let total: usize = ShardId::all(env.params.active_shards)
            .map(|shard| {
                rule.assign_offset(
                    self.base.substitute(shard).len(),
                    self.base.committee(shard).len(),
                    env.params.number_of_fixed_shard_block_validator,
                    env.params.min_shard_committee_size,
                )
            })
            .sum();
        self.number_of_assigned_candidates = total.min(self.shard_common_pool.len());
        debug!(
            "Random time: {} of {} candidates reserved",
            self.number_of_assigned_candidates,
            self.shard_common_pool.len()
        );
    }

    pub(crate) fn process_stake(
        &mut self,
        inst: &StakeInstruction,
        env: &CommitteeEnvironment,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        for (i, key) in inst.public_keys.iter().enumerate() {
            if self.base.is_known_staker(key, store)? {
                info!("Duplicate stake for {}, returning it", key);
                ctx.return_stake(ChainId::Beacon, key, inst.tx_stakes[i].clone());
                continue;
            }
            let decoded = CommitteePublicKey::from_base58(key)?;
            self.base.record_stake(
                key,
                &inst.reward_receivers[i],
                &inst.tx_stakes[i],
                inst.auto_stakes[i],
                env.beacon_height,
                store,
            )?;
            ctx.change.add_next_epoch_candidate(&decoded);
            self.shard_common_pool.push(decoded);
        }
        Ok(())
    }

    /// Detach the reserved prefix from the common pool.
    pub(crate) fn take_assigned_candidates(
        &mut self,
        ctx: &mut UpdateContext,
    ) -> Result<Vec<String>> {
        let count = self.number_of_assigned_candidates.min(self.shard_common_pool.len());
        let taken: Vec<CommitteePublicKey> = self.shard_common_pool.drain(..count).collect();
        for key in &taken {
            ctx.change.remove_next_epoch_candidate(key);
        }
        self.number_of_assigned_candidates = 0;
        keys_to_strings(&taken)
    }

    fn process_random(
        &mut self,
        inst: &RandomInstruction,
        env: &CommitteeEnvironment,
        snapshot: &ShardSnapshot,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let candidates = self.take_assigned_candidates(ctx)?;
        let assigned = assign_rule_for_version(env.params.assign_rule_version).process(
            &candidates,
            snapshot.loads(),
            inst.random_number,
        );

        for (shard, keys) in assigned {
            info!("Shard {} receives {} substitutes", shard, keys.len());
            for key in strings_to_keys(&keys)? {
                ctx.change.add_shard_substitute(shard, &key);
                self.base.shard_substitute.entry(shard).or_default().push(key);
            }
        }
        Ok(())
    }

    /// Verify a swap against the block-start pools and apply it. Slashed keys
    /// and swapped-out keys without auto-stake are removed with a stake
    /// return; the remaining swapped-out keys are handed back for re-queueing.
    pub(crate) fn apply_swap_shard(
        &mut self,
        inst: &SwapShardInstruction,
        env: &CommitteeEnvironment,
        snapshot: &ShardSnapshot,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<Vec<String>> {
        let shard = inst.shard_id;
        check_active_shard(shard, env.params.active_shards)?;
        let rule = swap_rule_for_version(env.params.swap_rule_version);
        let outcome = snapshot.compute_swap(shard, env, rule.as_ref(), &self.number_of_round);
        verify_swap(inst, &outcome)?;
        self.base.apply_swap_outcome(shard, &outcome, &mut ctx.change)?;

        for key in &outcome.back_to_substitutes {
            *self.number_of_round.entry(key.clone()).or_insert(0) += 1;
        }

        for key in &outcome.slashed {
            ctx.change.add_slashed(shard, key);
            self.number_of_round.remove(key);
            let tx = self.base.delete_staker(key, store, &mut ctx.change)?;
            ctx.return_stake(ChainId::Shard(shard), key, tx);
        }

        let mut requeue = Vec::new();
        for key in &outcome.normal_swap_out {
            self.number_of_round.remove(key);
            if self.base.staker_info(key, store)?.auto_staking {
                requeue.push(key.clone());
            } else {
                let tx = self.base.delete_staker(key, store, &mut ctx.change)?;
                ctx.return_stake(ChainId::Shard(shard), key, tx);
            }
        }
        Ok(requeue)
    }

    fn process_swap_shard(
        &mut self,
        inst: &SwapShardInstruction,
        env: &CommitteeEnvironment,
        snapshot: &ShardSnapshot,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let requeue = self.apply_swap_shard(inst, env, snapshot, store, ctx)?;
        for key in strings_to_keys(&requeue)? {
            ctx.change.add_next_epoch_candidate(&key);
            self.shard_common_pool.push(key);
        }
        Ok(())
    }

    /// Unassigned candidates leave at once with a full refund; anything
    /// already assigned only loses auto-stake.
    pub(crate) fn process_unstake(
        &mut self,
        inst: &UnstakeInstruction,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
        sync_pool: &BTreeMap<ShardId, Vec<String>>,
    ) -> Result<()> {
        for key in &inst.public_keys {
            let decoded = CommitteePublicKey::from_base58(key)?;
            match self.shard_common_pool.iter().position(|k| *k == decoded) {
                Some(pos) if pos >= self.number_of_assigned_candidates => {
                    self.shard_common_pool.remove(pos);
                    ctx.change.remove_next_epoch_candidate(&decoded);
                    let tx = self.base.delete_staker(key, store, &mut ctx.change)?;
                    ctx.return_stake(ChainId::Beacon, key, tx);
                    info!("Unstaked candidate {}", key);
                }
                Some(_) => self.base.stop_auto_stake(key, store, &mut ctx.change)?,
                None if self.base.assigned_shard(&decoded).is_some()
                    || in_sync_pool(sync_pool, key) =>
                {
                    self.base.stop_auto_stake(key, store, &mut ctx.change)?
                }
                None => debug!("Unstake for unknown key {}", key),
            }
        }
        Ok(())
    }

    pub(crate) fn process_stop_auto_stake(
        &mut self,
        inst: &StopAutoStakeInstruction,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
        sync_pool: &BTreeMap<ShardId, Vec<String>>,
    ) -> Result<()> {
        for key in &inst.public_keys {
            let decoded = CommitteePublicKey::from_base58(key)?;
            let in_pool = self.shard_common_pool.contains(&decoded)
                || self.base.assigned_shard(&decoded).is_some()
                || in_sync_pool(sync_pool, key);
            if in_pool {
                self.base.stop_auto_stake(key, store, &mut ctx.change)?;
            } else {
                self.base.auto_stake.remove(key);
            }
        }
        Ok(())
    }

    pub(crate) fn candidate_hash(&self) -> Result<Digest> {
        Ok(hash_string_list(&keys_to_strings(&self.shard_common_pool)?))
    }
}

fn in_sync_pool(sync_pool: &BTreeMap<ShardId, Vec<String>>, key: &str) -> bool {
    sync_pool.values().any(|keys| keys.iter().any(|k| k == key))
}
