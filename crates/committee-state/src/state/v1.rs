// SELF-SWAP COMMITTEE STATE
// V1 Module - Epoch candidate queues, hash-bucket assignment, claimed swaps
//
// SAFETY INVARIANTS:
// 1. A staked key waits in the next-epoch queue until the random-time block
// 2. Claimed swap-in keys must be the head of the substitute list
// 3. Claimed swap-out keys must all sit in the shard committee

use super::base::{check_active_shard, CommitteeBase};
use super::UpdateContext;
use crate::environment::CommitteeEnvironment;
use crate::error::{CommitteeStateError, Result};
use crate::hash::{hash_string_list, Digest};
use crate::instruction::{
    Instruction, RandomInstruction, StakeInstruction, StopAutoStakeInstruction,
    SwapShardInstruction, UnstakeInstruction,
};
use crate::key::{keys_to_strings, strings_to_keys, CommitteePublicKey};
use crate::store::StakerStore;
use committee_rules::swap_rule::{default_assign_offset, remove_validator_prefix};
use committee_rules::{ChainId, HashBucketAssignment};
use log::{debug, info};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitteeStateV1 {
    pub(crate) base: CommitteeBase,

    /// Staked this epoch, assigned from the next random round on
    pub(crate) next_epoch_shard_candidate: Vec<CommitteePublicKey>,

    /// Waiting for the RANDOM instruction of this epoch
    pub(crate) current_epoch_shard_candidate: Vec<CommitteePublicKey>,
}

impl CommitteeStateV1 {
    pub fn new(base: CommitteeBase) -> Self {
        CommitteeStateV1 {
            base,
            ..Default::default()
        }
    }

    pub fn next_epoch_shard_candidate(&self) -> &[CommitteePublicKey] {
        &self.next_epoch_shard_candidate
    }

    pub fn current_epoch_shard_candidate(&self) -> &[CommitteePublicKey] {
        &self.current_epoch_shard_candidate
    }

    pub(crate) fn process(
        &mut self,
        env: &CommitteeEnvironment,
        instructions: &[Instruction],
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        if env.is_beacon_random_time {
            self.promote_next_epoch_candidates(ctx);
        }

        for inst in instructions {
            match inst {
                Instruction::Stake(stake) => self.process_stake(stake, env, store, ctx)?,
                Instruction::Random(random) => self.process_random(random, env, ctx)?,
                Instruction::SwapShard(swap) => {
                    check_active_shard(swap.shard_id, env.params.active_shards)?;
                    self.process_swap_shard(swap, store, ctx)?
                }
                Instruction::Unstake(unstake) => self.process_unstake(unstake, store, ctx)?,
                Instruction::StopAutoStake(stop) => self.process_stop_auto_stake(stop, store, ctx)?,
                other => debug!("V1 ignores {}", other.opcode()),
            }
        }
        Ok(())
    }

    fn promote_next_epoch_candidates(&mut self, ctx: &mut UpdateContext) {
        for key in &self.next_epoch_shard_candidate {
            ctx.change.remove_next_epoch_candidate(key);
            ctx.change.add_current_epoch_candidate(key);
        }
        let promoted = std::mem::take(&mut self.next_epoch_shard_candidate);
        debug!("Random time: {} candidates move to the current epoch", promoted.len());
        self.current_epoch_shard_candidate.extend(promoted);
    }

    fn process_stake(
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
            self.next_epoch_shard_candidate.push(decoded);
        }
        Ok(())
    }

    fn process_random(
        &mut self,
        inst: &RandomInstruction,
        env: &CommitteeEnvironment,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let candidates = keys_to_strings(&self.current_epoch_shard_candidate)?;
        let assignment = HashBucketAssignment::new(
            default_assign_offset(env.params.max_shard_committee_size),
            env.params.active_shards,
        );
        let (remaining, assigned) =
            assignment.process(&candidates, &BTreeMap::new(), inst.random_number);

        for (shard, keys) in assigned {
            for key in strings_to_keys(&keys)? {
                ctx.change.remove_current_epoch_candidate(&key);
                ctx.change.add_shard_substitute(shard, &key);
                self.base.shard_substitute.entry(shard).or_default().push(key);
            }
        }
        for key in strings_to_keys(&remaining)? {
            ctx.change.remove_current_epoch_candidate(&key);
            ctx.change.add_next_epoch_candidate(&key);
            self.next_epoch_shard_candidate.push(key);
        }
        self.current_epoch_shard_candidate.clear();

        info!(
            "Random assignment: {} assigned, {} deferred",
            candidates.len() - remaining.len(),
            remaining.len()
        );
        Ok(())
    }

    /// Apply the claimed swap after checking it against the current pools.
    fn process_swap_shard(
        &mut self,
        inst: &SwapShardInstruction,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let shard = inst.shard_id;
        let committee = keys_to_strings(self.base.committee(shard))?;
        let substitutes = keys_to_strings(self.base.substitute(shard))?;

        let new_substitutes = remove_validator_prefix(&substitutes, &inst.in_public_keys)?;
        if let Some(stranger) = inst.out_public_keys.iter().find(|k| !committee.contains(k)) {
            debug!("Swap-out key {} not in shard {} committee", stranger, shard);
            return Err(CommitteeStateError::SwapMismatch {
                shard,
                expected_in: inst.in_public_keys.clone(),
                expected_out: inst
                    .out_public_keys
                    .iter()
                    .filter(|k| committee.contains(k))
                    .cloned()
                    .collect(),
                got_in: inst.in_public_keys.clone(),
                got_out: inst.out_public_keys.clone(),
            });
        }

        let mut new_committee: Vec<String> = committee
            .into_iter()
            .filter(|k| !inst.out_public_keys.contains(k))
            .collect();
        new_committee.extend(inst.in_public_keys.iter().cloned());

        for key in strings_to_keys(&inst.in_public_keys)? {
            ctx.change.remove_shard_substitute(shard, &key);
            ctx.change.add_shard_committee(shard, &key);
        }
        self.base
            .shard_committee
            .insert(shard, strings_to_keys(&new_committee)?);
        self.base
            .shard_substitute
            .insert(shard, strings_to_keys(&new_substitutes)?);

        for key in &inst.out_public_keys {
            let decoded = CommitteePublicKey::from_base58(key)?;
            ctx.change.remove_shard_committee(shard, &decoded);
            if self.base.staker_info(key, store)?.auto_staking {
                ctx.change.add_next_epoch_candidate(&decoded);
                self.next_epoch_shard_candidate.push(decoded);
            } else {
                let tx = self.base.delete_staker(key, store, &mut ctx.change)?;
                ctx.return_stake(ChainId::Shard(shard), key, tx);
            }
        }

        info!(
            "Shard {} self-swap: {} in, {} out",
            shard,
            inst.in_public_keys.len(),
            inst.out_public_keys.len()
        );
        Ok(())
    }

    fn process_unstake(
        &mut self,
        inst: &UnstakeInstruction,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        for key in &inst.public_keys {
            let decoded = CommitteePublicKey::from_base58(key)?;
            if let Some(pos) = self.next_epoch_shard_candidate.iter().position(|k| *k == decoded) {
                self.next_epoch_shard_candidate.remove(pos);
                ctx.change.remove_next_epoch_candidate(&decoded);
            } else if let Some(pos) =
                self.current_epoch_shard_candidate.iter().position(|k| *k == decoded)
            {
                self.current_epoch_shard_candidate.remove(pos);
                ctx.change.remove_current_epoch_candidate(&decoded);
            } else {
                if self.base.assigned_shard(&decoded).is_some() {
                    self.base.stop_auto_stake(key, store, &mut ctx.change)?;
                }
                continue;
            }
            let tx = self.base.delete_staker(key, store, &mut ctx.change)?;
            ctx.return_stake(ChainId::Beacon, key, tx);
        }
        Ok(())
    }

    fn process_stop_auto_stake(
        &mut self,
        inst: &StopAutoStakeInstruction,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        for key in &inst.public_keys {
            let decoded = CommitteePublicKey::from_base58(key)?;
            if self.is_in_any_pool(&decoded) {
                self.base.stop_auto_stake(key, store, &mut ctx.change)?;
            } else {
                self.base.auto_stake.remove(key);
            }
        }
        Ok(())
    }

    fn is_in_any_pool(&self, key: &CommitteePublicKey) -> bool {
        self.next_epoch_shard_candidate.contains(key)
            || self.current_epoch_shard_candidate.contains(key)
            || self.base.assigned_shard(key).is_some()
    }

    /// Current then next epoch candidates.
    pub(crate) fn candidate_hash(&self) -> Result<Digest> {
        let mut all = keys_to_strings(&self.current_epoch_shard_candidate)?;
        all.extend(keys_to_strings(&self.next_epoch_shard_candidate)?);
        Ok(hash_string_list(&all))
    }

    /// Candidates in queue order, as the common pool of the next version.
    pub(crate) fn into_parts(self) -> (CommitteeBase, Vec<CommitteePublicKey>) {
        let mut pool = self.current_epoch_shard_candidate;
        pool.extend(self.next_epoch_shard_candidate);
        (self.base, pool)
    }
}
