// BEACON STAKING COMMITTEE STATE
// V4 Module - Beacon validators move waiting -> pending -> committee -> locking
//
// SAFETY INVARIANTS:
// 1. A beacon key sits in exactly one of committee, pending, waiting, locking
// 2. Fixed nodes are never slashed, unstaked or ranked out of the committee
// 3. Performance stays within [0, MAX_PERFORMING]
// 4. Locked stake is returned only LOCKING_PERIOD epochs after locking
// 5. The ordered beacon committee is re-derived from scores after every block

use super::base::CommitteeBase;
use super::v3::CommitteeStateV3;
use super::UpdateContext;
use crate::environment::{CommitteeEnvironment, CommitteeParams};
use crate::error::{CommitteeStateError, Result};
use crate::hash::{hash_string_list, Digest};
use crate::instruction::{
    AddStakingInstruction, BeaconStakeInstruction, FinishSyncInstruction, Instruction, ReturnReason,
};
use crate::key::{keys_to_strings, CommitteePublicKey};
use crate::store::{BeaconStakerInfo, StakerStore};
use committee_rules::{ChainId, RuleError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Performance every beacon validator starts an epoch with.
pub const DEFAULT_PERFORMING: u64 = 500;

pub const MAX_PERFORMING: u64 = 1000;

/// Per-block growth for a signer, per mille.
pub const INCREASE_PERFORMING: u64 = 1015;

/// Per-block decay for a non-signer, per mille.
pub const DECREASE_PERFORMING: u64 = 965;

const PERFORMING_SCALE: u64 = 1000;

/// Epochs of shard service a waiting key needs before it may become pending.
pub const MIN_ACTIVE_SHARD: u32 = 30;

/// Performance below which a non-fixed member is slashed at epoch end.
pub const MIN_PERFORMANCE: u64 = 200;

/// Epochs a locked key waits for its stake.
pub const LOCKING_PERIOD: u64 = 3;

/// Missed-signature share above which shard active time restarts.
pub const MAX_MISSING_SIGNATURE_PERCENT: u64 = 20;

/// Beacon staking position of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconStaker {
    pub staking_amount: u64,

    pub unstake: bool,

    pub performance: u64,

    /// Ranking score frozen at the last epoch swap
    pub epoch_score: u64,

    pub fixed_node: bool,
}

impl BeaconStaker {
    pub fn candidate(staking_amount: u64) -> Self {
        BeaconStaker {
            staking_amount,
            unstake: false,
            performance: DEFAULT_PERFORMING,
            epoch_score: 0,
            fixed_node: false,
        }
    }

    fn score(&self) -> u128 {
        u128::from(self.performance) * u128::from(self.staking_amount)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockingInfo {
    pub locking_epoch: u64,
    pub reason: ReturnReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitteeStateV4 {
    pub(crate) v3: CommitteeStateV3,
    pub(crate) beacon_committee: BTreeMap<String, BeaconStaker>,
    pub(crate) beacon_pending: BTreeMap<String, BeaconStaker>,
    pub(crate) beacon_waiting: BTreeMap<String, BeaconStaker>,
    pub(crate) beacon_locking: BTreeMap<String, LockingInfo>,
}

/// Remove non-fixed entries carrying the unstake flag.
fn take_flagged(pool: &mut BTreeMap<String, BeaconStaker>) -> Vec<String> {
    let flagged: Vec<String> = pool
        .iter()
        .filter(|(_, s)| s.unstake && !s.fixed_node)
        .map(|(k, _)| k.clone())
        .collect();
    for key in &flagged {
        pool.remove(key);
    }
    flagged
}

fn sorted_desc<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut keys: Vec<&str> = keys.map(String::as_str).collect();
    keys.sort_unstable_by(|a, b| b.cmp(a));
    keys
}

impl CommitteeStateV4 {
    /// The existing beacon committee becomes staked: the first
    /// `min_beacon_committee_size` keys are fixed nodes.
    pub(crate) fn from_v3(
        v3: CommitteeStateV3,
        params: &CommitteeParams,
        store: &dyn StakerStore,
    ) -> Result<Self> {
        let amount = params.beacon_upgrade_staking_amount;
        let mut beacon_committee = BTreeMap::new();

        for (i, key) in keys_to_strings(&v3.v2.base.beacon_committee)?.into_iter().enumerate() {
            let shard_info = v3.v2.base.staker_info(&key, store)?;
            let mut info = BeaconStakerInfo::new(
                shard_info.reward_receiver,
                shard_info.beacon_confirm_height,
                shard_info.tx_staking_id,
                amount,
            );
            info.finish_sync = true;
            store.store_beacon_staker_info(&key, &info)?;
            beacon_committee.insert(
                key,
                BeaconStaker {
                    staking_amount: amount,
                    unstake: false,
                    performance: DEFAULT_PERFORMING,
                    epoch_score: DEFAULT_PERFORMING.saturating_mul(amount),
                    fixed_node: i < params.min_beacon_committee_size,
                },
            );
        }

        let mut state = CommitteeStateV4 {
            v3,
            beacon_committee,
            ..Default::default()
        };
        state.reorder_beacon_committee()?;
        info!(
            "Beacon staking enabled for {} committee members",
            state.beacon_committee.len()
        );
        Ok(state)
    }

    pub(crate) fn base(&self) -> &CommitteeBase {
        &self.v3.v2.base
    }

    pub fn beacon_committee(&self) -> &BTreeMap<String, BeaconStaker> {
        &self.beacon_committee
    }

    pub fn beacon_pending(&self) -> &BTreeMap<String, BeaconStaker> {
        &self.beacon_pending
    }

    pub fn beacon_waiting(&self) -> &BTreeMap<String, BeaconStaker> {
        &self.beacon_waiting
    }

    pub fn beacon_locking(&self) -> &BTreeMap<String, LockingInfo> {
        &self.beacon_locking
    }

    fn is_beacon_staker(&self, key: &str) -> bool {
        self.beacon_committee.contains_key(key)
            || self.beacon_pending.contains_key(key)
            || self.beacon_waiting.contains_key(key)
    }

    fn staker_mut(&mut self, key: &str) -> Option<&mut BeaconStaker> {
        if self.beacon_committee.contains_key(key) {
            return self.beacon_committee.get_mut(key);
        }
        if self.beacon_pending.contains_key(key) {
            return self.beacon_pending.get_mut(key);
        }
        self.beacon_waiting.get_mut(key)
    }

    fn beacon_info(&self, key: &str, store: &dyn StakerStore) -> Result<BeaconStakerInfo> {
        store
            .get_beacon_staker_info(key)?
            .ok_or_else(|| CommitteeStateError::StakerNotFound(key.to_string()))
    }

    pub(crate) fn process(
        &mut self,
        env: &CommitteeEnvironment,
        instructions: &[Instruction],
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        if env.is_first_block_of_epoch() {
            self.count_shard_active_time(env, store, ctx)?;
        }

        self.v3.process(env, instructions, store, ctx)?;

        self.update_performance(env)?;
        self.flag_unstake(instructions, store)?;
        if env.is_last_block_of_epoch() {
            self.swap_and_slash(env, store, ctx)?;
        }

        for inst in instructions {
            if let Instruction::FinishSync(finish) = inst {
                if finish.chain_id == ChainId::Beacon {
                    self.process_finish_sync(finish, store)?;
                }
            }
        }
        self.promote_waiting(store, ctx)?;

        for inst in instructions {
            match inst {
                Instruction::BeaconStake(stake) => self.process_beacon_stake(stake, env, store, ctx)?,
                Instruction::AddStaking(add) => self.process_add_staking(add, env, store, ctx)?,
                _ => {}
            }
        }

        if env.is_last_block_of_epoch() {
            self.unlock(env, store, ctx)?;
        }
        self.reorder_beacon_committee()
    }

    /// Score the shard service of every waiting key for the closed epoch.
    fn count_shard_active_time(
        &mut self,
        env: &CommitteeEnvironment,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let waiting: Vec<String> = self.beacon_waiting.keys().cloned().collect();
        for key in waiting {
            let mut info = self.beacon_info(&key, store)?;

            if let Some(stats) = env.missing_signature.get(&key) {
                if stats.actual_total != 0 {
                    let missed =
                        u64::from(stats.missing) * 100 / u64::from(stats.actual_total);
                    if missed > MAX_MISSING_SIGNATURE_PERCENT {
                        info.shard_active_time = 0;
                    } else {
                        info.shard_active_time += 1;
                    }
                }
            }

            let mut unstake = env.missing_signature_penalty.contains_key(&key);
            match store.get_staker_info(&key)? {
                Some(shard_info) if info.shard_active_time >= MIN_ACTIVE_SHARD => {
                    if shard_info.auto_staking {
                        self.v3
                            .v2
                            .base
                            .stop_auto_stake(&key, store, &mut ctx.change)?;
                    }
                }
                None if info.shard_active_time < MIN_ACTIVE_SHARD => unstake = true,
                _ => {}
            }

            if unstake {
                info.unstaking = true;
                if let Some(staker) = self.beacon_waiting.get_mut(&key) {
                    staker.unstake = true;
                }
            }
            store.store_beacon_staker_info(&key, &info)?;
        }
        Ok(())
    }

    /// Signers of the previous block gain performance, absentees lose it.
    fn update_performance(&mut self, env: &CommitteeEnvironment) -> Result<()> {
        if env.is_first_block_of_epoch() {
            for staker in self.beacon_committee.values_mut() {
                staker.performance = DEFAULT_PERFORMING;
            }
            return Ok(());
        }
        let Some(signers) = &env.previous_block_signers else {
            return Ok(());
        };

        let order = keys_to_strings(&self.base().beacon_committee)?;
        if let Some(&index) = signers.iter().find(|&&i| i >= order.len()) {
            return Err(RuleError::SignerIndexOutOfRange {
                index,
                committee_size: order.len(),
            }
            .into());
        }
        let signed: BTreeSet<usize> = signers.iter().copied().collect();

        for (i, key) in order.iter().enumerate() {
            if let Some(staker) = self.beacon_committee.get_mut(key) {
                staker.performance = if signed.contains(&i) {
                    (staker.performance * INCREASE_PERFORMING / PERFORMING_SCALE).min(MAX_PERFORMING)
                } else {
                    staker.performance * DECREASE_PERFORMING / PERFORMING_SCALE
                };
            }
        }
        Ok(())
    }

    fn flag_unstake(&mut self, instructions: &[Instruction], store: &dyn StakerStore) -> Result<()> {
        for inst in instructions {
            let keys = match inst {
                Instruction::Unstake(unstake) => &unstake.public_keys,
                Instruction::StopAutoStake(stop) => &stop.public_keys,
                _ => continue,
            };
            for key in keys {
                let Some(staker) = self.staker_mut(key) else {
                    continue;
                };
                staker.unstake = true;
                let mut info = self.beacon_info(key, store)?;
                info.unstaking = true;
                store.store_beacon_staker_info(key, &info)?;
                info!("Beacon staker {} will unstake at epoch end", key);
            }
        }
        Ok(())
    }

    fn lock(
        &mut self,
        key: &str,
        env: &CommitteeEnvironment,
        reason: ReturnReason,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let mut info = self.beacon_info(key, store)?;
        info.locking_epoch = env.epoch;
        info.locking_reason = Some(reason);
        store.store_beacon_staker_info(key, &info)?;
        self.beacon_locking.insert(
            key.to_string(),
            LockingInfo {
                locking_epoch: env.epoch,
                reason,
            },
        );
        ctx.change.add_beacon_locking(key);
        Ok(())
    }

    /// Epoch-end rotation: slash, lock unstakers, then rank pending and
    /// non-fixed committee keys for the free committee seats.
    fn swap_and_slash(
        &mut self,
        env: &CommitteeEnvironment,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let slashed: Vec<String> = self
            .beacon_committee
            .iter()
            .filter(|(_, s)| !s.fixed_node && s.performance < MIN_PERFORMANCE)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &slashed {
            self.beacon_committee.remove(key);
            ctx.change.remove_beacon_committee(key);
            self.lock(key, env, ReturnReason::Slash, store, ctx)?;
        }

        for key in take_flagged(&mut self.beacon_committee) {
            ctx.change.remove_beacon_committee(&key);
            self.lock(&key, env, ReturnReason::Unstake, store, ctx)?;
        }
        for key in take_flagged(&mut self.beacon_pending) {
            ctx.change.remove_beacon_pending(&key);
            self.lock(&key, env, ReturnReason::Unstake, store, ctx)?;
        }
        for key in take_flagged(&mut self.beacon_waiting) {
            ctx.change.remove_beacon_waiting(&key);
            self.lock(&key, env, ReturnReason::Unstake, store, ctx)?;
        }

        // (score, key, currently pending)
        let mut ranked: Vec<(u128, String, bool)> = self
            .beacon_pending
            .iter()
            .map(|(k, s)| (u128::from(DEFAULT_PERFORMING) * u128::from(s.staking_amount), k.clone(), true))
            .chain(
                self.beacon_committee
                    .iter()
                    .filter(|(_, s)| !s.fixed_node)
                    .map(|(k, s)| (s.score(), k.clone(), false)),
            )
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let fixed = self.beacon_committee.values().filter(|s| s.fixed_node).count();
        let seats = env.params.max_beacon_committee_size.saturating_sub(fixed);

        let mut promoted = BTreeSet::new();
        for (rank, (_, key, pending)) in ranked.into_iter().enumerate() {
            match (rank < seats, pending) {
                (true, true) => {
                    if let Some(staker) = self.beacon_pending.remove(&key) {
                        ctx.change.remove_beacon_pending(&key);
                        ctx.change.add_beacon_committee(&key);
                        self.beacon_committee.insert(key.clone(), staker);
                        promoted.insert(key);
                    }
                }
                (false, false) => {
                    if let Some(staker) = self.beacon_committee.remove(&key) {
                        ctx.change.remove_beacon_committee(&key);
                        ctx.change.add_beacon_pending(&key);
                        self.beacon_pending.insert(key, staker);
                    }
                }
                _ => {}
            }
        }

        for (key, staker) in self.beacon_committee.iter_mut() {
            staker.epoch_score = if promoted.contains(key) {
                DEFAULT_PERFORMING.saturating_mul(staker.staking_amount)
            } else {
                staker.performance.saturating_mul(staker.staking_amount)
            };
            staker.performance = DEFAULT_PERFORMING;
        }
        for staker in self.beacon_pending.values_mut() {
            staker.epoch_score = 0;
        }

        info!(
            "Beacon epoch {} swap: {} slashed, {} promoted, committee {} / pending {}",
            env.epoch,
            slashed.len(),
            promoted.len(),
            self.beacon_committee.len(),
            self.beacon_pending.len()
        );
        Ok(())
    }

    fn process_finish_sync(
        &mut self,
        inst: &FinishSyncInstruction,
        store: &dyn StakerStore,
    ) -> Result<()> {
        for key in &inst.public_keys {
            match store.get_beacon_staker_info(key)? {
                Some(mut info) => {
                    info.finish_sync = true;
                    store.store_beacon_staker_info(key, &info)?;
                }
                None => warn!("Beacon finish sync for unknown staker {}", key),
            }
        }
        Ok(())
    }

    /// Synced waiting keys with enough shard service and no shard stake left.
    fn promote_waiting(&mut self, store: &dyn StakerStore, ctx: &mut UpdateContext) -> Result<()> {
        let waiting: Vec<String> = self.beacon_waiting.keys().cloned().collect();
        for key in waiting {
            let info = self.beacon_info(&key, store)?;
            if !info.finish_sync || info.shard_active_time < MIN_ACTIVE_SHARD {
                continue;
            }
            if store.get_staker_info(&key)?.is_some() {
                continue;
            }
            if let Some(staker) = self.beacon_waiting.remove(&key) {
                ctx.change.remove_beacon_waiting(&key);
                ctx.change.add_beacon_pending(&key);
                self.beacon_pending.insert(key.clone(), staker);
                debug!("{} is now a pending beacon validator", key);
            }
        }
        Ok(())
    }

    fn process_beacon_stake(
        &mut self,
        inst: &BeaconStakeInstruction,
        env: &CommitteeEnvironment,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        for (i, key) in inst.public_keys.iter().enumerate() {
            let amount = inst.staking_amounts[i];
            if self.is_beacon_staker(key)
                || self.beacon_locking.contains_key(key)
                || store.get_beacon_staker_info(key)?.is_some()
            {
                info!("Duplicate beacon stake for {}, returning {}", key, amount);
                ctx.beacon_returns
                    .add(key.clone(), ReturnReason::DuplicateStake, amount);
                continue;
            }
            CommitteePublicKey::from_base58(key)?;
            let info = BeaconStakerInfo::new(
                inst.reward_receivers[i].clone(),
                env.beacon_height,
                inst.tx_stakes[i].clone(),
                amount,
            );
            store.store_beacon_staker_info(key, &info)?;
            self.beacon_waiting
                .insert(key.clone(), BeaconStaker::candidate(amount));
            ctx.change.add_beacon_waiting(key);
        }
        Ok(())
    }

    fn process_add_staking(
        &mut self,
        inst: &AddStakingInstruction,
        env: &CommitteeEnvironment,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        for (i, key) in inst.public_keys.iter().enumerate() {
            let amount = inst.staking_amounts[i];
            let info = if self.is_beacon_staker(key) {
                store.get_beacon_staker_info(key)?
            } else {
                None
            };
            let Some(mut info) = info else {
                info!("Add staking for non-staker {}, returning {}", key, amount);
                ctx.beacon_returns
                    .add(key.clone(), ReturnReason::AddStakeFail, amount);
                continue;
            };
            info.add_staking(inst.tx_stakes[i].clone(), env.beacon_height, amount);
            store.store_beacon_staker_info(key, &info)?;
            let total = info.total_staking_amount();
            if let Some(staker) = self.staker_mut(key) {
                staker.staking_amount = total;
            }
        }
        Ok(())
    }

    fn unlock(
        &mut self,
        env: &CommitteeEnvironment,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let expired: Vec<(String, LockingInfo)> = self
            .beacon_locking
            .iter()
            .filter(|(_, lock)| env.epoch >= lock.locking_epoch + LOCKING_PERIOD)
            .map(|(k, lock)| (k.clone(), *lock))
            .collect();

        for (key, lock) in expired {
            let info = self.beacon_info(&key, store)?;
            ctx.beacon_returns
                .add(key.clone(), lock.reason, info.total_staking_amount());
            store.delete_beacon_staker_info(&key)?;
            self.beacon_locking.remove(&key);
            ctx.change.remove_beacon_locking(&key);
            info!(
                "Unlocked {} after epoch {} ({:?})",
                key, lock.locking_epoch, lock.reason
            );
        }
        Ok(())
    }

    /// Highest epoch score first, ties by key descending.
    fn reorder_beacon_committee(&mut self) -> Result<()> {
        let mut ordered: Vec<(&String, &BeaconStaker)> = self.beacon_committee.iter().collect();
        ordered.sort_by(|a, b| b.1.epoch_score.cmp(&a.1.epoch_score).then_with(|| b.0.cmp(a.0)));
        let keys = ordered
            .into_iter()
            .map(|(k, _)| CommitteePublicKey::from_base58(k))
            .collect::<Result<Vec<_>>>()?;
        self.v3.v2.base.beacon_committee = keys;
        Ok(())
    }

    /// Committee in order, then pending and locking keys descending.
    pub(crate) fn beacon_hash(&self) -> Result<Digest> {
        let committee = keys_to_strings(&self.base().beacon_committee)?;
        let mut all: Vec<&str> = committee.iter().map(String::as_str).collect();
        all.extend(sorted_desc(self.beacon_pending.keys()));
        all.extend(sorted_desc(self.beacon_locking.keys()));
        Ok(hash_string_list(&all))
    }

    pub(crate) fn candidate_hash(&self) -> Digest {
        let waiting: Vec<&str> = self.beacon_waiting.keys().map(String::as_str).collect();
        hash_string_list(&waiting)
    }
}
