// SYNCING COMMITTEE STATE
// V3 Module - Assigned candidates sync before they may substitute
//
// SAFETY INVARIANTS:
// 1. RANDOM places candidates in the sync pool, never straight into substitutes
// 2. Only keys present in a shard's sync pool can finish syncing on that shard
// 3. Substitute insertion positions depend only on (key, seed, list length)

use super::base::ShardSnapshot;
use super::v2::CommitteeStateV2;
use super::UpdateContext;
use crate::environment::CommitteeEnvironment;
use crate::error::{CommitteeStateError, Result};
use crate::hash::{hash_string_list, Digest};
use crate::instruction::{FinishSyncInstruction, Instruction, RandomInstruction, SwapShardInstruction};
use crate::key::CommitteePublicKey;
use crate::store::StakerStore;
use committee_rules::{assign_rule_for_version, ChainId, ShardId};
use log::{debug, info};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitteeStateV3 {
    pub(crate) v2: CommitteeStateV2,

    /// Shard -> keys catching up on shard state, in assignment order
    pub(crate) sync_pool: BTreeMap<ShardId, Vec<String>>,
}

impl CommitteeStateV3 {
    pub(crate) fn from_v2(v2: CommitteeStateV2, active_shards: usize) -> Self {
        let sync_pool = ShardId::all(active_shards).map(|s| (s, Vec::new())).collect();
        CommitteeStateV3 { v2, sync_pool }
    }

    pub fn sync_pool(&self, shard: ShardId) -> &[String] {
        self.sync_pool.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Block-start pools; assignment load counts committee, substitutes and
    /// syncing keys.
    fn snapshot(&self, active_shards: usize) -> Result<ShardSnapshot> {
        let mut snapshot = self.v2.base.snapshot_shards(active_shards)?;
        for shard in ShardId::all(active_shards) {
            snapshot.add_load(shard, self.sync_pool(shard).len());
        }
        Ok(snapshot)
    }

    pub(crate) fn process(
        &mut self,
        env: &CommitteeEnvironment,
        instructions: &[Instruction],
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        if env.is_beacon_random_time {
            self.v2.reserve_assigned_candidates(env);
        }
        let snapshot = self.snapshot(env.params.active_shards)?;

        for inst in instructions {
            match inst {
                Instruction::Stake(stake) => self.v2.process_stake(stake, env, store, ctx)?,
                Instruction::Random(random) => self.process_random(random, env, &snapshot, ctx)?,
                Instruction::SwapShard(swap) => {
                    self.process_swap_shard(swap, env, &snapshot, store, ctx)?
                }
                Instruction::Unstake(unstake) => {
                    self.v2.process_unstake(unstake, store, ctx, &self.sync_pool)?
                }
                Instruction::StopAutoStake(stop) => {
                    self.v2
                        .process_stop_auto_stake(stop, store, ctx, &self.sync_pool)?
                }
                Instruction::FinishSync(finish) => self.process_finish_sync(finish, env, ctx)?,
                other => debug!("V3 ignores {}", other.opcode()),
            }
        }
        Ok(())
    }

    fn process_random(
        &mut self,
        inst: &RandomInstruction,
        env: &CommitteeEnvironment,
        snapshot: &ShardSnapshot,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let candidates = self.v2.take_assigned_candidates(ctx)?;
        let assigned = assign_rule_for_version(env.params.assign_rule_version).process(
            &candidates,
            snapshot.loads(),
            inst.random_number,
        );

        for (shard, keys) in assigned {
            info!("Shard {} starts syncing {} validators", shard, keys.len());
            for key in &keys {
                ctx.change.add_syncing(shard, key);
            }
            self.sync_pool.entry(shard).or_default().extend(keys);
        }
        Ok(())
    }

    /// Swapped-out keys that keep auto-stake are re-assigned by block-start
    /// load and inserted into the chosen shard's substitutes.
    fn process_swap_shard(
        &mut self,
        inst: &SwapShardInstruction,
        env: &CommitteeEnvironment,
        snapshot: &ShardSnapshot,
        store: &dyn StakerStore,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let requeue = self.v2.apply_swap_shard(inst, env, snapshot, store, ctx)?;
        let rule = assign_rule_for_version(env.params.assign_rule_version);

        for key in requeue {
            let assigned =
                rule.process(std::slice::from_ref(&key), snapshot.loads(), env.random_number);
            let Some(shard) = assigned.keys().next().copied() else {
                debug!("No shard for {}, keeping it in shard {}", key, inst.shard_id);
                continue;
            };
            let decoded = CommitteePublicKey::from_base58(&key)?;
            self.v2
                .base
                .insert_substitute_at_position(shard, decoded, &key, env.random_number, &mut ctx.change);
            debug!("{} re-queued as substitute of shard {}", key, shard);
        }
        Ok(())
    }

    fn process_finish_sync(
        &mut self,
        inst: &FinishSyncInstruction,
        env: &CommitteeEnvironment,
        ctx: &mut UpdateContext,
    ) -> Result<()> {
        let shard = match inst.chain_id {
            ChainId::Shard(shard) => shard,
            ChainId::Beacon => return Ok(()),
        };

        for key in &inst.public_keys {
            let syncing = self.sync_pool.entry(shard).or_default();
            let pos = syncing.iter().position(|k| k == key).ok_or_else(|| {
                CommitteeStateError::InvalidSyncValidator {
                    shard,
                    key: key.clone(),
                }
            })?;
            syncing.remove(pos);
            ctx.change.remove_syncing(shard, key);
            ctx.change.add_finished_sync(shard, key);

            let decoded = CommitteePublicKey::from_base58(key)?;
            self.v2
                .base
                .insert_substitute_at_position(shard, decoded, key, env.random_number, &mut ctx.change);
        }
        info!(
            "Shard {}: {} validators finished syncing",
            shard,
            inst.public_keys.len()
        );
        Ok(())
    }

    pub(crate) fn sync_hash(&self) -> Digest {
        let all: Vec<&str> = self
            .sync_pool
            .values()
            .flat_map(|keys| keys.iter().map(String::as_str))
            .collect();
        hash_string_list(&all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::CommitteeParams;
    use crate::instruction::{StakeInstruction, SwapType, UnstakeInstruction};
    use crate::state::base::CommitteeBase;
    use crate::store::InMemoryStakerStore;

    fn key(b: u8) -> CommitteePublicKey {
        CommitteePublicKey::new(vec![b])
    }

    fn key_str(b: u8) -> String {
        key(b).to_base58().unwrap()
    }

    fn params() -> CommitteeParams {
        CommitteeParams::new(2, 4, 8, 0, 10).unwrap()
    }

    fn env(height: u64) -> CommitteeEnvironment {
        CommitteeEnvironment::builder(&params())
            .beacon_height(height)
            .random_number(77)
            .build()
    }

    /// Shard 0: full committee 1..=8, substitutes 9..=10. Shard 1: 11..=14.
    fn state(store: &InMemoryStakerStore) -> CommitteeStateV3 {
        let mut base = CommitteeBase::default();
        base.shard_committee
            .insert(ShardId(0), (1..=8).map(key).collect());
        base.shard_substitute.insert(ShardId(0), vec![key(9), key(10)]);
        base.shard_committee
            .insert(ShardId(1), (11..=14).map(key).collect());
        base.shard_substitute.insert(ShardId(1), Vec::new());
        for b in 1..=14 {
            base.record_stake(&key_str(b), "r", &format!("tx{}", b), b != 2, 1, store)
                .unwrap();
        }
        base.initialized = true;
        CommitteeStateV3::from_v2(
            CommitteeStateV2 {
                base,
                ..Default::default()
            },
            2,
        )
    }

    #[test]
    fn test_random_fills_sync_pool_of_lighter_shard() {
        let store = InMemoryStakerStore::new();
        let mut state = state(&store);
        let mut ctx = UpdateContext::default();
        let stake = Instruction::Stake(StakeInstruction {
            public_keys: vec![key_str(50)],
            tx_stakes: vec!["tx50".into()],
            reward_receivers: vec!["r".into()],
            auto_stakes: vec![true],
        });
        state.process(&env(2), &[stake], &store, &mut ctx).unwrap();

        let mut ctx = UpdateContext::default();
        let random = Instruction::Random(RandomInstruction { random_number: 3 });
        state.process(&env(5), &[random], &store, &mut ctx).unwrap();

        // loads 10 vs 4: shard 1 is the only shard below the mean
        assert_eq!(state.sync_pool(ShardId(1)), &[key_str(50)]);
        assert!(state.v2.shard_common_pool().is_empty());
        assert_eq!(ctx.change.syncing_pool_added.get(&ShardId(1)), Some(&vec![key_str(50)]));
    }

    #[test]
    fn test_finish_sync_moves_key_to_substitutes() {
        let store = InMemoryStakerStore::new();
        let mut state = state(&store);
        state.sync_pool.insert(ShardId(1), vec![key_str(60)]);
        let mut ctx = UpdateContext::default();

        let finish = Instruction::FinishSync(FinishSyncInstruction {
            chain_id: ChainId::Shard(ShardId(1)),
            public_keys: vec![key_str(60)],
        });
        state.process(&env(3), &[finish], &store, &mut ctx).unwrap();

        assert!(state.sync_pool(ShardId(1)).is_empty());
        assert_eq!(state.v2.base.substitute(ShardId(1)), &[key(60)]);
        assert_eq!(
            ctx.change.finished_sync_validators.get(&ShardId(1)),
            Some(&vec![key_str(60)])
        );
        assert_eq!(ctx.change.shard_substitute_added.get(&ShardId(1)), Some(&vec![key(60)]));
    }

    #[test]
    fn test_finish_sync_rejects_key_not_syncing() {
        let store = InMemoryStakerStore::new();
        let mut state = state(&store);
        let mut ctx = UpdateContext::default();
        let finish = Instruction::FinishSync(FinishSyncInstruction {
            chain_id: ChainId::Shard(ShardId(0)),
            public_keys: vec![key_str(9)],
        });
        let err = state.process(&env(3), &[finish], &store, &mut ctx).unwrap_err();
        assert!(matches!(err, CommitteeStateError::InvalidSyncValidator { .. }));
    }

    #[test]
    fn test_swap_requeues_auto_stake_key_as_substitute() {
        let store = InMemoryStakerStore::new();
        let mut state = state(&store);
        let mut ctx = UpdateContext::default();

        // len 8 = max: one normal swap-out, then 7 / 8 = 0 swap-in, no refill
        let swap = Instruction::SwapShard(SwapShardInstruction {
            in_public_keys: vec![],
            out_public_keys: vec![key_str(1)],
            shard_id: ShardId(0),
            swap_type: SwapType::EndEpoch,
        });
        state.process(&env(10), &[swap], &store, &mut ctx).unwrap();

        assert_eq!(state.v2.base.committee(ShardId(0)).len(), 7);
        // key 1 keeps auto-stake and lands on the lighter shard 1
        assert_eq!(state.v2.base.substitute(ShardId(1)), &[key(1)]);
        assert!(store.get_staker_info(&key_str(1)).unwrap().is_some());
    }

    #[test]
    fn test_block_reads_shard_loads_from_its_start() {
        let store = InMemoryStakerStore::new();
        let mut state = state(&store);
        // Shard 1: three members (one short of the minimum) and six syncing keys.
        // Block-start loads are 10 and 9, so shard 1 is the lighter one.
        state
            .v2
            .base
            .shard_committee
            .insert(ShardId(1), (11..=13).map(key).collect());
        state
            .sync_pool
            .insert(ShardId(1), (70..=75).map(key_str).collect());
        state.v2.shard_common_pool = vec![key(50)];
        state.v2.number_of_assigned_candidates = 1;

        let swap_0 = Instruction::SwapShard(SwapShardInstruction {
            in_public_keys: vec![],
            out_public_keys: vec![key_str(1)],
            shard_id: ShardId(0),
            swap_type: SwapType::EndEpoch,
        });
        // Shard 1 had no substitutes when the block started: nothing swaps in,
        // even though key 1 lands there earlier in the same block.
        let swap_1 = Instruction::SwapShard(SwapShardInstruction {
            in_public_keys: vec![],
            out_public_keys: vec![],
            shard_id: ShardId(1),
            swap_type: SwapType::EndEpoch,
        });
        let random = Instruction::Random(RandomInstruction { random_number: 3 });

        let mut ctx = UpdateContext::default();
        state
            .process(&env(10), &[swap_0, swap_1, random], &store, &mut ctx)
            .unwrap();

        assert_eq!(state.v2.base.committee(ShardId(0)).len(), 7);
        assert_eq!(state.v2.base.substitute(ShardId(0)), &[key(9), key(10)]);
        assert_eq!(state.v2.base.committee(ShardId(1)).len(), 3);
        assert_eq!(state.v2.base.substitute(ShardId(1)), &[key(1)]);

        let mut syncing: Vec<String> = (70..=75).map(key_str).collect();
        syncing.push(key_str(50));
        assert_eq!(state.sync_pool(ShardId(1)), syncing.as_slice());
        assert!(state.sync_pool(ShardId(0)).is_empty());
    }

    #[test]
    fn test_unstake_syncing_key_stops_auto_stake() {
        let store = InMemoryStakerStore::new();
        let mut state = state(&store);
        state
            .v2
            .base
            .record_stake(&key_str(61), "r", "tx61", true, 1, &store)
            .unwrap();
        state.sync_pool.insert(ShardId(0), vec![key_str(61)]);

        let mut ctx = UpdateContext::default();
        let unstake = Instruction::Unstake(UnstakeInstruction {
            public_keys: vec![key_str(61)],
        });
        state.process(&env(3), &[unstake], &store, &mut ctx).unwrap();
        assert_eq!(ctx.change.stop_auto_stake, vec![key_str(61)]);
        assert_eq!(state.sync_pool(ShardId(0)), &[key_str(61)]);
    }
}
