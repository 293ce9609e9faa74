// COMMITTEE ENGINE
// Engine Module - Final and uncommitted committee state for one beacon chain
//
// SAFETY INVARIANTS:
// 1. The final state only changes through commit (or an explicit upgrade)
// 2. Every block is applied to a fresh clone of the final state
// 3. Store writes made while applying a block stay staged until commit
// 4. Commit requires the block header's state hash to match the computed one
// 5. Readers only ever see cloned snapshots of the final state

use crate::environment::{CommitteeEnvironment, CommitteeParams};
use crate::error::{CommitteeStateError, Result};
use crate::hash::StateHash;
use crate::instruction::SwapShardInstruction;
use crate::key::CommitteePublicKey;
use crate::state::{CommitteeState, CommitteeUpdate, GenesisCommittee};
use crate::store::{StagedStore, StakerStore};
use committee_rules::ShardId;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;

/// A processed block waiting for its header hash to be confirmed.
struct Uncommitted {
    state: CommitteeState,
    staged: StagedStore,
    hash: StateHash,
    beacon_height: u64,
}

/// Owns the committee state of the beacon chain.
///
/// Block processing is serialized through `&mut self`; other threads read
/// through [`CommitteeReader`] handles.
pub struct CommitteeEngine {
    params: CommitteeParams,
    store: Arc<dyn StakerStore>,
    final_state: Arc<RwLock<CommitteeState>>,
    uncommitted: Option<Uncommitted>,
}

impl CommitteeEngine {
    pub fn new(state: CommitteeState, params: CommitteeParams, store: Arc<dyn StakerStore>) -> Self {
        CommitteeEngine {
            params,
            store,
            final_state: Arc::new(RwLock::new(state)),
            uncommitted: None,
        }
    }

    /// Build the genesis state at `version`. Genesis staker records are
    /// written straight to the store.
    pub fn from_genesis(
        version: u8,
        genesis: &GenesisCommittee,
        params: CommitteeParams,
        store: Arc<dyn StakerStore>,
    ) -> Result<Self> {
        let state = CommitteeState::from_genesis(version, genesis, &params, store.as_ref())?;
        info!(
            "Genesis committee V{}: {} beacon validators, {} shards",
            version,
            state.beacon_committee().len(),
            state.all_shard_committees().len()
        );
        Ok(Self::new(state, params, store))
    }

    pub fn params(&self) -> &CommitteeParams {
        &self.params
    }

    pub fn store(&self) -> &Arc<dyn StakerStore> {
        &self.store
    }

    pub fn reader(&self) -> CommitteeReader {
        CommitteeReader {
            state: Arc::clone(&self.final_state),
        }
    }

    pub fn snapshot(&self) -> CommitteeState {
        self.final_state.read().clone()
    }

    pub fn final_hash(&self) -> Result<StateHash> {
        self.final_state.read().hash()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.uncommitted.is_some()
    }

    /// The state produced by the last `update_committee_state`, if any.
    pub fn uncommitted_state(&self) -> Option<&CommitteeState> {
        self.uncommitted.as_ref().map(|u| &u.state)
    }

    /// Apply one block on top of the final state. The result replaces any
    /// previous uncommitted state; on error nothing is kept.
    pub fn update_committee_state(
        &mut self,
        env: &CommitteeEnvironment,
        instructions: &[Vec<String>],
    ) -> Result<CommitteeUpdate> {
        if let Some(prev) = self.uncommitted.take() {
            warn!(
                "Dropping uncommitted committee state of height {}",
                prev.beacon_height
            );
        }

        let mut state = self.final_state.read().clone();
        let staged = StagedStore::new(Arc::clone(&self.store));
        let update = state.update_committee_state(env, instructions, &staged)?;
        debug!(
            "Height {}: {} staged store writes",
            env.beacon_height,
            staged.pending_writes()
        );

        self.uncommitted = Some(Uncommitted {
            state,
            staged,
            hash: update.state_hash.clone(),
            beacon_height: env.beacon_height,
        });
        Ok(update)
    }

    /// Promote the uncommitted state once the block header confirms its hash.
    pub fn commit(&mut self, expected: &StateHash) -> Result<()> {
        let pending = self
            .uncommitted
            .take()
            .ok_or(CommitteeStateError::NoUncommittedState)?;

        if &pending.hash != expected {
            let got = pending.hash.digest().to_hex();
            let expected = expected.digest().to_hex();
            error!(
                "Committee hash mismatch at height {}: expected {}, got {}",
                pending.beacon_height, expected, got
            );
            return Err(CommitteeStateError::HashMismatch { expected, got });
        }

        pending.staged.flush()?;
        *self.final_state.write() = pending.state;
        info!("Committed committee state at height {}", pending.beacon_height);
        Ok(())
    }

    /// Drop the uncommitted state and its staged writes. Returns whether
    /// there was one.
    pub fn abort_uncommitted(&mut self) -> bool {
        match self.uncommitted.take() {
            Some(prev) => {
                info!(
                    "Aborted uncommitted committee state of height {}",
                    prev.beacon_height
                );
                true
            }
            None => false,
        }
    }

    /// Upgrade the final state to the next version. Any uncommitted state
    /// is dropped.
    pub fn upgrade(&mut self) -> Result<u8> {
        self.abort_uncommitted();
        let mut guard = self.final_state.write();
        let upgraded = guard.clone().upgrade(&self.params, self.store.as_ref())?;
        *guard = upgraded;
        Ok(guard.version())
    }

    pub fn generate_swap_shard_instruction(
        &self,
        env: &CommitteeEnvironment,
        shard: ShardId,
    ) -> Result<Option<SwapShardInstruction>> {
        self.final_state
            .read()
            .generate_swap_shard_instruction(env, shard)
    }
}

/// Read-only handle on the final committee state.
#[derive(Clone)]
pub struct CommitteeReader {
    state: Arc<RwLock<CommitteeState>>,
}

impl CommitteeReader {
    pub fn snapshot(&self) -> CommitteeState {
        self.state.read().clone()
    }

    pub fn version(&self) -> u8 {
        self.state.read().version()
    }

    pub fn hash(&self) -> Result<StateHash> {
        self.state.read().hash()
    }

    pub fn beacon_committee(&self) -> Vec<CommitteePublicKey> {
        self.state.read().beacon_committee().to_vec()
    }

    pub fn shard_committee(&self, shard: ShardId) -> Vec<CommitteePublicKey> {
        self.state.read().shard_committee(shard).to_vec()
    }

    pub fn shard_substitute(&self, shard: ShardId) -> Vec<CommitteePublicKey> {
        self.state.read().shard_substitute(shard).to_vec()
    }
}
