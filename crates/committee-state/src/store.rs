// STAKER METADATA STORE
// Store Module - Key-value access to shard and beacon staker records
//
// SAFETY INVARIANTS:
// 1. Every call is synchronous; an Err aborts the whole block
// 2. Writes made while validating a block stay staged until the block commits
// 3. Records are bincode-encoded, so equal records are byte-identical

use crate::error::StoreError;
use crate::instruction::ReturnReason;
use dashmap::DashMap;
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shard staking record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakerInfo {
    pub reward_receiver: String,

    pub auto_staking: bool,

    pub tx_staking_id: String,

    pub beacon_confirm_height: u64,
}

/// One staking transaction of a beacon staker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingTxInfo {
    pub amount: u64,
    pub height: u64,
}

/// Beacon staking record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconStakerInfo {
    pub reward_receiver: String,

    pub beacon_confirm_height: u64,

    /// Staking tx id -> amount and height
    pub staking_txs: BTreeMap<String, StakingTxInfo>,

    pub finish_sync: bool,

    /// Consecutive epochs of good shard service
    pub shard_active_time: u32,

    pub unstaking: bool,

    pub locking_epoch: u64,

    pub locking_reason: Option<ReturnReason>,
}

impl BeaconStakerInfo {
    pub fn new(reward_receiver: String, height: u64, tx: String, amount: u64) -> Self {
        let mut staking_txs = BTreeMap::new();
        staking_txs.insert(tx, StakingTxInfo { amount, height });
        BeaconStakerInfo {
            reward_receiver,
            beacon_confirm_height: height,
            staking_txs,
            finish_sync: false,
            shard_active_time: 0,
            unstaking: false,
            locking_epoch: 0,
            locking_reason: None,
        }
    }

    pub fn total_staking_amount(&self) -> u64 {
        self.staking_txs
            .values()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.amount))
    }

    pub fn add_staking(&mut self, tx: String, height: u64, amount: u64) {
        let entry = self
            .staking_txs
            .entry(tx)
            .or_insert(StakingTxInfo { amount: 0, height });
        entry.amount = entry.amount.saturating_add(amount);
    }
}

/// Narrow view of the persistent staker database.
pub trait StakerStore: Send + Sync {
    fn get_staker_info(&self, key: &str) -> Result<Option<StakerInfo>, StoreError>;

    fn store_staker_info(&self, key: &str, info: &StakerInfo) -> Result<(), StoreError>;

    fn delete_staker_info(&self, key: &str) -> Result<(), StoreError>;

    fn get_beacon_staker_info(&self, key: &str) -> Result<Option<BeaconStakerInfo>, StoreError>;

    fn store_beacon_staker_info(&self, key: &str, info: &BeaconStakerInfo) -> Result<(), StoreError>;

    fn delete_beacon_staker_info(&self, key: &str) -> Result<(), StoreError>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

/// In-memory store holding bincode-encoded records.
#[derive(Debug, Default)]
pub struct InMemoryStakerStore {
    stakers: DashMap<String, Vec<u8>>,
    beacon_stakers: DashMap<String, Vec<u8>>,
}

impl InMemoryStakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staker_count(&self) -> usize {
        self.stakers.len()
    }

    pub fn beacon_staker_count(&self) -> usize {
        self.beacon_stakers.len()
    }
}

impl StakerStore for InMemoryStakerStore {
    fn get_staker_info(&self, key: &str) -> Result<Option<StakerInfo>, StoreError> {
        self.stakers.get(key).map(|v| decode(v.value())).transpose()
    }

    fn store_staker_info(&self, key: &str, info: &StakerInfo) -> Result<(), StoreError> {
        self.stakers.insert(key.to_string(), encode(info)?);
        Ok(())
    }

    fn delete_staker_info(&self, key: &str) -> Result<(), StoreError> {
        self.stakers.remove(key);
        Ok(())
    }

    fn get_beacon_staker_info(&self, key: &str) -> Result<Option<BeaconStakerInfo>, StoreError> {
        self.beacon_stakers.get(key).map(|v| decode(v.value())).transpose()
    }

    fn store_beacon_staker_info(&self, key: &str, info: &BeaconStakerInfo) -> Result<(), StoreError> {
        self.beacon_stakers.insert(key.to_string(), encode(info)?);
        Ok(())
    }

    fn delete_beacon_staker_info(&self, key: &str) -> Result<(), StoreError> {
        self.beacon_stakers.remove(key);
        Ok(())
    }
}

/// Write buffer over a base store. Reads see staged writes first; nothing
/// reaches the base until `flush`. `None` marks a staged delete.
pub struct StagedStore {
    base: Arc<dyn StakerStore>,
    stakers: DashMap<String, Option<StakerInfo>>,
    beacon_stakers: DashMap<String, Option<BeaconStakerInfo>>,
}

impl StagedStore {
    pub fn new(base: Arc<dyn StakerStore>) -> Self {
        StagedStore {
            base,
            stakers: DashMap::new(),
            beacon_stakers: DashMap::new(),
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.stakers.len() + self.beacon_stakers.len()
    }

    /// Apply staged writes to the base store in key order.
    pub fn flush(self) -> Result<(), StoreError> {
        let stakers: BTreeMap<String, Option<StakerInfo>> = self.stakers.into_iter().collect();
        let beacon_stakers: BTreeMap<String, Option<BeaconStakerInfo>> =
            self.beacon_stakers.into_iter().collect();
        debug!(
            "Flushing {} staker and {} beacon staker writes",
            stakers.len(),
            beacon_stakers.len()
        );

        for (key, info) in stakers {
            match info {
                Some(info) => self.base.store_staker_info(&key, &info)?,
                None => self.base.delete_staker_info(&key)?,
            }
        }
        for (key, info) in beacon_stakers {
            match info {
                Some(info) => self.base.store_beacon_staker_info(&key, &info)?,
                None => self.base.delete_beacon_staker_info(&key)?,
            }
        }
        Ok(())
    }
}

impl StakerStore for StagedStore {
    fn get_staker_info(&self, key: &str) -> Result<Option<StakerInfo>, StoreError> {
        if let Some(staged) = self.stakers.get(key) {
            return Ok(staged.value().clone());
        }
        self.base.get_staker_info(key)
    }

    fn store_staker_info(&self, key: &str, info: &StakerInfo) -> Result<(), StoreError> {
        self.stakers.insert(key.to_string(), Some(info.clone()));
        Ok(())
    }

    fn delete_staker_info(&self, key: &str) -> Result<(), StoreError> {
        self.stakers.insert(key.to_string(), None);
        Ok(())
    }

    fn get_beacon_staker_info(&self, key: &str) -> Result<Option<BeaconStakerInfo>, StoreError> {
        if let Some(staged) = self.beacon_stakers.get(key) {
            return Ok(staged.value().clone());
        }
        self.base.get_beacon_staker_info(key)
    }

    fn store_beacon_staker_info(&self, key: &str, info: &BeaconStakerInfo) -> Result<(), StoreError> {
        self.beacon_stakers.insert(key.to_string(), Some(info.clone()));
        Ok(())
    }

    fn delete_beacon_staker_info(&self, key: &str) -> Result<(), StoreError> {
        self.beacon_stakers.insert(key.to_string(), None);
        Ok(())
    }
}
