// CHAIN PARAMETERS AND PER-BLOCK ENVIRONMENT
// Environment Module - Everything a committee update reads but never writes
//
// SAFETY INVARIANTS:
// 1. CommitteeParams are fixed at genesis; changing them is a hard fork
// 2. Epoch boundaries derive from beacon height alone
// 3. An environment is built for one block and borrowed immutably by all handlers

use committee_rules::{
    default_penalties, penalties_for, MissingSignature, MissingSignatureCounter, Penalty,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Chain-constant committee parameters.
///
/// SAFETY: every node must load identical values or the computed
/// committees diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitteeParams {
    pub active_shards: usize,

    pub min_shard_committee_size: usize,

    pub max_shard_committee_size: usize,

    pub min_beacon_committee_size: usize,

    pub max_beacon_committee_size: usize,

    /// Committee prefix exempt from swap-out and slashing
    pub number_of_fixed_shard_block_validator: usize,

    /// Must be > 0
    pub blocks_per_epoch: u64,

    /// Height inside the epoch at which candidates are reserved for the next random round
    pub random_time_height_in_epoch: u64,

    pub swap_rule_version: u8,

    pub assign_rule_version: u8,

    /// Percent of each block reward kept by the DAO
    pub dao_percent: u8,

    /// Stake attributed to each beacon validator when upgrading to V4
    pub beacon_upgrade_staking_amount: u64,

    pub missing_signature_penalty: Vec<Penalty>,
}

impl Default for CommitteeParams {
    fn default() -> Self {
        CommitteeParams {
            active_shards: 8,
            min_shard_committee_size: 4,
            max_shard_committee_size: 32,
            min_beacon_committee_size: 4,
            max_beacon_committee_size: 32,
            number_of_fixed_shard_block_validator: 4,
            blocks_per_epoch: 350,
            random_time_height_in_epoch: 175,
            swap_rule_version: 3,
            assign_rule_version: 3,
            dao_percent: 10,
            beacon_upgrade_staking_amount: 1_750_000_000_000,
            missing_signature_penalty: default_penalties(),
        }
    }
}

impl CommitteeParams {
    /// Validated constructor for the size-related parameters; the rest keep
    /// their defaults.
    pub fn new(
        active_shards: usize,
        min_shard_committee_size: usize,
        max_shard_committee_size: usize,
        number_of_fixed_shard_block_validator: usize,
        blocks_per_epoch: u64,
    ) -> Result<Self, String> {
        let params = CommitteeParams {
            active_shards,
            min_shard_committee_size,
            max_shard_committee_size,
            number_of_fixed_shard_block_validator,
            blocks_per_epoch,
            random_time_height_in_epoch: blocks_per_epoch / 2,
            ..Default::default()
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.active_shards == 0 || self.active_shards > u8::MAX as usize + 1 {
            return Err(format!("active_shards must be in 1..=256, got {}", self.active_shards));
        }
        if self.blocks_per_epoch == 0 {
            return Err("blocks_per_epoch must be > 0".to_string());
        }
        if self.random_time_height_in_epoch >= self.blocks_per_epoch {
            return Err("random_time_height_in_epoch must fall inside the epoch".to_string());
        }
        if self.min_shard_committee_size > self.max_shard_committee_size {
            return Err("min_shard_committee_size exceeds max_shard_committee_size".to_string());
        }
        if self.min_beacon_committee_size > self.max_beacon_committee_size {
            return Err("min_beacon_committee_size exceeds max_beacon_committee_size".to_string());
        }
        if self.number_of_fixed_shard_block_validator > self.min_shard_committee_size {
            return Err(
                "number_of_fixed_shard_block_validator exceeds min_shard_committee_size".to_string(),
            );
        }
        if self.dao_percent > 100 {
            return Err("dao_percent must be <= 100".to_string());
        }
        Ok(())
    }

    /// Counter for `committees` judged by the configured penalty table.
    pub fn signature_counter(&self, committees: &[String]) -> MissingSignatureCounter {
        MissingSignatureCounter::new(committees, self.missing_signature_penalty.clone())
    }

    pub fn from_json_str(json: &str) -> Result<Self, String> {
        let params: CommitteeParams =
            serde_json::from_str(json).map_err(|e| format!("invalid committee params: {}", e))?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::from_json_str(&json)
    }

    /// Epoch of a beacon height (heights start at 1).
    pub fn epoch_of(&self, beacon_height: u64) -> u64 {
        beacon_height.saturating_sub(1) / self.blocks_per_epoch + 1
    }

    pub fn is_first_block_of_epoch(&self, beacon_height: u64) -> bool {
        self.blocks_per_epoch == 1 || beacon_height % self.blocks_per_epoch == 1
    }

    pub fn is_last_block_of_epoch(&self, beacon_height: u64) -> bool {
        beacon_height % self.blocks_per_epoch == 0
    }

    pub fn is_random_time(&self, beacon_height: u64) -> bool {
        beacon_height % self.blocks_per_epoch == self.random_time_height_in_epoch
    }
}

/// Read-only inputs for one committee update.
#[derive(Debug, Clone)]
pub struct CommitteeEnvironment {
    pub params: CommitteeParams,

    pub beacon_height: u64,

    pub epoch: u64,

    /// Seed used for swap re-queue and sync placement
    pub random_number: i64,

    pub is_beacon_random_time: bool,

    /// Shard-level signing statistics for the closing period
    pub missing_signature: BTreeMap<String, MissingSignature>,

    /// Keys penalised by the missed-signature table
    pub missing_signature_penalty: BTreeMap<String, Penalty>,

    /// Beacon committee indices that signed the previous beacon block
    pub previous_block_signers: Option<Vec<usize>>,
}

impl CommitteeEnvironment {
    pub fn builder(params: &CommitteeParams) -> CommitteeEnvironmentBuilder {
        CommitteeEnvironmentBuilder {
            env: CommitteeEnvironment {
                params: params.clone(),
                beacon_height: 1,
                epoch: 1,
                random_number: 0,
                is_beacon_random_time: false,
                missing_signature: BTreeMap::new(),
                missing_signature_penalty: BTreeMap::new(),
                previous_block_signers: None,
            },
            epoch_set: false,
            random_time_set: false,
        }
    }

    pub fn is_first_block_of_epoch(&self) -> bool {
        self.params.is_first_block_of_epoch(self.beacon_height)
    }

    pub fn is_last_block_of_epoch(&self) -> bool {
        self.params.is_last_block_of_epoch(self.beacon_height)
    }
}

/// Consuming builder for CommitteeEnvironment. Epoch and random time are
/// derived from the height unless set explicitly.
#[derive(Debug, Clone)]
pub struct CommitteeEnvironmentBuilder {
    env: CommitteeEnvironment,
    epoch_set: bool,
    random_time_set: bool,
}

impl CommitteeEnvironmentBuilder {
    pub fn beacon_height(mut self, height: u64) -> Self {
        self.env.beacon_height = height;
        self
    }

    pub fn epoch(mut self, epoch: u64) -> Self {
        self.env.epoch = epoch;
        self.epoch_set = true;
        self
    }

    pub fn random_number(mut self, random_number: i64) -> Self {
        self.env.random_number = random_number;
        self
    }

    pub fn beacon_random_time(mut self, is_random_time: bool) -> Self {
        self.env.is_beacon_random_time = is_random_time;
        self.random_time_set = true;
        self
    }

    pub fn missing_signature(mut self, stats: BTreeMap<String, MissingSignature>) -> Self {
        self.env.missing_signature = stats;
        self
    }

    pub fn missing_signature_penalty(mut self, penalties: BTreeMap<String, Penalty>) -> Self {
        self.env.missing_signature_penalty = penalties;
        self
    }

    /// Statistics from a signature counter, penalised with the chain's
    /// configured table.
    pub fn signature_counter(mut self, counter: &MissingSignatureCounter) -> Self {
        self.env.missing_signature = counter.missing_signature().clone();
        self.env.missing_signature_penalty = penalties_for(
            &self.env.missing_signature,
            &self.env.params.missing_signature_penalty,
        );
        self
    }

    pub fn previous_block_signers(mut self, signers: Vec<usize>) -> Self {
        self.env.previous_block_signers = Some(signers);
        self
    }

    pub fn build(mut self) -> CommitteeEnvironment {
        if !self.epoch_set {
            self.env.epoch = self.env.params.epoch_of(self.env.beacon_height);
        }
        if !self.random_time_set {
            self.env.is_beacon_random_time = self.env.params.is_random_time(self.env.beacon_height);
        }
        self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validation() {
        assert!(CommitteeParams::new(8, 4, 32, 4, 350).is_ok());
        assert!(CommitteeParams::new(0, 4, 32, 4, 350).is_err());
        assert!(CommitteeParams::new(8, 4, 32, 4, 0).is_err());
        assert!(CommitteeParams::new(8, 33, 32, 4, 350).is_err());
        assert!(CommitteeParams::new(8, 4, 32, 5, 350).is_err());
    }

    #[test]
    fn test_params_from_json_uses_defaults() {
        let params =
            CommitteeParams::from_json_str(r#"{"active_shards": 2, "blocks_per_epoch": 10, "random_time_height_in_epoch": 5}"#)
                .unwrap();
        assert_eq!(params.active_shards, 2);
        assert_eq!(params.max_shard_committee_size, 32);
        assert_eq!(params.missing_signature_penalty, default_penalties());
        assert!(CommitteeParams::from_json_str(r#"{"blocks_per_epoch": 0}"#).is_err());
        assert!(CommitteeParams::from_json_str("not json").is_err());
    }

    #[test]
    fn test_epoch_boundaries() {
        let params = CommitteeParams::new(2, 4, 8, 2, 10).unwrap();
        assert_eq!(params.epoch_of(1), 1);
        assert_eq!(params.epoch_of(10), 1);
        assert_eq!(params.epoch_of(11), 2);
        assert!(params.is_first_block_of_epoch(11));
        assert!(params.is_last_block_of_epoch(20));
        assert!(params.is_random_time(15));
        assert!(!params.is_random_time(16));
    }

    #[test]
    fn test_single_block_epochs() {
        let mut params = CommitteeParams::new(2, 4, 8, 2, 10).unwrap();
        params.blocks_per_epoch = 1;
        params.random_time_height_in_epoch = 0;
        assert!(params.validate().is_ok());
        for height in 1..=4 {
            assert!(params.is_first_block_of_epoch(height));
            assert!(params.is_last_block_of_epoch(height));
            assert_eq!(params.epoch_of(height), height);
        }
    }

    #[test]
    fn test_configured_penalty_table_drives_slashing() {
        let committee = vec!["steady".to_string(), "sleepy".to_string()];
        let strict = vec![Penalty {
            min_percent: 20,
            time: 0,
            force_unstake: true,
        }];

        // "sleepy" misses one block in four: 25 percent
        let mut counter = MissingSignatureCounter::with_default_penalties(&committee);
        for signers in [vec![0, 1], vec![0, 1], vec![0], vec![0, 1]] {
            counter.add_missing_signature(&signers, &committee).unwrap();
        }

        let lenient = CommitteeParams::new(2, 4, 8, 2, 10).unwrap();
        let env = CommitteeEnvironment::builder(&lenient)
            .signature_counter(&counter)
            .build();
        assert!(env.missing_signature_penalty.is_empty());
        assert_eq!(env.missing_signature["sleepy"].missing, 1);

        let mut params = lenient.clone();
        params.missing_signature_penalty = strict.clone();
        let env = CommitteeEnvironment::builder(&params)
            .signature_counter(&counter)
            .build();
        assert_eq!(env.missing_signature_penalty.len(), 1);
        assert_eq!(env.missing_signature_penalty["sleepy"], strict[0]);

        let counter = params.signature_counter(&committee);
        assert_eq!(counter.penalties(), strict.as_slice());
    }

    #[test]
    fn test_builder_derives_epoch_and_random_time() {
        let params = CommitteeParams::new(2, 4, 8, 2, 10).unwrap();
        let env = CommitteeEnvironment::builder(&params)
            .beacon_height(25)
            .random_number(99)
            .build();
        assert_eq!(env.epoch, 3);
        assert!(env.is_beacon_random_time);
        assert_eq!(env.random_number, 99);

        let env = CommitteeEnvironment::builder(&params)
            .beacon_height(25)
            .beacon_random_time(false)
            .epoch(7)
            .build();
        assert_eq!(env.epoch, 7);
        assert!(!env.is_beacon_random_time);
    }
}
