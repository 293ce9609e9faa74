// BLOCK REWARD SPLIT
// Reward Module - Shard block reward shared by committees, DAO and custodian
//
// SAFETY INVARIANTS:
// 1. Integer arithmetic only; every node computes the same split
// 2. The four shares always sum to the input total

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSplit {
    pub shard: u64,
    pub beacon: u64,
    pub dao: u64,
    pub custodian: u64,
}

/// Split `total` for one shard block.
///
/// The DAO takes `dao_percent`; the rest is shared shard:beacon in the ratio
/// `shard_committee_len : 2 * beacon_committee_len / active_shards`.
/// `custodian_percent`, when set, is carved out of the DAO share.
pub fn split_reward(
    total: u64,
    shard_committee_len: usize,
    beacon_committee_len: usize,
    active_shards: usize,
    dao_percent: u8,
    custodian_percent: Option<u8>,
) -> RewardSplit {
    let total_wide = u128::from(total);
    let mut dao = (total_wide * u128::from(dao_percent.min(100)) / 100) as u64;
    let rest = u128::from(total - dao);

    // Cross-multiplied by active_shards to stay in integers
    let shard_weight = shard_committee_len as u128 * active_shards as u128;
    let beacon_weight = 2 * beacon_committee_len as u128;
    let shard_wide = if shard_weight + beacon_weight == 0 {
        rest
    } else {
        rest * shard_weight / (shard_weight + beacon_weight)
    };
    let shard = shard_wide as u64;
    let beacon = rest as u64 - shard;

    let custodian = match custodian_percent {
        Some(p) => (u128::from(dao) * u128::from(p.min(100)) / 100) as u64,
        None => 0,
    };
    dao -= custodian;

    RewardSplit {
        shard,
        beacon,
        dao,
        custodian,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reward_ratio() {
        // 8 shards, 32 shard members, 32 beacon members: 256 : 64
        let split = split_reward(1_000, 32, 32, 8, 10, None);
        assert_eq!(split.dao, 100);
        assert_eq!(split.shard, 720);
        assert_eq!(split.beacon, 180);
        assert_eq!(split.custodian, 0);
    }

    #[test]
    fn test_split_reward_custodian_and_conservation() {
        let split = split_reward(999_999, 21, 7, 8, 10, Some(10));
        assert_eq!(split.custodian, 9_999);
        assert_eq!(split.shard + split.beacon + split.dao + split.custodian, 999_999);
    }

    #[test]
    fn test_split_reward_empty_committees() {
        let split = split_reward(50, 0, 0, 8, 0, None);
        assert_eq!(split.shard, 50);
        assert_eq!(split.beacon, 0);

        let split = split_reward(u64::MAX, 64, 64, 8, 100, None);
        assert_eq!(split.dao, u64::MAX);
        assert_eq!(split.shard + split.beacon, 0);
    }
}
