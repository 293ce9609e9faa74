// Chain identifiers shared by every committee rule.
//
// SAFETY INVARIANTS:
// 1. Shard ids are dense: 0..active_shards
// 2. The beacon chain is addressed as chain -1 and never as a shard

use serde::{Serialize, Deserialize};
use std::fmt;

/// Chain id used on the wire for the beacon chain.
pub const BEACON_CHAIN_ID: i32 = -1;

/// ShardId identifies one shard chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct ShardId(pub u8);

impl ShardId {
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// All shard ids for a network with `active_shards` shards.
    pub fn all(active_shards: usize) -> impl Iterator<Item = ShardId> {
        (0..active_shards.min(u8::MAX as usize + 1)).map(|s| ShardId(s as u8))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either a shard or the beacon chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum ChainId {
    Beacon,
    Shard(ShardId),
}

impl ChainId {
    /// Parse the wire form (`-1` for beacon, `0..=255` for shards).
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            BEACON_CHAIN_ID => Some(ChainId::Beacon),
            v if (0..=u8::MAX as i32).contains(&v) => Some(ChainId::Shard(ShardId(v as u8))),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> i32 {
        match self {
            ChainId::Beacon => BEACON_CHAIN_ID,
            ChainId::Shard(shard) => shard.0 as i32,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_wire_form() {
        assert_eq!(ChainId::from_wire(-1), Some(ChainId::Beacon));
        assert_eq!(ChainId::from_wire(7), Some(ChainId::Shard(ShardId(7))));
        assert_eq!(ChainId::from_wire(-2), None);
        assert_eq!(ChainId::from_wire(256), None);
        assert_eq!(ChainId::Shard(ShardId(3)).to_wire(), 3);
    }

    #[test]
    fn test_all_shards() {
        let shards: Vec<ShardId> = ShardId::all(3).collect();
        assert_eq!(shards, vec![ShardId(0), ShardId(1), ShardId(2)]);
    }
}
