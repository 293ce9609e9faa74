// Additive diff of every pool mutation made while processing one block.
//
// SAFETY INVARIANTS:
// 1. A key recorded as added to a pool is cancelled, not duplicated, when the
//    same block later removes it from that pool (and vice versa)
// 2. All maps are ordered so serialized changes are byte-identical across nodes

use crate::key::CommitteePublicKey;
use committee_rules::ShardId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Record `key` as added, or cancel a pending removal of it.
fn note_added<T: PartialEq + Clone>(added: &mut Vec<T>, removed: &mut Vec<T>, key: &T) {
    if let Some(pos) = removed.iter().position(|k| k == key) {
        removed.remove(pos);
    } else if !added.contains(key) {
        added.push(key.clone());
    }
}

fn note_removed<T: PartialEq + Clone>(added: &mut Vec<T>, removed: &mut Vec<T>, key: &T) {
    note_added(removed, added, key)
}

fn shard_lists<'a, T>(
    map: &'a mut BTreeMap<ShardId, Vec<T>>,
    other: &'a mut BTreeMap<ShardId, Vec<T>>,
    shard: ShardId,
) -> (&'a mut Vec<T>, &'a mut Vec<T>)
where
    T: Clone,
{
    (map.entry(shard).or_default(), other.entry(shard).or_default())
}

fn prune<T>(map: &mut BTreeMap<ShardId, Vec<T>>) {
    map.retain(|_, v| !v.is_empty());
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeChange {
    pub next_epoch_shard_candidate_added: Vec<CommitteePublicKey>,
    pub next_epoch_shard_candidate_removed: Vec<CommitteePublicKey>,

    /// V1 only
    pub current_epoch_shard_candidate_added: Vec<CommitteePublicKey>,
    pub current_epoch_shard_candidate_removed: Vec<CommitteePublicKey>,

    pub shard_substitute_added: BTreeMap<ShardId, Vec<CommitteePublicKey>>,
    pub shard_substitute_removed: BTreeMap<ShardId, Vec<CommitteePublicKey>>,
    pub shard_committee_added: BTreeMap<ShardId, Vec<CommitteePublicKey>>,
    pub shard_committee_removed: BTreeMap<ShardId, Vec<CommitteePublicKey>>,

    pub syncing_pool_added: BTreeMap<ShardId, Vec<String>>,
    pub syncing_pool_removed: BTreeMap<ShardId, Vec<String>>,
    pub finished_sync_validators: BTreeMap<ShardId, Vec<String>>,

    pub stop_auto_stake: Vec<String>,
    pub removed_staker: Vec<String>,
    pub slashing_committee: BTreeMap<ShardId, Vec<String>>,

    pub beacon_committee_added: Vec<String>,
    pub beacon_committee_removed: Vec<String>,
    pub beacon_pending_added: Vec<String>,
    pub beacon_pending_removed: Vec<String>,
    pub beacon_waiting_added: Vec<String>,
    pub beacon_waiting_removed: Vec<String>,
    pub beacon_locking_added: Vec<String>,
    pub beacon_locking_removed: Vec<String>,
}

impl CommitteeChange {
    pub fn is_empty(&self) -> bool {
        *self == CommitteeChange::default()
    }

    pub fn add_next_epoch_candidate(&mut self, key: &CommitteePublicKey) {
        note_added(
            &mut self.next_epoch_shard_candidate_added,
            &mut self.next_epoch_shard_candidate_removed,
            key,
        );
    }

    pub fn remove_next_epoch_candidate(&mut self, key: &CommitteePublicKey) {
        note_removed(
            &mut self.next_epoch_shard_candidate_added,
            &mut self.next_epoch_shard_candidate_removed,
            key,
        );
    }

    pub fn add_current_epoch_candidate(&mut self, key: &CommitteePublicKey) {
        note_added(
            &mut self.current_epoch_shard_candidate_added,
            &mut self.current_epoch_shard_candidate_removed,
            key,
        );
    }

    pub fn remove_current_epoch_candidate(&mut self, key: &CommitteePublicKey) {
        note_removed(
            &mut self.current_epoch_shard_candidate_added,
            &mut self.current_epoch_shard_candidate_removed,
            key,
        );
    }

    pub fn add_shard_substitute(&mut self, shard: ShardId, key: &CommitteePublicKey) {
        let (added, removed) =
            shard_lists(&mut self.shard_substitute_added, &mut self.shard_substitute_removed, shard);
        note_added(added, removed, key);
    }

    pub fn remove_shard_substitute(&mut self, shard: ShardId, key: &CommitteePublicKey) {
        let (added, removed) =
            shard_lists(&mut self.shard_substitute_added, &mut self.shard_substitute_removed, shard);
        note_removed(added, removed, key);
    }

    pub fn add_shard_committee(&mut self, shard: ShardId, key: &CommitteePublicKey) {
        let (added, removed) =
            shard_lists(&mut self.shard_committee_added, &mut self.shard_committee_removed, shard);
        note_added(added, removed, key);
    }

    pub fn remove_shard_committee(&mut self, shard: ShardId, key: &CommitteePublicKey) {
        let (added, removed) =
            shard_lists(&mut self.shard_committee_added, &mut self.shard_committee_removed, shard);
        note_removed(added, removed, key);
    }

    pub fn add_syncing(&mut self, shard: ShardId, key: &str) {
        let (added, removed) =
            shard_lists(&mut self.syncing_pool_added, &mut self.syncing_pool_removed, shard);
        note_added(added, removed, &key.to_string());
    }

    pub fn remove_syncing(&mut self, shard: ShardId, key: &str) {
        let (added, removed) =
            shard_lists(&mut self.syncing_pool_added, &mut self.syncing_pool_removed, shard);
        note_removed(added, removed, &key.to_string());
    }

    pub fn add_finished_sync(&mut self, shard: ShardId, key: &str) {
        self.finished_sync_validators
            .entry(shard)
            .or_default()
            .push(key.to_string());
    }

    pub fn add_stop_auto_stake(&mut self, key: &str) {
        if !self.stop_auto_stake.iter().any(|k| k == key) {
            self.stop_auto_stake.push(key.to_string());
        }
    }

    pub fn add_removed_staker(&mut self, key: &str) {
        if !self.removed_staker.iter().any(|k| k == key) {
            self.removed_staker.push(key.to_string());
        }
    }

    pub fn add_slashed(&mut self, shard: ShardId, key: &str) {
        self.slashing_committee
            .entry(shard)
            .or_default()
            .push(key.to_string());
    }

    pub fn add_beacon_committee(&mut self, key: &str) {
        note_added(&mut self.beacon_committee_added, &mut self.beacon_committee_removed, &key.to_string());
    }

    pub fn remove_beacon_committee(&mut self, key: &str) {
        note_removed(&mut self.beacon_committee_added, &mut self.beacon_committee_removed, &key.to_string());
    }

    pub fn add_beacon_pending(&mut self, key: &str) {
        note_added(&mut self.beacon_pending_added, &mut self.beacon_pending_removed, &key.to_string());
    }

    pub fn remove_beacon_pending(&mut self, key: &str) {
        note_removed(&mut self.beacon_pending_added, &mut self.beacon_pending_removed, &key.to_string());
    }

    pub fn add_beacon_waiting(&mut self, key: &str) {
        note_added(&mut self.beacon_waiting_added, &mut self.beacon_waiting_removed, &key.to_string());
    }

    pub fn remove_beacon_waiting(&mut self, key: &str) {
        note_removed(&mut self.beacon_waiting_added, &mut self.beacon_waiting_removed, &key.to_string());
    }

    pub fn add_beacon_locking(&mut self, key: &str) {
        note_added(&mut self.beacon_locking_added, &mut self.beacon_locking_removed, &key.to_string());
    }

    pub fn remove_beacon_locking(&mut self, key: &str) {
        note_removed(&mut self.beacon_locking_added, &mut self.beacon_locking_removed, &key.to_string());
    }

    /// Drop empty per-shard entries left behind by cancelled additions.
    pub fn normalize(&mut self) {
        prune(&mut self.shard_substitute_added);
        prune(&mut self.shard_substitute_removed);
        prune(&mut self.shard_committee_added);
        prune(&mut self.shard_committee_removed);
        prune(&mut self.syncing_pool_added);
        prune(&mut self.syncing_pool_removed);
        prune(&mut self.finished_sync_validators);
        prune(&mut self.slashing_committee);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> CommitteePublicKey {
        CommitteePublicKey::new(vec![b])
    }

    #[test]
    fn test_add_then_remove_cancels() {
        let mut change = CommitteeChange::default();
        change.add_shard_substitute(ShardId(1), &key(1));
        change.remove_shard_substitute(ShardId(1), &key(1));
        change.normalize();
        assert!(change.is_empty());
    }

    #[test]
    fn test_remove_then_add_cancels() {
        let mut change = CommitteeChange::default();
        change.remove_next_epoch_candidate(&key(3));
        change.add_next_epoch_candidate(&key(3));
        assert!(change.next_epoch_shard_candidate_added.is_empty());
        assert!(change.next_epoch_shard_candidate_removed.is_empty());
    }

    #[test]
    fn test_additions_are_deduplicated() {
        let mut change = CommitteeChange::default();
        change.add_beacon_waiting("k");
        change.add_beacon_waiting("k");
        change.add_stop_auto_stake("k");
        change.add_stop_auto_stake("k");
        assert_eq!(change.beacon_waiting_added, vec!["k"]);
        assert_eq!(change.stop_auto_stake, vec!["k"]);
    }

    #[test]
    fn test_serializes_to_json() {
        let mut change = CommitteeChange::default();
        change.add_syncing(ShardId(2), "abc");
        let json = serde_json::to_string(&change).unwrap();
        let back: CommitteeChange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }
}
