// SHARD CANDIDATE ASSIGNMENT
// Assign Rule Module - Deterministic, load-balancing candidate placement
//
// SAFETY INVARIANTS:
// 1. Assignments are a pure function of (candidates, per-shard load, random seed)
// 2. Every candidate is assigned to exactly one shard (conservation)
// 3. Candidate order inside a shard follows input order
// 4. Less loaded shards receive more candidates over repeated rounds

use crate::types::ShardId;
use log::debug;
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::fmt;

/// Sum of the SHA3-256 digest bytes of `candidate ++ decimal(rand)`.
fn seed_byte_sum(candidate: &str, rand: i64) -> usize {
    let mut hasher = Sha3_256::new();
    hasher.update(candidate.as_bytes());
    hasher.update(rand.to_string().as_bytes());
    hasher.finalize().iter().map(|b| *b as usize).sum()
}

/// Pseudo-random position of a candidate in `[1, total)`.
///
/// Returns 1 when `total` is 1 and 0 when `total` is 0; callers never place
/// anything in an empty range.
pub fn calculate_candidate_position(candidate: &str, rand: i64, total: usize) -> usize {
    if total == 0 {
        return 0;
    }
    let pos = seed_byte_sum(candidate, rand) % total;
    if pos == 0 {
        1
    } else {
        pos
    }
}

/// Shard ids ordered by increasing load. Equal loads keep shard-id order.
pub fn sort_shard_ids_by_load(loads: &[usize]) -> Vec<ShardId> {
    let mut indexed: Vec<(usize, usize)> = loads.iter().copied().enumerate().collect();
    // sort_by_key is stable
    indexed.sort_by_key(|(_, load)| *load);
    indexed.into_iter().map(|(shard, _)| ShardId(shard as u8)).collect()
}

/// Shards strictly below `mean`, lightest first, capped at half of all shards.
///
/// When no shard is below the mean the lightest half is returned instead, so
/// a round never has an empty target set.
pub fn ordered_lower_set(mean: usize, loads: &[usize]) -> Vec<usize> {
    let cap = (loads.len() / 2).max(1);
    let sorted = sort_shard_ids_by_load(loads);
    let lower: Vec<usize> = sorted
        .iter()
        .map(|s| s.as_usize())
        .filter(|&s| loads[s] < mean)
        .take(cap)
        .collect();
    if !lower.is_empty() {
        return lower;
    }
    sorted.iter().take(cap).map(|s| s.as_usize()).collect()
}

/// Walks the cumulative deficits and returns the first lower-set shard whose
/// running total exceeds `position`. Positions past the end fall on the last shard.
pub fn assign_candidate(lower_set: &[usize], position: usize, diffs: &[usize]) -> usize {
    let mut index = 0;
    let mut cumulative = diffs.first().copied().unwrap_or(0);
    while position >= cumulative && index + 1 < diffs.len() {
        index += 1;
        cumulative += diffs[index];
    }
    lower_set[index]
}

/// Distributes a batch of candidates across shards.
pub trait AssignRule: Send + Sync + fmt::Debug {
    /// `number_of_validators[i]` is the current load of shard `i`.
    fn process(
        &self,
        candidates: &[String],
        number_of_validators: &[usize],
        rand: i64,
    ) -> BTreeMap<ShardId, Vec<String>>;

    fn version(&self) -> u8;
}

/// Select the assign rule for a configured version. Versions above 3 use V3.
pub fn assign_rule_for_version(version: u8) -> Box<dyn AssignRule> {
    if version >= 3 {
        Box::new(AssignRuleV3)
    } else {
        Box::new(AssignRuleV2)
    }
}

/// Inverse-rank assignment: a candidate whose random bucket lands on the
/// k-th heaviest shard is placed on the k-th lightest one.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssignRuleV2;

impl AssignRule for AssignRuleV2 {
    fn process(
        &self,
        candidates: &[String],
        number_of_validators: &[usize],
        rand: i64,
    ) -> BTreeMap<ShardId, Vec<String>> {
        let mut assigned: BTreeMap<ShardId, Vec<String>> = BTreeMap::new();
        let n = number_of_validators.len();
        if n == 0 || candidates.is_empty() {
            return assigned;
        }

        // All-empty network: treat every shard as weight 1
        let weights: Vec<usize> = if number_of_validators.iter().all(|v| *v == 0) {
            vec![1; n]
        } else {
            number_of_validators.to_vec()
        };
        let total: usize = weights.iter().sum();

        let sorted = sort_shard_ids_by_load(number_of_validators);
        let mut rank = vec![0usize; n];
        for (position, shard) in sorted.iter().enumerate() {
            rank[shard.as_usize()] = position;
        }

        for candidate in candidates {
            let position = calculate_candidate_position(candidate, rand, total);
            let mut bucket = 0;
            let mut cumulative = weights[0];
            while position > cumulative && bucket + 1 < n {
                bucket += 1;
                cumulative += weights[bucket];
            }
            let target = sorted[n - 1 - rank[bucket]];
            assigned.entry(target).or_default().push(candidate.clone());
        }

        debug!("AssignRuleV2 placed {} candidates over {} shards", candidates.len(), n);
        assigned
    }

    fn version(&self) -> u8 {
        2
    }
}

/// Deficit-weighted assignment into the shards below the mean load.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssignRuleV3;

impl AssignRule for AssignRuleV3 {
    fn process(
        &self,
        candidates: &[String],
        number_of_validators: &[usize],
        rand: i64,
    ) -> BTreeMap<ShardId, Vec<String>> {
        let mut assigned: BTreeMap<ShardId, Vec<String>> = BTreeMap::new();
        let n = number_of_validators.len();
        if n == 0 || candidates.is_empty() {
            return assigned;
        }

        let mean = number_of_validators.iter().sum::<usize>() / n;
        let lower_set = ordered_lower_set(mean, number_of_validators);

        let mut diffs: Vec<usize> = lower_set
            .iter()
            .map(|&s| mean.saturating_sub(number_of_validators[s]))
            .collect();
        if diffs.iter().all(|d| *d == 0) {
            diffs = vec![1; lower_set.len()];
        }
        let total_diff: usize = diffs.iter().sum();

        for candidate in candidates {
            let position = calculate_candidate_position(candidate, rand, total_diff);
            let chosen = assign_candidate(&lower_set, position, &diffs);
            assigned.entry(ShardId(chosen as u8)).or_default().push(candidate.clone());
        }

        debug!(
            "AssignRuleV3 placed {} candidates into lower set {:?} (mean {})",
            candidates.len(),
            lower_set,
            mean
        );
        assigned
    }

    fn version(&self) -> u8 {
        3
    }
}

/// First-generation assignment: hash each candidate straight onto a shard and
/// accept it only while that shard has fewer than `assign_offset` pending
/// validators. Rejected candidates wait for the next random round.
#[derive(Debug, Clone, Copy)]
pub struct HashBucketAssignment {
    pub assign_offset: usize,
    pub active_shards: usize,
}

impl HashBucketAssignment {
    pub fn new(assign_offset: usize, active_shards: usize) -> Self {
        HashBucketAssignment {
            assign_offset,
            active_shards,
        }
    }

    pub fn candidate_shard(&self, candidate: &str, rand: i64) -> Option<ShardId> {
        if self.active_shards == 0 {
            return None;
        }
        Some(ShardId((seed_byte_sum(candidate, rand) % self.active_shards) as u8))
    }

    /// Returns `(remaining, assigned)`.
    pub fn process(
        &self,
        candidates: &[String],
        pending_per_shard: &BTreeMap<ShardId, usize>,
        rand: i64,
    ) -> (Vec<String>, BTreeMap<ShardId, Vec<String>>) {
        let mut pending = pending_per_shard.clone();
        let mut remaining = Vec::new();
        let mut assigned: BTreeMap<ShardId, Vec<String>> = BTreeMap::new();

        for candidate in candidates {
            let shard = match self.candidate_shard(candidate, rand) {
                Some(shard) => shard,
                None => {
                    remaining.push(candidate.clone());
                    continue;
                }
            };
            let count = pending.entry(shard).or_insert(0);
            if *count + 1 > self.assign_offset {
                remaining.push(candidate.clone());
                continue;
            }
            *count += 1;
            assigned.entry(shard).or_default().push(candidate.clone());
        }
        (remaining, assigned)
    }
}
