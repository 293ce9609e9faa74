// MISSED SIGNATURE ACCOUNTING
// Signature Counter Module - Per-validator signing statistics and penalty lookup
//
// SAFETY INVARIANTS:
// 1. Only keys tracked by the counter are ever counted
// 2. `missing <= actual_total` for every tracked key
// 3. A signer index outside the expected committee rejects the whole block
// 4. Penalty lookup picks the highest threshold that the missed percent reaches

use crate::error::RuleError;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One row of the penalty table.
///
/// The all-zero value means "no penalty".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Penalty {
    pub min_percent: u32,
    pub time: i64,
    pub force_unstake: bool,
}

impl Penalty {
    pub fn is_empty(&self) -> bool {
        *self == Penalty::default()
    }
}

/// Table used when none is configured: miss half the blocks, get unstaked.
pub fn default_penalties() -> Vec<Penalty> {
    vec![Penalty {
        min_percent: 50,
        time: 0,
        force_unstake: true,
    }]
}

/// Blocks a validator was expected to sign, and how many it missed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSignature {
    pub actual_total: u32,
    pub missing: u32,
}

/// Highest penalty whose threshold `missing * 100 / total` reaches.
pub fn slashing_penalty(missing: u32, total: u32, penalties: &[Penalty]) -> Penalty {
    if total == 0 {
        return Penalty::default();
    }
    let missed_percent = (u64::from(missing) * 100 / u64::from(total)) as u32;
    penalties
        .iter()
        .filter(|p| missed_percent >= p.min_percent)
        .max_by_key(|p| p.min_percent)
        .copied()
        .unwrap_or_default()
}

/// Non-empty penalties for `stats` under `penalties`, each key judged on the
/// blocks it actually saw.
pub fn penalties_for(
    stats: &BTreeMap<String, MissingSignature>,
    penalties: &[Penalty],
) -> BTreeMap<String, Penalty> {
    stats
        .iter()
        .filter_map(|(key, stat)| {
            let penalty = slashing_penalty(stat.missing, stat.actual_total, penalties);
            (!penalty.is_empty()).then(|| (key.clone(), penalty))
        })
        .collect()
}

/// Tracks signing statistics for the current shard committees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSignatureCounter {
    missing_signature: BTreeMap<String, MissingSignature>,

    penalties: Vec<Penalty>,

    /// Signer indices of the last counted block
    last_signers: Option<Vec<usize>>,
}

impl Default for MissingSignatureCounter {
    fn default() -> Self {
        Self::new(&[], default_penalties())
    }
}

impl MissingSignatureCounter {
    pub fn new(committees: &[String], penalties: Vec<Penalty>) -> Self {
        MissingSignatureCounter {
            missing_signature: committees
                .iter()
                .map(|k| (k.clone(), MissingSignature::default()))
                .collect(),
            penalties,
            last_signers: None,
        }
    }

    pub fn with_default_penalties(committees: &[String]) -> Self {
        Self::new(committees, default_penalties())
    }

    pub fn missing_signature(&self) -> &BTreeMap<String, MissingSignature> {
        &self.missing_signature
    }

    pub fn penalties(&self) -> &[Penalty] {
        &self.penalties
    }

    /// Count one block. `signer_indices` index into `to_be_signed`.
    pub fn add_missing_signature(
        &mut self,
        signer_indices: &[usize],
        to_be_signed: &[String],
    ) -> Result<(), RuleError> {
        let signed = signers(signer_indices, to_be_signed)?;

        for key in to_be_signed {
            if let Some(stat) = self.missing_signature.get_mut(key) {
                stat.actual_total += 1;
                if !signed.contains(key.as_str()) {
                    stat.missing += 1;
                }
            }
        }

        self.last_signers = Some(signer_indices.to_vec());
        Ok(())
    }

    /// Late signatures for the previous block: credit back signers that were
    /// counted as missing.
    pub fn add_previous_missing_signature(
        &mut self,
        signer_indices: &[usize],
        to_be_signed: &[String],
    ) -> Result<(), RuleError> {
        let cached = match &self.last_signers {
            Some(cached) => cached,
            None => {
                debug!("Signature counter: no cached signers, skip previous block");
                return Ok(());
            }
        };
        if signer_indices.len() <= cached.len() {
            return Ok(());
        }

        let mut uncounted = BTreeSet::new();
        for &idx in signer_indices {
            let key = to_be_signed.get(idx).ok_or(RuleError::SignerIndexOutOfRange {
                index: idx,
                committee_size: to_be_signed.len(),
            })?;
            if !cached.contains(&idx) {
                uncounted.insert(key.as_str());
            }
        }

        for key in uncounted {
            if let Some(stat) = self.missing_signature.get_mut(key) {
                if stat.missing > 0 {
                    trace!("Signature counter: late signature from {}", key);
                    stat.missing -= 1;
                }
            }
        }

        self.last_signers = Some(signer_indices.to_vec());
        Ok(())
    }

    /// Penalties computed against the blocks each key actually saw.
    pub fn slashing_penalty_with_actual_total(&self) -> BTreeMap<String, Penalty> {
        penalties_for(&self.missing_signature, &self.penalties)
    }

    /// Penalties against an externally expected block count. Untracked keys
    /// are treated as having missed every expected block.
    pub fn slashing_penalty_with_expected_total(
        &self,
        expected_total: &BTreeMap<String, u32>,
    ) -> BTreeMap<String, Penalty> {
        expected_total
            .iter()
            .filter_map(|(key, &expected)| {
                let missed = match self.missing_signature.get(key) {
                    Some(stat) => {
                        let signed = stat.actual_total - stat.missing;
                        expected.saturating_sub(signed)
                    }
                    None => expected,
                };
                let penalty = slashing_penalty(missed, expected, &self.penalties);
                (!penalty.is_empty()).then(|| (key.clone(), penalty))
            })
            .collect()
    }

    /// Start a fresh counting period for `committees`.
    pub fn reset(&mut self, committees: &[String]) {
        self.missing_signature = committees
            .iter()
            .map(|k| (k.clone(), MissingSignature::default()))
            .collect();
    }

    /// Re-key to a new committee, keeping counts of members that stay.
    pub fn committee_change(&mut self, committees: &[String]) {
        let mut next = BTreeMap::new();
        for key in committees {
            let stat = self.missing_signature.get(key).copied().unwrap_or_default();
            next.insert(key.clone(), stat);
        }
        self.missing_signature = next;
    }
}

fn signers<'a>(
    signer_indices: &[usize],
    to_be_signed: &'a [String],
) -> Result<BTreeSet<&'a str>, RuleError> {
    signer_indices
        .iter()
        .map(|&idx| {
            to_be_signed
                .get(idx)
                .map(String::as_str)
                .ok_or(RuleError::SignerIndexOutOfRange {
                    index: idx,
                    committee_size: to_be_signed.len(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committee(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key{}", i)).collect()
    }

    fn table() -> Vec<Penalty> {
        vec![
            Penalty { min_percent: 50, time: 0, force_unstake: true },
            Penalty { min_percent: 20, time: 0, force_unstake: false },
        ]
    }

    #[test]
    fn test_add_missing_signature_counts_tracked_keys_only() {
        let tracked = committee(3);
        let mut counter = MissingSignatureCounter::with_default_penalties(&tracked);
        let mut to_sign = tracked.clone();
        to_sign.push("outsider".to_string());

        counter.add_missing_signature(&[0, 3], &to_sign).unwrap();

        let stats = counter.missing_signature();
        assert_eq!(stats["key0"], MissingSignature { actual_total: 1, missing: 0 });
        assert_eq!(stats["key1"], MissingSignature { actual_total: 1, missing: 1 });
        assert_eq!(stats["key2"], MissingSignature { actual_total: 1, missing: 1 });
        assert!(!stats.contains_key("outsider"));
    }

    #[test]
    fn test_signer_index_out_of_range() {
        let keys = committee(2);
        let mut counter = MissingSignatureCounter::with_default_penalties(&keys);
        assert_eq!(
            counter.add_missing_signature(&[0, 2], &keys),
            Err(RuleError::SignerIndexOutOfRange { index: 2, committee_size: 2 })
        );
        assert_eq!(counter.missing_signature()["key0"].actual_total, 0);
    }

    #[test]
    fn test_add_previous_missing_signature_credits_late_signers() {
        let keys = committee(4);
        let mut counter = MissingSignatureCounter::with_default_penalties(&keys);
        counter.add_missing_signature(&[0, 1], &keys).unwrap();
        assert_eq!(counter.missing_signature()["key2"].missing, 1);

        counter.add_previous_missing_signature(&[0, 1, 2], &keys).unwrap();
        assert_eq!(counter.missing_signature()["key2"].missing, 0);
        assert_eq!(counter.missing_signature()["key3"].missing, 1);

        // Same or shorter signer list changes nothing
        counter.add_previous_missing_signature(&[0, 3], &keys).unwrap();
        assert_eq!(counter.missing_signature()["key3"].missing, 1);
    }

    #[test]
    fn test_add_previous_without_cache_is_noop() {
        let keys = committee(2);
        let mut counter = MissingSignatureCounter::with_default_penalties(&keys);
        counter.add_previous_missing_signature(&[0, 1], &keys).unwrap();
        assert_eq!(counter.missing_signature()["key0"], MissingSignature::default());
    }

    #[test]
    fn test_slashing_penalty_picks_highest_threshold() {
        assert!(slashing_penalty(10, 0, &table()).is_empty());
        assert!(slashing_penalty(1, 10, &table()).is_empty());
        assert_eq!(slashing_penalty(3, 10, &table()).min_percent, 20);
        assert_eq!(slashing_penalty(5, 10, &table()).min_percent, 50);
        assert!(slashing_penalty(10, 10, &table()).force_unstake);
    }

    #[test]
    fn test_penalty_with_actual_total() {
        let keys = committee(3);
        let mut counter = MissingSignatureCounter::new(&keys, table());
        for _ in 0..10 {
            counter.add_missing_signature(&[0], &keys).unwrap();
        }
        let penalties = counter.slashing_penalty_with_actual_total();
        assert!(!penalties.contains_key("key0"));
        assert_eq!(penalties["key1"].min_percent, 50);
        assert_eq!(penalties.len(), 2);
    }

    #[test]
    fn test_penalty_with_expected_total() {
        let keys = committee(2);
        let mut counter = MissingSignatureCounter::new(&keys, table());
        for _ in 0..4 {
            counter.add_missing_signature(&[0, 1], &keys).unwrap();
        }
        let expected: BTreeMap<String, u32> = [
            ("key0".to_string(), 5),
            ("key1".to_string(), 10),
            ("stranger".to_string(), 3),
        ]
        .into_iter()
        .collect();
        let penalties = counter.slashing_penalty_with_expected_total(&expected);

        // 1/5 missed = 20%
        assert_eq!(penalties["key0"].min_percent, 20);
        // 6/10 missed
        assert_eq!(penalties["key1"].min_percent, 50);
        // never tracked: missed everything
        assert!(penalties["stranger"].force_unstake);
    }

    #[test]
    fn test_reset_and_committee_change() {
        let keys = committee(3);
        let mut counter = MissingSignatureCounter::with_default_penalties(&keys);
        counter.add_missing_signature(&[0], &keys).unwrap();

        let next = vec!["key1".to_string(), "key9".to_string()];
        counter.committee_change(&next);
        let stats = counter.missing_signature();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["key1"], MissingSignature { actual_total: 1, missing: 1 });
        assert_eq!(stats["key9"], MissingSignature::default());

        counter.reset(&keys);
        assert!(counter.missing_signature().values().all(|s| *s == MissingSignature::default()));
        assert_eq!(counter.missing_signature().len(), 3);
    }
}
