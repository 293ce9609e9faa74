// SHARD COMMITTEE ROTATION
// Swap Rule Module - Deterministic slashing, swap-out and swap-in selection
//
// SAFETY INVARIANTS:
// 1. Same inputs produce the same swap on every node (no hidden state)
// 2. The first `number_of_fixed_validators` committee members are never removed
// 3. Slashed keys are listed before normally swapped-out keys
// 4. Swap-in never pushes the committee above `max_committee_size`
// 5. V3: slashed + normal swap-out never exceeds one third of the committee

use crate::error::RuleError;
use crate::signature_counter::Penalty;
use crate::types::ShardId;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt;

/// Rotation divisor used by V1/V2 and for the per-shard assign offset.
pub const MAX_SWAP_OR_ASSIGN_PERCENT: usize = 8;

/// Rounds a V2 key must serve in substitutes-and-back before leaving the shard.
pub const MAX_NUMBER_OF_ROUND: u32 = 1;

/// V3 slashing cap divisor (one third of the committee).
pub const MAX_SLASHING_PERCENT: usize = 3;

/// V3 normal swap-out divisor.
pub const MAX_SWAP_OUT_PERCENT: usize = 8;

/// V3 swap-in divisor.
pub const MAX_SWAP_IN_PERCENT: usize = 8;

/// Everything a swap rule looks at for one shard.
#[derive(Debug, Clone, Copy)]
pub struct SwapInput<'a> {
    pub shard_id: ShardId,
    pub committees: &'a [String],
    pub substitutes: &'a [String],
    pub min_committee_size: usize,
    pub max_committee_size: usize,
    pub number_of_fixed_validators: usize,
    /// Keys currently carrying a missed-signature penalty
    pub penalties: &'a BTreeMap<String, Penalty>,
    /// V2 aging counters; ignored by other versions
    pub number_of_round: &'a BTreeMap<String, u32>,
}

/// Result of one swap computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapOutcome {
    pub in_keys: Vec<String>,

    /// Slashed, then normally swapped out, then sent back to substitutes
    pub out_keys: Vec<String>,

    pub new_committees: Vec<String>,

    pub new_substitutes: Vec<String>,

    pub slashed: Vec<String>,

    pub normal_swap_out: Vec<String>,

    /// V2 only: rotated keys that are too young to leave and rejoin substitutes
    pub back_to_substitutes: Vec<String>,
}

impl SwapOutcome {
    fn unchanged(input: &SwapInput<'_>) -> Self {
        SwapOutcome {
            new_committees: input.committees.to_vec(),
            new_substitutes: input.substitutes.to_vec(),
            ..Default::default()
        }
    }

    /// True when the committee does not change.
    pub fn is_noop(&self) -> bool {
        self.in_keys.is_empty() && self.out_keys.is_empty()
    }
}

/// Computes the committee rotation for one shard.
pub trait SwapRule: Send + Sync + fmt::Debug {
    fn process(&self, input: &SwapInput<'_>) -> SwapOutcome;

    /// How many common-pool candidates a shard may take in one random round.
    fn assign_offset(
        &self,
        len_substitutes: usize,
        len_committees: usize,
        number_of_fixed_validators: usize,
        min_committee_size: usize,
    ) -> usize;

    fn version(&self) -> u8;
}

/// Select the swap rule for a configured version. Versions above 3 use V3.
pub fn swap_rule_for_version(version: u8) -> Box<dyn SwapRule> {
    match version {
        0 | 1 => Box::new(SwapRuleV1),
        2 => Box::new(SwapRuleV2),
        _ => Box::new(SwapRuleV3),
    }
}

/// One eighth of the committee, at least one.
pub fn default_assign_offset(len_committees: usize) -> usize {
    (len_committees / MAX_SWAP_OR_ASSIGN_PERCENT).max(1)
}

/// Drop `removed` from the front of `validators`.
pub fn remove_validator_prefix(
    validators: &[String],
    removed: &[String],
) -> Result<Vec<String>, RuleError> {
    if removed.len() > validators.len() {
        return Err(RuleError::RemovalTooLong {
            removed: removed.len(),
            current: validators.len(),
        });
    }
    if validators[..removed.len()] != *removed {
        return Err(RuleError::NotAPrefix);
    }
    Ok(validators[removed.len()..].to_vec())
}

/// Upper bound on slashed keys: a third of the committee, never touching
/// the fixed prefix.
pub fn max_slashing_offset(len_committees: usize, number_of_fixed_validators: usize) -> usize {
    if len_committees <= number_of_fixed_validators {
        return 0;
    }
    let offset = len_committees / MAX_SLASHING_PERCENT;
    if number_of_fixed_validators + offset > len_committees {
        len_committees - number_of_fixed_validators
    } else {
        offset
    }
}

/// Remove penalised non-fixed keys, in committee order, up to `max_slashing`.
///
/// Returns `(remaining committee, slashed keys)`.
pub fn slashing_swap_out(
    committees: &[String],
    penalties: &BTreeMap<String, Penalty>,
    number_of_fixed_validators: usize,
    max_slashing: usize,
) -> (Vec<String>, Vec<String>) {
    let fixed = number_of_fixed_validators.min(committees.len());
    let mut remaining: Vec<String> = committees[..fixed].to_vec();
    let mut slashed = Vec::new();

    for key in &committees[fixed..] {
        if slashed.len() < max_slashing && penalties.contains_key(key) {
            slashed.push(key.clone());
        } else {
            remaining.push(key.clone());
        }
    }
    (remaining, slashed)
}

/// V3 normal swap-out budget.
///
/// Only a full committee rotates; the budget is what is left of one eighth
/// after slashing, limited by the non-fixed members and the substitutes.
pub fn normal_swap_out_offset(
    len_committees_before_slash: usize,
    len_substitutes: usize,
    len_slashed: usize,
    number_of_fixed_validators: usize,
    max_committee_size: usize,
) -> usize {
    if len_committees_before_slash < max_committee_size {
        return 0;
    }
    let quota = len_committees_before_slash / MAX_SWAP_OUT_PERCENT;
    if len_slashed >= quota {
        return 0;
    }
    let flexible = len_committees_before_slash
        .saturating_sub(number_of_fixed_validators)
        .saturating_sub(len_slashed);
    (quota - len_slashed).min(flexible).min(len_substitutes)
}

/// Take `offset` keys from the front of the non-fixed part.
pub fn normal_swap_out(
    committees: &[String],
    offset: usize,
    number_of_fixed_validators: usize,
) -> (Vec<String>, Vec<String>) {
    let fixed = number_of_fixed_validators.min(committees.len());
    let take = offset.min(committees.len() - fixed);
    let swapped_out = committees[fixed..fixed + take].to_vec();
    let mut remaining = committees[..fixed].to_vec();
    remaining.extend_from_slice(&committees[fixed + take..]);
    (remaining, swapped_out)
}

/// V3 swap-in count for a committee of `len_committees` after swap-out.
pub fn swap_in_offset(
    len_committees: usize,
    len_substitutes: usize,
    min_committee_size: usize,
    max_committee_size: usize,
) -> usize {
    let refill = min_committee_size.saturating_sub(len_committees);
    (len_committees / MAX_SWAP_IN_PERCENT)
        .max(refill)
        .min(len_substitutes)
        .min(max_committee_size.saturating_sub(len_committees))
}

/// Move the first `offset` substitutes to the end of the committee.
///
/// Returns `(committee, substitutes, swapped in)`.
pub fn swap_in_after_swap_out(
    committees: &[String],
    substitutes: &[String],
    offset: usize,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let take = offset.min(substitutes.len());
    let swap_in = substitutes[..take].to_vec();
    let mut new_committees = committees.to_vec();
    new_committees.extend_from_slice(&swap_in);
    (new_committees, substitutes[take..].to_vec(), swap_in)
}

/// Shared V1/V2 rotation: fill vacancies first, then rotate the oldest
/// non-fixed members out. With `ages` set, members younger than
/// MAX_NUMBER_OF_ROUND go back to substitutes instead of leaving.
fn rotate_with_vacancy(
    committees: Vec<String>,
    substitutes: &[String],
    number_of_fixed_validators: usize,
    max_committee_size: usize,
    swap_offset: usize,
    ages: Option<&BTreeMap<String, u32>>,
) -> SwapOutcome {
    let vacant = max_committee_size.saturating_sub(committees.len());
    if vacant >= swap_offset {
        let (new_committees, new_substitutes, in_keys) =
            swap_in_after_swap_out(&committees, substitutes, swap_offset);
        return SwapOutcome {
            in_keys,
            new_committees,
            new_substitutes,
            ..Default::default()
        };
    }

    let fixed = number_of_fixed_validators.min(committees.len());
    let rotate = (swap_offset - vacant).min(committees.len() - fixed);
    let (remaining, rotated) = normal_swap_out(&committees, rotate, fixed);

    let mut normal_swap_out = Vec::new();
    let mut back_to_substitutes = Vec::new();
    for key in rotated {
        let round = ages.map(|a| a.get(&key).copied().unwrap_or(0));
        match round {
            Some(r) if r < MAX_NUMBER_OF_ROUND => back_to_substitutes.push(key),
            _ => normal_swap_out.push(key),
        }
    }

    let (new_committees, mut new_substitutes, in_keys) =
        swap_in_after_swap_out(&remaining, substitutes, vacant + rotate);
    new_substitutes.extend(back_to_substitutes.iter().cloned());

    let mut out_keys = normal_swap_out.clone();
    out_keys.extend(back_to_substitutes.iter().cloned());
    SwapOutcome {
        in_keys,
        out_keys,
        new_committees,
        new_substitutes,
        slashed: Vec::new(),
        normal_swap_out,
        back_to_substitutes,
    }
}

/// Self-swap without slashing: every rotated member leaves the committee.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapRuleV1;

impl SwapRule for SwapRuleV1 {
    fn process(&self, input: &SwapInput<'_>) -> SwapOutcome {
        let total = input.committees.len() + input.substitutes.len();
        let swap_offset = (total / MAX_SWAP_OR_ASSIGN_PERCENT).min(input.substitutes.len());
        if swap_offset == 0 {
            return SwapOutcome::unchanged(input);
        }
        let outcome = rotate_with_vacancy(
            input.committees.to_vec(),
            input.substitutes,
            input.number_of_fixed_validators,
            input.max_committee_size,
            swap_offset,
            None,
        );
        debug!(
            "SwapRuleV1 shard {}: {} in, {} out",
            input.shard_id,
            outcome.in_keys.len(),
            outcome.out_keys.len()
        );
        outcome
    }

    fn assign_offset(&self, _: usize, len_committees: usize, _: usize, _: usize) -> usize {
        default_assign_offset(len_committees)
    }

    fn version(&self) -> u8 {
        1
    }
}

/// Fixed-percentage rotation with slashing and round aging.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapRuleV2;

impl SwapRule for SwapRuleV2 {
    fn process(&self, input: &SwapInput<'_>) -> SwapOutcome {
        let len = input.committees.len();
        let max_slashing = max_slashing_offset(len, input.number_of_fixed_validators);
        let (after_slash, slashed) = slashing_swap_out(
            input.committees,
            input.penalties,
            input.number_of_fixed_validators,
            max_slashing,
        );

        let swap_offset = ((len + input.substitutes.len()) / MAX_SWAP_OR_ASSIGN_PERCENT)
            .min(input.substitutes.len());

        let mut outcome = if swap_offset == 0 {
            SwapOutcome {
                new_committees: after_slash,
                new_substitutes: input.substitutes.to_vec(),
                ..Default::default()
            }
        } else {
            rotate_with_vacancy(
                after_slash,
                input.substitutes,
                input.number_of_fixed_validators,
                input.max_committee_size,
                swap_offset,
                Some(input.number_of_round),
            )
        };

        let mut out_keys = slashed.clone();
        out_keys.append(&mut outcome.out_keys);
        outcome.out_keys = out_keys;
        outcome.slashed = slashed;

        if !outcome.is_noop() {
            info!(
                "SwapRuleV2 shard {}: {} in, {} out ({} slashed, {} back to substitutes)",
                input.shard_id,
                outcome.in_keys.len(),
                outcome.out_keys.len(),
                outcome.slashed.len(),
                outcome.back_to_substitutes.len()
            );
        }
        outcome
    }

    fn assign_offset(&self, _: usize, len_committees: usize, _: usize, _: usize) -> usize {
        default_assign_offset(len_committees)
    }

    fn version(&self) -> u8 {
        2
    }
}

/// Slash, swap out up to one eighth, then swap in proportionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapRuleV3;

impl SwapRule for SwapRuleV3 {
    fn process(&self, input: &SwapInput<'_>) -> SwapOutcome {
        let fixed = input.number_of_fixed_validators;
        let len_before = input.committees.len();

        let (after_slash, slashed) = slashing_swap_out(
            input.committees,
            input.penalties,
            fixed,
            max_slashing_offset(len_before, fixed),
        );

        let normal_offset = normal_swap_out_offset(
            len_before,
            input.substitutes.len(),
            slashed.len(),
            fixed,
            input.max_committee_size,
        );
        let (after_swap_out, normal_swap_out) = normal_swap_out(&after_slash, normal_offset, fixed);

        let in_offset = swap_in_offset(
            after_swap_out.len(),
            input.substitutes.len(),
            input.min_committee_size,
            input.max_committee_size,
        );
        let (new_committees, new_substitutes, in_keys) =
            swap_in_after_swap_out(&after_swap_out, input.substitutes, in_offset);

        let mut out_keys = slashed.clone();
        out_keys.extend(normal_swap_out.iter().cloned());

        if !in_keys.is_empty() || !out_keys.is_empty() {
            info!(
                "SwapRuleV3 shard {}: {} in, {} out ({} slashed)",
                input.shard_id,
                in_keys.len(),
                out_keys.len(),
                slashed.len()
            );
        }

        SwapOutcome {
            in_keys,
            out_keys,
            new_committees,
            new_substitutes,
            slashed,
            normal_swap_out,
            back_to_substitutes: Vec::new(),
        }
    }

    fn assign_offset(&self, _: usize, len_committees: usize, _: usize, _: usize) -> usize {
        default_assign_offset(len_committees)
    }

    fn version(&self) -> u8 {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("key{}", i)).collect()
    }

    fn named(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn penalties(names: &[&str]) -> BTreeMap<String, Penalty> {
        names.iter().map(|k| (k.to_string(), Penalty::default())).collect()
    }

    fn input<'a>(
        committees: &'a [String],
        substitutes: &'a [String],
        max: usize,
        fixed: usize,
        penalty: &'a BTreeMap<String, Penalty>,
        rounds: &'a BTreeMap<String, u32>,
    ) -> SwapInput<'a> {
        SwapInput {
            shard_id: ShardId(0),
            committees,
            substitutes,
            min_committee_size: 0,
            max_committee_size: max,
            number_of_fixed_validators: fixed,
            penalties: penalty,
            number_of_round: rounds,
        }
    }

    #[test]
    fn test_max_slashing_offset() {
        assert_eq!(max_slashing_offset(8, 8), 0);
        assert_eq!(max_slashing_offset(10, 8), 2);
        assert_eq!(max_slashing_offset(15, 8), 5);
        assert_eq!(max_slashing_offset(24, 8), 8);
    }

    #[test]
    fn test_normal_swap_out_offset() {
        assert_eq!(normal_swap_out_offset(64, 14, 2, 8, 64), 6);
        assert_eq!(normal_swap_out_offset(64, 10, 4, 58, 64), 2);
        assert_eq!(normal_swap_out_offset(64, 10, 0, 21, 64), 8);
        assert_eq!(normal_swap_out_offset(64, 10, 0, 58, 64), 6);
        // Slashing already used the quota
        assert_eq!(normal_swap_out_offset(64, 10, 8, 8, 64), 0);
        // Committee below max only refills
        assert_eq!(normal_swap_out_offset(22, 10, 0, 8, 24), 0);
    }

    #[test]
    fn test_swap_in_offset() {
        assert_eq!(swap_in_offset(25, 2, 0, 64), 2);
        assert_eq!(swap_in_offset(60, 5, 0, 64), 4);
        assert_eq!(swap_in_offset(25, 5, 0, 64), 3);
        assert_eq!(swap_in_offset(60, 20, 0, 64), 4);
        // Below min committee size the whole gap is refilled
        assert_eq!(swap_in_offset(2, 10, 6, 64), 4);
    }

    #[test]
    fn test_swap_in_after_swap_out() {
        let committees = keys(0..60);
        let substitutes = named(&["key0", "key", "key2", "key3", "key4"]);
        let offset = swap_in_offset(committees.len(), substitutes.len(), 0, 64);
        let (new_committees, new_substitutes, swap_in) =
            swap_in_after_swap_out(&committees, &substitutes, offset);
        assert_eq!(swap_in, named(&["key0", "key", "key2", "key3"]));
        assert_eq!(new_substitutes, named(&["key4"]));
        assert_eq!(new_committees.len(), 64);
    }

    #[test]
    fn test_normal_swap_out_skips_fixed_prefix() {
        let committees = keys(0..61);
        let (remaining, swapped) = normal_swap_out(&committees, 5, 8);
        assert_eq!(swapped, keys(8..13));
        assert_eq!(remaining.len(), 56);
        assert_eq!(&remaining[..8], &committees[..8]);
        assert_eq!(remaining[8], "key13");
    }

    #[test]
    fn test_remove_validator_prefix() {
        let validators = keys(0..4);
        assert_eq!(remove_validator_prefix(&validators, &keys(0..2)).unwrap(), keys(2..4));
        assert_eq!(
            remove_validator_prefix(&validators, &keys(1..3)),
            Err(RuleError::NotAPrefix)
        );
        assert_eq!(
            remove_validator_prefix(&validators, &keys(0..5)),
            Err(RuleError::RemovalTooLong { removed: 5, current: 4 })
        );
    }

    #[test]
    fn test_swap_rule_v3_slash_then_swap_in() {
        // 24 members, 8 fixed, key12 penalised, quota 3 = 1 slash + 2 normal
        let committees = keys(0..24);
        let substitutes = keys(24..29);
        let penalty = penalties(&["key12", "key3"]);
        let rounds = BTreeMap::new();
        let outcome = SwapRuleV3.process(&input(&committees, &substitutes, 24, 8, &penalty, &rounds));

        // key3 sits in the fixed prefix and is immune
        assert_eq!(outcome.slashed, named(&["key12"]));
        assert_eq!(outcome.normal_swap_out, named(&["key8", "key9"]));
        assert_eq!(outcome.out_keys, named(&["key12", "key8", "key9"]));
        // 21 left, 21 / 8 = 2 swap in
        assert_eq!(outcome.in_keys, named(&["key24", "key25"]));
        assert_eq!(outcome.new_committees.len(), 23);
        assert_eq!(outcome.new_substitutes, named(&["key26", "key27", "key28"]));
    }

    #[test]
    fn test_swap_rule_v3_slashing_capped_at_a_third() {
        let committees = keys(0..24);
        let substitutes = keys(24..29);
        let penalty = penalties(&[
            "key8", "key10", "key12", "key14", "key16", "key18", "key20", "key23", "key22",
        ]);
        let rounds = BTreeMap::new();
        let outcome = SwapRuleV3.process(&input(&committees, &substitutes, 24, 8, &penalty, &rounds));

        assert_eq!(outcome.slashed.len(), 8);
        assert!(!outcome.slashed.contains(&"key23".to_string()));
        assert!(outcome.normal_swap_out.is_empty());
        assert_eq!(outcome.in_keys, named(&["key24", "key25"]));
    }

    #[test]
    fn test_swap_rule_v3_fixed_heavy_committee() {
        // 32 members, 29 fixed: only key29..key31 may move
        let committees = keys(0..32);
        let substitutes = keys(32..36);
        let penalty = penalties(&["key30"]);
        let rounds = BTreeMap::new();
        let outcome = SwapRuleV3.process(&input(&committees, &substitutes, 32, 29, &penalty, &rounds));

        assert_eq!(outcome.out_keys, named(&["key30", "key29", "key31"]));
        assert_eq!(outcome.in_keys, named(&["key32", "key33", "key34"]));
        assert_eq!(outcome.new_committees.len(), 32);
    }

    #[test]
    fn test_swap_rule_v2_round_aging() {
        let committees = named(&["key0", "key", "key1", "key2"]);
        let substitutes = named(&["key5", "key6", "key7", "key8"]);
        let penalty = BTreeMap::new();

        // Fresh key goes back to the substitute list
        let young = BTreeMap::new();
        let outcome = SwapRuleV2.process(&input(&committees, &substitutes, 4, 1, &penalty, &young));
        assert_eq!(outcome.in_keys, named(&["key5"]));
        assert_eq!(outcome.out_keys, named(&["key"]));
        assert_eq!(outcome.back_to_substitutes, named(&["key"]));
        assert!(outcome.normal_swap_out.is_empty());
        assert_eq!(outcome.new_substitutes, named(&["key6", "key7", "key8", "key"]));
        assert_eq!(outcome.new_committees, named(&["key0", "key1", "key2", "key5"]));

        // After one round it leaves the shard
        let aged: BTreeMap<String, u32> = [("key".to_string(), 1)].into_iter().collect();
        let outcome = SwapRuleV2.process(&input(&committees, &substitutes, 4, 1, &penalty, &aged));
        assert_eq!(outcome.normal_swap_out, named(&["key"]));
        assert!(outcome.back_to_substitutes.is_empty());
        assert_eq!(outcome.new_substitutes, named(&["key6", "key7", "key8"]));
    }

    #[test]
    fn test_swap_rule_v2_fills_vacancy_first() {
        let committees = keys(0..4);
        let substitutes = keys(4..12);
        let rounds = BTreeMap::new();
        let penalty = BTreeMap::new();
        let outcome = SwapRuleV2.process(&input(&committees, &substitutes, 8, 1, &penalty, &rounds));
        // (4 + 8) / 8 = 1 swap, one vacancy available
        assert_eq!(outcome.in_keys, named(&["key4"]));
        assert!(outcome.out_keys.is_empty());
    }

    #[test]
    fn test_swap_rule_v1_without_substitutes_is_noop() {
        let committees = keys(0..16);
        let rounds = BTreeMap::new();
        let penalty = penalties(&["key9"]);
        let outcome = SwapRuleV1.process(&input(&committees, &[], 16, 4, &penalty, &rounds));
        assert!(outcome.is_noop());
        assert_eq!(outcome.new_committees, committees);
    }

    #[test]
    fn test_assign_offset() {
        let rule = SwapRuleV3;
        assert_eq!(rule.assign_offset(0, 4, 4, 0), 1);
        assert_eq!(rule.assign_offset(0, 10, 8, 0), 1);
        assert_eq!(rule.assign_offset(0, 64, 8, 0), 8);
    }

    proptest! {
        #[test]
        fn prop_fixed_validators_are_immune(
            len in 1usize..80,
            fixed_seed in 0usize..80,
            subs in 0usize..30,
            penalty_mask in proptest::collection::vec(any::<bool>(), 80),
            version in 1u8..4,
        ) {
            let fixed = fixed_seed % (len + 1);
            let committees = keys(0..len);
            let substitutes = keys(100..100 + subs);
            let penalty: BTreeMap<String, Penalty> = committees
                .iter()
                .zip(penalty_mask.iter())
                .filter(|(_, p)| **p)
                .map(|(k, _)| (k.clone(), Penalty::default()))
                .collect();
            let rounds: BTreeMap<String, u32> = committees.iter().map(|k| (k.clone(), 1)).collect();
            let rule = swap_rule_for_version(version);
            let outcome = rule.process(&input(&committees, &substitutes, len, fixed, &penalty, &rounds));

            for key in &committees[..fixed] {
                prop_assert!(!outcome.slashed.contains(key));
                prop_assert!(!outcome.normal_swap_out.contains(key));
            }
            prop_assert_eq!(&outcome.new_committees[..fixed], &committees[..fixed]);
            prop_assert!(outcome.new_committees.len() <= len.max(committees.len()));
        }

        #[test]
        fn prop_v3_swap_out_bounded_by_a_third(
            len in 1usize..100,
            fixed_seed in 0usize..100,
            subs in 0usize..40,
            penalty_mask in proptest::collection::vec(any::<bool>(), 100),
        ) {
            let fixed = fixed_seed % (len + 1);
            let committees = keys(0..len);
            let substitutes = keys(200..200 + subs);
            let penalty: BTreeMap<String, Penalty> = committees
                .iter()
                .zip(penalty_mask.iter())
                .filter(|(_, p)| **p)
                .map(|(k, _)| (k.clone(), Penalty::default()))
                .collect();
            let rounds = BTreeMap::new();
            let outcome = SwapRuleV3.process(&input(&committees, &substitutes, len, fixed, &penalty, &rounds));

            prop_assert!(outcome.slashed.len() + outcome.normal_swap_out.len() <= len / 3);
            let again = SwapRuleV3.process(&input(&committees, &substitutes, len, fixed, &penalty, &rounds));
            prop_assert_eq!(outcome, again);
        }
    }
}
