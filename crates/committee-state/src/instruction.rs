// INSTRUCTION WIRE FORMAT
// Instruction Module - Typed view over `[opcode, arg, ...]` string arrays
//
// SAFETY INVARIANTS:
// 1. Parsing is total: every input yields a typed instruction, `None`
//    (unknown opcode) or an InstructionError, never a panic
// 2. Plural fields are comma-joined; the empty string is the empty list
// 3. Parallel lists (keys, txs, rewards, ...) must have equal length

use crate::error::InstructionError;
use committee_rules::{ChainId, ShardId};
use std::fmt;

pub const STAKE_ACTION: &str = "STAKE";
pub const UNSTAKE_ACTION: &str = "UNSTAKE";
pub const STOP_AUTO_STAKE_ACTION: &str = "STOP_AUTO_STAKE";
pub const SWAP_SHARD_ACTION: &str = "SWAP_SHARD";
pub const RANDOM_ACTION: &str = "RANDOM";
pub const FINISH_SYNC_ACTION: &str = "FINISH_SYNC";
pub const BEACON_STAKE_ACTION: &str = "BEACON_STAKE";
pub const ADD_STAKING_ACTION: &str = "ADD_STAKING";
pub const RETURN_ACTION: &str = "RETURN";
pub const RETURN_BEACON_STAKE_ACTION: &str = "RETURN_BEACON_STAKE";

/// Chain tag carried by shard stake instructions.
pub const SHARD_INST: &str = "shard";

/// Percent refunded when a stake is returned.
pub const FULL_RETURN_PERCENT: u32 = 100;

fn split_list(field: &str) -> Vec<String> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split(',').map(str::to_string).collect()
    }
}

fn join_list<T: ToString>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn check_arity(raw: &[String], expected: usize) -> Result<(), InstructionError> {
    if raw.len() != expected {
        return Err(InstructionError::WrongArity {
            opcode: raw.first().cloned().unwrap_or_default(),
            expected,
            got: raw.len(),
        });
    }
    Ok(())
}

fn parse_field<T: std::str::FromStr>(
    opcode: &str,
    field: &'static str,
    value: &str,
) -> Result<T, InstructionError> {
    value.parse::<T>().map_err(|_| InstructionError::InvalidField {
        opcode: opcode.to_string(),
        field,
        value: value.to_string(),
    })
}

fn parse_list<T: std::str::FromStr>(
    opcode: &str,
    field: &'static str,
    value: &str,
) -> Result<Vec<T>, InstructionError> {
    split_list(value)
        .iter()
        .map(|v| parse_field(opcode, field, v))
        .collect()
}

fn parse_chain(opcode: &str, value: &str) -> Result<ChainId, InstructionError> {
    let wire: i32 = parse_field(opcode, "chain id", value)?;
    ChainId::from_wire(wire).ok_or_else(|| InstructionError::InvalidField {
        opcode: opcode.to_string(),
        field: "chain id",
        value: value.to_string(),
    })
}

fn parse_shard(opcode: &str, value: &str) -> Result<ShardId, InstructionError> {
    match parse_chain(opcode, value)? {
        ChainId::Shard(shard) => Ok(shard),
        ChainId::Beacon => Err(InstructionError::InvalidField {
            opcode: opcode.to_string(),
            field: "shard id",
            value: value.to_string(),
        }),
    }
}

fn non_empty_keys(opcode: &str, value: &str) -> Result<Vec<String>, InstructionError> {
    let keys = split_list(value);
    if keys.is_empty() {
        return Err(InstructionError::InvalidField {
            opcode: opcode.to_string(),
            field: "public keys",
            value: String::new(),
        });
    }
    Ok(keys)
}

fn equal_lengths(opcode: &str, lengths: &[usize]) -> Result<(), InstructionError> {
    if lengths.windows(2).any(|w| w[0] != w[1]) {
        return Err(InstructionError::LengthMismatch {
            opcode: opcode.to_string(),
        });
    }
    Ok(())
}

/// `[STAKE, keys, "shard", tx_ids, reward_receivers, auto_stakes]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeInstruction {
    pub public_keys: Vec<String>,
    pub tx_stakes: Vec<String>,
    pub reward_receivers: Vec<String>,
    pub auto_stakes: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstakeInstruction {
    pub public_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopAutoStakeInstruction {
    pub public_keys: Vec<String>,
}

/// Why a committee is being swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapType {
    EndEpoch,
    Slashing,
    IncreaseCommitteeSize,
    RandomCommittee,
}

impl SwapType {
    pub fn as_u8(&self) -> u8 {
        match self {
            SwapType::EndEpoch => 1,
            SwapType::Slashing => 2,
            SwapType::IncreaseCommitteeSize => 3,
            SwapType::RandomCommittee => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SwapType::EndEpoch),
            2 => Some(SwapType::Slashing),
            3 => Some(SwapType::IncreaseCommitteeSize),
            4 => Some(SwapType::RandomCommittee),
            _ => None,
        }
    }
}

/// `[SWAP_SHARD, in_keys, out_keys, shard_id, swap_type]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapShardInstruction {
    pub in_public_keys: Vec<String>,
    pub out_public_keys: Vec<String>,
    pub shard_id: ShardId,
    pub swap_type: SwapType,
}

impl SwapShardInstruction {
    pub fn is_empty(&self) -> bool {
        self.in_public_keys.is_empty() && self.out_public_keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomInstruction {
    pub random_number: i64,
}

/// `[FINISH_SYNC, chain_id, keys]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishSyncInstruction {
    pub chain_id: ChainId,
    pub public_keys: Vec<String>,
}

/// `[BEACON_STAKE, keys, tx_ids, reward_receivers, amounts]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconStakeInstruction {
    pub public_keys: Vec<String>,
    pub tx_stakes: Vec<String>,
    pub reward_receivers: Vec<String>,
    pub staking_amounts: Vec<u64>,
}

/// `[ADD_STAKING, keys, tx_ids, amounts]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddStakingInstruction {
    pub public_keys: Vec<String>,
    pub tx_stakes: Vec<String>,
    pub staking_amounts: Vec<u64>,
}

/// `[RETURN, keys, shard_id, tx_ids, percents]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnStakingInstruction {
    pub public_keys: Vec<String>,
    pub chain_id: ChainId,
    pub tx_stakes: Vec<String>,
    pub percents: Vec<u32>,
}

impl ReturnStakingInstruction {
    pub fn new(chain_id: ChainId) -> Self {
        ReturnStakingInstruction {
            public_keys: Vec::new(),
            chain_id,
            tx_stakes: Vec::new(),
            percents: Vec::new(),
        }
    }

    pub fn add(&mut self, key: String, tx_stake: String) {
        self.public_keys.push(key);
        self.tx_stakes.push(tx_stake);
        self.percents.push(FULL_RETURN_PERCENT);
    }

    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty()
    }
}

/// Why beacon stake is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum ReturnReason {
    Unstake,
    Slash,
    DuplicateStake,
    AddStakeFail,
}

impl ReturnReason {
    pub fn as_u8(&self) -> u8 {
        match self {
            ReturnReason::Unstake => 0,
            ReturnReason::Slash => 1,
            ReturnReason::DuplicateStake => 2,
            ReturnReason::AddStakeFail => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReturnReason::Unstake),
            1 => Some(ReturnReason::Slash),
            2 => Some(ReturnReason::DuplicateStake),
            3 => Some(ReturnReason::AddStakeFail),
            _ => None,
        }
    }
}

impl fmt::Display for ReturnReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl std::str::FromStr for ReturnReason {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u8>().ok().and_then(ReturnReason::from_u8).ok_or(())
    }
}

/// `[RETURN_BEACON_STAKE, keys, reasons, amounts]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnBeaconStakeInstruction {
    pub public_keys: Vec<String>,
    pub reasons: Vec<ReturnReason>,
    pub amounts: Vec<u64>,
}

impl ReturnBeaconStakeInstruction {
    pub fn add(&mut self, key: String, reason: ReturnReason, amount: u64) {
        self.public_keys.push(key);
        self.reasons.push(reason);
        self.amounts.push(amount);
    }

    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Stake(StakeInstruction),
    Unstake(UnstakeInstruction),
    StopAutoStake(StopAutoStakeInstruction),
    SwapShard(SwapShardInstruction),
    Random(RandomInstruction),
    FinishSync(FinishSyncInstruction),
    BeaconStake(BeaconStakeInstruction),
    AddStaking(AddStakingInstruction),
    Return(ReturnStakingInstruction),
    ReturnBeaconStake(ReturnBeaconStakeInstruction),
}

impl Instruction {
    /// Parse a raw instruction. Unknown opcodes yield `Ok(None)`.
    pub fn parse(raw: &[String]) -> Result<Option<Instruction>, InstructionError> {
        let opcode = raw.first().ok_or(InstructionError::Empty)?.as_str();
        let inst = match opcode {
            STAKE_ACTION => {
                check_arity(raw, 6)?;
                let public_keys = non_empty_keys(opcode, &raw[1])?;
                if raw[2] != SHARD_INST {
                    return Err(InstructionError::InvalidField {
                        opcode: opcode.to_string(),
                        field: "chain",
                        value: raw[2].clone(),
                    });
                }
                let tx_stakes = split_list(&raw[3]);
                let reward_receivers = split_list(&raw[4]);
                let auto_stakes: Vec<bool> = parse_list(opcode, "auto stake", &raw[5])?;
                equal_lengths(
                    opcode,
                    &[public_keys.len(), tx_stakes.len(), reward_receivers.len(), auto_stakes.len()],
                )?;
                Instruction::Stake(StakeInstruction {
                    public_keys,
                    tx_stakes,
                    reward_receivers,
                    auto_stakes,
                })
            }
            UNSTAKE_ACTION => {
                check_arity(raw, 2)?;
                Instruction::Unstake(UnstakeInstruction {
                    public_keys: non_empty_keys(opcode, &raw[1])?,
                })
            }
            STOP_AUTO_STAKE_ACTION => {
                check_arity(raw, 2)?;
                Instruction::StopAutoStake(StopAutoStakeInstruction {
                    public_keys: non_empty_keys(opcode, &raw[1])?,
                })
            }
            SWAP_SHARD_ACTION => {
                check_arity(raw, 5)?;
                let swap_type_raw: u8 = parse_field(opcode, "swap type", &raw[4])?;
                let swap_type =
                    SwapType::from_u8(swap_type_raw).ok_or_else(|| InstructionError::InvalidField {
                        opcode: opcode.to_string(),
                        field: "swap type",
                        value: raw[4].clone(),
                    })?;
                Instruction::SwapShard(SwapShardInstruction {
                    in_public_keys: split_list(&raw[1]),
                    out_public_keys: split_list(&raw[2]),
                    shard_id: parse_shard(opcode, &raw[3])?,
                    swap_type,
                })
            }
            RANDOM_ACTION => {
                check_arity(raw, 2)?;
                Instruction::Random(RandomInstruction {
                    random_number: parse_field(opcode, "random number", &raw[1])?,
                })
            }
            FINISH_SYNC_ACTION => {
                check_arity(raw, 3)?;
                Instruction::FinishSync(FinishSyncInstruction {
                    chain_id: parse_chain(opcode, &raw[1])?,
                    public_keys: non_empty_keys(opcode, &raw[2])?,
                })
            }
            BEACON_STAKE_ACTION => {
                check_arity(raw, 5)?;
                let public_keys = non_empty_keys(opcode, &raw[1])?;
                let tx_stakes = split_list(&raw[2]);
                let reward_receivers = split_list(&raw[3]);
                let staking_amounts: Vec<u64> = parse_list(opcode, "staking amount", &raw[4])?;
                equal_lengths(
                    opcode,
                    &[public_keys.len(), tx_stakes.len(), reward_receivers.len(), staking_amounts.len()],
                )?;
                Instruction::BeaconStake(BeaconStakeInstruction {
                    public_keys,
                    tx_stakes,
                    reward_receivers,
                    staking_amounts,
                })
            }
            ADD_STAKING_ACTION => {
                check_arity(raw, 4)?;
                let public_keys = non_empty_keys(opcode, &raw[1])?;
                let tx_stakes = split_list(&raw[2]);
                let staking_amounts: Vec<u64> = parse_list(opcode, "staking amount", &raw[3])?;
                equal_lengths(opcode, &[public_keys.len(), tx_stakes.len(), staking_amounts.len()])?;
                Instruction::AddStaking(AddStakingInstruction {
                    public_keys,
                    tx_stakes,
                    staking_amounts,
                })
            }
            RETURN_ACTION => {
                check_arity(raw, 5)?;
                let public_keys = split_list(&raw[1]);
                let tx_stakes = split_list(&raw[3]);
                let percents: Vec<u32> = parse_list(opcode, "percent", &raw[4])?;
                equal_lengths(opcode, &[public_keys.len(), tx_stakes.len(), percents.len()])?;
                Instruction::Return(ReturnStakingInstruction {
                    public_keys,
                    chain_id: parse_chain(opcode, &raw[2])?,
                    tx_stakes,
                    percents,
                })
            }
            RETURN_BEACON_STAKE_ACTION => {
                check_arity(raw, 4)?;
                let public_keys = split_list(&raw[1]);
                let reasons: Vec<ReturnReason> = parse_list(opcode, "reason", &raw[2])?;
                let amounts: Vec<u64> = parse_list(opcode, "amount", &raw[3])?;
                equal_lengths(opcode, &[public_keys.len(), reasons.len(), amounts.len()])?;
                Instruction::ReturnBeaconStake(ReturnBeaconStakeInstruction {
                    public_keys,
                    reasons,
                    amounts,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(inst))
    }

    pub fn opcode(&self) -> &'static str {
        match self {
            Instruction::Stake(_) => STAKE_ACTION,
            Instruction::Unstake(_) => UNSTAKE_ACTION,
            Instruction::StopAutoStake(_) => STOP_AUTO_STAKE_ACTION,
            Instruction::SwapShard(_) => SWAP_SHARD_ACTION,
            Instruction::Random(_) => RANDOM_ACTION,
            Instruction::FinishSync(_) => FINISH_SYNC_ACTION,
            Instruction::BeaconStake(_) => BEACON_STAKE_ACTION,
            Instruction::AddStaking(_) => ADD_STAKING_ACTION,
            Instruction::Return(_) => RETURN_ACTION,
            Instruction::ReturnBeaconStake(_) => RETURN_BEACON_STAKE_ACTION,
        }
    }

    /// Wire form.
    pub fn to_raw(&self) -> Vec<String> {
        let mut raw = vec![self.opcode().to_string()];
        match self {
            Instruction::Stake(s) => raw.extend([
                join_list(&s.public_keys),
                SHARD_INST.to_string(),
                join_list(&s.tx_stakes),
                join_list(&s.reward_receivers),
                join_list(&s.auto_stakes),
            ]),
            Instruction::Unstake(u) => raw.push(join_list(&u.public_keys)),
            Instruction::StopAutoStake(s) => raw.push(join_list(&s.public_keys)),
            Instruction::SwapShard(s) => raw.extend([
                join_list(&s.in_public_keys),
                join_list(&s.out_public_keys),
                s.shard_id.to_string(),
                s.swap_type.as_u8().to_string(),
            ]),
            Instruction::Random(r) => raw.push(r.random_number.to_string()),
            Instruction::FinishSync(f) => {
                raw.extend([f.chain_id.to_string(), join_list(&f.public_keys)])
            }
            Instruction::BeaconStake(b) => raw.extend([
                join_list(&b.public_keys),
                join_list(&b.tx_stakes),
                join_list(&b.reward_receivers),
                join_list(&b.staking_amounts),
            ]),
            Instruction::AddStaking(a) => raw.extend([
                join_list(&a.public_keys),
                join_list(&a.tx_stakes),
                join_list(&a.staking_amounts),
            ]),
            Instruction::Return(r) => raw.extend([
                join_list(&r.public_keys),
                r.chain_id.to_string(),
                join_list(&r.tx_stakes),
                join_list(&r.percents),
            ]),
            Instruction::ReturnBeaconStake(r) => raw.extend([
                join_list(&r.public_keys),
                join_list(&r.reasons),
                join_list(&r.amounts),
            ]),
        }
        raw
    }
}

/// Parse a whole batch, dropping unknown opcodes.
pub fn parse_instructions(raw: &[Vec<String>]) -> Result<Vec<Instruction>, InstructionError> {
    let mut parsed = Vec::with_capacity(raw.len());
    for inst in raw {
        match Instruction::parse(inst)? {
            Some(inst) => parsed.push(inst),
            None => log::debug!(
                "Skipping unknown instruction {}",
                inst.first().map(String::as_str).unwrap_or_default()
            ),
        }
    }
    Ok(parsed)
}
