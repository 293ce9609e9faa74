use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use committee_state::{
    split_reward, CommitteeEngine, CommitteeEnvironment, CommitteeParams, CommitteeUpdate,
    GenesisCommittee, InMemoryStakerStore, Instruction, ShardId, StakerStore,
};
use env_logger::Env;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "committee-replay")]
#[command(about = "Replay beacon blocks through the committee state machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a file of instruction batches and print one update per block
    Replay {
        /// Chain file: state version, parameters and genesis committees
        #[arg(long)]
        chain: PathBuf,

        /// JSON array of blocks
        #[arg(long)]
        blocks: PathBuf,

        /// Add the producer's SWAP_SHARD instructions at every epoch end
        #[arg(long)]
        auto_swap: bool,
    },

    /// Print the genesis state hash
    Genesis {
        #[arg(long)]
        chain: PathBuf,
    },

    /// Split one shard block reward
    Reward {
        total: u64,
        shard_committee_len: usize,
        beacon_committee_len: usize,
        #[arg(long)]
        chain: PathBuf,
        #[arg(long)]
        custodian_percent: Option<u8>,
    },
}

#[derive(Debug, Deserialize)]
struct ChainFile {
    #[serde(default = "latest_version")]
    version: u8,
    params: CommitteeParams,
    genesis: GenesisCommittee,
}

fn latest_version() -> u8 {
    committee_state::LATEST_VERSION
}

#[derive(Debug, Deserialize)]
struct Block {
    height: u64,
    #[serde(default)]
    random_number: i64,
    #[serde(default)]
    previous_block_signers: Option<Vec<usize>>,
    #[serde(default)]
    instructions: Vec<Vec<String>>,
    /// Hex digest the block header commits to
    #[serde(default)]
    expected_hash: Option<String>,
}

#[derive(Debug, Serialize)]
struct BlockReport<'a> {
    height: u64,
    state_digest: String,
    update: &'a CommitteeUpdate,
}

fn load_chain(path: &Path) -> Result<ChainFile> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading chain file {}", path.display()))?;
    let chain: ChainFile = serde_json::from_str(&json)
        .with_context(|| format!("parsing chain file {}", path.display()))?;
    if let Err(e) = chain.params.validate() {
        bail!("invalid parameters in {}: {}", path.display(), e);
    }
    Ok(chain)
}

fn build_engine(chain: &ChainFile) -> Result<CommitteeEngine> {
    let store: Arc<dyn StakerStore> = Arc::new(InMemoryStakerStore::new());
    CommitteeEngine::from_genesis(chain.version, &chain.genesis, chain.params.clone(), store)
        .context("building genesis committee state")
}

fn replay(chain_path: &Path, blocks_path: &Path, auto_swap: bool) -> Result<()> {
    let chain = load_chain(chain_path)?;
    let mut engine = build_engine(&chain)?;

    let json = std::fs::read_to_string(blocks_path)
        .with_context(|| format!("reading blocks file {}", blocks_path.display()))?;
    let blocks: Vec<Block> = serde_json::from_str(&json)
        .with_context(|| format!("parsing blocks file {}", blocks_path.display()))?;
    info!("Replaying {} blocks on a V{} committee state", blocks.len(), chain.version);

    for block in blocks {
        let mut builder = CommitteeEnvironment::builder(&chain.params)
            .beacon_height(block.height)
            .random_number(block.random_number);
        if let Some(signers) = block.previous_block_signers {
            builder = builder.previous_block_signers(signers);
        }
        let env = builder.build();

        let mut instructions = block.instructions;
        if auto_swap && env.is_last_block_of_epoch() {
            for shard in ShardId::all(chain.params.active_shards) {
                if let Some(swap) = engine.generate_swap_shard_instruction(&env, shard)? {
                    instructions.push(Instruction::SwapShard(swap).to_raw());
                }
            }
        }

        let update = engine
            .update_committee_state(&env, &instructions)
            .with_context(|| format!("processing block {}", block.height))?;
        let state_digest = update.state_hash.digest().to_hex();

        if let Some(expected) = &block.expected_hash {
            if *expected != state_digest {
                engine.abort_uncommitted();
                bail!(
                    "block {}: header commits to {}, computed {}",
                    block.height,
                    expected,
                    state_digest
                );
            }
        }
        engine
            .commit(&update.state_hash)
            .with_context(|| format!("committing block {}", block.height))?;

        let report = BlockReport {
            height: block.height,
            state_digest,
            update: &update,
        };
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            chain,
            blocks,
            auto_swap,
        } => replay(&chain, &blocks, auto_swap)?,
        Commands::Genesis { chain } => {
            let chain = load_chain(&chain)?;
            let engine = build_engine(&chain)?;
            let hash = engine.final_hash()?;
            println!("{}", serde_json::to_string_pretty(&hash)?);
            println!("digest: {}", hash.digest());
        }
        Commands::Reward {
            total,
            shard_committee_len,
            beacon_committee_len,
            chain,
            custodian_percent,
        } => {
            let chain = load_chain(&chain)?;
            if shard_committee_len == 0 && beacon_committee_len == 0 {
                warn!("Both committees are empty; the shard takes the whole remainder");
            }
            let split = split_reward(
                total,
                shard_committee_len,
                beacon_committee_len,
                chain.params.active_shards,
                chain.params.dao_percent,
                custodian_percent,
            );
            println!("{}", serde_json::to_string_pretty(&split)?);
        }
    }

    Ok(())
}
