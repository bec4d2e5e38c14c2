//! CLI module for SopChain

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sopchain::stf::VoteOption;

#[derive(Parser)]
#[command(name = "sopchain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Merkle-authenticated ledger for multi-agent incident response", long_about = None)]
pub struct Cli {
    /// Directory holding state.json, config.toml and keys.json (defaults to ~/.sopchain)
    #[arg(short, long, global = true, env = "SOPCHAIN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Engine config used when a new chain is created
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the genesis state, agent signing keys and config.toml
    Init {
        /// Overwrite an existing chain
        #[arg(long)]
        force: bool,
    },

    /// Chain height, pending count, SOP phase
    Status,

    /// Store an incident snapshot (Init -> Data_Collected)
    Ingest {
        /// Submitting agent (name or address)
        #[arg(long)]
        submitter: String,

        #[arg(long)]
        summary: String,

        /// Raw incident payload as JSON
        #[arg(long)]
        data: Option<String>,
    },

    /// Sign a transaction with the agent's key and queue it
    Submit {
        #[command(subcommand)]
        tx: SubmitTx,

        /// Override the type's minimum gas limit
        #[arg(long, global = true)]
        gas_limit: Option<u64>,

        /// Override the configured gas price
        #[arg(long, global = true)]
        gas_price: Option<u64>,

        /// Seal a block right after admission
        #[arg(long, global = true)]
        seal: bool,
    },

    /// Execute pending transactions and seal a block
    Seal,

    /// Run one scripted analysis cycle
    Cycle {
        /// Incident submitter and proposer (name or address)
        #[arg(long)]
        submitter: String,

        /// Incident summary, used when the SOP is still in Init
        #[arg(long, default_value = "")]
        summary: String,

        #[arg(long)]
        data: Option<String>,

        /// Root cause to propose; omit to skip proposing
        #[arg(long)]
        root_cause: Option<String>,

        /// Ballot for agents without an explicit --vote
        #[arg(long, default_value = "for")]
        default_vote: VoteOption,

        /// Per-agent ballot, e.g. --vote "Fault Mapper=against"
        #[arg(long = "vote", value_parser = parse_agent_vote)]
        votes: Vec<(String, VoteOption)>,
    },

    /// Fail the open proposal and settle its penalties
    CloseVoting,

    /// List sealed blocks
    Blocks {
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Show one block
    Block { index: u64 },

    /// Look up a transaction by hash (pending or sealed)
    Tx { hash: String },

    /// Merkle inclusion proof for a transaction
    Proof { block: u64, tx_index: usize },

    /// SOP phase, incident and recent events
    Sop {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Agent accounts and the treasury
    Agents,

    /// Open proposal with live tally, or the last closed one
    Voting,

    /// Gas, reward and penalty constants plus treasury balance
    Economy,

    /// Pending pool contents
    Pending,

    /// Audit hash linkage and Merkle roots of the whole chain
    Verify,

    /// Drop all state and return to genesis
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum SubmitTx {
    Transfer {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
    },
    Stake {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        amount: u64,
    },
    Vote {
        #[arg(long)]
        agent: String,
        /// Defaults to the open proposal
        #[arg(long)]
        proposal_id: Option<String>,
        #[arg(long)]
        option: VoteOption,
    },
    Propose {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        content: String,
    },
}

fn parse_agent_vote(s: &str) -> Result<(String, VoteOption), String> {
    let (name, option) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=OPTION, got {:?}", s))?;
    Ok((name.trim().to_string(), option.parse()?))
}
