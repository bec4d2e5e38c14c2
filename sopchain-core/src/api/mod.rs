//! Read surface of the engine
//!
//! Serializable view records. Each function copies what it needs out of the
//! engine under one shared lock, so a view is always internally consistent.

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::stf::hash::to_hex;
use crate::stf::{
    Account, Block, ChainState, Hash, IncidentSnapshot, ProofStep, Proposal, SopChain, SopEvent,
    Transaction, TxPayload, Verdict, VoteOption, VoteStats,
};

/// Events returned by [`sop_state`] when no limit is given
pub const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionView {
    pub tx_hash: String,
    pub sender: String,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    #[serde(flatten)]
    pub payload: TxPayload,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Absent while pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
}

impl TransactionView {
    fn new(tx: &Transaction, block: Option<&Block>) -> Self {
        Self {
            tx_hash: to_hex(&tx.hash()),
            sender: tx.sender().to_string(),
            nonce: tx.nonce(),
            gas_price: tx.gas_price(),
            gas_limit: tx.gas_limit(),
            payload: tx.payload().clone(),
            timestamp: tx.timestamp(),
            signature: tx.signature().map(str::to_string),
            block_index: block.map(Block::index),
            block_hash: block.map(|b| to_hex(&b.hash)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockView {
    pub index: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: u64,
    pub merkle_root: String,
    pub nonce: u64,
    pub transaction_count: usize,
    pub transactions: Vec<TransactionView>,
}

impl From<&Block> for BlockView {
    fn from(block: &Block) -> Self {
        Self {
            index: block.index(),
            hash: to_hex(&block.hash),
            previous_hash: to_hex(&block.header.previous_hash),
            timestamp: block.header.timestamp,
            merkle_root: to_hex(&block.header.merkle_root),
            nonce: block.header.nonce,
            transaction_count: block.transactions.len(),
            transactions: block
                .transactions
                .iter()
                .map(|tx| TransactionView::new(tx, Some(block)))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MerkleProofView {
    pub block_index: u64,
    pub tx_index: usize,
    pub transaction_hash: String,
    pub merkle_root: String,
    pub proof_path: Vec<ProofStep>,
    pub verified: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainInfoView {
    pub chain_id: String,
    pub block_height: u64,
    pub pending_transactions: usize,
    pub latest_block_hash: String,
    pub sop_state: String,
    pub tainted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SopStateView {
    pub current_state: String,
    pub current_proposal: Option<Proposal>,
    pub incident_data: Option<IncidentSnapshot>,
    pub events: Vec<SopEvent>,
}

/// Raw account numbers plus derived weight. Ranking and formatting are left
/// to whoever renders this.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountView {
    pub address: String,
    pub name: String,
    pub balance: u64,
    pub stake: u64,
    pub reputation: u32,
    pub weight: u64,
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl From<&Account> for AccountView {
    fn from(a: &Account) -> Self {
        Self {
            address: a.address.clone(),
            name: a.name.clone(),
            balance: a.balance,
            stake: a.stake,
            reputation: a.reputation,
            weight: a.weight(),
            nonce: a.nonce,
            public_key: a.public_key.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentsStateView {
    pub accounts: Vec<AccountView>,
    /// Always one entry; a list so clients render it with the same table
    pub treasury: Vec<AccountView>,
    pub total_network_weight: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BallotView {
    pub address: String,
    pub name: String,
    pub option: VoteOption,
    pub weight: u64,
}

/// Weighted tally keyed `for` / `against` / `abstain`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteStatisticsView {
    #[serde(rename = "for")]
    pub for_weight: u64,
    #[serde(rename = "against")]
    pub against_weight: u64,
    #[serde(rename = "abstain")]
    pub abstain_weight: u64,
    pub support_rate: f64,
    pub consensus_reached: bool,
    pub total_network_weight: u64,
    pub voters: usize,
}

impl From<&VoteStats> for VoteStatisticsView {
    fn from(stats: &VoteStats) -> Self {
        Self {
            for_weight: stats.for_weight,
            against_weight: stats.against_weight,
            abstain_weight: stats.abstain_weight,
            support_rate: stats.support_rate,
            consensus_reached: stats.consensus_reached,
            total_network_weight: stats.total_network_weight,
            voters: stats.voters,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClosedProposalView {
    pub proposal: Proposal,
    pub verdict: Verdict,
    pub statistics: VoteStatisticsView,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VotingStatusView {
    pub active: bool,
    pub proposal: Option<Proposal>,
    pub statistics: Option<VoteStatisticsView>,
    pub votes: Vec<BallotView>,
    pub last_closed: Option<ClosedProposalView>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EconomyView {
    pub agent_initial_balance: u64,
    pub gas_price: u64,
    pub min_gas_limit: u64,
    pub vote_gas_limit: u64,
    pub propose_gas_limit: u64,
    pub reward_gas_limit: u64,
    pub proposer_reward_token: u64,
    pub proposer_reward_rep: u32,
    pub supporter_reward_token: u64,
    pub supporter_reward_rep: u32,
    pub pass_rebate_ratio: f64,
    pub bounty_base_token: u64,
    pub penalty_against_pass_token: u64,
    pub penalty_against_pass_rep: u32,
    pub penalty_support_fail_token: u64,
    pub penalty_support_fail_rep: u32,
    pub penalty_proposer_fail_token: u64,
    pub penalty_proposer_fail_rep: u32,
    pub treasury_balance: u64,
    pub treasury_address: String,
    pub agent_count: usize,
}

pub fn chain_info(engine: &SopChain) -> ChainInfoView {
    let tainted = engine.is_tainted();
    engine.read(|s| ChainInfoView {
        chain_id: s.config().chain_id.clone(),
        block_height: s.ledger().height(),
        pending_transactions: s.pool().len(),
        latest_block_hash: to_hex(&s.ledger().latest_hash()),
        sop_state: s.sop().phase().to_string(),
        tainted,
    })
}

pub fn block(engine: &SopChain, index: u64) -> EngineResult<BlockView> {
    engine.read(|s| s.ledger().get_block(index).map(BlockView::from))
}

pub fn blocks(engine: &SopChain, limit: Option<usize>, offset: usize) -> Vec<BlockView> {
    engine.read(|s| s.ledger().range(limit, offset).iter().map(BlockView::from).collect())
}

/// Look a transaction up by hash, pending or sealed.
pub fn transaction(engine: &SopChain, tx_hash: &Hash) -> EngineResult<TransactionView> {
    engine.read(|s| {
        if let Some(tx) = s.pool().get(tx_hash) {
            return Ok(TransactionView::new(tx, None));
        }
        let (block, tx) = s.ledger().get_transaction(tx_hash)?;
        Ok(TransactionView::new(tx, Some(block)))
    })
}

pub fn merkle_proof(engine: &SopChain, block_index: u64, tx_index: usize) -> EngineResult<MerkleProofView> {
    let proof = engine.merkle_proof(block_index, tx_index)?;
    Ok(MerkleProofView {
        block_index,
        tx_index,
        transaction_hash: to_hex(&proof.tx_hash),
        merkle_root: to_hex(&proof.merkle_root),
        verified: proof.verify(),
        proof_path: proof.path,
    })
}

pub fn pending(engine: &SopChain) -> Vec<TransactionView> {
    engine.read(|s| s.pool().iter().map(|tx| TransactionView::new(tx, None)).collect())
}

pub fn sop_state(engine: &SopChain, event_limit: Option<usize>) -> SopStateView {
    engine.read(|s| {
        let sop = s.sop();
        SopStateView {
            current_state: sop.phase().to_string(),
            current_proposal: sop
                .current_proposal()
                .and_then(|id| s.governance().proposal(id))
                .cloned(),
            incident_data: sop.incident().cloned(),
            events: sop
                .recent_events(event_limit.unwrap_or(DEFAULT_EVENT_LIMIT))
                .to_vec(),
        }
    })
}

pub fn agents_state(engine: &SopChain) -> AgentsStateView {
    engine.read(|s| AgentsStateView {
        accounts: s.accounts().agents().map(AccountView::from).collect(),
        treasury: vec![AccountView::from(s.accounts().treasury())],
        total_network_weight: s.accounts().total_network_weight(),
    })
}

fn ballots(s: &ChainState) -> Vec<BallotView> {
    let Some(session) = s.governance().active() else {
        return Vec::new();
    };
    session
        .ballots
        .iter()
        .map(|(address, ballot)| {
            let account = s.accounts().get(address).ok();
            BallotView {
                address: address.clone(),
                name: account.map(|a| a.name.clone()).unwrap_or_default(),
                option: ballot.option,
                weight: account.map(Account::weight).unwrap_or(0),
            }
        })
        .collect()
}

pub fn voting_status(engine: &SopChain) -> VotingStatusView {
    engine.read(|s| VotingStatusView {
        active: s.sop().phase().voting_open(),
        proposal: s.governance().active().map(|v| v.proposal.clone()),
        statistics: s.vote_stats().as_ref().map(VoteStatisticsView::from),
        votes: ballots(s),
        last_closed: s.governance().last_closed().map(|r| ClosedProposalView {
            proposal: r.proposal.clone(),
            verdict: r.verdict,
            statistics: VoteStatisticsView::from(&r.final_tally),
        }),
    })
}

pub fn economy(engine: &SopChain) -> EconomyView {
    engine.read(|s| {
        let e = &s.config().economy;
        let treasury = s.accounts().treasury();
        EconomyView {
            agent_initial_balance: e.agent_initial_balance,
            gas_price: e.gas_price,
            min_gas_limit: e.min_gas_limit,
            vote_gas_limit: e.vote_gas_limit,
            propose_gas_limit: e.propose_gas_limit,
            reward_gas_limit: e.reward_gas_limit,
            proposer_reward_token: e.proposer_reward_token,
            proposer_reward_rep: e.proposer_reward_rep,
            supporter_reward_token: e.supporter_reward_token,
            supporter_reward_rep: e.supporter_reward_rep,
            pass_rebate_ratio: e.pass_rebate_percent as f64 / 100.0,
            bounty_base_token: e.bounty_base_token,
            penalty_against_pass_token: e.penalty_against_pass_token,
            penalty_against_pass_rep: e.penalty_against_pass_rep,
            penalty_support_fail_token: e.penalty_support_fail_token,
            penalty_support_fail_rep: e.penalty_support_fail_rep,
            penalty_proposer_fail_token: e.penalty_proposer_fail_token,
            penalty_proposer_fail_rep: e.penalty_proposer_fail_rep,
            treasury_balance: treasury.balance,
            treasury_address: treasury.address.clone(),
            agent_count: s.accounts().agent_count(),
        }
    })
}
