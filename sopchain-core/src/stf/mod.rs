//! State Transition Function (STF) for SopChain
//!
//! This module defines the core state machine that:
//! - Seals transactions into Merkle-rooted, hash-linked blocks
//! - Authenticates agent transactions with ed25519 signatures
//! - Tracks agent balances, stakes and reputation plus the treasury
//! - Drives the incident SOP from data collection to a solution
//! - Tallies weighted votes and settles rewards and penalties once

pub mod hash;
pub mod keys;
pub mod merkle;
mod accounts;
mod governance;
mod ledger;
mod pool;
mod sop;
mod state;
mod transaction;

pub use accounts::{Account, AccountLedger, REPUTATION_CEILING};
pub use governance::{
    exceeds_half, Adjustment, Ballot, GovernanceState, Proposal, ProposalRecord, ProposalStatus,
    SettlementPlan, Verdict, VoteStats, VotingSession,
};
pub use hash::Hash;
pub use keys::{KeyEntry, Keyring};
pub use ledger::{Block, BlockHeader, Ledger};
pub use merkle::{MerkleProof, Position, ProofStep};
pub use pool::TxPool;
pub use sop::{IncidentSnapshot, SopEvent, SopEventKind, SopPhase, SopState};
pub use state::{system_clock, ChainState, Clock, SealOutcome, SopChain, TxLocation};
pub use transaction::{
    hex_hash, Transaction, TxOutcome, TxPayload, TxReceipt, TxType, VoteOption,
};
