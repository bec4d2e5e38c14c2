//! SopChain - Merkle-authenticated ledger and stake-weighted governance
//! engine for multi-agent incident response.

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod stf;
pub mod storage;
