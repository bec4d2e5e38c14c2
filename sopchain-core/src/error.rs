//! Engine error taxonomy
//!
//! Transaction-level variants reject a single transaction and leave the
//! surrounding batch untouched. `ChainContinuity` is the only fatal one: it
//! taints the engine instance until an explicit reset.

use thiserror::Error;

use crate::stf::SopPhase;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Unknown block, transaction or proposal on the read path.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid nonce for {sender}: expected {expected}, got {actual}")]
    InvalidNonce {
        sender: String,
        expected: u64,
        actual: u64,
    },

    #[error("insufficient balance for {address}: have {have}, need {need}")]
    InsufficientBalance {
        address: String,
        have: u64,
        need: u64,
    },

    #[error("gas limit too low for {tx_type}: minimum {minimum}, got {actual}")]
    GasLimitTooLow {
        tx_type: String,
        minimum: u64,
        actual: u64,
    },

    #[error("gas price too low: minimum {minimum}, got {actual}")]
    GasPriceTooLow { minimum: u64, actual: u64 },

    #[error("{action} is not allowed while SOP is in {current}")]
    InvalidPhase { action: String, current: SopPhase },

    #[error("index {index} out of range for {len} leaves")]
    InvalidIndex { index: usize, len: usize },

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transaction pool is full ({0} pending)")]
    PoolFull(usize),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Internal invariant breach. Unrecoverable without a reset.
    #[error("chain continuity broken at block {index}: {reason}")]
    ChainContinuity { index: u64, reason: String },
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn invalid_phase(action: impl Into<String>, current: SopPhase) -> Self {
        EngineError::InvalidPhase {
            action: action.into(),
            current,
        }
    }

    /// True for errors that must surface loudly instead of being reported
    /// back to a single submitter.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::ChainContinuity { .. })
    }
}
