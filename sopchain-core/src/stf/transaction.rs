//! Transaction types for SopChain

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::hash::{CanonicalEncoder, Hash};

/// Ballot option on the active root-cause proposal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteOption {
    For,
    Against,
    Abstain,
}

impl VoteOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteOption::For => "for",
            VoteOption::Against => "against",
            VoteOption::Abstain => "abstain",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            VoteOption::For => 0,
            VoteOption::Against => 1,
            VoteOption::Abstain => 2,
        }
    }
}

impl fmt::Display for VoteOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "for" | "yes" => Ok(VoteOption::For),
            "against" | "no" => Ok(VoteOption::Against),
            "abstain" => Ok(VoteOption::Abstain),
            other => Err(format!("unknown vote option: {}", other)),
        }
    }
}

/// Discriminant of [`TxPayload`], used for gas minimums and display
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Transfer,
    Stake,
    Vote,
    ProposeRootCause,
    Slash,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Transfer => "transfer",
            TxType::Stake => "stake",
            TxType::Vote => "vote",
            TxType::ProposeRootCause => "propose_root_cause",
            TxType::Slash => "slash",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific transaction data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tx_type", content = "data", rename_all = "snake_case")]
pub enum TxPayload {
    /// Move tokens between two accounts
    Transfer { to: String, amount: u64 },

    /// Escrow tokens from balance into stake
    Stake { amount: u64 },

    /// Ballot on the active proposal
    Vote {
        proposal_id: String,
        option: VoteOption,
    },

    /// Diagnosed root cause for the current incident
    ProposeRootCause { content: String },

    /// System-only penalty routed to the treasury
    Slash {
        target: String,
        amount: u64,
        reputation: u32,
        reason: String,
    },
}

impl TxPayload {
    pub fn tx_type(&self) -> TxType {
        match self {
            TxPayload::Transfer { .. } => TxType::Transfer,
            TxPayload::Stake { .. } => TxType::Stake,
            TxPayload::Vote { .. } => TxType::Vote,
            TxPayload::ProposeRootCause { .. } => TxType::ProposeRootCause,
            TxPayload::Slash { .. } => TxType::Slash,
        }
    }

    fn encode_into(&self, enc: &mut CanonicalEncoder) {
        match self {
            TxPayload::Transfer { to, amount } => {
                enc.u8(0).str(to).u64(*amount);
            }
            TxPayload::Stake { amount } => {
                enc.u8(1).u64(*amount);
            }
            TxPayload::Vote {
                proposal_id,
                option,
            } => {
                enc.u8(2).str(proposal_id).u8(option.tag());
            }
            TxPayload::ProposeRootCause { content } => {
                enc.u8(3).str(content);
            }
            TxPayload::Slash {
                target,
                amount,
                reputation,
                reason,
            } => {
                enc.u8(4)
                    .str(target)
                    .u64(*amount)
                    .u64(*reputation as u64)
                    .str(reason);
            }
        }
    }
}

/// A content-addressed transaction. Fields are fixed at construction; the
/// hash covers every one of them except the signature, which signs the hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(with = "hex_hash")]
    tx_hash: Hash,
    sender: String,
    nonce: u64,
    gas_price: u64,
    gas_limit: u64,
    #[serde(flatten)]
    payload: TxPayload,
    timestamp: u64,
    /// Hex ed25519 signature over `tx_hash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl Transaction {
    pub fn new(
        sender: impl Into<String>,
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
        payload: TxPayload,
        timestamp: u64,
    ) -> Self {
        let sender = sender.into();
        let tx_hash = Self::compute_hash(&sender, nonce, gas_price, gas_limit, &payload, timestamp);
        Self {
            tx_hash,
            sender,
            nonce,
            gas_price,
            gas_limit,
            payload,
            timestamp,
            signature: None,
        }
    }

    /// Attach a hex signature. Replaces any previous one; the hash is unchanged.
    pub fn with_signature(mut self, signature: String) -> Self {
        self.signature = Some(signature);
        self
    }

    fn compute_hash(
        sender: &str,
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
        payload: &TxPayload,
        timestamp: u64,
    ) -> Hash {
        let mut enc = CanonicalEncoder::new(b"sopchain-tx");
        enc.str(sender).u64(nonce).u64(gas_price).u64(gas_limit);
        payload.encode_into(&mut enc);
        enc.u64(timestamp);
        enc.finish()
    }

    /// Recompute the hash from the fields (used when auditing loaded chains).
    pub fn hash_matches(&self) -> bool {
        self.tx_hash
            == Self::compute_hash(
                &self.sender,
                self.nonce,
                self.gas_price,
                self.gas_limit,
                &self.payload,
                self.timestamp,
            )
    }

    pub fn hash(&self) -> Hash {
        self.tx_hash
    }

    pub fn tx_type(&self) -> TxType {
        self.payload.tx_type()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn gas_price(&self) -> u64 {
        self.gas_price
    }

    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    /// Full fee charged up front: `gas_price × gas_limit`.
    pub fn gas_fee(&self) -> u64 {
        self.gas_price.saturating_mul(self.gas_limit)
    }

    pub fn payload(&self) -> &TxPayload {
        &self.payload
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
}

/// What executing a transaction did
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxOutcome {
    Transferred { to: String, amount: u64 },
    Staked { amount: u64, new_stake: u64 },
    ProposalCreated { proposal_id: String },
    VoteRecorded {
        proposal_id: String,
        option: VoteOption,
        /// Set when this ballot closed the proposal
        #[serde(skip_serializing_if = "Option::is_none")]
        settled: Option<bool>,
    },
    Slashed { target: String, amount: u64 },
    /// Payload failed after gas was charged; excluded from the block
    Failed { error: String },
}

/// Receipt for every transaction executed during block production
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    #[serde(with = "hex_hash")]
    pub tx_hash: Hash,
    pub tx_type: TxType,
    pub sender: String,
    pub gas_used: u64,
    pub outcome: TxOutcome,
}

impl TxReceipt {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, TxOutcome::Failed { .. })
    }
}

/// Serde adapter rendering 32-byte hashes as hex strings
pub mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::stf::hash::{from_hex, to_hex, Hash};

    pub fn serialize<S: Serializer>(hash: &Hash, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&to_hex(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(d)?;
        from_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid hash: {}", s)))
    }
}
