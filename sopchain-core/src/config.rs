//! Engine configuration
//!
//! Every reward, penalty, rebate and gas constant lives here so no call site
//! hard-codes a magnitude. Loaded from TOML; any omitted field falls back to
//! the defaults below.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::stf::hash::derive_address;
use crate::stf::keys::parse_public_key;
use crate::stf::TxType;

pub const DEFAULT_CHAIN_ID: &str = "mABC-DAO-Chain";

/// The seven incident-response roles of the default agent set
pub const DEFAULT_AGENT_NAMES: [&str; 7] = [
    "Alert Receiver",
    "Process Scheduler",
    "Data Detective",
    "Dependency Explorer",
    "Probability Oracle",
    "Fault Mapper",
    "Solution Engineer",
];

/// Gas, reward and penalty constants
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyParams {
    pub agent_initial_balance: u64,
    /// Neutral starting reputation (0-100)
    pub agent_initial_reputation: u32,

    /// Minimum accepted gas price
    pub gas_price: u64,
    /// Minimum gas limit for transfer and stake
    pub min_gas_limit: u64,
    pub vote_gas_limit: u64,
    pub propose_gas_limit: u64,
    /// Gas limit stamped on system settlement transactions (never charged)
    pub reward_gas_limit: u64,

    pub proposer_reward_token: u64,
    pub proposer_reward_rep: u32,
    pub supporter_reward_token: u64,
    pub supporter_reward_rep: u32,
    /// Percentage (0-100) of voting gas returned to `for` voters on a pass
    pub pass_rebate_percent: u8,
    /// Extra payout to the proposer when the root cause is accepted
    pub bounty_base_token: u64,

    pub penalty_against_pass_token: u64,
    pub penalty_against_pass_rep: u32,
    pub penalty_support_fail_token: u64,
    pub penalty_support_fail_rep: u32,
    pub penalty_proposer_fail_token: u64,
    pub penalty_proposer_fail_rep: u32,

    pub max_pending_txs: usize,
}

impl Default for EconomyParams {
    fn default() -> Self {
        Self {
            agent_initial_balance: 10_000,
            agent_initial_reputation: 50,
            gas_price: 1,
            min_gas_limit: 100,
            vote_gas_limit: 200,
            propose_gas_limit: 500,
            reward_gas_limit: 100,
            proposer_reward_token: 100,
            proposer_reward_rep: 10,
            supporter_reward_token: 50,
            supporter_reward_rep: 5,
            pass_rebate_percent: 50,
            bounty_base_token: 200,
            penalty_against_pass_token: 30,
            penalty_against_pass_rep: 5,
            penalty_support_fail_token: 20,
            penalty_support_fail_rep: 5,
            penalty_proposer_fail_token: 80,
            penalty_proposer_fail_rep: 15,
            max_pending_txs: 1000,
        }
    }
}

impl EconomyParams {
    /// Type-specific gas limit floor
    pub fn min_gas_for(&self, tx_type: TxType) -> u64 {
        match tx_type {
            TxType::Transfer | TxType::Stake => self.min_gas_limit,
            TxType::Vote => self.vote_gas_limit,
            TxType::ProposeRootCause => self.propose_gas_limit,
            TxType::Slash => self.reward_gas_limit,
        }
    }
}

/// When an open proposal is closed as failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingPolicy {
    /// Fail the proposal once every agent has voted without consensus
    pub close_on_full_turnout: bool,
    /// Fail immediately when `against` weight exceeds half the network
    pub reject_on_against_majority: bool,
}

impl Default for VotingPolicy {
    fn default() -> Self {
        Self {
            close_on_full_turnout: true,
            reject_on_against_majority: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreasurySpec {
    pub name: String,
    pub initial_balance: u64,
}

impl Default for TreasurySpec {
    fn default() -> Self {
        Self {
            name: "System Treasury".to_string(),
            initial_balance: 100_000,
        }
    }
}

impl TreasurySpec {
    pub fn address(&self) -> String {
        derive_address("treasury", &self.name)
    }
}

/// One member of the fixed agent set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_balance: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_stake: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_reputation: Option<u32>,
    /// Hex ed25519 key that must sign this agent's transactions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl AgentSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            initial_balance: None,
            initial_stake: None,
            initial_reputation: None,
            public_key: None,
        }
    }

    pub fn address(&self) -> String {
        derive_address("agent", &self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chain_id: String,
    pub economy: EconomyParams,
    pub voting: VotingPolicy,
    pub treasury: TreasurySpec,
    pub agents: Vec<AgentSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_agents(&DEFAULT_AGENT_NAMES)
    }
}

impl EngineConfig {
    /// Default economy with the given agent names.
    pub fn with_agents(names: &[&str]) -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID.to_string(),
            economy: EconomyParams::default(),
            voting: VotingPolicy::default(),
            treasury: TreasurySpec::default(),
            agents: names.iter().map(|n| AgentSpec::named(n)).collect(),
        }
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s).context("Failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agents.is_empty() {
            bail!("at least one agent must be configured");
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                bail!("agent names must not be empty");
            }
            if !seen.insert(agent.name.as_str()) {
                bail!("duplicate agent name: {}", agent.name);
            }
            if agent.name == self.treasury.name {
                bail!("agent {} collides with the treasury name", agent.name);
            }
            if let Some(key) = &agent.public_key {
                parse_public_key(key).with_context(|| format!("agent {}", agent.name))?;
            }
        }
        let e = &self.economy;
        if e.pass_rebate_percent > 100 {
            bail!("pass_rebate_percent must be within 0-100, got {}", e.pass_rebate_percent);
        }
        if e.agent_initial_reputation > crate::stf::REPUTATION_CEILING {
            bail!("agent_initial_reputation must be within 0-100");
        }
        if e.min_gas_limit == 0 || e.vote_gas_limit == 0 || e.propose_gas_limit == 0 {
            bail!("gas limit minimums must be positive");
        }
        if e.max_pending_txs == 0 {
            bail!("max_pending_txs must be positive");
        }
        Ok(())
    }
}
