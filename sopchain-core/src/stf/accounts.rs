//! Account & treasury ledger
//!
//! A fixed set of agent accounts plus one treasury, created at genesis and
//! never added or removed mid-run. Every mutation either fully applies or
//! returns an error having touched nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Reputation is clamped into `0..=REPUTATION_CEILING`.
pub const REPUTATION_CEILING: u32 = 100;

/// Balance, stake and reputation of a single participant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub name: String,
    pub balance: u64,
    pub stake: u64,
    pub reputation: u32,
    /// Next expected transaction nonce
    pub nonce: u64,
    /// Registered ed25519 key (hex). The treasury has none and never signs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Account {
    fn new(address: String, name: String, balance: u64, stake: u64, reputation: u32) -> Self {
        Self {
            address,
            name,
            balance,
            stake,
            reputation: reputation.min(REPUTATION_CEILING),
            nonce: 0,
            public_key: None,
        }
    }

    /// Voting weight: `stake + reputation`. Derived, never submitted.
    pub fn weight(&self) -> u64 {
        self.stake.saturating_add(self.reputation as u64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountLedger {
    /// Agents keyed by address (ordered for deterministic iteration)
    agents: BTreeMap<String, Account>,
    treasury: Account,
}

impl AccountLedger {
    /// Build the genesis account set from configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        let agents = config
            .agents
            .iter()
            .map(|spec| {
                let mut account = Account::new(
                    spec.address(),
                    spec.name.clone(),
                    spec.initial_balance.unwrap_or(config.economy.agent_initial_balance),
                    spec.initial_stake.unwrap_or(0),
                    spec.initial_reputation
                        .unwrap_or(config.economy.agent_initial_reputation),
                );
                account.public_key = spec.public_key.clone();
                (account.address.clone(), account)
            })
            .collect();
        let treasury = Account::new(
            config.treasury.address(),
            config.treasury.name.clone(),
            config.treasury.initial_balance,
            0,
            0,
        );
        Self { agents, treasury }
    }

    pub fn get(&self, address: &str) -> EngineResult<&Account> {
        if address == self.treasury.address {
            return Ok(&self.treasury);
        }
        self.agents
            .get(address)
            .ok_or_else(|| EngineError::UnknownAccount(address.to_string()))
    }

    fn get_mut(&mut self, address: &str) -> EngineResult<&mut Account> {
        if address == self.treasury.address {
            return Ok(&mut self.treasury);
        }
        self.agents
            .get_mut(address)
            .ok_or_else(|| EngineError::UnknownAccount(address.to_string()))
    }

    /// Resolve either an address or an agent name to an address.
    pub fn resolve(&self, address_or_name: &str) -> EngineResult<String> {
        if self.is_known(address_or_name) {
            return Ok(address_or_name.to_string());
        }
        if self.treasury.name == address_or_name {
            return Ok(self.treasury.address.clone());
        }
        self.agents
            .values()
            .find(|a| a.name == address_or_name)
            .map(|a| a.address.clone())
            .ok_or_else(|| EngineError::UnknownAccount(address_or_name.to_string()))
    }

    pub fn is_known(&self, address: &str) -> bool {
        address == self.treasury.address || self.agents.contains_key(address)
    }

    pub fn is_agent(&self, address: &str) -> bool {
        self.agents.contains_key(address)
    }

    pub fn is_treasury(&self, address: &str) -> bool {
        address == self.treasury.address
    }

    pub fn agents(&self) -> impl Iterator<Item = &Account> {
        self.agents.values()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn treasury(&self) -> &Account {
        &self.treasury
    }

    /// Sum of every agent's current weight.
    pub fn total_network_weight(&self) -> u64 {
        self.agents.values().map(Account::weight).sum()
    }

    /// Balances + stakes of every agent, plus the treasury balance.
    pub fn total_value(&self) -> u128 {
        let agents: u128 = self
            .agents
            .values()
            .map(|a| a.balance as u128 + a.stake as u128)
            .sum();
        agents + self.treasury.balance as u128
    }

    /// Debit `from` and credit `to`; both sides or neither.
    pub fn apply_transfer(&mut self, from: &str, to: &str, amount: u64) -> EngineResult<()> {
        self.get(to)?;
        let sender = self.get(from)?;
        if sender.balance < amount {
            return Err(EngineError::InsufficientBalance {
                address: from.to_string(),
                have: sender.balance,
                need: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        self.get_mut(from)?.balance -= amount;
        let recipient = self.get_mut(to)?;
        recipient.balance = recipient.balance.saturating_add(amount);
        Ok(())
    }

    /// Move `amount` from balance into stake.
    pub fn apply_stake(&mut self, address: &str, amount: u64) -> EngineResult<u64> {
        let account = self.get_mut(address)?;
        if account.balance < amount {
            return Err(EngineError::InsufficientBalance {
                address: address.to_string(),
                have: account.balance,
                need: amount,
            });
        }
        account.balance -= amount;
        account.stake = account.stake.saturating_add(amount);
        Ok(account.stake)
    }

    /// Shift reputation by `delta`, clamped to the valid range.
    pub fn adjust_reputation(&mut self, address: &str, delta: i64) -> EngineResult<u32> {
        let account = self.get_mut(address)?;
        let next = (account.reputation as i64 + delta).clamp(0, REPUTATION_CEILING as i64);
        account.reputation = next as u32;
        Ok(account.reputation)
    }

    pub fn credit_treasury(&mut self, amount: u64) {
        self.treasury.balance = self.treasury.balance.saturating_add(amount);
    }

    pub fn debit_treasury(&mut self, amount: u64) -> EngineResult<()> {
        if self.treasury.balance < amount {
            return Err(EngineError::InsufficientBalance {
                address: self.treasury.address.clone(),
                have: self.treasury.balance,
                need: amount,
            });
        }
        self.treasury.balance -= amount;
        Ok(())
    }

    /// Charge a gas fee from `address` into the treasury.
    pub fn charge_gas(&mut self, address: &str, fee: u64) -> EngineResult<()> {
        let treasury = self.treasury.address.clone();
        self.apply_transfer(address, &treasury, fee)
    }

    /// Pay `amount` out of the treasury, reduced to what the treasury holds.
    /// Returns the amount actually paid.
    pub fn pay_from_treasury(&mut self, address: &str, amount: u64) -> EngineResult<u64> {
        self.get(address)?;
        let paid = amount.min(self.treasury.balance);
        self.debit_treasury(paid)?;
        let account = self.get_mut(address)?;
        account.balance = account.balance.saturating_add(paid);
        Ok(paid)
    }

    /// Debit up to `amount` of balance into the treasury and lower
    /// reputation. Returns the amount actually taken.
    pub fn slash(&mut self, address: &str, amount: u64, reputation: u32) -> EngineResult<u64> {
        let account = self.get_mut(address)?;
        let taken = amount.min(account.balance);
        account.balance -= taken;
        account.reputation = account.reputation.saturating_sub(reputation);
        self.credit_treasury(taken);
        Ok(taken)
    }

    pub fn bump_nonce(&mut self, address: &str) -> EngineResult<u64> {
        let account = self.get_mut(address)?;
        account.nonce += 1;
        Ok(account.nonce)
    }
}
