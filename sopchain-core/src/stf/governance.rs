//! Root-cause governance
//!
//! Agents vote on the single active root-cause proposal. Voting power is
//! `stake + reputation`, read at tally time. A proposal closes exactly once,
//! either by consensus or by one of the failure triggers in [`VotingPolicy`],
//! and the closing produces a settlement plan the executor applies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::accounts::AccountLedger;
use super::hash::short;
use super::transaction::VoteOption;
use crate::config::{EconomyParams, VotingPolicy};
use crate::error::{EngineError, EngineResult};

/// Proposal status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Voting is open
    Active,
    /// Consensus reached and settled
    Passed,
    /// Failed and settled
    Rejected,
}

/// A root-cause proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Hex hash of the proposing transaction
    pub id: String,
    pub content: String,
    pub proposer: String,
    pub created_at: u64,
    pub status: ProposalStatus,
}

/// Latest ballot of one voter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub option: VoteOption,
    /// Gas paid across every ballot this voter cast on the proposal
    pub gas_spent: u64,
    pub timestamp: u64,
}

/// Weighted tally of an open proposal
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteStats {
    pub for_weight: u64,
    pub against_weight: u64,
    pub abstain_weight: u64,
    pub total_network_weight: u64,
    pub voters: usize,
    /// `for / (for + against + abstain)`, 0 with no weighted ballots
    pub support_rate: f64,
    pub consensus_reached: bool,
}

impl VoteStats {
    pub fn voted_weight(&self) -> u64 {
        self.for_weight
            .saturating_add(self.against_weight)
            .saturating_add(self.abstain_weight)
    }
}

/// Strict majority of the network: `2·part > total`. Exactly half never counts.
pub fn exceeds_half(part: u64, total: u64) -> bool {
    (part as u128) * 2 > total as u128
}

/// Why an open proposal closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// `for` weight exceeds half the network
    Consensus,
    /// `against` weight exceeds half the network
    AgainstMajority,
    /// Every agent voted and consensus was not reached
    FullTurnout,
    /// Closed from outside (voting timeout)
    Closed,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Consensus)
    }
}

/// A token and reputation movement produced by settlement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub target: String,
    pub token: u64,
    pub reputation: u32,
    pub reason: String,
}

/// Everything a closed proposal owes and is owed. Penalties are collected
/// before rewards are paid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPlan {
    pub penalties: Vec<Adjustment>,
    pub rewards: Vec<Adjustment>,
}

/// Open voting round on the active proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingSession {
    pub proposal: Proposal,
    /// Ballots keyed by voter address (ordered for deterministic settlement)
    pub ballots: BTreeMap<String, Ballot>,
}

impl VotingSession {
    pub fn tally(&self, accounts: &AccountLedger) -> VoteStats {
        let (mut f, mut a, mut ab) = (0u64, 0u64, 0u64);
        for (voter, ballot) in &self.ballots {
            let weight = accounts.get(voter).map(|acc| acc.weight()).unwrap_or(0);
            let bucket = match ballot.option {
                VoteOption::For => &mut f,
                VoteOption::Against => &mut a,
                VoteOption::Abstain => &mut ab,
            };
            *bucket = bucket.saturating_add(weight);
        }
        let total_network_weight = accounts.total_network_weight();
        let voted = f.saturating_add(a).saturating_add(ab);
        VoteStats {
            for_weight: f,
            against_weight: a,
            abstain_weight: ab,
            total_network_weight,
            voters: self.ballots.len(),
            support_rate: if voted == 0 { 0.0 } else { f as f64 / voted as f64 },
            consensus_reached: exceeds_half(f, total_network_weight),
        }
    }

    /// Whether the current tally closes the proposal.
    pub fn evaluate(&self, stats: &VoteStats, policy: &VotingPolicy, agent_count: usize) -> Option<Verdict> {
        if stats.consensus_reached {
            return Some(Verdict::Consensus);
        }
        if policy.reject_on_against_majority
            && exceeds_half(stats.against_weight, stats.total_network_weight)
        {
            return Some(Verdict::AgainstMajority);
        }
        if policy.close_on_full_turnout && agent_count > 0 && self.ballots.len() >= agent_count {
            return Some(Verdict::FullTurnout);
        }
        None
    }

    fn voters_with(&self, option: VoteOption) -> impl Iterator<Item = (&String, &Ballot)> {
        self.ballots.iter().filter(move |(_, b)| b.option == option)
    }

    /// Rewards and penalties owed once the proposal closes with `passed`.
    pub fn settlement_plan(&self, passed: bool, economy: &EconomyParams) -> SettlementPlan {
        let proposer = &self.proposal.proposer;
        let mut plan = SettlementPlan::default();

        if passed {
            plan.rewards.push(Adjustment {
                target: proposer.clone(),
                token: economy
                    .proposer_reward_token
                    .saturating_add(economy.bounty_base_token),
                reputation: economy.proposer_reward_rep,
                reason: "proposer reward + bounty".into(),
            });
            for (voter, ballot) in self.voters_with(VoteOption::For) {
                if voter != proposer {
                    plan.rewards.push(Adjustment {
                        target: voter.clone(),
                        token: economy.supporter_reward_token,
                        reputation: economy.supporter_reward_rep,
                        reason: "supporter reward".into(),
                    });
                }
                let rebate = ballot.gas_spent.saturating_mul(economy.pass_rebate_percent as u64) / 100;
                if rebate > 0 {
                    plan.rewards.push(Adjustment {
                        target: voter.clone(),
                        token: rebate,
                        reputation: 0,
                        reason: "voting gas rebate".into(),
                    });
                }
            }
            for (voter, _) in self.voters_with(VoteOption::Against) {
                plan.penalties.push(Adjustment {
                    target: voter.clone(),
                    token: economy.penalty_against_pass_token,
                    reputation: economy.penalty_against_pass_rep,
                    reason: "voted against an accepted root cause".into(),
                });
            }
        } else {
            for (voter, _) in self.voters_with(VoteOption::For) {
                if voter != proposer {
                    plan.penalties.push(Adjustment {
                        target: voter.clone(),
                        token: economy.penalty_support_fail_token,
                        reputation: economy.penalty_support_fail_rep,
                        reason: "supported a rejected root cause".into(),
                    });
                }
            }
            plan.penalties.push(Adjustment {
                target: proposer.clone(),
                token: economy.penalty_proposer_fail_token,
                reputation: economy.penalty_proposer_fail_rep,
                reason: "proposed a rejected root cause".into(),
            });
        }
        plan
    }
}

/// A closed proposal with the tally it closed on
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal: Proposal,
    pub verdict: Verdict,
    pub final_tally: VoteStats,
    pub ballots: BTreeMap<String, Ballot>,
}

/// Governance state: the open round plus every closed proposal
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernanceState {
    active: Option<VotingSession>,
    history: Vec<ProposalRecord>,
}

impl GovernanceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&VotingSession> {
        self.active.as_ref()
    }

    pub fn history(&self) -> &[ProposalRecord] {
        &self.history
    }

    pub fn last_closed(&self) -> Option<&ProposalRecord> {
        self.history.last()
    }

    /// Look up a proposal, open or closed.
    pub fn proposal(&self, id: &str) -> Option<&Proposal> {
        self.active
            .as_ref()
            .map(|s| &s.proposal)
            .filter(|p| p.id == id)
            .or_else(|| {
                self.history
                    .iter()
                    .map(|r| &r.proposal)
                    .find(|p| p.id == id)
            })
    }

    pub fn open(&mut self, id: String, proposer: String, content: String, created_at: u64) -> EngineResult<&Proposal> {
        if let Some(session) = &self.active {
            return Err(EngineError::InvalidPayload(format!(
                "proposal {} is still open",
                session.proposal.id
            )));
        }
        tracing::info!("📋 Root-cause proposal {} opened by {}", short(&id), short(&proposer));
        let session = self.active.insert(VotingSession {
            proposal: Proposal {
                id,
                content,
                proposer,
                created_at,
                status: ProposalStatus::Active,
            },
            ballots: BTreeMap::new(),
        });
        Ok(&session.proposal)
    }

    /// Record or overwrite `voter`'s ballot on the open proposal.
    pub fn cast(&mut self, proposal_id: &str, voter: &str, option: VoteOption, gas: u64, timestamp: u64) -> EngineResult<()> {
        let session = self
            .active
            .as_mut()
            .filter(|s| s.proposal.id == proposal_id)
            .ok_or_else(|| EngineError::not_found(format!("active proposal {}", proposal_id)))?;
        let spent = session
            .ballots
            .get(voter)
            .map(|b| b.gas_spent)
            .unwrap_or(0)
            .saturating_add(gas);
        session.ballots.insert(
            voter.to_string(),
            Ballot {
                option,
                gas_spent: spent,
                timestamp,
            },
        );
        tracing::info!("🗳️ {} votes {} on proposal {}", short(voter), option, short(proposal_id));
        Ok(())
    }

    /// Close the open proposal on `verdict`. Taking the session out is the
    /// latch: a proposal can be finalized once, after which it only lives in
    /// history.
    pub fn finalize(&mut self, verdict: Verdict, final_tally: VoteStats) -> EngineResult<&ProposalRecord> {
        let mut session = self
            .active
            .take()
            .ok_or_else(|| EngineError::not_found("active proposal"))?;
        session.proposal.status = if verdict.passed() {
            ProposalStatus::Passed
        } else {
            ProposalStatus::Rejected
        };
        let index = self.history.len();
        self.history.push(ProposalRecord {
            proposal: session.proposal,
            verdict,
            final_tally,
            ballots: session.ballots,
        });
        Ok(&self.history[index])
    }
}
