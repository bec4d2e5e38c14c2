//! Analysis cycle driver
//!
//! The engine never decides what an agent thinks. An [`AgentPolicy`] supplies
//! root-cause proposals and ballots, and [`run_analysis_cycle`] turns them
//! into ordinary transactions signed from a [`Keyring`]: ingest if idle,
//! propose if data is collected, then collect one ballot per agent and seal
//! them.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::stf::{
    Account, IncidentSnapshot, Keyring, Proposal, SealOutcome, SopChain, SopPhase, TxOutcome,
    TxPayload, TxReceipt, VoteOption,
};

/// Decision source for one analysis cycle
pub trait AgentPolicy {
    /// Root cause text for the incident, or `None` to hold off proposing.
    fn propose(&mut self, proposer: &Account, incident: &IncidentSnapshot) -> Option<String>;

    fn vote(&mut self, voter: &Account, proposal: &Proposal) -> VoteOption;
}

/// Fixed answers, keyed by agent name. Agents without an entry cast
/// `default_vote`.
#[derive(Clone, Debug)]
pub struct ScriptedPolicy {
    root_cause: Option<String>,
    votes: HashMap<String, VoteOption>,
    default_vote: VoteOption,
}

impl ScriptedPolicy {
    pub fn new(root_cause: Option<String>, default_vote: VoteOption) -> Self {
        Self {
            root_cause,
            votes: HashMap::new(),
            default_vote,
        }
    }

    pub fn with_vote(mut self, agent_name: &str, option: VoteOption) -> Self {
        self.votes.insert(agent_name.to_string(), option);
        self
    }
}

impl AgentPolicy for ScriptedPolicy {
    fn propose(&mut self, _proposer: &Account, _incident: &IncidentSnapshot) -> Option<String> {
        self.root_cause.clone()
    }

    fn vote(&mut self, voter: &Account, _proposal: &Proposal) -> VoteOption {
        self.votes.get(&voter.name).copied().unwrap_or(self.default_vote)
    }
}

/// Incident handed to a cycle that starts from `Init`
#[derive(Clone, Debug)]
pub struct IncidentReport {
    /// Agent name or address; also the proposer for this cycle
    pub submitter: String,
    pub summary: String,
    pub raw_data: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub starting_phase: SopPhase,
    pub final_phase: SopPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<String>,
    pub sealed_blocks: Vec<u64>,
    pub receipts: Vec<TxReceipt>,
    /// Ballots refused before admission (agent name, reason), including
    /// agents with no key in the keyring
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<(String, String)>,
}

impl CycleReport {
    fn record(&mut self, outcome: SealOutcome) {
        if let Some(block) = outcome.block {
            self.sealed_blocks.push(block.index());
        }
        self.receipts.extend(outcome.receipts);
    }
}

/// Advance the SOP as far as one round of agent decisions allows.
pub fn run_analysis_cycle(
    engine: &SopChain,
    policy: &mut dyn AgentPolicy,
    keys: &Keyring,
    incident: &IncidentReport,
) -> EngineResult<CycleReport> {
    let starting_phase = engine.phase();
    let mut report = CycleReport {
        starting_phase,
        final_phase: starting_phase,
        proposal_id: None,
        sealed_blocks: Vec::new(),
        receipts: Vec::new(),
        skipped: Vec::new(),
    };

    if matches!(starting_phase, SopPhase::Consensus | SopPhase::Solution) {
        return Err(EngineError::invalid_phase("analysis_cycle", starting_phase));
    }

    if starting_phase == SopPhase::Init {
        engine.ingest_incident(&incident.submitter, &incident.summary, incident.raw_data.clone())?;
    }

    if engine.phase() == SopPhase::DataCollected {
        let proposer = engine.account(&incident.submitter)?;
        let snapshot = engine
            .read(|s| s.sop().incident().cloned())
            .ok_or_else(|| EngineError::not_found("incident snapshot"))?;
        let Some(content) = policy.propose(&proposer, &snapshot) else {
            tracing::info!("📋 {} has no root cause to propose yet", proposer.name);
            report.final_phase = engine.phase();
            return Ok(report);
        };
        let tx = keys.prepare(engine, &proposer.address, TxPayload::ProposeRootCause { content })?;
        let outcome = engine.submit_and_seal(tx)?;
        if let Some(TxOutcome::Failed { error }) = outcome.receipts.first().map(|r| &r.outcome) {
            tracing::warn!("⚠️ Proposal from {} failed: {}", proposer.name, error);
        }
        report.record(outcome);
    }

    let Some((proposal, voters)) = engine.read(|s| {
        let session = s.governance().active()?;
        let voters: Vec<Account> = s
            .accounts()
            .agents()
            .filter(|a| !session.ballots.contains_key(&a.address))
            .cloned()
            .collect();
        Some((session.proposal.clone(), voters))
    }) else {
        report.final_phase = engine.phase();
        return Ok(report);
    };
    report.proposal_id = Some(proposal.id.clone());

    for voter in &voters {
        let option = policy.vote(voter, &proposal);
        let payload = TxPayload::Vote {
            proposal_id: proposal.id.clone(),
            option,
        };
        let admitted = keys
            .prepare(engine, &voter.address, payload)
            .and_then(|tx| engine.submit(tx));
        if let Err(e) = admitted {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!("⚠️ Ballot from {} refused: {}", voter.name, e);
            report.skipped.push((voter.name.clone(), e.to_string()));
        }
    }

    let outcome = engine.produce_block()?;
    report.record(outcome);
    report.final_phase = engine.phase();
    tracing::info!(
        "🗳️ Analysis cycle done: {} -> {} ({} blocks sealed)",
        report.starting_phase,
        report.final_phase,
        report.sealed_blocks.len()
    );
    Ok(report)
}
