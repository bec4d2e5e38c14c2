//! Incident-response SOP state machine
//!
//! `Init → Data_Collected → Root_Cause_Proposed → Consensus → Solution`.
//! `Consensus` is transient: a passing proposal settles and moves straight on
//! to `Solution`, a failing one falls back to `Data_Collected` so the same
//! incident can be proposed on again. `Solution` holds until a reset.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::hash::{to_hex, CanonicalEncoder};
use crate::error::{EngineError, EngineResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SopPhase {
    #[serde(rename = "Init")]
    Init,
    #[serde(rename = "Data_Collected")]
    DataCollected,
    #[serde(rename = "Root_Cause_Proposed")]
    RootCauseProposed,
    #[serde(rename = "Consensus")]
    Consensus,
    #[serde(rename = "Solution")]
    Solution,
}

impl SopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SopPhase::Init => "Init",
            SopPhase::DataCollected => "Data_Collected",
            SopPhase::RootCauseProposed => "Root_Cause_Proposed",
            SopPhase::Consensus => "Consensus",
            SopPhase::Solution => "Solution",
        }
    }

    /// Voting is open only while a root cause awaits a decision.
    pub fn voting_open(&self) -> bool {
        matches!(self, SopPhase::RootCauseProposed)
    }
}

impl fmt::Display for SopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident data captured at ingestion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentSnapshot {
    pub submitter: String,
    pub summary: String,
    #[serde(default)]
    pub raw_data: serde_json::Value,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum SopEventKind {
    DataCollected {
        submitter: String,
        summary: String,
    },
    RootCauseProposed {
        proposal_id: String,
        proposer: String,
        content: String,
    },
    VoteCast {
        proposal_id: String,
        voter: String,
        option: String,
    },
    ConsensusReached {
        proposal_id: String,
        passed: bool,
    },
    SolutionPhaseEntered {
        proposal_id: String,
        root_cause: String,
    },
    ProposalRejected {
        proposal_id: String,
        proposer: String,
    },
    SettlementApplied {
        proposal_id: String,
        passed: bool,
        rewards_paid: u64,
        penalties_collected: u64,
    },
}

impl SopEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            SopEventKind::DataCollected { .. } => "DataCollected",
            SopEventKind::RootCauseProposed { .. } => "RootCauseProposed",
            SopEventKind::VoteCast { .. } => "VoteCast",
            SopEventKind::ConsensusReached { .. } => "ConsensusReached",
            SopEventKind::SolutionPhaseEntered { .. } => "SolutionPhaseEntered",
            SopEventKind::ProposalRejected { .. } => "ProposalRejected",
            SopEventKind::SettlementApplied { .. } => "SettlementApplied",
        }
    }

    fn proposal_id(&self) -> &str {
        match self {
            SopEventKind::DataCollected { .. } => "",
            SopEventKind::RootCauseProposed { proposal_id, .. }
            | SopEventKind::VoteCast { proposal_id, .. }
            | SopEventKind::ConsensusReached { proposal_id, .. }
            | SopEventKind::SolutionPhaseEntered { proposal_id, .. }
            | SopEventKind::ProposalRejected { proposal_id, .. }
            | SopEventKind::SettlementApplied { proposal_id, .. } => proposal_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SopEvent {
    pub id: String,
    pub block_index: u64,
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: SopEventKind,
}

/// SOP singleton for one engine instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SopState {
    current_state: SopPhase,
    current_proposal: Option<String>,
    incident_data: Option<IncidentSnapshot>,
    events: Vec<SopEvent>,
}

impl Default for SopState {
    fn default() -> Self {
        Self::new()
    }
}

impl SopState {
    pub fn new() -> Self {
        Self {
            current_state: SopPhase::Init,
            current_proposal: None,
            incident_data: None,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> SopPhase {
        self.current_state
    }

    pub fn current_proposal(&self) -> Option<&str> {
        self.current_proposal.as_deref()
    }

    pub fn incident(&self) -> Option<&IncidentSnapshot> {
        self.incident_data.as_ref()
    }

    pub fn events(&self) -> &[SopEvent] {
        &self.events
    }

    /// The last `limit` events, oldest first.
    pub fn recent_events(&self, limit: usize) -> &[SopEvent] {
        let start = self.events.len().saturating_sub(limit);
        &self.events[start..]
    }

    fn require(&self, action: &str, phase: SopPhase) -> EngineResult<()> {
        if self.current_state != phase {
            return Err(EngineError::invalid_phase(action, self.current_state));
        }
        Ok(())
    }

    pub fn check_can_ingest(&self) -> EngineResult<()> {
        self.require("ingest_incident", SopPhase::Init)
    }

    pub fn check_can_propose(&self) -> EngineResult<()> {
        self.require("propose_root_cause", SopPhase::DataCollected)
    }

    pub fn check_can_vote(&self, proposal_id: &str) -> EngineResult<()> {
        self.require("vote", SopPhase::RootCauseProposed)?;
        match self.current_proposal.as_deref() {
            Some(active) if active == proposal_id => Ok(()),
            _ => Err(EngineError::invalid_phase(
                format!("vote on proposal {}", proposal_id),
                self.current_state,
            )),
        }
    }

    /// Init → Data_Collected
    pub fn ingest_incident(&mut self, incident: IncidentSnapshot, block_index: u64) -> EngineResult<()> {
        self.check_can_ingest()?;
        let kind = SopEventKind::DataCollected {
            submitter: incident.submitter.clone(),
            summary: incident.summary.clone(),
        };
        let timestamp = incident.timestamp;
        self.incident_data = Some(incident);
        self.current_state = SopPhase::DataCollected;
        self.emit(kind, block_index, timestamp);
        Ok(())
    }

    /// Data_Collected → Root_Cause_Proposed
    pub fn open_proposal(
        &mut self,
        proposal_id: &str,
        proposer: &str,
        content: &str,
        block_index: u64,
        timestamp: u64,
    ) -> EngineResult<()> {
        self.check_can_propose()?;
        self.current_proposal = Some(proposal_id.to_string());
        self.current_state = SopPhase::RootCauseProposed;
        self.emit(
            SopEventKind::RootCauseProposed {
                proposal_id: proposal_id.to_string(),
                proposer: proposer.to_string(),
                content: content.to_string(),
            },
            block_index,
            timestamp,
        );
        Ok(())
    }

    pub fn record_vote(&mut self, proposal_id: &str, voter: &str, option: &str, block_index: u64, timestamp: u64) {
        self.emit(
            SopEventKind::VoteCast {
                proposal_id: proposal_id.to_string(),
                voter: voter.to_string(),
                option: option.to_string(),
            },
            block_index,
            timestamp,
        );
    }

    /// Root_Cause_Proposed → Consensus → Solution on a pass, back to
    /// Data_Collected on a failure.
    pub fn conclude(
        &mut self,
        proposal_id: &str,
        proposer: &str,
        root_cause: &str,
        passed: bool,
        block_index: u64,
        timestamp: u64,
    ) -> EngineResult<()> {
        self.check_can_vote(proposal_id)?;
        let pid = proposal_id.to_string();
        self.current_state = SopPhase::Consensus;
        self.emit(
            SopEventKind::ConsensusReached {
                proposal_id: pid.clone(),
                passed,
            },
            block_index,
            timestamp,
        );
        if passed {
            self.current_state = SopPhase::Solution;
            self.emit(
                SopEventKind::SolutionPhaseEntered {
                    proposal_id: pid,
                    root_cause: root_cause.to_string(),
                },
                block_index,
                timestamp,
            );
        } else {
            self.current_state = SopPhase::DataCollected;
            self.current_proposal = None;
            self.emit(
                SopEventKind::ProposalRejected {
                    proposal_id: pid,
                    proposer: proposer.to_string(),
                },
                block_index,
                timestamp,
            );
        }
        Ok(())
    }

    pub fn record_settlement(
        &mut self,
        proposal_id: &str,
        passed: bool,
        rewards_paid: u64,
        penalties_collected: u64,
        block_index: u64,
        timestamp: u64,
    ) {
        self.emit(
            SopEventKind::SettlementApplied {
                proposal_id: proposal_id.to_string(),
                passed,
                rewards_paid,
                penalties_collected,
            },
            block_index,
            timestamp,
        );
    }

    fn emit(&mut self, kind: SopEventKind, block_index: u64, timestamp: u64) {
        let mut enc = CanonicalEncoder::new(b"sopchain-event");
        enc.u64(self.events.len() as u64)
            .str(kind.name())
            .str(kind.proposal_id())
            .u64(block_index)
            .u64(timestamp);
        let id = to_hex(&enc.finish());
        tracing::debug!("📣 SOP event {} at block {}", kind.name(), block_index);
        self.events.push(SopEvent {
            id,
            block_index,
            timestamp,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident() -> IncidentSnapshot {
        IncidentSnapshot {
            submitter: "alert".into(),
            summary: "p99 latency spike on checkout".into(),
            raw_data: serde_json::json!({ "service": "checkout" }),
            timestamp: 100,
        }
    }

    #[test]
    fn test_happy_path_reaches_solution() {
        let mut sop = SopState::new();
        assert_eq!(sop.phase(), SopPhase::Init);
        sop.ingest_incident(incident(), 0).unwrap();
        assert_eq!(sop.phase(), SopPhase::DataCollected);
        sop.open_proposal("p1", "a", "db pool exhausted", 1, 101).unwrap();
        assert_eq!(sop.phase(), SopPhase::RootCauseProposed);
        assert!(sop.phase().voting_open());
        sop.conclude("p1", "a", "db pool exhausted", true, 2, 102).unwrap();
        assert_eq!(sop.phase(), SopPhase::Solution);

        let names: Vec<_> = sop.events().iter().map(|e| e.kind.name()).collect();
        assert_eq!(
            names,
            vec!["DataCollected", "RootCauseProposed", "ConsensusReached", "SolutionPhaseEntered"]
        );
    }

    #[test]
    fn test_rejection_returns_to_data_collected() {
        let mut sop = SopState::new();
        sop.ingest_incident(incident(), 0).unwrap();
        sop.open_proposal("p1", "a", "dns", 1, 101).unwrap();
        sop.conclude("p1", "a", "dns", false, 2, 102).unwrap();
        assert_eq!(sop.phase(), SopPhase::DataCollected);
        assert_eq!(sop.current_proposal(), None);
        assert!(sop.incident().is_some());
        assert_eq!(sop.recent_events(1)[0].kind.name(), "ProposalRejected");

        sop.open_proposal("p2", "b", "disk", 3, 103).unwrap();
        assert_eq!(sop.current_proposal(), Some("p2"));
    }

    #[test]
    fn test_wrong_phase_has_no_side_effects() {
        let mut sop = SopState::new();
        let err = sop.open_proposal("p1", "a", "x", 0, 1).unwrap_err();
        assert_eq!(err, EngineError::invalid_phase("propose_root_cause", SopPhase::Init));
        assert_eq!(sop, SopState::new());

        sop.ingest_incident(incident(), 0).unwrap();
        assert!(sop.ingest_incident(incident(), 0).is_err());
        assert!(sop.check_can_vote("p1").is_err());
    }

    #[test]
    fn test_vote_only_targets_active_proposal() {
        let mut sop = SopState::new();
        sop.ingest_incident(incident(), 0).unwrap();
        sop.open_proposal("p1", "a", "x", 1, 1).unwrap();
        assert!(sop.check_can_vote("p1").is_ok());
        assert!(matches!(
            sop.check_can_vote("other"),
            Err(EngineError::InvalidPhase { current: SopPhase::RootCauseProposed, .. })
        ));
    }

    #[test]
    fn test_phase_serializes_with_underscored_names() {
        assert_eq!(
            serde_json::to_string(&SopPhase::RootCauseProposed).unwrap(),
            "\"Root_Cause_Proposed\""
        );
        assert_eq!(SopPhase::DataCollected.to_string(), "Data_Collected");
    }

    #[test]
    fn test_event_ids_are_unique() {
        let mut sop = SopState::new();
        sop.ingest_incident(incident(), 0).unwrap();
        sop.open_proposal("p1", "a", "x", 0, 100).unwrap();
        sop.record_vote("p1", "a", "for", 0, 100);
        sop.record_vote("p1", "a", "for", 0, 100);
        let mut ids: Vec<_> = sop.events().iter().map(|e| e.id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }
}
