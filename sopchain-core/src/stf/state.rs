//! SopChain engine state
//!
//! One explicitly constructed engine owns the chain, the accounts, the
//! pending pool and the SOP/voting state behind a single RwLock. Writers take
//! the lock exclusively for a whole operation; readers copy out what they need
//! under a shared lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use super::accounts::{Account, AccountLedger};
use super::governance::{GovernanceState, VoteStats, Verdict};
use super::hash::{short, to_hex, Hash};
use super::keys::verify_transaction;
use super::ledger::{Block, Ledger};
use super::merkle::MerkleProof;
use super::pool::TxPool;
use super::sop::{IncidentSnapshot, SopPhase, SopState};
use super::transaction::{Transaction, TxOutcome, TxPayload, TxReceipt, TxType};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{PersistedState, Storage, SNAPSHOT_VERSION};

/// Source of block and event timestamps (unix seconds)
pub type Clock = fn() -> u64;

pub fn system_clock() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Extension trait that recovers from poisoned RwLocks gracefully,
/// but marks the owning engine as TAINTED to block further mutations.
trait PoisonRecover<T> {
    fn read_or_recover(&self, tainted: &AtomicBool) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self, tainted: &AtomicBool) -> RwLockWriteGuard<'_, T>;
}

impl<T> PoisonRecover<T> for RwLock<T> {
    fn read_or_recover(&self, tainted: &AtomicBool) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 RwLock was poisoned (read), engine is TAINTED until reset");
            tainted.store(true, Ordering::SeqCst);
            poisoned.into_inner()
        })
    }
    fn write_or_recover(&self, tainted: &AtomicBool) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 RwLock was poisoned (write), engine is TAINTED until reset");
            tainted.store(true, Ordering::SeqCst);
            poisoned.into_inner()
        })
    }
}

/// Result of sealing: a receipt per executed transaction, and the block if
/// at least one transaction made it in.
#[derive(Clone, Debug, Serialize)]
pub struct SealOutcome {
    pub receipts: Vec<TxReceipt>,
    pub block: Option<Block>,
}

/// Where a transaction currently lives
#[derive(Clone, Debug)]
pub struct TxLocation {
    pub transaction: Transaction,
    /// `None` while the transaction is still pending
    pub block_index: Option<u64>,
    pub block_hash: Option<Hash>,
}

/// Everything guarded by the engine lock
#[derive(Clone, Debug)]
pub struct ChainState {
    config: EngineConfig,
    ledger: Ledger,
    accounts: AccountLedger,
    pool: TxPool,
    sop: SopState,
    governance: GovernanceState,
}

impl ChainState {
    fn genesis(config: EngineConfig, timestamp: u64) -> Self {
        Self {
            ledger: Ledger::new(timestamp),
            accounts: AccountLedger::from_config(&config),
            pool: TxPool::new(config.economy.max_pending_txs),
            sop: SopState::new(),
            governance: GovernanceState::new(),
            config,
        }
    }

    fn restore(snapshot: PersistedState) -> EngineResult<Self> {
        let ledger = Ledger::from_blocks(snapshot.blocks)?;
        Ok(Self {
            pool: TxPool::from_transactions(snapshot.config.economy.max_pending_txs, snapshot.pending),
            ledger,
            accounts: snapshot.accounts,
            sop: snapshot.sop,
            governance: snapshot.governance,
            config: snapshot.config,
        })
    }

    fn snapshot(&self) -> PersistedState {
        PersistedState {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            blocks: self.ledger.blocks().to_vec(),
            accounts: self.accounts.clone(),
            sop: self.sop.clone(),
            governance: self.governance.clone(),
            pending: self.pool.iter().cloned().collect(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn accounts(&self) -> &AccountLedger {
        &self.accounts
    }

    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    pub fn sop(&self) -> &SopState {
        &self.sop
    }

    pub fn governance(&self) -> &GovernanceState {
        &self.governance
    }

    /// Nonce the next submission from `address` must carry.
    pub fn next_nonce(&self, address: &str) -> EngineResult<u64> {
        let account = self.accounts.get(address)?;
        Ok(account.nonce + self.pool.pending_for(address))
    }

    /// Live tally of the open proposal.
    pub fn vote_stats(&self) -> Option<VoteStats> {
        self.governance.active().map(|s| s.tally(&self.accounts))
    }

    pub fn locate(&self, tx_hash: &Hash) -> EngineResult<TxLocation> {
        if let Some(tx) = self.pool.get(tx_hash) {
            return Ok(TxLocation {
                transaction: tx.clone(),
                block_index: None,
                block_hash: None,
            });
        }
        let (block, tx) = self.ledger.get_transaction(tx_hash)?;
        Ok(TxLocation {
            transaction: tx.clone(),
            block_index: Some(block.index()),
            block_hash: Some(block.hash),
        })
    }

    pub fn merkle_proof(&self, block_index: u64, tx_index: usize) -> EngineResult<MerkleProof> {
        let block = self.ledger.get_block(block_index)?;
        let path = block.merkle_proof(tx_index)?;
        Ok(MerkleProof {
            block_index,
            tx_index,
            tx_hash: block.transactions[tx_index].hash(),
            merkle_root: block.header.merkle_root,
            path,
        })
    }

    /// Admission checks, signature included. They mutate nothing and run
    /// twice: on submission and again right before execution.
    fn validate(&self, tx: &Transaction, expected_nonce: u64) -> EngineResult<()> {
        if !tx.hash_matches() {
            return Err(EngineError::InvalidPayload(
                "transaction hash does not match its contents".into(),
            ));
        }
        if tx.tx_type() == TxType::Slash {
            return Err(EngineError::Unauthorized("slash transactions are system-only".into()));
        }
        let sender = self.accounts.get(tx.sender())?;
        if self.accounts.is_treasury(tx.sender()) {
            return Err(EngineError::Unauthorized("the treasury cannot submit transactions".into()));
        }
        let public_key = sender.public_key.as_deref().ok_or_else(|| {
            EngineError::Unauthorized(format!("no public key registered for {}", short(tx.sender())))
        })?;
        verify_transaction(public_key, tx)?;
        if tx.nonce() != expected_nonce {
            return Err(EngineError::InvalidNonce {
                sender: tx.sender().to_string(),
                expected: expected_nonce,
                actual: tx.nonce(),
            });
        }

        let economy = &self.config.economy;
        let minimum = economy.min_gas_for(tx.tx_type());
        if tx.gas_limit() < minimum {
            return Err(EngineError::GasLimitTooLow {
                tx_type: tx.tx_type().to_string(),
                minimum,
                actual: tx.gas_limit(),
            });
        }
        if tx.gas_price() < economy.gas_price {
            return Err(EngineError::GasPriceTooLow {
                minimum: economy.gas_price,
                actual: tx.gas_price(),
            });
        }
        if sender.balance < tx.gas_fee() {
            return Err(EngineError::InsufficientBalance {
                address: tx.sender().to_string(),
                have: sender.balance,
                need: tx.gas_fee(),
            });
        }

        match tx.payload() {
            TxPayload::Transfer { amount: 0, .. } | TxPayload::Stake { amount: 0 } => {
                Err(EngineError::InvalidPayload("amount must be positive".into()))
            }
            TxPayload::ProposeRootCause { content } if content.trim().is_empty() => {
                Err(EngineError::InvalidPayload("root cause must not be empty".into()))
            }
            TxPayload::ProposeRootCause { .. } => self.sop.check_can_propose(),
            TxPayload::Vote { proposal_id, .. } => self.sop.check_can_vote(proposal_id),
            _ => Ok(()),
        }
    }

    fn admit(&mut self, tx: Transaction) -> EngineResult<Hash> {
        let expected = self.next_nonce(tx.sender()).unwrap_or(0);
        if let Err(e) = self.validate(&tx, expected).and_then(|_| self.pool.check_capacity()) {
            tracing::warn!("⚠️ Rejected {} tx from {}: {}", tx.tx_type(), short(tx.sender()), e);
            return Err(e);
        }
        let hash = tx.hash();
        tracing::info!(
            "📨 Accepted {} tx {} from {} (nonce {})",
            tx.tx_type(),
            short(&to_hex(&hash)),
            short(tx.sender()),
            tx.nonce()
        );
        self.pool.push(tx)?;
        Ok(hash)
    }

    /// Execute the pool FIFO and append whatever succeeded as the next block.
    fn seal(&mut self, timestamp: u64) -> EngineResult<SealOutcome> {
        let block_index = self.ledger.height();
        let mut included = Vec::new();
        let mut receipts = Vec::new();
        for tx in self.pool.drain() {
            self.execute(tx, block_index, timestamp, &mut included, &mut receipts)?;
        }
        let block = if included.is_empty() {
            None
        } else {
            Some(self.append_block(included, timestamp)?)
        };
        Ok(SealOutcome { receipts, block })
    }

    fn execute(
        &mut self,
        tx: Transaction,
        block_index: u64,
        timestamp: u64,
        included: &mut Vec<Transaction>,
        receipts: &mut Vec<TxReceipt>,
    ) -> EngineResult<()> {
        let expected = self.accounts.get(tx.sender()).map(|a| a.nonce).unwrap_or(0);
        if let Err(e) = self.validate(&tx, expected) {
            tracing::warn!("⚠️ Dropped {} tx from {} at execution: {}", tx.tx_type(), short(tx.sender()), e);
            receipts.push(failed_receipt(&tx, 0, &e));
            return Ok(());
        }

        // Both were just checked by validate.
        let fee = tx.gas_fee();
        self.accounts.charge_gas(tx.sender(), fee)?;
        self.accounts.bump_nonce(tx.sender())?;

        match self.apply_payload(&tx, block_index, timestamp) {
            Ok((outcome, verdict)) => {
                receipts.push(TxReceipt {
                    tx_hash: tx.hash(),
                    tx_type: tx.tx_type(),
                    sender: tx.sender().to_string(),
                    gas_used: fee,
                    outcome,
                });
                included.push(tx);
                if let Some(verdict) = verdict {
                    self.settle(verdict, block_index, timestamp, included, receipts)
                        .map_err(|e| into_fatal(e, block_index))?;
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ {} tx from {} failed after gas: {}", tx.tx_type(), short(tx.sender()), e);
                receipts.push(failed_receipt(&tx, fee, &e));
            }
        }
        Ok(())
    }

    /// Type-specific effects. Each arm either fully applies or changes nothing.
    fn apply_payload(
        &mut self,
        tx: &Transaction,
        block_index: u64,
        timestamp: u64,
    ) -> EngineResult<(TxOutcome, Option<Verdict>)> {
        let sender = tx.sender();
        match tx.payload() {
            TxPayload::Transfer { to, amount } => {
                self.accounts.apply_transfer(sender, to, *amount)?;
                Ok((
                    TxOutcome::Transferred {
                        to: to.clone(),
                        amount: *amount,
                    },
                    None,
                ))
            }
            TxPayload::Stake { amount } => {
                let new_stake = self.accounts.apply_stake(sender, *amount)?;
                Ok((
                    TxOutcome::Staked {
                        amount: *amount,
                        new_stake,
                    },
                    None,
                ))
            }
            TxPayload::ProposeRootCause { content } => {
                self.sop.check_can_propose()?;
                let proposal_id = to_hex(&tx.hash());
                self.governance.open(
                    proposal_id.clone(),
                    sender.to_string(),
                    content.clone(),
                    tx.timestamp(),
                )?;
                self.sop
                    .open_proposal(&proposal_id, sender, content, block_index, timestamp)?;
                Ok((TxOutcome::ProposalCreated { proposal_id }, None))
            }
            TxPayload::Vote {
                proposal_id,
                option,
            } => {
                self.sop.check_can_vote(proposal_id)?;
                self.governance
                    .cast(proposal_id, sender, *option, tx.gas_fee(), tx.timestamp())?;
                self.sop
                    .record_vote(proposal_id, sender, option.as_str(), block_index, timestamp);
                let verdict = self.governance.active().and_then(|session| {
                    let stats = session.tally(&self.accounts);
                    session.evaluate(&stats, &self.config.voting, self.accounts.agent_count())
                });
                Ok((
                    TxOutcome::VoteRecorded {
                        proposal_id: proposal_id.clone(),
                        option: *option,
                        settled: verdict.map(|v| v.passed()),
                    },
                    verdict,
                ))
            }
            TxPayload::Slash { .. } => Err(EngineError::Unauthorized(
                "slash transactions are system-only".into(),
            )),
        }
    }

    /// Close the active proposal on `verdict`: collect penalties as system
    /// slash transactions, then pay rewards out of the treasury.
    fn settle(
        &mut self,
        verdict: Verdict,
        block_index: u64,
        timestamp: u64,
        included: &mut Vec<Transaction>,
        receipts: &mut Vec<TxReceipt>,
    ) -> EngineResult<()> {
        let passed = verdict.passed();
        let session = self
            .governance
            .active()
            .cloned()
            .ok_or_else(|| EngineError::not_found("active proposal"))?;
        let stats = session.tally(&self.accounts);
        let plan = session.settlement_plan(passed, &self.config.economy);
        tracing::info!(
            "🏛️ Proposal {} closed ({:?}): for {} / against {} / abstain {} of {} network weight",
            short(&session.proposal.id),
            verdict,
            stats.for_weight,
            stats.against_weight,
            stats.abstain_weight,
            stats.total_network_weight
        );

        let treasury = self.accounts.treasury().address.clone();
        let mut collected = 0u64;
        for penalty in &plan.penalties {
            let taken = self
                .accounts
                .slash(&penalty.target, penalty.token, penalty.reputation)?;
            collected = collected.saturating_add(taken);
            let nonce = self.accounts.treasury().nonce;
            let slash = Transaction::new(
                treasury.clone(),
                nonce,
                0,
                self.config.economy.reward_gas_limit,
                TxPayload::Slash {
                    target: penalty.target.clone(),
                    amount: taken,
                    reputation: penalty.reputation,
                    reason: penalty.reason.clone(),
                },
                timestamp,
            );
            self.accounts.bump_nonce(&treasury)?;
            tracing::warn!(
                "⚡ SLASHED {} for {} tokens, -{} rep: {}",
                short(&penalty.target),
                taken,
                penalty.reputation,
                penalty.reason
            );
            receipts.push(TxReceipt {
                tx_hash: slash.hash(),
                tx_type: TxType::Slash,
                sender: treasury.clone(),
                gas_used: 0,
                outcome: TxOutcome::Slashed {
                    target: penalty.target.clone(),
                    amount: taken,
                },
            });
            included.push(slash);
        }

        let mut paid_total = 0u64;
        for reward in &plan.rewards {
            let paid = self.accounts.pay_from_treasury(&reward.target, reward.token)?;
            if paid < reward.token {
                tracing::warn!(
                    "⚠️ Treasury short: paid {} of {} to {} ({})",
                    paid,
                    reward.token,
                    short(&reward.target),
                    reward.reason
                );
            }
            if reward.reputation > 0 {
                self.accounts
                    .adjust_reputation(&reward.target, reward.reputation as i64)?;
            }
            paid_total = paid_total.saturating_add(paid);
        }

        let record = self.governance.finalize(verdict, stats)?;
        let (id, proposer, content) = (
            record.proposal.id.clone(),
            record.proposal.proposer.clone(),
            record.proposal.content.clone(),
        );
        self.sop
            .conclude(&id, &proposer, &content, passed, block_index, timestamp)?;
        self.sop
            .record_settlement(&id, passed, paid_total, collected, block_index, timestamp);
        tracing::info!(
            "💰 Settlement for {}: {} paid out, {} collected, SOP now {}",
            short(&id),
            paid_total,
            collected,
            self.sop.phase()
        );
        Ok(())
    }

    fn append_block(&mut self, txs: Vec<Transaction>, timestamp: u64) -> EngineResult<Block> {
        let block = self.ledger.append(txs, timestamp)?.clone();
        tracing::info!(
            "⛓️ Block #{} sealed: {} txs, merkle root {}...",
            block.index(),
            block.transactions.len(),
            short(&to_hex(&block.header.merkle_root))
        );
        Ok(block)
    }
}

fn failed_receipt(tx: &Transaction, gas_used: u64, error: &EngineError) -> TxReceipt {
    TxReceipt {
        tx_hash: tx.hash(),
        tx_type: tx.tx_type(),
        sender: tx.sender().to_string(),
        gas_used,
        outcome: TxOutcome::Failed {
            error: error.to_string(),
        },
    }
}

/// A settlement that cannot complete leaves accounts half-applied.
fn into_fatal(e: EngineError, block_index: u64) -> EngineError {
    if e.is_fatal() {
        return e;
    }
    EngineError::ChainContinuity {
        index: block_index,
        reason: format!("settlement failed: {}", e),
    }
}

/// The engine handle. Clones share the same state.
#[derive(Clone)]
pub struct SopChain {
    inner: Arc<RwLock<ChainState>>,
    tainted: Arc<AtomicBool>,
    clock: Clock,
}

impl SopChain {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, system_clock)
    }

    pub fn with_clock(config: EngineConfig, clock: Clock) -> Self {
        let state = ChainState::genesis(config, clock());
        tracing::info!(
            "🌱 Genesis for {}: {} agents, treasury {}",
            state.config.chain_id,
            state.accounts.agent_count(),
            state.accounts.treasury().balance
        );
        Self::from_state(state, clock)
    }

    fn from_state(state: ChainState, clock: Clock) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
            tainted: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Rebuild an engine from a snapshot, re-verifying the whole chain.
    pub fn from_snapshot(snapshot: PersistedState) -> EngineResult<Self> {
        Self::from_snapshot_with_clock(snapshot, system_clock)
    }

    pub fn from_snapshot_with_clock(snapshot: PersistedState, clock: Clock) -> EngineResult<Self> {
        let state = ChainState::restore(snapshot)?;
        tracing::info!(
            "📊 Restored chain {}: height {}, SOP {}",
            state.config.chain_id,
            state.ledger.height(),
            state.sop.phase()
        );
        Ok(Self::from_state(state, clock))
    }

    /// Load the stored snapshot, or start from genesis if there is none.
    pub fn load_or_init(storage: &Storage, config: EngineConfig) -> anyhow::Result<Self> {
        match storage.load_state()? {
            Some(snapshot) => Ok(Self::from_snapshot(snapshot)?),
            None => Ok(Self::new(config)),
        }
    }

    pub fn snapshot(&self) -> PersistedState {
        self.read(ChainState::snapshot)
    }

    /// Persist current state to disk
    pub fn save(&self, storage: &Storage) -> anyhow::Result<()> {
        storage.save_state(&self.snapshot())
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::SeqCst)
    }

    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Run `f` under the shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&ChainState) -> R) -> R {
        let state = self.inner.read_or_recover(&self.tainted);
        f(&state)
    }

    /// Run `f` under the exclusive lock. Refused while tainted; a fatal
    /// error from `f` taints the instance.
    fn mutate<R>(&self, f: impl FnOnce(&mut ChainState, u64) -> EngineResult<R>) -> EngineResult<R> {
        let mut state = self.inner.write_or_recover(&self.tainted);
        if self.is_tainted() {
            tracing::error!("🚨 Refusing mutation: engine is tainted. Reset required.");
            return Err(EngineError::ChainContinuity {
                index: state.ledger.height(),
                reason: "engine is tainted; reset required".into(),
            });
        }
        let result = f(&mut state, (self.clock)());
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!("🚨 {}. Engine is TAINTED until reset.", e);
                self.tainted.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    /// Build an unsigned transaction for `sender` (address or agent name)
    /// with the next nonce and the minimum gas for its type. Submission needs
    /// a signature on top, see [`Keyring::sign`](super::keys::Keyring::sign).
    pub fn prepare(&self, sender: &str, payload: TxPayload) -> EngineResult<Transaction> {
        let timestamp = self.now();
        self.read(|state| {
            let address = state.accounts.resolve(sender)?;
            let nonce = state.next_nonce(&address)?;
            let economy = &state.config.economy;
            let gas_limit = economy.min_gas_for(payload.tx_type());
            Ok(Transaction::new(address, nonce, economy.gas_price, gas_limit, payload, timestamp))
        })
    }

    /// Admit a transaction into the pending pool.
    pub fn submit(&self, tx: Transaction) -> EngineResult<Hash> {
        self.mutate(|state, _| state.admit(tx))
    }

    /// Execute every pending transaction and seal the successful ones.
    pub fn produce_block(&self) -> EngineResult<SealOutcome> {
        self.mutate(|state, now| state.seal(now))
    }

    /// Admit one transaction and seal it immediately.
    pub fn submit_and_seal(&self, tx: Transaction) -> EngineResult<SealOutcome> {
        self.mutate(|state, now| {
            state.admit(tx)?;
            state.seal(now)
        })
    }

    /// Store the incident snapshot and move SOP from `Init` to
    /// `Data_Collected`.
    pub fn ingest_incident(
        &self,
        submitter: &str,
        summary: &str,
        raw_data: serde_json::Value,
    ) -> EngineResult<()> {
        self.mutate(|state, now| {
            let submitter = state.accounts.resolve(submitter)?;
            let block_index = state.ledger.latest().index();
            state.sop.ingest_incident(
                IncidentSnapshot {
                    submitter: submitter.clone(),
                    summary: summary.to_string(),
                    raw_data,
                    timestamp: now,
                },
                block_index,
            )?;
            tracing::info!("📥 Incident ingested by {}: {}", short(&submitter), summary);
            Ok(())
        })
    }

    /// Fail the open proposal from outside (voting timeout) and seal its
    /// penalties into a block.
    pub fn close_voting(&self) -> EngineResult<SealOutcome> {
        self.mutate(|state, now| {
            if !state.sop.phase().voting_open() {
                return Err(EngineError::invalid_phase("close_voting", state.sop.phase()));
            }
            let block_index = state.ledger.height();
            let mut included = Vec::new();
            let mut receipts = Vec::new();
            state
                .settle(Verdict::Closed, block_index, now, &mut included, &mut receipts)
                .map_err(|e| into_fatal(e, block_index))?;
            let block = state.append_block(included, now)?;
            Ok(SealOutcome {
                receipts,
                block: Some(block),
            })
        })
    }

    /// Rebuild genesis from the current configuration and swap it in.
    pub fn reset(&self) {
        {
            let mut state = self.inner.write_or_recover(&self.tainted);
            let config = state.config.clone();
            *state = ChainState::genesis(config, (self.clock)());
        }
        // The fresh state replaces whatever a panicking writer left behind.
        self.inner.clear_poison();
        self.tainted.store(false, Ordering::SeqCst);
        tracing::info!("🔄 Engine reset to genesis");
    }

    /// Full-chain audit. A failure taints the instance.
    pub fn verify_chain(&self) -> EngineResult<()> {
        let result = self.read(|state| state.ledger.verify_chain());
        if let Err(e) = &result {
            tracing::error!("🚨 Chain audit failed: {}", e);
            self.tainted.store(true, Ordering::SeqCst);
        }
        result
    }

    pub fn height(&self) -> u64 {
        self.read(|s| s.ledger.height())
    }

    pub fn latest_hash(&self) -> Hash {
        self.read(|s| s.ledger.latest_hash())
    }

    pub fn get_block(&self, index: u64) -> EngineResult<Block> {
        self.read(|s| s.ledger.get_block(index).cloned())
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> EngineResult<Block> {
        self.read(|s| s.ledger.get_block_by_hash(hash).cloned())
    }

    pub fn blocks(&self, limit: Option<usize>, offset: usize) -> Vec<Block> {
        self.read(|s| s.ledger.range(limit, offset).to_vec())
    }

    pub fn get_transaction(&self, tx_hash: &Hash) -> EngineResult<TxLocation> {
        self.read(|s| s.locate(tx_hash))
    }

    pub fn merkle_proof(&self, block_index: u64, tx_index: usize) -> EngineResult<MerkleProof> {
        self.read(|s| s.merkle_proof(block_index, tx_index))
    }

    pub fn phase(&self) -> SopPhase {
        self.read(|s| s.sop.phase())
    }

    pub fn account(&self, address_or_name: &str) -> EngineResult<Account> {
        self.read(|s| {
            let address = s.accounts.resolve(address_or_name)?;
            s.accounts.get(&address).cloned()
        })
    }

    pub fn vote_stats(&self) -> Option<VoteStats> {
        self.read(ChainState::vote_stats)
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.read(|s| s.pool.iter().cloned().collect())
    }

    pub fn total_value(&self) -> u128 {
        self.read(|s| s.accounts.total_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stf::governance::ProposalStatus;
    use crate::stf::keys::{sign_transaction, Keyring};
    use crate::stf::transaction::VoteOption;

    const KEY_SEED: &[u8] = b"state-tests";

    fn fixed_clock() -> u64 {
        1_700_000_000
    }

    /// Keys matching whatever agents `engine` was configured with.
    fn signer(engine: &SopChain) -> Keyring {
        Keyring::derive(KEY_SEED, &mut engine.read(|s| s.config().clone()))
    }

    /// Agents A-D with stake 0 and reputation 25, so each weighs 25.
    fn four_agents() -> EngineConfig {
        let mut config = EngineConfig::with_agents(&["A", "B", "C", "D"]);
        for agent in &mut config.agents {
            agent.initial_reputation = Some(25);
        }
        Keyring::derive(KEY_SEED, &mut config);
        config
    }

    fn engine() -> SopChain {
        SopChain::with_clock(four_agents(), fixed_clock)
    }

    fn addr(engine: &SopChain, name: &str) -> String {
        engine.account(name).unwrap().address
    }

    fn vote(engine: &SopChain, who: &str, proposal_id: &str, option: VoteOption) -> Hash {
        let tx = signer(engine)
            .prepare(
                engine,
                who,
                TxPayload::Vote {
                    proposal_id: proposal_id.to_string(),
                    option,
                },
            )
            .unwrap();
        engine.submit(tx).unwrap()
    }

    /// Ingest an incident and seal a proposal from `proposer`.
    fn open_proposal(engine: &SopChain, proposer: &str) -> String {
        engine
            .ingest_incident("A", "checkout 5xx burst", serde_json::json!({ "errors": 812 }))
            .unwrap();
        let tx = signer(engine)
            .prepare(
                engine,
                proposer,
                TxPayload::ProposeRootCause {
                    content: "connection pool exhausted on payments-db".into(),
                },
            )
            .unwrap();
        let outcome = engine.submit_and_seal(tx).unwrap();
        match &outcome.receipts[0].outcome {
            TxOutcome::ProposalCreated { proposal_id } => proposal_id.clone(),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_four_agent_consensus_scenario() {
        let engine = engine();
        let economy = engine.read(|s| s.config().economy.clone());
        let pid = open_proposal(&engine, "A");
        assert_eq!(engine.phase(), SopPhase::RootCauseProposed);

        let before: Vec<u64> = ["A", "B", "C", "D"]
            .iter()
            .map(|n| engine.account(n).unwrap().balance)
            .collect();
        let treasury_before = engine.read(|s| s.accounts().treasury().balance);
        let value_before = engine.total_value();

        vote(&engine, "A", &pid, VoteOption::For);
        vote(&engine, "B", &pid, VoteOption::For);
        vote(&engine, "D", &pid, VoteOption::Against);
        vote(&engine, "C", &pid, VoteOption::For);
        let outcome = engine.produce_block().unwrap();

        let block = outcome.block.expect("votes sealed");
        assert_eq!(block.transactions.len(), 5, "four votes plus D's slash");
        assert_eq!(block.transactions[4].tx_type(), TxType::Slash);
        assert!(outcome.receipts.iter().all(TxReceipt::is_success));
        assert!(matches!(
            outcome.receipts[3].outcome,
            TxOutcome::VoteRecorded { settled: Some(true), .. }
        ));

        assert_eq!(engine.phase(), SopPhase::Solution);
        let record = engine.read(|s| s.governance().last_closed().cloned()).unwrap();
        assert_eq!(record.proposal.status, ProposalStatus::Passed);
        assert_eq!(record.final_tally.for_weight, 75);
        assert_eq!(record.final_tally.against_weight, 25);
        assert_eq!(record.final_tally.support_rate, 0.75);
        assert!(record.final_tally.consensus_reached);

        let gas = economy.gas_price * economy.vote_gas_limit;
        let rebate = gas * economy.pass_rebate_percent as u64 / 100;
        let after = |n: &str| engine.account(n).unwrap();
        assert_eq!(
            after("A").balance,
            before[0] - gas + economy.proposer_reward_token + economy.bounty_base_token + rebate
        );
        assert_eq!(after("B").balance, before[1] - gas + economy.supporter_reward_token + rebate);
        assert_eq!(after("C").balance, before[2] - gas + economy.supporter_reward_token + rebate);
        assert_eq!(after("D").balance, before[3] - gas - economy.penalty_against_pass_token);
        assert_eq!(after("A").reputation, 25 + economy.proposer_reward_rep);
        assert_eq!(after("D").reputation, 25 - economy.penalty_against_pass_rep);

        let paid = economy.proposer_reward_token
            + economy.bounty_base_token
            + 2 * economy.supporter_reward_token
            + 3 * rebate;
        let treasury_after = engine.read(|s| s.accounts().treasury().balance);
        assert_eq!(
            treasury_after,
            treasury_before + 4 * gas + economy.penalty_against_pass_token - paid
        );
        assert_eq!(engine.total_value(), value_before);

        let names: Vec<_> = engine.read(|s| {
            s.sop().events().iter().map(|e| e.kind.name()).collect()
        });
        assert!(names.ends_with(&["ConsensusReached", "SolutionPhaseEntered", "SettlementApplied"]));
        engine.verify_chain().unwrap();
    }

    #[test]
    fn test_late_vote_after_settlement_is_dropped() {
        let engine = engine();
        let pid = open_proposal(&engine, "A");
        for who in ["A", "B", "C"] {
            vote(&engine, who, &pid, VoteOption::For);
        }
        vote(&engine, "D", &pid, VoteOption::Against);
        let outcome = engine.produce_block().unwrap();
        let last = outcome.receipts.last().unwrap();
        assert!(!last.is_success());
        assert_eq!(last.gas_used, 0);
        assert_eq!(engine.account("D").unwrap().nonce, 0);
    }

    #[test]
    fn test_rejection_returns_to_data_collected() {
        let engine = engine();
        let economy = engine.read(|s| s.config().economy.clone());
        let pid = open_proposal(&engine, "A");
        let a_before = engine.account("A").unwrap();

        vote(&engine, "B", &pid, VoteOption::Against);
        vote(&engine, "C", &pid, VoteOption::Against);
        vote(&engine, "D", &pid, VoteOption::Against);
        let outcome = engine.produce_block().unwrap();

        assert_eq!(engine.phase(), SopPhase::DataCollected);
        let block = outcome.block.unwrap();
        let slashes: Vec<_> = block
            .transactions
            .iter()
            .filter(|t| t.tx_type() == TxType::Slash)
            .collect();
        assert_eq!(slashes.len(), 1, "only the proposer is penalized");
        let a = engine.account("A").unwrap();
        assert_eq!(a.balance, a_before.balance - economy.penalty_proposer_fail_token);
        assert_eq!(a.reputation, 25 - economy.penalty_proposer_fail_rep);

        let record = engine.read(|s| s.governance().last_closed().cloned()).unwrap();
        assert_eq!(record.verdict, Verdict::AgainstMajority);
        assert_eq!(record.proposal.status, ProposalStatus::Rejected);

        // The same incident takes a new proposal.
        let retry = signer(&engine)
            .prepare(&engine, "B", TxPayload::ProposeRootCause { content: "stale DNS cache".into() })
            .unwrap();
        engine.submit_and_seal(retry).unwrap();
        assert_eq!(engine.phase(), SopPhase::RootCauseProposed);
    }

    #[test]
    fn test_close_voting_fails_open_proposal() {
        let engine = engine();
        let pid = open_proposal(&engine, "A");
        vote(&engine, "B", &pid, VoteOption::For);
        engine.produce_block().unwrap();

        let outcome = engine.close_voting().unwrap();
        let block = outcome.block.unwrap();
        let targets: Vec<_> = block
            .transactions
            .iter()
            .filter_map(|t| match t.payload() {
                TxPayload::Slash { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![addr(&engine, "B"), addr(&engine, "A")]);
        assert_eq!(engine.phase(), SopPhase::DataCollected);
        assert!(matches!(
            engine.close_voting(),
            Err(EngineError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_exactly_half_then_just_over() {
        let mut config = four_agents();
        config.voting.close_on_full_turnout = false;
        let engine = SopChain::with_clock(config, fixed_clock);
        let pid = open_proposal(&engine, "A");

        vote(&engine, "A", &pid, VoteOption::For);
        vote(&engine, "B", &pid, VoteOption::For);
        engine.produce_block().unwrap();
        let stats = engine.vote_stats().unwrap();
        assert_eq!(stats.for_weight * 2, stats.total_network_weight);
        assert!(!stats.consensus_reached);
        assert_eq!(engine.phase(), SopPhase::RootCauseProposed);

        // One more unit of stake tips B over half.
        let stake = signer(&engine).prepare(&engine, "B", TxPayload::Stake { amount: 1 }).unwrap();
        engine.submit(stake).unwrap();
        vote(&engine, "B", &pid, VoteOption::For);
        let outcome = engine.produce_block().unwrap();
        let settled: Vec<_> = outcome
            .receipts
            .iter()
            .filter(|r| matches!(r.outcome, TxOutcome::VoteRecorded { settled: Some(_), .. }))
            .collect();
        assert_eq!(settled.len(), 1);
        assert_eq!(engine.phase(), SopPhase::Solution);
        assert_eq!(engine.read(|s| s.governance().history().len()), 1);
    }

    #[test]
    fn test_duplicate_nonce_rejected_without_side_effects() {
        let engine = engine();
        let b = addr(&engine, "B");
        let tx = signer(&engine)
            .prepare(&engine, "A", TxPayload::Transfer { to: b.clone(), amount: 10 })
            .unwrap();
        engine.submit(tx.clone()).unwrap();
        let err = engine.submit(tx).unwrap_err();
        assert!(matches!(err, EngineError::InvalidNonce { expected: 1, actual: 0, .. }));
        assert_eq!(engine.pending().len(), 1);

        let stale = Transaction::new(
            addr(&engine, "A"),
            0,
            1,
            100,
            TxPayload::Transfer { to: b, amount: 1 },
            5,
        );
        let stale = signer(&engine).sign(stale).unwrap();
        assert!(matches!(engine.submit(stale), Err(EngineError::InvalidNonce { .. })));
        assert_eq!(engine.account("A").unwrap().nonce, 0);
    }

    #[test]
    fn test_value_is_conserved_across_transfer_and_stake() {
        let engine = engine();
        let before = engine.total_value();
        let b = addr(&engine, "B");
        let keys = signer(&engine);
        engine
            .submit(keys.prepare(&engine, "A", TxPayload::Transfer { to: b, amount: 250 }).unwrap())
            .unwrap();
        engine
            .submit(keys.prepare(&engine, "A", TxPayload::Stake { amount: 100 }).unwrap())
            .unwrap();
        let outcome = engine.produce_block().unwrap();
        assert_eq!(outcome.block.unwrap().transactions.len(), 2);
        assert_eq!(engine.total_value(), before);
        assert_eq!(engine.account("A").unwrap().stake, 100);
        assert_eq!(engine.account("A").unwrap().weight(), 125);
    }

    #[test]
    fn test_admission_errors() {
        let engine = engine();
        let keys = signer(&engine);
        let a = addr(&engine, "A");

        let ghost = Transaction::new("nobody", 0, 1, 100, TxPayload::Stake { amount: 1 }, 0);
        assert!(matches!(engine.submit(ghost), Err(EngineError::UnknownAccount(_))));

        let cheap = keys
            .sign(Transaction::new(a.clone(), 0, 1, 10, TxPayload::Stake { amount: 1 }, 0))
            .unwrap();
        assert!(matches!(engine.submit(cheap), Err(EngineError::GasLimitTooLow { .. })));

        let free = keys
            .sign(Transaction::new(a.clone(), 0, 0, 100, TxPayload::Stake { amount: 1 }, 0))
            .unwrap();
        assert!(matches!(engine.submit(free), Err(EngineError::GasPriceTooLow { .. })));

        let slash = Transaction::new(
            a.clone(),
            0,
            1,
            100,
            TxPayload::Slash {
                target: a.clone(),
                amount: 1,
                reputation: 0,
                reason: "self".into(),
            },
            0,
        );
        assert!(matches!(engine.submit(slash), Err(EngineError::Unauthorized(_))));

        let early_vote = keys
            .prepare(
                &engine,
                "A",
                TxPayload::Vote {
                    proposal_id: "none".into(),
                    option: VoteOption::For,
                },
            )
            .unwrap();
        assert!(matches!(engine.submit(early_vote), Err(EngineError::InvalidPhase { .. })));

        let early_proposal = keys
            .prepare(&engine, "A", TxPayload::ProposeRootCause { content: "x".into() })
            .unwrap();
        assert!(matches!(
            engine.submit(early_proposal),
            Err(EngineError::InvalidPhase { .. })
        ));

        assert!(engine.pending().is_empty());
        assert_eq!(engine.account("A").unwrap().nonce, 0);
    }

    #[test]
    fn test_payload_failure_charges_gas_and_is_excluded() {
        let engine = engine();
        let a = engine.account("A").unwrap();
        let b = addr(&engine, "B");
        let tx = signer(&engine)
            .prepare(&engine, "A", TxPayload::Transfer { to: b, amount: a.balance })
            .unwrap();
        let fee = tx.gas_fee();
        let outcome = engine.submit_and_seal(tx).unwrap();
        assert!(outcome.block.is_none());
        assert_eq!(outcome.receipts.len(), 1);
        assert!(!outcome.receipts[0].is_success());
        assert_eq!(outcome.receipts[0].gas_used, fee);

        let after = engine.account("A").unwrap();
        assert_eq!(after.balance, a.balance - fee);
        assert_eq!(after.nonce, 1);
        assert_eq!(engine.height(), 1);
    }

    #[test]
    fn test_empty_pool_seals_nothing() {
        let engine = engine();
        let outcome = engine.produce_block().unwrap();
        assert!(outcome.block.is_none());
        assert!(outcome.receipts.is_empty());
        assert_eq!(engine.height(), 1);
    }

    #[test]
    fn test_pool_full() {
        let mut config = four_agents();
        config.economy.max_pending_txs = 1;
        let engine = SopChain::with_clock(config, fixed_clock);
        let keys = signer(&engine);
        engine
            .submit(keys.prepare(&engine, "A", TxPayload::Stake { amount: 1 }).unwrap())
            .unwrap();
        let next = keys.prepare(&engine, "B", TxPayload::Stake { amount: 1 }).unwrap();
        assert_eq!(engine.submit(next), Err(EngineError::PoolFull(1)));
    }

    #[test]
    fn test_transaction_lookup_and_proof() {
        let engine = engine();
        let tx = signer(&engine).prepare(&engine, "A", TxPayload::Stake { amount: 5 }).unwrap();
        let hash = engine.submit(tx).unwrap();
        let pending = engine.get_transaction(&hash).unwrap();
        assert_eq!(pending.block_index, None);

        engine.produce_block().unwrap();
        let sealed = engine.get_transaction(&hash).unwrap();
        assert_eq!(sealed.block_index, Some(1));
        assert_eq!(sealed.block_hash, Some(engine.latest_hash()));

        let proof = engine.merkle_proof(1, 0).unwrap();
        assert!(proof.path.is_empty());
        assert!(proof.verify());
        assert!(matches!(engine.merkle_proof(1, 1), Err(EngineError::InvalidIndex { .. })));
        assert!(matches!(engine.merkle_proof(9, 0), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_reset_restores_genesis() {
        let engine = engine();
        let initial = engine.account("A").unwrap();
        let pid = open_proposal(&engine, "A");
        vote(&engine, "B", &pid, VoteOption::For);
        engine.produce_block().unwrap();
        vote(&engine, "C", &pid, VoteOption::For);
        assert!(engine.height() > 1);

        engine.reset();

        assert_eq!(engine.height(), 1);
        assert_eq!(engine.phase(), SopPhase::Init);
        assert_eq!(engine.account("A").unwrap(), initial);
        assert!(engine.pending().is_empty());
        assert!(engine.vote_stats().is_none());
        engine.read(|s| {
            assert!(s.governance().history().is_empty());
            assert!(s.sop().events().is_empty());
        });
    }

    #[test]
    fn test_tainted_instance_refuses_writes_until_reset() {
        let engine = engine();
        let inner = engine.inner.clone();
        std::thread::spawn(move || {
            let _guard = inner.write().unwrap();
            panic!("poison the engine lock");
        })
        .join()
        .unwrap_err();

        assert_eq!(engine.height(), 1);
        assert!(engine.is_tainted());
        let tx = signer(&engine).prepare(&engine, "A", TxPayload::Stake { amount: 1 }).unwrap();
        assert!(matches!(
            engine.submit(tx.clone()),
            Err(EngineError::ChainContinuity { .. })
        ));

        engine.reset();
        assert!(!engine.is_tainted());
        engine.submit(tx).unwrap();
    }

    #[test]
    fn test_instances_are_independent() {
        let one = engine();
        let two = engine();
        one.submit(signer(&one).prepare(&one, "A", TxPayload::Stake { amount: 1 }).unwrap())
            .unwrap();
        one.produce_block().unwrap();
        assert_eq!(one.height(), 2);
        assert_eq!(two.height(), 1);
    }

    #[test]
    fn test_snapshot_restores_equivalent_engine() {
        let engine = engine();
        let pid = open_proposal(&engine, "A");
        vote(&engine, "B", &pid, VoteOption::For);

        let restored = SopChain::from_snapshot_with_clock(engine.snapshot(), fixed_clock).unwrap();
        assert_eq!(restored.height(), engine.height());
        assert_eq!(restored.latest_hash(), engine.latest_hash());
        assert_eq!(restored.phase(), SopPhase::RootCauseProposed);
        assert_eq!(restored.pending().len(), 1);
        assert_eq!(restored.total_value(), engine.total_value());
        restored.verify_chain().unwrap();
    }

    #[test]
    fn test_unsigned_and_forged_transactions_rejected() {
        let engine = engine();
        let unsigned = engine.prepare("A", TxPayload::Stake { amount: 1 }).unwrap();
        assert!(matches!(
            engine.submit(unsigned.clone()),
            Err(EngineError::Unauthorized(_))
        ));

        let mut other = four_agents();
        let wrong_keys = Keyring::derive(b"someone-else", &mut other);
        let forged = wrong_keys.sign(unsigned).unwrap();
        assert!(matches!(engine.submit(forged), Err(EngineError::Unauthorized(_))));

        assert!(engine.pending().is_empty());
        assert_eq!(engine.account("A").unwrap().nonce, 0);
    }

    #[test]
    fn test_impersonated_vote_is_not_counted() {
        let engine = engine();
        let pid = open_proposal(&engine, "A");
        let ballot = engine
            .prepare(
                "B",
                TxPayload::Vote {
                    proposal_id: pid,
                    option: VoteOption::For,
                },
            )
            .unwrap();

        // A signs a ballot that names B as sender.
        let keys = signer(&engine);
        let a_key = keys.get(&addr(&engine, "A")).unwrap();
        let spoofed = sign_transaction(ballot, a_key);
        assert!(matches!(engine.submit(spoofed), Err(EngineError::Unauthorized(_))));
        assert_eq!(engine.vote_stats().unwrap().voters, 0);
    }

    #[test]
    fn test_agent_without_registered_key_cannot_submit() {
        let engine = SopChain::with_clock(EngineConfig::with_agents(&["A"]), fixed_clock);
        let mut config = EngineConfig::with_agents(&["A"]);
        let keys = Keyring::derive(KEY_SEED, &mut config);
        let tx = keys.prepare(&engine, "A", TxPayload::Stake { amount: 1 }).unwrap();
        let err = engine.submit(tx).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(ref m) if m.contains("no public key")));
    }

    #[test]
    fn test_non_ascii_sender_is_rejected_without_tainting() {
        let engine = engine();
        let sender = format!("a{}", "é".repeat(10));
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        let result = tracing::subscriber::with_default(subscriber, || {
            engine.submit(Transaction::new(sender, 0, 1, 100, TxPayload::Stake { amount: 1 }, 0))
        });
        assert!(matches!(result, Err(EngineError::UnknownAccount(_))));
        assert!(!engine.is_tainted());

        let tx = signer(&engine).prepare(&engine, "A", TxPayload::Stake { amount: 1 }).unwrap();
        engine.submit(tx).unwrap();
    }

    #[test]
    fn test_vote_on_stale_proposal_is_invalid_phase() {
        let engine = engine();
        open_proposal(&engine, "A");
        let stale = signer(&engine)
            .prepare(
                &engine,
                "B",
                TxPayload::Vote {
                    proposal_id: "stale".into(),
                    option: VoteOption::For,
                },
            )
            .unwrap();
        assert!(matches!(
            engine.submit(stale),
            Err(EngineError::InvalidPhase { current: SopPhase::RootCauseProposed, .. })
        ));
    }
}
