//! Pending transaction pool (FIFO, capped)

use std::collections::{HashMap, VecDeque};

use super::hash::Hash;
use super::transaction::Transaction;
use crate::error::{EngineError, EngineResult};

#[derive(Clone, Debug, Default)]
pub struct TxPool {
    queue: VecDeque<Transaction>,
    per_sender: HashMap<String, u64>,
    capacity: usize,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            per_sender: HashMap::new(),
            capacity,
        }
    }

    /// Restore a pool from persisted pending transactions, oldest first.
    pub fn from_transactions(capacity: usize, txs: Vec<Transaction>) -> Self {
        let mut pool = Self::new(capacity);
        for tx in txs {
            *pool.per_sender.entry(tx.sender().to_string()).or_default() += 1;
            pool.queue.push_back(tx);
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pending transactions from `sender` not yet sealed.
    pub fn pending_for(&self, sender: &str) -> u64 {
        self.per_sender.get(sender).copied().unwrap_or(0)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.queue.iter().any(|tx| &tx.hash() == hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.queue.iter().find(|tx| &tx.hash() == hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.queue.iter()
    }

    pub fn check_capacity(&self) -> EngineResult<()> {
        if self.queue.len() >= self.capacity {
            return Err(EngineError::PoolFull(self.queue.len()));
        }
        Ok(())
    }

    pub fn push(&mut self, tx: Transaction) -> EngineResult<()> {
        self.check_capacity()?;
        *self.per_sender.entry(tx.sender().to_string()).or_default() += 1;
        self.queue.push_back(tx);
        Ok(())
    }

    /// Take every pending transaction in arrival order.
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.per_sender.clear();
        self.queue.drain(..).collect()
    }
}
