//! Append-only block chain
//!
//! Blocks are chained by hash and authenticated by the Merkle root of their
//! transactions. Nothing is ever removed; a reset builds a new ledger.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::hash::{CanonicalEncoder, Hash, ZERO_HASH};
use super::merkle;
use super::transaction::{hex_hash, Transaction};
use crate::error::{EngineError, EngineResult};

/// Block header for the chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: u64,
    pub timestamp: u64,
    #[serde(with = "hex_hash")]
    pub previous_hash: Hash,
    #[serde(with = "hex_hash")]
    pub merkle_root: Hash,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn compute_hash(&self) -> Hash {
        let mut enc = CanonicalEncoder::new(b"sopchain-block");
        enc.u64(self.index)
            .hash(&self.previous_hash)
            .hash(&self.merkle_root)
            .u64(self.timestamp)
            .u64(self.nonce);
        enc.finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(with = "hex_hash")]
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    fn seal(index: u64, previous_hash: Hash, transactions: Vec<Transaction>, timestamp: u64) -> Self {
        let merkle_root = merkle::build(&tx_hashes(&transactions));
        let header = BlockHeader {
            index,
            timestamp,
            previous_hash,
            merkle_root,
            nonce: 0,
        };
        Self {
            hash: header.compute_hash(),
            header,
            transactions,
        }
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        tx_hashes(&self.transactions)
    }

    /// Merkle root recomputed from the transaction list alone.
    pub fn recompute_merkle_root(&self) -> Hash {
        merkle::build(&self.tx_hashes())
    }

    /// Audit path for the transaction at `tx_index`.
    pub fn merkle_proof(&self, tx_index: usize) -> EngineResult<Vec<merkle::ProofStep>> {
        merkle::prove(&self.tx_hashes(), tx_index)
    }
}

fn tx_hashes(transactions: &[Transaction]) -> Vec<Hash> {
    transactions.iter().map(Transaction::hash).collect()
}

/// The block chain plus a tx-hash index
#[derive(Clone, Debug)]
pub struct Ledger {
    chain: Vec<Block>,
    /// tx_hash -> (block index, position in block)
    tx_index: HashMap<Hash, (usize, usize)>,
}

impl Ledger {
    /// Fresh ledger holding only the genesis block.
    pub fn new(genesis_timestamp: u64) -> Self {
        let genesis = Block::seal(0, ZERO_HASH, Vec::new(), genesis_timestamp);
        Self {
            chain: vec![genesis],
            tx_index: HashMap::new(),
        }
    }

    /// Rebuild from a stored block list, auditing every link.
    pub fn from_blocks(blocks: Vec<Block>) -> EngineResult<Self> {
        if blocks.is_empty() {
            return Err(EngineError::ChainContinuity {
                index: 0,
                reason: "no genesis block".into(),
            });
        }
        let mut ledger = Self {
            chain: blocks,
            tx_index: HashMap::new(),
        };
        ledger.verify_chain()?;
        ledger.rebuild_index()?;
        Ok(ledger)
    }

    fn rebuild_index(&mut self) -> EngineResult<()> {
        self.tx_index.clear();
        for (b, block) in self.chain.iter().enumerate() {
            for (t, tx) in block.transactions.iter().enumerate() {
                if self.tx_index.insert(tx.hash(), (b, t)).is_some() {
                    return Err(EngineError::ChainContinuity {
                        index: b as u64,
                        reason: format!("transaction {} appears twice", hex::encode(tx.hash())),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of blocks, genesis included.
    pub fn height(&self) -> u64 {
        self.chain.len() as u64
    }

    pub fn latest(&self) -> &Block {
        // The chain always holds at least the genesis block.
        &self.chain[self.chain.len() - 1]
    }

    pub fn latest_hash(&self) -> Hash {
        self.latest().hash
    }

    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    /// Range query: `limit` blocks starting at `offset` (all when `None`).
    pub fn range(&self, limit: Option<usize>, offset: usize) -> &[Block] {
        let start = offset.min(self.chain.len());
        let end = match limit {
            Some(n) => start.saturating_add(n).min(self.chain.len()),
            None => self.chain.len(),
        };
        &self.chain[start..end]
    }

    pub fn get_block(&self, index: u64) -> EngineResult<&Block> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.chain.get(i))
            .ok_or_else(|| EngineError::not_found(format!("block {}", index)))
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> EngineResult<&Block> {
        self.chain
            .iter()
            .find(|b| &b.hash == hash)
            .ok_or_else(|| EngineError::not_found(format!("block {}", hex::encode(hash))))
    }

    pub fn get_transaction(&self, tx_hash: &Hash) -> EngineResult<(&Block, &Transaction)> {
        let (b, t) = self
            .tx_index
            .get(tx_hash)
            .copied()
            .ok_or_else(|| EngineError::not_found(format!("transaction {}", hex::encode(tx_hash))))?;
        let block = &self.chain[b];
        Ok((block, &block.transactions[t]))
    }

    pub fn contains_transaction(&self, tx_hash: &Hash) -> bool {
        self.tx_index.contains_key(tx_hash)
    }

    /// Seal `transactions` into the next block and append it.
    pub fn append(&mut self, transactions: Vec<Transaction>, timestamp: u64) -> EngineResult<&Block> {
        let index = self.height();
        let previous_hash = self.latest_hash();

        // The tail must still hash to what the next block will reference.
        let tail = self.latest();
        if tail.header.compute_hash() != tail.hash {
            return Err(EngineError::ChainContinuity {
                index: tail.index(),
                reason: "tail block hash does not match its header".into(),
            });
        }
        for tx in &transactions {
            if self.tx_index.contains_key(&tx.hash()) {
                return Err(EngineError::ChainContinuity {
                    index,
                    reason: format!("transaction {} already on chain", hex::encode(tx.hash())),
                });
            }
        }

        let block = Block::seal(index, previous_hash, transactions, timestamp);
        let b = self.chain.len();
        for (t, tx) in block.transactions.iter().enumerate() {
            self.tx_index.insert(tx.hash(), (b, t));
        }
        self.chain.push(block);
        Ok(&self.chain[b])
    }

    /// Re-derive every hash, root and link from genesis.
    pub fn verify_chain(&self) -> EngineResult<()> {
        for (i, block) in self.chain.iter().enumerate() {
            let fail = |reason: &str| EngineError::ChainContinuity {
                index: i as u64,
                reason: reason.to_string(),
            };
            if block.header.index != i as u64 {
                return Err(fail("index is not contiguous"));
            }
            if block.header.compute_hash() != block.hash {
                return Err(fail("block hash does not match header"));
            }
            if block.recompute_merkle_root() != block.header.merkle_root {
                return Err(fail("merkle root does not match transactions"));
            }
            if block.transactions.iter().any(|tx| !tx.hash_matches()) {
                return Err(fail("transaction hash does not match contents"));
            }
            let expected_prev = if i == 0 { ZERO_HASH } else { self.chain[i - 1].hash };
            if block.header.previous_hash != expected_prev {
                return Err(fail("previous hash does not link"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stf::hash::empty_root;
    use crate::stf::merkle::verify;
    use crate::stf::transaction::TxPayload;

    fn tx(sender: &str, nonce: u64) -> Transaction {
        Transaction::new(sender, nonce, 1, 100, TxPayload::Stake { amount: nonce + 1 }, 42)
    }

    fn chain_with(blocks: &[usize]) -> Ledger {
        let mut ledger = Ledger::new(1);
        let mut nonce = 0;
        for (i, n) in blocks.iter().enumerate() {
            let txs = (0..*n)
                .map(|_| {
                    nonce += 1;
                    tx("s", nonce)
                })
                .collect();
            ledger.append(txs, 10 + i as u64).unwrap();
        }
        ledger
    }

    #[test]
    fn test_genesis_block() {
        let ledger = Ledger::new(7);
        assert_eq!(ledger.height(), 1);
        let g = ledger.get_block(0).unwrap();
        assert_eq!(g.header.previous_hash, ZERO_HASH);
        assert_eq!(g.header.merkle_root, empty_root());
        assert!(g.transactions.is_empty());
        ledger.verify_chain().unwrap();
    }

    #[test]
    fn test_blocks_link_by_hash_and_roots_recompute() {
        let ledger = chain_with(&[1, 3, 4, 2]);
        assert_eq!(ledger.height(), 5);
        for i in 1..ledger.height() {
            let prev = ledger.get_block(i - 1).unwrap();
            let cur = ledger.get_block(i).unwrap();
            assert_eq!(cur.header.previous_hash, prev.hash);
            assert_eq!(cur.header.merkle_root, merkle::build(&cur.tx_hashes()));
        }
        ledger.verify_chain().unwrap();
    }

    #[test]
    fn test_every_transaction_proves_membership() {
        let ledger = chain_with(&[1, 5, 2]);
        for block in ledger.blocks() {
            for (i, tx) in block.transactions.iter().enumerate() {
                let path = block.merkle_proof(i).unwrap();
                assert!(verify(&tx.hash(), &path, &block.header.merkle_root));
            }
        }
        let single = ledger.get_block(1).unwrap();
        assert!(single.merkle_proof(0).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_by_hash() {
        let ledger = chain_with(&[2, 2]);
        let wanted = ledger.get_block(2).unwrap().transactions[1].clone();
        let (block, found) = ledger.get_transaction(&wanted.hash()).unwrap();
        assert_eq!(block.index(), 2);
        assert_eq!(found, &wanted);

        let b = ledger.get_block_by_hash(&block.hash).unwrap();
        assert_eq!(b.index(), 2);

        assert!(matches!(ledger.get_transaction(&[9u8; 32]), Err(EngineError::NotFound(_))));
        assert!(matches!(ledger.get_block(99), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_range_query() {
        let ledger = chain_with(&[1, 1, 1, 1]);
        assert_eq!(ledger.range(None, 0).len(), 5);
        let page = ledger.range(Some(2), 1);
        assert_eq!(page.iter().map(Block::index).collect::<Vec<_>>(), vec![1, 2]);
        assert!(ledger.range(Some(3), 10).is_empty());
    }

    #[test]
    fn test_duplicate_transaction_breaks_continuity() {
        let mut ledger = chain_with(&[1]);
        let again = ledger.get_block(1).unwrap().transactions[0].clone();
        let err = ledger.append(vec![again], 99).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.height(), 2);
    }

    #[test]
    fn test_tampering_is_detected_on_reload() {
        let ledger = chain_with(&[2, 2]);
        let mut blocks = ledger.blocks().to_vec();
        assert!(Ledger::from_blocks(blocks.clone()).is_ok());

        blocks[1].header.timestamp += 1;
        let err = Ledger::from_blocks(blocks.clone()).unwrap_err();
        assert!(matches!(err, EngineError::ChainContinuity { index: 1, .. }));

        let mut swapped = ledger.blocks().to_vec();
        swapped[2].transactions.swap(0, 1);
        assert!(Ledger::from_blocks(swapped).is_err());

        assert!(Ledger::from_blocks(Vec::new()).is_err());
    }
}
