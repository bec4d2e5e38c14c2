//! Binary Merkle tree over a block's ordered transaction hashes.
//!
//! Leaves are lifted as `H(tx_hash)`, odd levels duplicate their last node,
//! and parents are `H(left || right)`. A one-transaction block therefore has
//! root `H(tx_hash)` and an empty audit path.

use serde::{Deserialize, Serialize};

use super::hash::{empty_root, hash_pair, sha256, Hash};
use super::transaction::hex_hash;
use crate::error::{EngineError, EngineResult};

/// Which side of the authenticated node the sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    #[serde(with = "hex_hash")]
    pub hash: Hash,
    pub position: Position,
}

/// Membership proof of one transaction in one block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub block_index: u64,
    pub tx_index: usize,
    #[serde(with = "hex_hash")]
    pub tx_hash: Hash,
    #[serde(with = "hex_hash")]
    pub merkle_root: Hash,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        verify(&self.tx_hash, &self.path, &self.merkle_root)
    }
}

fn leaf_level(leaves: &[Hash]) -> Vec<Hash> {
    leaves.iter().map(|h| sha256(h)).collect()
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| {
            // A lone last node is paired with itself.
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            hash_pair(left, right)
        })
        .collect()
}

/// Root over the given transaction hashes (empty input gives `H("")`).
pub fn build(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return empty_root();
    }
    let mut level = leaf_level(leaves);
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Audit path for `leaves[index]`, ordered from leaf to root.
pub fn prove(leaves: &[Hash], index: usize) -> EngineResult<Vec<ProofStep>> {
    if index >= leaves.len() {
        return Err(EngineError::InvalidIndex {
            index,
            len: leaves.len(),
        });
    }

    let mut path = Vec::new();
    let mut level = leaf_level(leaves);
    let mut idx = index;
    while level.len() > 1 {
        let step = if idx % 2 == 0 {
            // A lone last node is paired with itself.
            let sibling = level.get(idx + 1).copied().unwrap_or(level[idx]);
            ProofStep {
                hash: sibling,
                position: Position::Right,
            }
        } else {
            ProofStep {
                hash: level[idx - 1],
                position: Position::Left,
            }
        };
        path.push(step);
        level = next_level(&level);
        idx /= 2;
    }
    Ok(path)
}

/// Recompute the root from a leaf and its path. Never errors: a mismatch is
/// an ordinary `false`.
pub fn verify(leaf: &Hash, path: &[ProofStep], root: &Hash) -> bool {
    let computed = path.iter().fold(sha256(leaf), |current, step| match step.position {
        Position::Left => hash_pair(&step.hash, &current),
        Position::Right => hash_pair(&current, &step.hash),
    });
    computed == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| sha256(format!("tx-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_tree_root() {
        assert_eq!(build(&[]), empty_root());
        assert!(matches!(prove(&[], 0), Err(EngineError::InvalidIndex { .. })));
    }

    #[test]
    fn test_single_leaf_has_empty_path() {
        let l = leaves(1);
        let root = build(&l);
        assert_eq!(root, sha256(&l[0]));
        let path = prove(&l, 0).unwrap();
        assert!(path.is_empty());
        assert!(verify(&l[0], &path, &root));
    }

    #[test]
    fn test_every_leaf_verifies_for_various_sizes() {
        for n in 1..=9 {
            let l = leaves(n);
            let root = build(&l);
            for i in 0..n {
                let path = prove(&l, i).unwrap();
                assert!(verify(&l[i], &path, &root), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let l = leaves(3);
        let a = sha256(&l[0]);
        let b = sha256(&l[1]);
        let c = sha256(&l[2]);
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(build(&l), expected);

        let path = prove(&l, 2).unwrap();
        assert_eq!(path[0], ProofStep { hash: c, position: Position::Right });
        assert_eq!(path[1].position, Position::Left);
    }

    #[test]
    fn test_flipped_byte_fails_verification() {
        let l = leaves(5);
        let root = build(&l);
        let path = prove(&l, 3).unwrap();
        let mut tampered = l[3];
        tampered[7] ^= 0x01;
        assert!(!verify(&tampered, &path, &root));

        let mut bad_path = path.clone();
        bad_path[0].hash[0] ^= 0xff;
        assert!(!verify(&l[3], &bad_path, &root));
    }

    #[test]
    fn test_out_of_range_index() {
        let l = leaves(4);
        assert_eq!(
            prove(&l, 4),
            Err(EngineError::InvalidIndex { index: 4, len: 4 })
        );
    }
}
