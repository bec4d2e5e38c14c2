//! Hashing helpers shared by transactions, blocks and the Merkle tree.
//!
//! Every encoding is length-prefixed little-endian so that two different
//! field layouts can never collide on the same byte stream.

use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

/// Previous-hash sentinel carried by the genesis block.
pub const ZERO_HASH: Hash = [0u8; 32];

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Hash of `left || right`.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root of a tree with no leaves: `H("")`.
pub fn empty_root() -> Hash {
    sha256(b"")
}

/// Stable 20-byte hex address derived from a domain tag and a name.
pub fn derive_address(domain: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    let digest: Hash = hasher.finalize().into();
    hex::encode(&digest[..20])
}

pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Parse a 64-char hex string back into a hash.
pub fn from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
    bytes.try_into().ok()
}

/// First 16 characters of `s`, for log lines. Cuts on a char boundary.
pub fn short(s: &str) -> &str {
    s.char_indices().nth(16).map_or(s, |(i, _)| &s[..i])
}

/// Canonical byte encoder used for content addressing.
#[derive(Default)]
pub struct CanonicalEncoder {
    hasher: Sha256,
}

impl CanonicalEncoder {
    pub fn new(domain: &[u8]) -> Self {
        let mut enc = Self::default();
        enc.bytes(domain);
        enc
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.hasher.update(v.to_le_bytes());
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.hasher.update([v]);
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.hasher.update((b.len() as u64).to_le_bytes());
        self.hasher.update(b);
        self
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.bytes(s.as_bytes())
    }

    pub fn hash(&mut self, h: &Hash) -> &mut Self {
        self.hasher.update(h);
        self
    }

    pub fn finish(self) -> Hash {
        self.hasher.finalize().into()
    }
}
