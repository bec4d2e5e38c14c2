//! Agent signing keys
//!
//! Every agent transaction carries an ed25519 signature over its hash. The
//! engine only ever sees public keys, registered per agent in the config at
//! genesis. Private keys live in a [`Keyring`] owned by whoever submits.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use super::hash::{sha256, short};
use super::state::SopChain;
use super::transaction::{Transaction, TxPayload};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

pub fn public_key_hex(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().to_bytes())
}

/// Decode a hex ed25519 public key, checking it is a valid curve point.
pub fn parse_public_key(hex_key: &str) -> EngineResult<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| EngineError::InvalidPayload("public key must be 64 hex characters".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| EngineError::InvalidPayload("invalid ed25519 public key".into()))
}

pub fn sign_transaction(tx: Transaction, key: &SigningKey) -> Transaction {
    let signature = key.sign(&tx.hash());
    tx.with_signature(hex::encode(signature.to_bytes()))
}

/// Check that `tx` was signed by the holder of `public_key` (hex).
pub fn verify_transaction(public_key: &str, tx: &Transaction) -> EngineResult<()> {
    let unauthorized = |why: &str| {
        EngineError::Unauthorized(format!("{} for {}", why, short(tx.sender())))
    };
    let signature = tx.signature().ok_or_else(|| unauthorized("missing signature"))?;
    let bytes: [u8; 64] = hex::decode(signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| unauthorized("malformed signature"))?;
    let key = parse_public_key(public_key).map_err(|_| unauthorized("unusable public key"))?;
    key.verify(&tx.hash(), &Signature::from_bytes(&bytes))
        .map_err(|_| unauthorized("signature verification failed"))
}

/// On-disk form of one keyring entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyEntry {
    pub address: String,
    pub public_key: String,
    pub private_key: String,
}

/// Private keys by agent address
#[derive(Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<String, SigningKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh random key for every agent in `config` that has no public key
    /// yet. The public halves are written back into `config`.
    pub fn generate(config: &mut EngineConfig) -> Self {
        let mut rng = rand::rngs::OsRng;
        let mut ring = Self::new();
        for agent in config.agents.iter_mut().filter(|a| a.public_key.is_none()) {
            let key = SigningKey::generate(&mut rng);
            agent.public_key = Some(public_key_hex(&key));
            ring.insert(agent.address(), key);
        }
        ring
    }

    /// Keys derived from `seed` and each agent name, replacing any public key
    /// already in `config`. The same seed and names always give the same keys.
    pub fn derive(seed: &[u8], config: &mut EngineConfig) -> Self {
        let mut ring = Self::new();
        for agent in &mut config.agents {
            let mut material = seed.to_vec();
            material.push(b':');
            material.extend_from_slice(agent.name.as_bytes());
            let key = SigningKey::from_bytes(&sha256(&material));
            agent.public_key = Some(public_key_hex(&key));
            ring.insert(agent.address(), key);
        }
        ring
    }

    pub fn insert(&mut self, address: String, key: SigningKey) {
        self.keys.insert(address, key);
    }

    pub fn get(&self, address: &str) -> Option<&SigningKey> {
        self.keys.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.keys.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sign with the sender's key.
    pub fn sign(&self, tx: Transaction) -> EngineResult<Transaction> {
        let key = self.keys.get(tx.sender()).ok_or_else(|| {
            EngineError::Unauthorized(format!("no signing key for {}", short(tx.sender())))
        })?;
        Ok(sign_transaction(tx, key))
    }

    /// Next transaction for `sender` (address or agent name), signed.
    pub fn prepare(&self, engine: &SopChain, sender: &str, payload: TxPayload) -> EngineResult<Transaction> {
        self.sign(engine.prepare(sender, payload)?)
    }

    pub fn to_entries(&self) -> Vec<KeyEntry> {
        self.keys
            .iter()
            .map(|(address, key)| KeyEntry {
                address: address.clone(),
                public_key: public_key_hex(key),
                private_key: hex::encode(key.to_bytes()),
            })
            .collect()
    }

    pub fn from_entries(entries: Vec<KeyEntry>) -> EngineResult<Self> {
        let mut ring = Self::new();
        for entry in entries {
            let secret: [u8; 32] = hex::decode(&entry.private_key)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| {
                    EngineError::InvalidPayload(format!("bad private key for {}", short(&entry.address)))
                })?;
            let key = SigningKey::from_bytes(&secret);
            if public_key_hex(&key) != entry.public_key {
                return Err(EngineError::InvalidPayload(format!(
                    "key pair mismatch for {}",
                    short(&entry.address)
                )));
            }
            ring.insert(entry.address, key);
        }
        Ok(ring)
    }
}
