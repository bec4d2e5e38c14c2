//! Persistent storage for SopChain state
//!
//! Stores a full JSON snapshot of the engine so a chain survives between CLI
//! invocations. Writes go to a temp file first and are renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::stf::{AccountLedger, Block, GovernanceState, KeyEntry, Keyring, SopState, Transaction};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Persistent state that gets saved to disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub config: EngineConfig,
    pub blocks: Vec<Block>,
    pub accounts: AccountLedger,
    pub sop: SopState,
    pub governance: GovernanceState,
    /// Pool contents, oldest first
    #[serde(default)]
    pub pending: Vec<Transaction>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

/// Storage manager for snapshot and config files
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Open (and create if needed) a data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        Ok(Self { data_dir })
    }

    /// Get the default data directory
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sopchain")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join("keys.json")
    }

    pub fn has_state(&self) -> bool {
        self.state_path().exists()
    }

    /// Load the snapshot, if one exists. A snapshot that fails to parse is an
    /// error, never silently replaced by a fresh chain.
    pub fn load_state(&self) -> anyhow::Result<Option<PersistedState>> {
        let path = self.state_path();
        if !path.exists() {
            tracing::info!("📂 No existing state found at {:?}", path);
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let state: PersistedState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state file {:?}", path))?;
        if state.version > SNAPSHOT_VERSION {
            anyhow::bail!(
                "state file {:?} has version {}, this build reads up to {}",
                path,
                state.version,
                SNAPSHOT_VERSION
            );
        }
        tracing::info!("📂 Loaded state from {:?}", path);
        Ok(Some(state))
    }

    /// Save state to disk via write-to-temp-then-rename, so a crash mid-write
    /// never leaves a truncated snapshot behind.
    pub fn save_state(&self, state: &PersistedState) -> anyhow::Result<()> {
        let path = self.state_path();
        let contents = serde_json::to_string_pretty(state)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to move snapshot into {:?}", path))?;
        tracing::debug!("💾 State saved atomically to {:?}", path);
        Ok(())
    }

    /// Config stored next to the snapshot, or the defaults.
    pub fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let path = self.config_path();
        if path.exists() {
            EngineConfig::from_file(&path)
        } else {
            Ok(EngineConfig::default())
        }
    }

    pub fn save_config(&self, config: &EngineConfig) -> anyhow::Result<()> {
        let path = self.config_path();
        fs::write(&path, config.to_toml_string()?)
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Agent private keys, or an empty keyring if none were saved.
    pub fn load_keyring(&self) -> anyhow::Result<Keyring> {
        let path = self.keys_path();
        if !path.exists() {
            return Ok(Keyring::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let entries: Vec<KeyEntry> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse key file {:?}", path))?;
        let keys = Keyring::from_entries(entries)
            .with_context(|| format!("Invalid key file {:?}", path))?;
        tracing::info!("🔑 Loaded {} agent keys from {:?}", keys.len(), path);
        Ok(keys)
    }

    pub fn save_keyring(&self, keys: &Keyring) -> anyhow::Result<()> {
        let path = self.keys_path();
        let contents = serde_json::to_string_pretty(&keys.to_entries())?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to move keys into {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stf::{SopChain, SopPhase, TxPayload};

    fn clock() -> u64 {
        1_700_000_000
    }

    fn keyed(names: &[&str]) -> (EngineConfig, Keyring) {
        let mut config = EngineConfig::with_agents(names);
        let keys = Keyring::derive(b"storage-tests", &mut config);
        (config, keys)
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        assert!(storage.load_state().unwrap().is_none());
        assert!(!storage.has_state());
    }

    #[test]
    fn test_save_load_roundtrip_keeps_chain_valid() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("nested")).unwrap();

        let (config, keys) = keyed(&["a", "b"]);
        let engine = SopChain::with_clock(config, clock);
        engine.ingest_incident("a", "disk full on node-3", serde_json::Value::Null).unwrap();
        let stake = keys.prepare(&engine, "a", TxPayload::Stake { amount: 40 }).unwrap();
        engine.submit_and_seal(stake).unwrap();
        let pending = keys.prepare(&engine, "b", TxPayload::Stake { amount: 1 }).unwrap();
        engine.submit(pending).unwrap();
        engine.save(&storage).unwrap();
        assert!(!dir.path().join("nested/state.json.tmp").exists());

        let snapshot = storage.load_state().unwrap().unwrap();
        let restored = SopChain::from_snapshot_with_clock(snapshot, clock).unwrap();
        restored.verify_chain().unwrap();
        assert_eq!(restored.height(), 2);
        assert_eq!(restored.latest_hash(), engine.latest_hash());
        assert_eq!(restored.phase(), SopPhase::DataCollected);
        assert_eq!(restored.account("a").unwrap().stake, 40);
        assert_eq!(restored.pending().len(), 1);
    }

    #[test]
    fn test_tampered_snapshot_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let (config, keys) = keyed(&["a"]);
        let engine = SopChain::with_clock(config, clock);
        let stake = keys.prepare(&engine, "a", TxPayload::Stake { amount: 5 }).unwrap();
        engine.submit_and_seal(stake).unwrap();

        let mut snapshot = engine.snapshot();
        snapshot.blocks[1].header.timestamp += 60;
        storage.save_state(&snapshot).unwrap();

        let loaded = storage.load_state().unwrap().unwrap();
        assert!(SopChain::from_snapshot(loaded).is_err());
    }

    #[test]
    fn test_garbage_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        fs::write(dir.path().join("state.json"), "{ not json").unwrap();
        assert!(storage.load_state().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        assert_eq!(storage.load_config().unwrap(), EngineConfig::default());

        let mut config = EngineConfig::with_agents(&["x", "y", "z"]);
        config.economy.bounty_base_token = 999;
        storage.save_config(&config).unwrap();
        assert_eq!(storage.load_config().unwrap(), config);
    }

    #[test]
    fn test_keyring_roundtrip_signs_for_restored_chain() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        assert!(storage.load_keyring().unwrap().is_empty());

        let mut config = EngineConfig::with_agents(&["a", "b"]);
        let keys = Keyring::generate(&mut config);
        storage.save_config(&config).unwrap();
        storage.save_keyring(&keys).unwrap();
        SopChain::with_clock(config, clock).save(&storage).unwrap();

        let loaded = storage.load_keyring().unwrap();
        assert_eq!(loaded.len(), 2);
        let engine = SopChain::from_snapshot_with_clock(storage.load_state().unwrap().unwrap(), clock)
            .unwrap();
        let tx = loaded.prepare(&engine, "b", TxPayload::Stake { amount: 2 }).unwrap();
        engine.submit(tx).unwrap();
    }
}
