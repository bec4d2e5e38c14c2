//! SopChain - ledger and governance engine for multi-agent incident response.
//!
//! Every command loads the stored snapshot, acts, saves and prints JSON.

mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sopchain::api;
use sopchain::config::EngineConfig;
use sopchain::driver::{run_analysis_cycle, IncidentReport, ScriptedPolicy};
use sopchain::stf::hash::{from_hex, to_hex};
use sopchain::stf::{Keyring, SopChain, Transaction, TxPayload};
use sopchain::storage::Storage;

use crate::cli::{Cli, Commands, SubmitTx};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_raw_data(data: Option<String>) -> anyhow::Result<serde_json::Value> {
    match data {
        Some(raw) => serde_json::from_str(&raw).context("--data must be valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

/// Config for a brand-new chain: --config, else config.toml, else defaults.
fn genesis_config(cli_config: Option<&std::path::Path>, storage: &Storage) -> anyhow::Result<EngineConfig> {
    let config = match cli_config {
        Some(path) => EngineConfig::from_file(path)?,
        None => storage.load_config()?,
    };
    config.validate()?;
    Ok(config)
}

/// Genesis plus a fresh key for every agent without a registered public key.
/// Writes config.toml, keys.json and the first snapshot.
fn create_chain(cli_config: Option<&std::path::Path>, storage: &Storage) -> anyhow::Result<(SopChain, Keyring)> {
    let mut config = genesis_config(cli_config, storage)?;
    let keys = Keyring::generate(&mut config);
    storage.save_config(&config)?;
    storage.save_keyring(&keys)?;
    let engine = SopChain::new(config);
    engine.save(storage)?;
    tracing::info!("🔑 Generated {} agent keys in {:?}", keys.len(), storage.keys_path());
    Ok((engine, keys))
}

/// Unsigned; the caller may still adjust gas before signing.
fn build_submission(engine: &SopChain, tx: SubmitTx) -> anyhow::Result<Transaction> {
    let (sender, payload) = match tx {
        SubmitTx::Transfer { from, to, amount } => {
            let to = engine.account(&to)?.address;
            (from, TxPayload::Transfer { to, amount })
        }
        SubmitTx::Stake { agent, amount } => (agent, TxPayload::Stake { amount }),
        SubmitTx::Vote { agent, proposal_id, option } => {
            let proposal_id = match proposal_id {
                Some(id) => id,
                None => engine
                    .read(|s| s.governance().active().map(|v| v.proposal.id.clone()))
                    .context("no proposal is open for voting")?,
            };
            (agent, TxPayload::Vote { proposal_id, option })
        }
        SubmitTx::Propose { agent, content } => (agent, TxPayload::ProposeRootCause { content }),
    };
    Ok(engine.prepare(&sender, payload)?)
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(Storage::default_data_dir);
    let storage = Storage::new(&data_dir)?;

    match cli.command {
        Commands::Init { force } => {
            if storage.has_state() && !force {
                bail!("a chain already exists in {:?} (use --force to overwrite)", data_dir);
            }
            let (engine, _) = create_chain(cli.config.as_deref(), &storage)?;
            tracing::info!("🌱 Chain initialized in {:?}", data_dir);
            print_json(&api::chain_info(&engine))
        }
        command => {
            let (engine, keys) = if storage.has_state() {
                let config = genesis_config(cli.config.as_deref(), &storage)?;
                let engine = SopChain::load_or_init(&storage, config)?;
                (engine, storage.load_keyring()?)
            } else {
                create_chain(cli.config.as_deref(), &storage)?
            };
            run(command, &engine, &keys, &storage)
        }
    }
}

/// Every command except `init` runs against a loaded engine.
fn run(command: Commands, engine: &SopChain, keys: &Keyring, storage: &Storage) -> anyhow::Result<()> {
    match command {
        Commands::Init { .. } => bail!("init runs before a chain is loaded"),

        Commands::Status => print_json(&api::chain_info(engine))?,

        Commands::Ingest { submitter, summary, data } => {
            engine.ingest_incident(&submitter, &summary, parse_raw_data(data)?)?;
            engine.save(storage)?;
            print_json(&api::sop_state(engine, None))?;
        }

        Commands::Submit { tx, gas_limit, gas_price, seal } => {
            let prepared = build_submission(engine, tx)?;
            let tx = if gas_limit.is_some() || gas_price.is_some() {
                Transaction::new(
                    prepared.sender(),
                    prepared.nonce(),
                    gas_price.unwrap_or(prepared.gas_price()),
                    gas_limit.unwrap_or(prepared.gas_limit()),
                    prepared.payload().clone(),
                    prepared.timestamp(),
                )
            } else {
                prepared
            };
            let tx = keys.sign(tx)?;
            if seal {
                let outcome = engine.submit_and_seal(tx)?;
                engine.save(storage)?;
                print_json(&outcome)?;
            } else {
                let hash = engine.submit(tx)?;
                engine.save(storage)?;
                print_json(&serde_json::json!({ "tx_hash": to_hex(&hash) }))?;
            }
        }

        Commands::Seal => {
            let outcome = engine.produce_block()?;
            engine.save(storage)?;
            print_json(&outcome)?;
        }

        Commands::Cycle { submitter, summary, data, root_cause, default_vote, votes } => {
            let mut policy = votes
                .iter()
                .fold(ScriptedPolicy::new(root_cause, default_vote), |p, (name, option)| {
                    p.with_vote(name, *option)
                });
            let incident = IncidentReport {
                submitter,
                summary,
                raw_data: parse_raw_data(data)?,
            };
            let report = run_analysis_cycle(engine, &mut policy, keys, &incident)?;
            engine.save(storage)?;
            print_json(&report)?;
        }

        Commands::CloseVoting => {
            let outcome = engine.close_voting()?;
            engine.save(storage)?;
            print_json(&outcome)?;
        }

        Commands::Blocks { limit, offset } => print_json(&api::blocks(engine, limit, offset))?,

        Commands::Block { index } => print_json(&api::block(engine, index)?)?,

        Commands::Tx { hash } => {
            let hash = from_hex(&hash).context("transaction hash must be 64 hex characters")?;
            print_json(&api::transaction(engine, &hash)?)?;
        }

        Commands::Proof { block, tx_index } => {
            print_json(&api::merkle_proof(engine, block, tx_index)?)?
        }

        Commands::Sop { limit } => print_json(&api::sop_state(engine, limit))?,

        Commands::Agents => print_json(&api::agents_state(engine))?,

        Commands::Voting => print_json(&api::voting_status(engine))?,

        Commands::Economy => print_json(&api::economy(engine))?,

        Commands::Pending => print_json(&api::pending(engine))?,

        Commands::Verify => {
            engine.verify_chain()?;
            print_json(&serde_json::json!({
                "valid": true,
                "block_height": engine.height(),
            }))?;
        }

        Commands::Reset { yes } => {
            if !yes {
                bail!("reset drops every block, account and proposal; pass --yes to confirm");
            }
            engine.reset();
            engine.save(storage)?;
            print_json(&api::chain_info(engine))?;
        }
    }

    Ok(())
}
