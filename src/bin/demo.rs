// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Runs one device through enrollment and attestation against an
//! in-process service.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pqattest::agent::{Agent, KeyStore};
use pqattest::api::Service;
use pqattest::authority::LocalAuthority;
use pqattest::clock::{Clock, SystemClock};
use pqattest::config::Config;
use pqattest::registry::MemoryRegistry;
use pqattest::retry::Backoff;
use pqattest::store::MemoryStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device identifier to enroll
    #[arg(short, long, default_value = "dev-1")]
    device_id: String,

    /// Key directory, overrides the configured one
    #[arg(short, long)]
    key_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("pqattest=info".parse()?),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let key_dir = args.key_dir.unwrap_or_else(|| config.agent.key_dir.clone());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(
        LocalAuthority::new(
            &config.authority.seed()?,
            &config.authority.name,
            config.authority.validity_days,
            clock.clone(),
        )?
        .with_pending_polls(config.authority.pending_polls),
    );
    let service = Arc::new(Service::new(
        Arc::new(MemoryRegistry::new()),
        store.clone(),
        authority,
        clock,
        &config,
    ));

    info!(device_id = %args.device_id, key_dir = %key_dir.display(), "starting agent");
    let agent = Agent::new(
        &args.device_id,
        KeyStore::open(key_dir)?,
        service,
        store,
        Backoff::from(&config.agent.certificate_poll),
    );
    let report = agent.run()?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
