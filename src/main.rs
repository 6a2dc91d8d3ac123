// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use council_config::Config;
use council_core::{EventHub, Orchestrator, ProviderRouter};
use council_model::Timeouts;
use council_node::AppState;
use council_store::{Aes256GcmProtector, CredentialStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::CheckConfig) => {
            let config = council_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Some(Commands::ListProviders { json }) => list_providers(json),
        Some(Commands::Serve { listen }) => {
            let config = council_config::load(cli.config.as_deref())?;
            serve(config, listen).await
        }
        None => {
            let config = council_config::load(cli.config.as_deref())?;
            serve(config, None).await
        }
    }
}

async fn serve(config: Config, listen: Option<String>) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store = if config.persistence.enabled {
        let path = PathBuf::from(&config.persistence.connection_string);
        info!(db = %path.display(), "opening session store");
        Arc::new(SqliteStore::open(&path).context("opening session store")?)
    } else {
        info!("persistence disabled; using an in-memory store");
        Arc::new(SqliteStore::open_in_memory()?)
    };

    let protector = Arc::new(load_protector(&config).context("loading sealing key")?);
    let credentials = Arc::new(CredentialStore::new(Arc::clone(&store), protector));

    let timeouts = Timeouts {
        request: std::time::Duration::from_secs(config.request_timeout_seconds),
        stream: std::time::Duration::from_secs(config.stream_timeout_seconds),
    };
    let router = Arc::new(ProviderRouter::new(
        Arc::clone(&credentials),
        timeouts,
        config.max_retries,
    ));

    let hub = Arc::new(EventHub::default());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        router,
        config.orchestration.clone(),
    );

    let state = AppState::new(store, credentials, hub, orchestrator, Arc::clone(&config));
    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    council_node::serve(state, &addr).await
}

/// Key material resolution: `COUNCIL_SEALING_KEY` (base64) wins; otherwise a
/// key file next to the database is used, created on first run.  An
/// in-memory deployment without the env var gets an ephemeral key.
fn load_protector(config: &Config) -> anyhow::Result<Aes256GcmProtector> {
    if let Ok(key) = std::env::var("COUNCIL_SEALING_KEY") {
        return Ok(Aes256GcmProtector::from_base64_key(key.trim())?);
    }
    if config.persistence.enabled {
        let path = format!("{}.key", config.persistence.connection_string);
        return Ok(Aes256GcmProtector::load_or_create(Path::new(&path))?);
    }
    Ok(Aes256GcmProtector::from_base64_key(
        &Aes256GcmProtector::generate_key_b64(),
    )?)
}

fn list_providers(json: bool) -> anyhow::Result<()> {
    let drivers = council_model::list_drivers();
    if json {
        let entries: Vec<serde_json::Value> = drivers
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "description": d.description,
                    "defaultEndpoint": d.default_endpoint,
                    "implemented": d.implemented,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for d in drivers {
            let status = if d.implemented { "" } else { "  (not implemented)" };
            println!("{:<12} {}{status}", d.id, d.description);
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
