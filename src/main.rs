// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use sluice_pool::{TokenPool, TokenRecord};
use sluice_store::FileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // reqwest is built with rustls; install the process-wide provider once
    // so TLS setup cannot race between subsystems.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        None | Some(Commands::Start) => {
            let config = sluice_config::load(cli.config.as_deref())?;
            let state = sluice_server::build_state(config).await?;
            sluice_server::serve(state).await
        }

        Some(Commands::ShowConfig) => {
            let config = sluice_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }

        Some(Commands::ImportTokens { file, class }) => {
            let config = sluice_config::load(cli.config.as_deref())?;
            import_tokens(&config, &file, class.into()).await
        }

        Some(Commands::GenerateKey) => {
            println!("sk-sluice-{}{}", new_key_half(), new_key_half());
            Ok(())
        }
    }
}

fn new_key_half() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ── Token import ──────────────────────────────────────────────────────────────

/// Read one credential per line and add the new ones to the catalog.
async fn import_tokens(
    config: &sluice_config::Config,
    file: &std::path::Path,
    class: sluice_pool::TokenClass,
) -> anyhow::Result<()> {
    let text = if file == std::path::Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?
    };

    let records: Vec<TokenRecord> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| TokenRecord::new(line, class))
        .collect();
    if records.is_empty() {
        anyhow::bail!("no credentials found in {}", file.display());
    }
    let total = records.len();

    let store = Arc::new(FileStore::new(config.store.path.clone()));
    let pool = TokenPool::load(store, config.pool.clone())
        .await
        .context("loading token catalog")?;
    let added = pool.import(records).await;
    pool.flush_now().await;

    info!(added, skipped = total - added, "import complete");
    println!("imported {added} token(s), {} already present", total - added);
    Ok(())
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
