// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Creator–Reviewer deliberation server.
///
/// Runs the iteration loop over per-user configured LLM endpoints and
/// exposes it over HTTP + WebSocket.  With no subcommand, `serve` runs.
#[derive(Parser, Debug)]
#[command(name = "council", version, about)]
pub struct Cli {
    /// Explicit config file, merged over the discovered layers.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (RUST_LOG overrides this).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the API server (the default when no subcommand is given).
    Serve {
        /// Listen address override, e.g. `0.0.0.0:8700`.
        #[arg(long)]
        listen: Option<String>,
    },

    /// Load, validate, and print the merged configuration.
    CheckConfig,

    /// List recognised provider tags and their defaults.
    ListProviders {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}
