// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Multi-tenant OpenAI-compatible gateway over a pooled upstream.
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered ones).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).  RUST_LOG wins when
    /// set.
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway (default when no subcommand is given).
    Start,

    /// Print the effective merged configuration and exit.
    ShowConfig,

    /// Import credentials into the token catalog, one per line.
    ///
    /// Reads from the given file, or stdin when the path is `-`.  Blank
    /// lines and lines starting with `#` are skipped.  Existing ids are
    /// left untouched.
    ImportTokens {
        /// Credential list file, or `-` for stdin.
        file: PathBuf,

        /// Account tier of the imported credentials.
        #[arg(long, value_enum, default_value_t = ClassArg::Basic)]
        class: ClassArg,
    },

    /// Generate a fresh API key for the `server.api_key` /
    /// `server.admin_key` config fields.
    GenerateKey,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ClassArg {
    Basic,
    Super,
}

impl From<ClassArg> for sluice_pool::TokenClass {
    fn from(value: ClassArg) -> Self {
        match value {
            ClassArg::Basic => Self::Basic,
            ClassArg::Super => Self::Super,
        }
    }
}
