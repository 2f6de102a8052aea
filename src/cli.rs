// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "foreman",
    about = "Autonomous agent runtime: orchestrator brain, specialist agents, dashboard + relay",
    version
)]
pub struct Cli {
    /// Initial task to process on startup. Without one, foreman waits for
    /// tasks from the dashboard or the relay tunnel.
    pub task: Option<String>,

    /// Path to an explicit config file (merged over the discovered ones).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG controls the filter; defaults to info).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the remote relay server (deploys to the public host).
    Relay,
    /// Print the effective merged configuration and exit.
    ShowConfig,
}
