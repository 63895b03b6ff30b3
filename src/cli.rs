// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kuvert_config::TransportKind;

#[derive(Parser, Debug)]
#[command(
    name = "kuvert",
    about = "An envelope-driven agent runtime with MCP tool transports",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Goal to run once; omit to start the interactive REPL
    #[arg(value_name = "GOAL")]
    pub goal: Option<String>,

    /// Tool transport (builtin | stdio | sse | direct)
    #[arg(long, short = 't', value_enum, env = "KUVERT_TRANSPORT")]
    pub transport: Option<TransportKind>,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Path to the MCP server registry (mcpServers.json)
    #[arg(long, value_name = "PATH")]
    pub servers: Option<PathBuf>,

    /// Override the decision-cycle budget
    #[arg(long, value_name = "N")]
    pub max_cycles: Option<u32>,

    /// Auto-approve confirmations (unattended runs)
    #[arg(long)]
    pub auto: bool,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration and exit
    ShowConfig,
    /// List the tools reachable over the configured transport
    ListTools,
}
