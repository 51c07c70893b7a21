// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Clustore daemon.
#[derive(Debug, Parser)]
#[command(name = "clustore", version, about = "Distributed object-storage cluster node")]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon.
    Serve(ServeArgs),
    /// Print the version and exit.
    Version,
}

/// Arguments for `clustore serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the control-plane bind address.
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Override the daemon ID.
    #[arg(long)]
    pub daemon_id: Option<String>,

    /// Override the primary URL to probe at startup.
    #[arg(long)]
    pub primary_url: Option<String>,
}
