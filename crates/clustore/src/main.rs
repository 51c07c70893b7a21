// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Clustore Authors

//! Clustore: distributed object-storage cluster daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use clustore_core::Config;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod node;

use cli::{Cli, Commands, ServeArgs};
use node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args).await,
        Commands::Version => {
            println!("clustore {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(id) = args.daemon_id {
        config.node.id = id;
    }
    if let Some(url) = args.primary_url {
        config.proxy.primary_url = url;
    }

    init_logging();

    let node = Node::init(config.clone()).context("Failed to initialize node")?;
    let app = node.router();

    // Serve before joining: peers push metadata back during startup.
    let listener = TcpListener::bind(config.server.bind)
        .await
        .context("Failed to bind control-plane listener")?;
    info!(addr = %config.server.bind, node = %node.local(), "control plane listening");

    let serve =
        tokio::spawn(
            async move { axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await },
        );

    node.start().await.context("Failed to start node")?;

    serve.await?.context("Server error")?;
    info!("daemon shutdown complete");
    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
