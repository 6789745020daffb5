// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Quire Node
//!
//! Entry point for the `quire-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the [`Pds`], and serves the HTTP
//! and WebSocket API.
//!
//! - `run`: start the node
//! - `init`: create the data directory and a key-encryption key
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::signal;

use quire_protocol::config::{AES_KEY_LENGTH, PROTOCOL_VERSION};
use quire_protocol::Pds;

use cli::{Commands, QuireNodeCli, KEY_FILE};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = QuireNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Open storage, then serve the API and metrics until a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, LogFormat::from_str_lossy(&args.log_format));

    let config = args.instance_config()?;
    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        ledger = ?config.ledger,
        "starting quire-node"
    );

    let db_path = args.db_path();
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let pds = Arc::new(
        Pds::open(config)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );

    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        pds: Arc::clone(&pds),
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    pds.repository()
        .db()
        .flush()
        .context("failed to flush database on shutdown")?;
    tracing::info!("quire-node stopped");
    Ok(())
}

/// Create the data directory and write a fresh key-encryption key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("quire_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = data_dir.join(KEY_FILE);
    write_instance_key(&key_path, args.force)?;
    tracing::info!(key_path = %key_path.display(), "key-encryption key generated");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Instance key   : {}", key_path.display());
    println!();
    println!("Back up the instance key. Without it, hosted signing keys cannot be recovered.");

    Ok(())
}

fn write_instance_key(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to replace it",
            path.display()
        );
    }

    let mut key = [0u8; AES_KEY_LENGTH];
    OsRng.fill_bytes(&mut key);
    std::fs::write(path, hex::encode(key))
        .with_context(|| format!("failed to write instance key to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn print_version() {
    println!("quire-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
