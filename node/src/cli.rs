// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CLI Interface
//!
//! Defines the command-line argument structure for `quire-node` using
//! `clap` derive. Every `run` flag can also come from a `QUIRE_*`
//! environment variable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use quire_protocol::config::{InstanceConfig, KeyEncryptionKey, LedgerEndpoint};

/// File inside the data directory holding the hex key-encryption key.
pub const KEY_FILE: &str = "instance.key";

/// Quire repository host.
///
/// Hosts DID-owned record repositories, streams their commits over the
/// firehose, and optionally serves an embedded identity ledger.
#[derive(Parser, Debug)]
#[command(
    name = "quire-node",
    about = "Quire repository host node",
    version,
    propagate_version = true
)]
pub struct QuireNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and generate a key-encryption key.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory holding the database and the instance key.
    #[arg(long, short = 'd', env = "QUIRE_DATA_DIR", default_value = "./quire-data")]
    pub data_dir: PathBuf,

    /// Port for the HTTP and WebSocket API.
    #[arg(long, env = "QUIRE_API_PORT", default_value_t = 2583)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "QUIRE_METRICS_PORT", default_value_t = 2584)]
    pub metrics_port: u16,

    /// Identity ledger base URL, or `embedded` to host one in-process.
    #[arg(long, env = "QUIRE_LEDGER", default_value = "embedded")]
    pub ledger: String,

    /// Externally reachable base URL of this node. Becomes the service
    /// endpoint of DIDs created here.
    #[arg(long, env = "QUIRE_PUBLIC_URL", default_value = "http://localhost:2583")]
    pub public_url: String,

    /// Hex key-encryption key (64 chars). Read from `<data-dir>/instance.key`
    /// when omitted.
    #[arg(long, env = "QUIRE_KEY_ENCRYPTION_KEY", hide_env_values = true)]
    pub key_encryption_key: Option<String>,

    /// Log output: `pretty` or `json`.
    #[arg(long, env = "QUIRE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl RunArgs {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Resolve flags and files into the library's configuration.
    pub fn instance_config(&self) -> Result<InstanceConfig> {
        let ledger = LedgerEndpoint::parse(&self.ledger).context("invalid --ledger")?;
        let key_hex = match &self.key_encryption_key {
            Some(hex) => hex.clone(),
            None => read_key_file(&self.data_dir)?,
        };
        let key_encryption_key =
            KeyEncryptionKey::from_hex(key_hex.trim()).context("invalid key-encryption key")?;

        Ok(InstanceConfig {
            ledger,
            public_url: self.public_url.trim_end_matches('/').to_string(),
            key_encryption_key,
            data_dir: self.db_path(),
        })
    }
}

fn read_key_file(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(KEY_FILE);
    std::fs::read_to_string(&path).with_context(|| {
        format!(
            "no key-encryption key given and {} is unreadable (run `quire-node init`)",
            path.display()
        )
    })
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "QUIRE_DATA_DIR", default_value = "./quire-data")]
    pub data_dir: PathBuf,

    /// Replace an existing instance key. Keys sealed under the old one
    /// become unreadable.
    #[arg(long)]
    pub force: bool,
}
