pub mod address;
pub mod config_cmd;
pub mod health;
pub mod pins;
pub mod records;

use crate::config::ReliquaryConfig;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use reliquary_core::{Network, Reliquary};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "reliquary")]
#[command(version, about = "NFT ingestion, dedup and pin redundancy daemon")]
pub struct Cli {
    /// Path to reliquary.toml
    #[arg(
        long,
        global = true,
        env = "RELIQUARY_CONFIG",
        default_value = "reliquary.toml"
    )]
    pub config: PathBuf,

    /// Path to data directory (overrides config file)
    #[arg(long, global = true, env = "RELIQUARY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the background pipeline and the HTTP API
    Serve,
    /// Start watching a wallet or contract
    Track(TrackArgs),
    /// Scan one tracked address up to the chain head
    Sync(SyncArgs),
    /// Run one dedup pass and queue changed records for pinning
    Dedup,
    /// Canonical artifact records
    #[command(subcommand)]
    Records(RecordCommands),
    /// Pin status and verification
    #[command(subcommand)]
    Pins(PinCommands),
    /// Provider health and store statistics
    Health,
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum RecordCommands {
    List(RecordListArgs),
    Get(RecordGetArgs),
}

#[derive(Subcommand, Debug)]
pub enum PinCommands {
    /// Show the pin record for a CID (a record document CID included)
    Status(PinStatusArgs),
    /// Check pins against their providers. Without a content id, checks all
    Verify(PinVerifyArgs),
    /// Drain the pin queue once
    Process,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    Validate,
    Show,
}

// --- Address args ---

#[derive(Args, Debug)]
pub struct TrackArgs {
    /// Address, optionally prefixed with its chain (`polygon:0x...`)
    pub address: String,
    /// Chain name. Inferred from the address format when omitted; a bare
    /// 0x address needs this unless exactly one EVM chain has RPC providers
    #[arg(long)]
    pub network: Option<Network>,
    #[arg(long)]
    pub label: Option<String>,
    /// First block to scan
    #[arg(long, default_value = "0")]
    pub from_block: u64,
    /// Follow transfers into this wallet instead of a contract's transfers
    #[arg(long)]
    pub wallet: bool,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    pub address: String,
    #[arg(long)]
    pub network: Option<Network>,
    /// Rescan from the start block instead of the checkpoint
    #[arg(long)]
    pub full: bool,
}

// --- Record args ---

#[derive(Args, Debug)]
pub struct RecordListArgs {
    #[arg(long)]
    pub tag: Option<String>,
    #[arg(long)]
    pub network: Option<Network>,
    /// Only records held for review
    #[arg(long)]
    pub conflicting: bool,
    #[arg(long, default_value = "20")]
    pub limit: usize,
    #[arg(long, default_value = "0")]
    pub offset: usize,
    /// Output format: table (default), json
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct RecordGetArgs {
    pub id: String,
    #[arg(long, default_value = "table")]
    pub format: String,
}

// --- Pin args ---

#[derive(Args, Debug)]
pub struct PinStatusArgs {
    pub content_id: String,
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct PinVerifyArgs {
    pub content_id: Option<String>,
}

/// Open the store and providers named by `config`.
pub fn open_reliquary(config: &ReliquaryConfig) -> anyhow::Result<Reliquary> {
    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("Failed to create {}", config.server.data_dir.display()))?;
    let reliquary = Reliquary::open(
        config.db_path(),
        config.endpoints(),
        config.pin_targets()?,
        config.library_config(),
    )
    .with_context(|| format!("Failed to open {}", config.db_path().display()))?;
    Ok(reliquary)
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max - 1).collect::<String>())
    }
}
