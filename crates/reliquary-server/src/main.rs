mod cli;
mod config;
mod http;
mod serve;

use clap::Parser;
use cli::{Cli, Commands};
use config::ReliquaryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides; `log` records from reliquary-core are captured too
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Cli::parse();

    let command = match args.command {
        Commands::Config(cmd) => return cli::config_cmd::run(cmd, &args.config).await,
        command => command,
    };

    let mut config = ReliquaryConfig::load_or_default(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.server.data_dir = data_dir;
    }

    match command {
        Commands::Serve => serve::run(config).await,
        Commands::Track(track) => cli::address::track(track, &config).await,
        Commands::Sync(sync) => cli::address::sync(sync, &config).await,
        Commands::Dedup => cli::records::dedup(&config).await,
        Commands::Records(cmd) => cli::records::run(cmd, &config).await,
        Commands::Pins(cmd) => cli::pins::run(cmd, &config).await,
        Commands::Health => cli::health::run(&config).await,
        Commands::Config(cmd) => cli::config_cmd::run(cmd, &args.config).await,
    }
}
