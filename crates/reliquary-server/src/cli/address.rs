use crate::cli::{open_reliquary, SyncArgs, TrackArgs};
use crate::config::ReliquaryConfig;
use anyhow::Result;
use reliquary_core::{AddressRole, SyncStatus};
use tokio_util::sync::CancellationToken;

pub async fn track(args: TrackArgs, config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    let role = if args.wallet {
        AddressRole::Wallet
    } else {
        AddressRole::Contract
    };
    let tracked = reliquary.track_address_as(&args.address, args.network, args.label, args.from_block, role)?;

    println!("Tracking {} on {}", tracked.address, tracked.network);
    println!("  Role:        {:?}", tracked.role);
    if let Some(label) = &tracked.label {
        println!("  Label:       {}", label);
    }
    match tracked.last_scanned_block {
        Some(block) => println!("  Checkpoint:  {}", block),
        None => println!("  Start block: {}", tracked.start_block),
    }
    if !tracked.network.supports_log_scanning() {
        println!("  Note: {} has no log scanning backend; sync will report it as unsupported.", tracked.network);
    }
    Ok(())
}

pub async fn sync(args: SyncArgs, config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    let tracked = reliquary.find_tracked(&args.address, args.network)?;
    if args.full {
        reliquary.reset_checkpoint(&tracked, None)?;
    }

    // Ctrl-C stops at the last committed sub-range
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = reliquary.trigger_sync(&tracked, &cancel).await?;
    reliquary.persist_health()?;

    let checkpoint = report
        .to_block
        .map(|b| b.to_string())
        .unwrap_or_else(|| "none".into());
    match &report.status {
        SyncStatus::Completed => {
            println!(
                "Synced {} on {}: {} new observations, blocks {}..={}",
                report.address, report.network, report.observations, report.from_block, checkpoint
            );
        }
        SyncStatus::Cancelled => {
            println!("Sync cancelled. Checkpoint at block {}", checkpoint);
        }
        SyncStatus::TemporarilyUnavailable { retry_at, reason } => {
            println!("❌ No provider could serve {}: {}", report.address, reason);
            println!("   Checkpoint kept at block {}. Retry after {}", checkpoint, retry_at);
            std::process::exit(2);
        }
    }
    Ok(())
}
