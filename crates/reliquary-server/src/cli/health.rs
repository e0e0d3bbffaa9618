use crate::cli::open_reliquary;
use crate::config::ReliquaryConfig;
use anyhow::Result;
use chrono::Utc;

pub async fn run(config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    let now = Utc::now();

    println!();
    println!("Providers");
    println!("{}", "─".repeat(72));
    println!("{:<18} {:<14} {:>4} {:>6} {:>8}  {}", "ID", "KIND", "PRIO", "FAILS", "CALLS", "STATE");
    for endpoint in reliquary.health_snapshot() {
        let state = match endpoint.backoff_until {
            Some(until) if until > now => format!("backing off until {}", until.format("%H:%M:%S")),
            _ if endpoint.consecutive_failures > 0 => "degraded".into(),
            _ => "ok".into(),
        };
        println!(
            "{:<18} {:<14} {:>4} {:>6} {:>8}  {}",
            endpoint.id,
            endpoint.kind.to_string(),
            endpoint.priority,
            endpoint.consecutive_failures,
            endpoint.total_calls,
            state
        );
        if let Some(err) = &endpoint.last_error {
            println!("{:<18} last error: {}", "", crate::cli::truncate(err, 50));
        }
    }

    let stats = reliquary.stats()?;
    let db_mb = stats.db_size_bytes as f64 / 1_048_576.0;
    println!();
    println!("Store");
    println!("{}", "─".repeat(72));
    println!("Tracked addresses: {:>8}", stats.tracked_addresses);
    println!("Observations:      {:>8}", stats.observations);
    println!("Duplicate groups:  {:>8}", stats.duplicate_groups);
    println!("Artifact records:  {:>8}", stats.artifact_records);
    println!("  held for review  {:>8}", stats.conflicting_records);
    let mut pins: Vec<_> = stats.pin_records_by_status.iter().collect();
    pins.sort_by_key(|(status, _)| format!("{:?}", status));
    for (status, count) in pins {
        println!("  pins {:<11} {:>8}", format!("{:?}", status).to_lowercase(), count);
    }
    println!("Content retries:   {:>8}", stats.pending_content_retries);
    println!("Cached documents:  {:>8}", stats.cached_documents);
    println!("DB Size: {:>7.1} MB", db_mb);
    println!("{}", "─".repeat(72));
    println!();

    for tracked in reliquary.list_tracked_addresses()? {
        let checkpoint = tracked
            .last_scanned_block
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{} {} {}  checkpoint {}",
            tracked.network,
            tracked.address,
            tracked.label.as_deref().unwrap_or(""),
            checkpoint
        );
    }
    Ok(())
}
