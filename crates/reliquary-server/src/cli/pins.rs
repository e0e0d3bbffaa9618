use crate::cli::{open_reliquary, PinCommands, PinStatusArgs, PinVerifyArgs};
use crate::config::ReliquaryConfig;
use anyhow::Result;
use reliquary_core::PinRecord;
use tokio_util::sync::CancellationToken;

pub async fn run(cmd: PinCommands, config: &ReliquaryConfig) -> Result<()> {
    match cmd {
        PinCommands::Status(args) => status(args, config),
        PinCommands::Verify(args) => verify(args, config).await,
        PinCommands::Process => process(config).await,
    }
}

fn status(args: PinStatusArgs, config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    let Some(record) = reliquary.get_pin_status(&args.content_id)? else {
        println!("No pin record for {}", args.content_id);
        std::process::exit(1);
    };
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_pin_detail(&record);
    }
    Ok(())
}

async fn verify(args: PinVerifyArgs, config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    match args.content_id {
        Some(content_id) => match reliquary.verify_pin(&content_id).await? {
            Some(record) => print_pin_detail(&record),
            None => {
                println!("No pin record for {}", content_id);
                std::process::exit(1);
            }
        },
        None => {
            let checked = reliquary.verify_pins(&CancellationToken::new()).await?;
            println!("Verified {} pin records", checked);
            // Lost pins were requeued; retry them now
            let report = reliquary.process_pins(&CancellationToken::new()).await?;
            if report.processed > 0 {
                println!(
                    "Re-pinned {}: {} healthy, {} pending, {} degraded, {} abandoned",
                    report.processed, report.healthy, report.pending, report.degraded, report.abandoned
                );
            }
        }
    }
    reliquary.persist_health()?;
    Ok(())
}

async fn process(config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    let report = reliquary.process_pins(&CancellationToken::new()).await?;
    reliquary.persist_health()?;
    println!(
        "Processed {}: {} healthy, {} pending, {} degraded, {} abandoned, {} deferred",
        report.processed, report.healthy, report.pending, report.degraded, report.abandoned, report.deferred
    );
    Ok(())
}

pub fn print_pin_detail(p: &PinRecord) {
    println!("Content:    {}", p.content_id);
    println!("Tier:       {:?}", p.priority_tier);
    println!("Status:     {:?}", p.status);
    if let Some(record_id) = p.record_id {
        println!("Record:     {}", record_id);
    }
    for provider in &p.target_providers {
        let mark = if p.confirmed_providers.contains(provider) {
            "✅"
        } else {
            "…"
        };
        println!(
            "  {} {:<16} attempts {}  pin {}",
            mark,
            provider,
            p.attempts.get(provider).copied().unwrap_or(0),
            p.provider_pin_ids.get(provider).map(String::as_str).unwrap_or("-")
        );
    }
    if let Some(err) = &p.last_error {
        println!("Last error: {}", err);
    }
    println!("Updated:    {}", p.updated_at.to_rfc3339());
}
