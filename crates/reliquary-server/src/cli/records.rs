use crate::cli::{open_reliquary, truncate, RecordCommands, RecordGetArgs, RecordListArgs};
use crate::config::ReliquaryConfig;
use anyhow::{Context, Result};
use reliquary_core::{ArtifactFilter, ArtifactRecord, RecordStatus};
use uuid::Uuid;

pub async fn run(cmd: RecordCommands, config: &ReliquaryConfig) -> Result<()> {
    match cmd {
        RecordCommands::List(args) => list(args, config),
        RecordCommands::Get(args) => get(args, config),
    }
}

/// One dedup pass over the whole log.
pub async fn dedup(config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    let report = reliquary.run_dedup_pass()?;

    println!();
    println!("Dedup pass");
    println!("{}", "─".repeat(50));
    println!("Observations:      {:>8}", report.observations);
    println!("Groups:            {:>8}", report.groups);
    println!(
        "  created {} / changed {} / unchanged {} / removed {}",
        report.group_diff.created,
        report.group_diff.changed,
        report.group_diff.unchanged,
        report.group_diff.removed
    );
    println!("Records created:   {:>8}", report.records_created);
    println!("Records updated:   {:>8}", report.records_updated);
    println!("Records superseded:{:>8}", report.records_superseded);
    println!("Held for review:   {:>8}", report.conflicting);
    if !report.oversized_groups.is_empty() {
        println!("Oversized groups:  {}", report.oversized_groups.join(", "));
    }
    println!("{}", "─".repeat(50));
    println!();
    Ok(())
}

fn list(args: RecordListArgs, config: &ReliquaryConfig) -> Result<()> {
    let reliquary = open_reliquary(config)?;
    let mut filter = ArtifactFilter::new().with_limit(args.limit).with_offset(args.offset);
    if let Some(tag) = args.tag {
        filter = filter.with_tag(tag);
    }
    if let Some(network) = args.network {
        filter = filter.with_network(network);
    }
    if args.conflicting {
        filter = filter.conflicting_only();
    }
    let records = reliquary.list_artifact_records(filter)?;

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("{:<36}  {:<40}  {:>5}  {}", "ID", "TITLE", "OBS", "STATUS");
    for record in &records {
        println!(
            "{:<36}  {:<40}  {:>5}  {}",
            record.id,
            truncate(&record.canonical_title, 40),
            record.merged_from_observation_ids.len(),
            status_label(record)
        );
    }
    println!("Total: {} records", records.len());
    Ok(())
}

fn get(args: RecordGetArgs, config: &ReliquaryConfig) -> Result<()> {
    let id: Uuid = args
        .id
        .parse()
        .with_context(|| format!("'{}' is not a record id", args.id))?;
    let reliquary = open_reliquary(config)?;

    let Some(record) = reliquary.get_artifact_record(id)? else {
        println!("Record {} not found", id);
        std::process::exit(1);
    };

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record_detail(&record);
    }
    Ok(())
}

fn status_label(r: &ArtifactRecord) -> String {
    match &r.status {
        RecordStatus::Canonical => "canonical".into(),
        RecordStatus::Conflicting { identities } => format!("conflicting ({})", identities.len()),
        RecordStatus::Superseded { by } => format!("superseded by {}", by),
    }
}

pub fn print_record_detail(r: &ArtifactRecord) {
    println!("ID:           {}", r.id);
    println!("Title:        {}", r.canonical_title);
    println!("Status:       {}", status_label(r));
    if let RecordStatus::Conflicting { identities } = &r.status {
        for identity in identities {
            println!("  candidate   {}", identity);
        }
    }
    if let Some(id) = &r.blockchain_id {
        println!("Chain:        {}", id);
    }
    if let Some(hash) = &r.perceptual_hash {
        println!("Perceptual:   {:016x}", hash.0);
    }
    println!("Tags:         {}", r.tags.iter().cloned().collect::<Vec<_>>().join(", "));
    for uri in &r.source_uris {
        println!("Source:       {}", truncate(uri, 100));
    }
    println!("Provenance:   {} observations", r.merged_from_observation_ids.len());
    for entry in &r.scrape_history {
        println!(
            "  {}  {} ({:?}, {})",
            entry.observed_at.to_rfc3339(),
            entry.source_id,
            entry.source_kind,
            entry.network
        );
    }
    if let Ok(cid) = r.document_cid() {
        println!("Document CID: {}", cid);
    }
    println!("Created:      {}", r.created_at.to_rfc3339());
    println!("Updated:      {}", r.updated_at.to_rfc3339());
}
