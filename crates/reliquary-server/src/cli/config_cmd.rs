use crate::cli::ConfigCommands;
use crate::config::ReliquaryConfig;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

const REDACTED: &str = "<redacted>";

pub async fn run(cmd: ConfigCommands, config_path: &Path) -> Result<()> {
    match cmd {
        ConfigCommands::Validate => validate(config_path),
        ConfigCommands::Show => show(config_path),
    }
}

fn validate(config_path: &Path) -> Result<()> {
    let config = match ReliquaryConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ {:#}", e);
            std::process::exit(1);
        }
    };

    let errors = config.validate();
    if !errors.is_empty() {
        println!("❌ Validation errors in {}:", config_path.display());
        for e in &errors {
            println!("  - {}", e);
        }
        std::process::exit(1);
    }

    println!("✅ {} is valid.", config_path.display());
    for line in pipeline_summary(&config) {
        println!("  {}", line);
    }
    let warnings = config.warnings();
    if !warnings.is_empty() {
        println!("⚠️  {} warning(s):", warnings.len());
        for w in &warnings {
            println!("  - {}", w);
        }
    }
    Ok(())
}

/// One line per pipeline stage describing what the config wires up.
fn pipeline_summary(config: &ReliquaryConfig) -> Vec<String> {
    let mut per_network: BTreeMap<String, usize> = BTreeMap::new();
    for rpc in &config.providers.rpc {
        *per_network.entry(rpc.network.to_string()).or_insert(0) += 1;
    }
    let scanning = if per_network.is_empty() {
        "none".to_string()
    } else {
        per_network
            .iter()
            .map(|(network, n)| format!("{} ({} node{})", network, n, if *n == 1 { "" } else { "s" }))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let gateways = config
        .providers
        .ipfs
        .iter()
        .map(|g| g.id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ");

    let max_group = config
        .dedup
        .max_group_size
        .map_or_else(|| "unbounded".to_string(), |n| n.to_string());

    vec![
        format!(
            "Scanning:   {} | {} blocks per query, every {}s",
            scanning, config.scanner.block_range, config.scanner.sync_interval_seconds
        ),
        format!(
            "Gateways:   {} | {}ms per attempt, cache {}d",
            if gateways.is_empty() { "none" } else { gateways.as_str() },
            config.resolver.gateway_timeout_ms,
            config.resolver.cache_ttl_days
        ),
        format!(
            "Dedup:      phash <= {} bits, title similarity {:.2}, max group {}",
            config.dedup.phash_threshold, config.dedup.title_similarity, max_group
        ),
        format!(
            "Pinning:    {} provider(s), {} with upload | redundancy {}, {} attempts each",
            config.providers.pin.len(),
            config.upload_capable_pin_providers(),
            config.pins.min_redundancy,
            config.pins.max_attempts
        ),
    ]
}

/// The config as loaded, with credentials masked.
fn redacted(config: &ReliquaryConfig) -> ReliquaryConfig {
    let mut shown = config.clone();
    if shown.server.auth_token.is_some() {
        shown.server.auth_token = Some(REDACTED.into());
    }
    for pin in &mut shown.providers.pin {
        if pin.token.is_some() {
            pin.token = Some(REDACTED.into());
        }
    }
    shown
}

fn show(config_path: &Path) -> Result<()> {
    let config = ReliquaryConfig::load_or_default(config_path)?;
    match toml::to_string_pretty(&redacted(&config)) {
        Ok(s) => println!("{}", s),
        Err(e) => anyhow::bail!("Failed to serialize config: {}", e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[server]
auth_token = "api-secret"

[dedup]
max_group_size = 40

[[providers.rpc]]
id = "main-a"
url = "https://eth-a.example"
network = "ethereum"

[[providers.rpc]]
id = "main-b"
url = "https://eth-b.example"
network = "ethereum"

[[providers.rpc]]
id = "base"
url = "https://base.example"
network = "base"

[[providers.ipfs]]
id = "primary"
url = "https://ipfs.io"

[[providers.ipfs]]
id = "fallback"
url = "https://dweb.link"

[[providers.pin]]
id = "pinata"
url = "https://api.pinata.example/psa"
upload_url = "https://uploads.pinata.example"
token = "pin-secret"
"#;

    #[test]
    fn test_summary_describes_each_stage() {
        let config: ReliquaryConfig = toml::from_str(CONFIG).unwrap();
        let summary = pipeline_summary(&config);
        assert_eq!(summary.len(), 4);
        assert!(summary[0].contains("base (1 node), ethereum (2 nodes)"), "{}", summary[0]);
        assert!(summary[1].contains("primary -> fallback"), "{}", summary[1]);
        assert!(summary[2].contains("max group 40"), "{}", summary[2]);
        assert!(summary[3].contains("1 provider(s), 1 with upload | redundancy 2"), "{}", summary[3]);
    }

    #[test]
    fn test_show_masks_credentials() {
        let config: ReliquaryConfig = toml::from_str(CONFIG).unwrap();
        let rendered = toml::to_string_pretty(&redacted(&config)).unwrap();
        assert!(!rendered.contains("api-secret"));
        assert!(!rendered.contains("pin-secret"));
        assert!(rendered.contains(REDACTED));
        assert!(rendered.contains("uploads.pinata.example"));
    }
}
