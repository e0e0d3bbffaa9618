use anyhow::Context;
use reliquary_core::{
    BackoffPolicy, DedupConfig, HttpPinProvider, LibraryConfig, Network, PinConfig, PinTarget,
    ProviderEndpoint, ProviderKind, ResolverConfig, ScannerConfig, MAX_PHASH_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Contents of `reliquary.toml`. Every section has defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReliquaryConfig {
    pub server: ServerConfig,
    pub scanner: ScannerSection,
    pub resolver: ResolverSection,
    pub backoff: BackoffSection,
    pub dedup: DedupSection,
    pub pins: PinsSection,
    pub providers: ProvidersSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Bearer token for the HTTP API. `RELIQUARY_AUTH_TOKEN` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 9191)),
            data_dir: PathBuf::from("./data"),
            auth_token: None,
        }
    }
}

impl ServerConfig {
    pub fn resolved_token(&self) -> Option<String> {
        std::env::var("RELIQUARY_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.auth_token.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSection {
    pub block_range: u64,
    pub compute_perceptual_hash: bool,
    pub sync_interval_seconds: u64,
    pub request_timeout_ms: u64,
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            block_range: 2000,
            compute_perceptual_hash: true,
            sync_interval_seconds: 300,
            request_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub gateway_timeout_ms: u64,
    pub cache_ttl_days: i64,
    pub content_retry_interval_seconds: u64,
    pub content_max_retries: u32,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            gateway_timeout_ms: 10_000,
            cache_ttl_days: 90,
            content_retry_interval_seconds: 900,
            content_max_retries: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub phash_threshold: u32,
    pub title_similarity: f32,
    pub interval_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_group_size: Option<usize>,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            phash_threshold: 5,
            title_similarity: 0.85,
            interval_seconds: 600,
            max_group_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PinsSection {
    pub min_redundancy: usize,
    pub max_attempts: u32,
    pub drain_interval_seconds: u64,
    pub verify_interval_seconds: u64,
}

impl Default for PinsSection {
    fn default() -> Self {
        Self {
            min_redundancy: 2,
            max_attempts: 3,
            drain_interval_seconds: 30,
            verify_interval_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersSection {
    pub rpc: Vec<RpcProviderConfig>,
    pub ipfs: Vec<GatewayConfig>,
    pub pin: Vec<PinProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcProviderConfig {
    pub id: String,
    pub url: String,
    pub network: Network,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub id: String,
    pub url: String,
    /// Omitted priorities follow list order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinProviderConfig {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Name of an environment variable holding the token. Wins over `token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    /// Kubo RPC base (`/api/v0/add`) for uploading record documents.
    /// Providers without one only pin content that already exists on IPFS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_requests_per_minute() -> u32 {
    60
}

impl PinProviderConfig {
    pub fn resolved_token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty())
            .or_else(|| self.token.clone())
    }
}

impl ReliquaryConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Defaults when the file is missing. A file that exists but does not
    /// parse is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join("reliquary.redb")
    }

    /// Human-readable problems. Empty when the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.scanner.block_range == 0 {
            errors.push("scanner.block_range must be greater than 0".into());
        }
        if self.scanner.sync_interval_seconds == 0 {
            errors.push("scanner.sync_interval_seconds must be greater than 0".into());
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            errors.push("backoff.base_ms must not exceed backoff.max_ms".into());
        }
        if self.resolver.cache_ttl_days < 0 {
            errors.push("resolver.cache_ttl_days must not be negative".into());
        }

        if self.dedup.phash_threshold > MAX_PHASH_THRESHOLD {
            errors.push(format!(
                "dedup.phash_threshold must be between 0 and {} (got {})",
                MAX_PHASH_THRESHOLD, self.dedup.phash_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.dedup.title_similarity) {
            errors.push(format!(
                "dedup.title_similarity must be between 0.0 and 1.0 (got {})",
                self.dedup.title_similarity
            ));
        }
        if self.dedup.max_group_size == Some(0) {
            errors.push("dedup.max_group_size must be greater than 0 when set".into());
        }

        if self.pins.min_redundancy == 0 {
            errors.push("pins.min_redundancy must be at least 1".into());
        }
        if self.pins.max_attempts == 0 {
            errors.push("pins.max_attempts must be at least 1".into());
        }
        if !self.providers.pin.is_empty() && self.pins.min_redundancy > self.providers.pin.len() {
            errors.push(format!(
                "pins.min_redundancy is {} but only {} pin providers are configured",
                self.pins.min_redundancy,
                self.providers.pin.len()
            ));
        }

        if self.providers.ipfs.is_empty() {
            errors.push("providers.ipfs must list at least one gateway".into());
        }

        let mut seen = HashSet::new();
        let ids = self
            .providers
            .rpc
            .iter()
            .map(|p| (&p.id, &p.url))
            .chain(self.providers.ipfs.iter().map(|p| (&p.id, &p.url)))
            .chain(self.providers.pin.iter().map(|p| (&p.id, &p.url)));
        for (id, url) in ids {
            if id.is_empty() {
                errors.push("provider id must not be empty".into());
            } else if !seen.insert(id.as_str()) {
                errors.push(format!("duplicate provider id '{}'", id));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("provider '{}' url must be http(s): {}", id, url));
            }
        }

        for rpc in &self.providers.rpc {
            if !rpc.network.supports_log_scanning() {
                errors.push(format!(
                    "rpc provider '{}' targets {} which has no log scanning backend",
                    rpc.id, rpc.network
                ));
            }
        }
        for pin in &self.providers.pin {
            if pin.requests_per_minute == 0 {
                errors.push(format!("pin provider '{}' requests_per_minute must be greater than 0", pin.id));
            }
            if let Some(ref upload_url) = pin.upload_url {
                if !upload_url.starts_with("http://") && !upload_url.starts_with("https://") {
                    errors.push(format!("pin provider '{}' upload_url must be http(s): {}", pin.id, upload_url));
                }
            }
        }

        errors
    }

    /// Settings that load and run but leave part of the pipeline idle or
    /// under-protected.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.providers.rpc.is_empty() {
            warnings.push("no providers.rpc entries: tracked addresses cannot be scanned".into());
        }
        if self.providers.ipfs.len() == 1 {
            warnings.push(format!(
                "only one IPFS gateway ('{}'): metadata stalls when it is down",
                self.providers.ipfs[0].id
            ));
        }

        if self.providers.pin.is_empty() {
            warnings.push("no providers.pin entries: nothing will be pinned".into());
        } else {
            let uploaders = self.upload_capable_pin_providers();
            if uploaders < self.pins.min_redundancy {
                warnings.push(format!(
                    "record documents need {} pin providers with upload_url, {} configured",
                    self.pins.min_redundancy, uploaders
                ));
            }
        }
        for pin in &self.providers.pin {
            if pin.token.is_some() && pin.token_env.is_none() {
                warnings.push(format!("pin provider '{}' keeps its token inline; prefer token_env", pin.id));
            }
        }

        if let Some(limit) = self.dedup.max_group_size {
            if limit < 2 {
                warnings.push("dedup.max_group_size below 2 flags every merged group".into());
            }
        }
        warnings
    }

    pub fn upload_capable_pin_providers(&self) -> usize {
        self.providers.pin.iter().filter(|p| p.upload_url.is_some()).count()
    }

    pub fn library_config(&self) -> LibraryConfig {
        LibraryConfig {
            scanner: ScannerConfig {
                block_range: self.scanner.block_range,
                content_retry_delay: Duration::from_secs(self.resolver.content_retry_interval_seconds),
                content_max_retries: self.resolver.content_max_retries,
            },
            resolver: ResolverConfig {
                gateway_timeout: Duration::from_millis(self.resolver.gateway_timeout_ms),
                cache_ttl: chrono::Duration::days(self.resolver.cache_ttl_days),
                compute_perceptual_hash: self.scanner.compute_perceptual_hash,
            },
            dedup: DedupConfig {
                phash_threshold: self.dedup.phash_threshold,
                title_similarity: self.dedup.title_similarity,
                max_group_size: self.dedup.max_group_size,
            },
            pins: PinConfig {
                min_redundancy: self.pins.min_redundancy,
                max_attempts: self.pins.max_attempts,
                ..PinConfig::default()
            },
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff.base_ms),
                max: Duration::from_millis(self.backoff.max_ms),
            },
            rpc_timeout: Duration::from_millis(self.scanner.request_timeout_ms),
        }
    }

    /// Every configured provider as a health-tracked endpoint.
    pub fn endpoints(&self) -> Vec<ProviderEndpoint> {
        let rpc = self
            .providers
            .rpc
            .iter()
            .map(|p| ProviderEndpoint::new(&p.id, &p.url, ProviderKind::Rpc(p.network), p.priority));
        let ipfs = self.providers.ipfs.iter().enumerate().map(|(i, p)| {
            let priority = p.priority.unwrap_or(i as u32);
            ProviderEndpoint::new(&p.id, &p.url, ProviderKind::Ipfs, priority)
        });
        let pin = self
            .providers
            .pin
            .iter()
            .map(|p| ProviderEndpoint::new(&p.id, &p.url, ProviderKind::Pin, p.priority));
        rpc.chain(ipfs).chain(pin).collect()
    }

    pub fn pin_targets(&self) -> anyhow::Result<Vec<PinTarget>> {
        let timeout = Duration::from_millis(self.scanner.request_timeout_ms);
        self.providers
            .pin
            .iter()
            .map(|p| {
                let mut provider = HttpPinProvider::new(&p.id, &p.url, p.resolved_token(), timeout)
                    .with_context(|| format!("Failed to build pin provider '{}'", p.id))?;
                if let Some(ref upload_url) = p.upload_url {
                    provider = provider.with_upload_url(upload_url);
                }
                Ok(PinTarget::new(Arc::new(provider), p.priority, p.requests_per_minute))
            })
            .collect()
    }
}
