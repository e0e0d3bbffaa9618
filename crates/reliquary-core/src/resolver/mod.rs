//! Token metadata and media resolution through a gateway fallback chain.

mod addressing;
mod cache;
mod fetch;
mod phash;
mod uri;

pub use addressing::{check_bytes, raw_cid, CidCheck};
pub use cache::{sha256_hex, ContentCache};
pub use fetch::{ContentFetcher, FetchedContent, HttpContentFetcher};
pub use phash::difference_hash;
pub use uri::{parse_content_uri, ContentLocator};

use crate::error::{ReliquaryError, Result};
use crate::provider::{CallError, ProviderPool};
use crate::storage::Storage;
use crate::types::{PerceptualHash, ProviderKind};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Resolver tuning
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Independent timeout for each gateway attempt
    pub gateway_timeout: Duration,
    pub cache_ttl: chrono::Duration,
    pub compute_perceptual_hash: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(10),
            cache_ttl: chrono::Duration::days(90),
            compute_perceptual_hash: true,
        }
    }
}

/// Normalized token metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub animation_url: Option<String>,
    pub external_url: Option<String>,
    pub tags: BTreeSet<String>,
    pub raw: Value,
    pub content_type: Option<String>,
}

fn string_field(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Metadata {
    /// Interpret a metadata JSON document.
    pub fn from_json(raw: Value, content_type: Option<String>) -> Self {
        let mut tags = BTreeSet::new();

        if let Some(attributes) = raw.get("attributes").and_then(Value::as_array) {
            for attribute in attributes {
                let value = attribute.get("value").and_then(scalar_to_string);
                let trait_type = attribute
                    .get("trait_type")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty());
                let tag = match (trait_type, value) {
                    (Some(t), Some(v)) => format!("{}:{}", t, v),
                    (None, Some(v)) => v,
                    _ => continue,
                };
                tags.insert(tag.trim().to_lowercase());
            }
        }

        if let Some(list) = raw.get("tags").and_then(Value::as_array) {
            tags.extend(
                list.iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        }

        Self {
            name: string_field(&raw, &["name", "title"]),
            description: string_field(&raw, &["description"]),
            image: string_field(&raw, &["image", "image_url", "imageUrl"]),
            animation_url: string_field(&raw, &["animation_url"]),
            external_url: string_field(&raw, &["external_url"]),
            tags,
            raw,
            content_type,
        }
    }

    /// The URI pointed straight at media rather than a JSON document.
    pub fn for_media(uri: &str, content_type: Option<String>) -> Self {
        Self {
            image: Some(uri.to_string()),
            content_type,
            ..Default::default()
        }
    }
}

/// Resolves metadata URIs to [`Metadata`], consulting the cache first and
/// then each IPFS gateway in priority order.
pub struct MetadataResolver {
    pool: Arc<ProviderPool>,
    fetcher: Arc<dyn ContentFetcher>,
    cache: ContentCache,
    config: ResolverConfig,
}

impl MetadataResolver {
    pub fn new(
        pool: Arc<ProviderPool>,
        fetcher: Arc<dyn ContentFetcher>,
        storage: Arc<dyn Storage>,
        config: ResolverConfig,
    ) -> Self {
        let cache = ContentCache::new(storage, config.cache_ttl);
        Self {
            pool,
            fetcher,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<FetchedContent, CallError> {
        let content = match tokio::time::timeout(self.config.gateway_timeout, self.fetcher.get(url)).await {
            Ok(result) => result?,
            Err(_) => return Err(CallError::Timeout),
        };
        if !content.is_usable() {
            return Err(CallError::InvalidResponse(format!(
                "unexpected content type {:?}",
                content.content_type
            )));
        }
        Ok(content)
    }

    /// Fetch raw bytes for a URI, from cache when possible.
    pub async fn fetch_content(&self, uri: &str) -> Result<FetchedContent> {
        let locator = parse_content_uri(uri)?;
        let key = locator.cache_key();

        if let Some(ref key) = key {
            if let Some(hit) = self.cache.get(key)? {
                return Ok(hit);
            }
        }

        let unavailable = || ReliquaryError::ContentUnavailable {
            uri: uri.to_string(),
        };

        let (content, check) = match &locator {
            ContentLocator::Inline {
                bytes,
                content_type,
            } => (
                FetchedContent::new(bytes.clone(), content_type.clone()),
                CidCheck::Unverifiable,
            ),
            ContentLocator::Http(url) => {
                let content = self.fetch_once(url).await.map_err(|e| {
                    log::warn!("Direct fetch of {} failed: {}", url, e);
                    unavailable()
                })?;
                (content, CidCheck::Unverifiable)
            }
            ContentLocator::Ipfs { cid, path } => {
                let locator = &locator;
                self.pool
                    .call_scoped(ProviderKind::Ipfs, CallError::gateway_scope, |gateway| async move {
                        let url = locator
                            .gateway_url(&gateway.base_url)
                            .ok_or_else(|| CallError::InvalidResponse("not an IPFS locator".into()))?;
                        let content = self.fetch_once(&url).await?;
                        // A path inside a CID resolves through a directory; only the root block is hashable
                        let check = if path.is_empty() {
                            check_bytes(cid, &content.bytes)
                        } else {
                            CidCheck::Unverifiable
                        };
                        if check == CidCheck::Mismatch {
                            log::warn!("Gateway {} served bytes that do not hash to {}", gateway.id, cid);
                            return Err(CallError::Integrity(format!("digest mismatch for {}", cid)));
                        }
                        Ok((content, check))
                    })
                    .await
                    .map_err(|e| {
                        log::warn!("All gateways failed for {}: {}", uri, e);
                        unavailable()
                    })?
            }
        };

        if let Some(ref key) = key {
            self.cache.put(key, &content, check == CidCheck::Verified)?;
        }
        Ok(content)
    }

    /// Resolve a metadata URI into normalized metadata.
    pub async fn resolve(&self, uri: &str) -> Result<Metadata> {
        let content = self.fetch_content(uri).await?;
        if let Ok(raw) = serde_json::from_slice::<Value>(&content.bytes) {
            return Ok(Metadata::from_json(raw, content.content_type));
        }
        if content.is_image() {
            return Ok(Metadata::for_media(uri, content.content_type));
        }
        Err(ReliquaryError::ContentUnavailable {
            uri: uri.to_string(),
        })
    }

    /// Fingerprint the image a metadata document points at. Failures are
    /// logged and yield `None`; a missing hash only weakens dedup.
    pub async fn perceptual_hash(&self, metadata: &Metadata) -> Option<PerceptualHash> {
        if !self.config.compute_perceptual_hash {
            return None;
        }
        let image_uri = metadata.image.as_deref()?;
        let content = match self.fetch_content(image_uri).await {
            Ok(content) => content,
            Err(e) => {
                log::debug!("No image for perceptual hash ({}): {}", image_uri, e);
                return None;
            }
        };
        match difference_hash(&content.bytes) {
            Ok(hash) => Some(hash),
            Err(e) => {
                log::debug!("Could not hash image {}: {}", image_uri, e);
                None
            }
        }
    }
}
