use crate::error::Result;
use crate::resolver::addressing::{check_bytes, CidCheck};
use crate::resolver::fetch::FetchedContent;
use crate::resolver::uri::{parse_content_uri, ContentLocator};
use crate::storage::Storage;
use crate::types::CachedContent;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Persistent fetch cache with a TTL. Every hit is re-hashed so a corrupted
/// or tampered entry is dropped instead of served; entries stored as
/// verified are checked against the CID in their key, not just their own
/// recorded digest.
pub struct ContentCache {
    storage: Arc<dyn Storage>,
    ttl: Duration,
}

impl ContentCache {
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn get(&self, key: &str) -> Result<Option<FetchedContent>> {
        self.get_at(key, Utc::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<FetchedContent>> {
        let Some(entry) = self.storage.get_cached_content(key)? else {
            return Ok(None);
        };

        if now - entry.fetched_at > self.ttl {
            log::debug!("Cache entry for {} expired", key);
            return Ok(None);
        }

        let intact = if entry.verified {
            key_matches_cid(key, &entry.bytes)
        } else {
            sha256_hex(&entry.bytes) == entry.sha256
        };
        if !intact {
            log::warn!("Cache entry for {} failed digest check, discarding", key);
            self.storage.remove_cached_content(key)?;
            return Ok(None);
        }

        Ok(Some(FetchedContent::new(entry.bytes, entry.content_type)))
    }

    pub fn put(&self, key: &str, content: &FetchedContent, verified: bool) -> Result<()> {
        self.storage.put_cached_content(&CachedContent {
            uri: key.to_string(),
            sha256: sha256_hex(&content.bytes),
            bytes: content.bytes.clone(),
            content_type: content.content_type.clone(),
            verified,
            fetched_at: Utc::now(),
        })
    }
}

fn key_matches_cid(key: &str, bytes: &[u8]) -> bool {
    match parse_content_uri(key) {
        Ok(ContentLocator::Ipfs { cid, path }) if path.is_empty() => {
            check_bytes(&cid, bytes) == CidCheck::Verified
        }
        _ => false,
    }
}
