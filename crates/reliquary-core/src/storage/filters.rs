use crate::network::Network;
use crate::types::PinStatus;
use std::collections::HashMap;

/// Filter criteria for listing artifact records
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub tag: Option<String>,
    pub network: Option<Network>,
    /// Only return records held for review
    pub conflicting_only: bool,
    /// Superseded records are hidden unless asked for
    pub include_superseded: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ArtifactFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records carrying this tag (matched case-insensitively)
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into().to_lowercase());
        self
    }

    /// Records whose chain identity or scrape history touches this network
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn conflicting_only(mut self) -> Self {
        self.conflicting_only = true;
        self
    }

    pub fn include_superseded(mut self) -> Self {
        self.include_superseded = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub tracked_addresses: u64,
    pub observations: u64,
    pub duplicate_groups: u64,
    pub artifact_records: u64,
    pub conflicting_records: u64,
    pub pin_records_by_status: HashMap<PinStatus, u64>,
    pub pending_content_retries: u64,
    pub cached_documents: u64,
    pub db_size_bytes: u64,
}
