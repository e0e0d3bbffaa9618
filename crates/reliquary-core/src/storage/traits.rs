use crate::error::Result;
use crate::network::Network;
use crate::storage::filters::{ArtifactFilter, StorageStats};
use crate::types::{
    ArtifactObservation, ArtifactRecord, CachedContent, ContentRetry, DuplicateGroup,
    PinRecord, ProviderEndpoint, RecordId, TrackedAddress,
};
use std::path::Path;

/// Outcome of replacing the duplicate group set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDiff {
    pub created: usize,
    /// Same group id, different membership or links
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// Storage trait for the ingestion store
pub trait Storage: Send + Sync {
    // === Tracked Addresses ===

    /// Store a tracked address (insert or update)
    fn put_tracked_address(&self, tracked: &TrackedAddress) -> Result<()>;

    fn get_tracked_address(&self, network: Network, address: &str) -> Result<Option<TrackedAddress>>;

    fn list_tracked_addresses(&self) -> Result<Vec<TrackedAddress>>;

    /// Move the checkpoint back for an explicit re-sync. The only way a
    /// checkpoint ever decreases.
    fn reset_checkpoint(&self, network: Network, address: &str, to: Option<u64>) -> Result<()>;

    // === Observations ===

    /// Append an observation unless one with the same id exists.
    /// Returns `true` when it was inserted.
    fn append_observation(&self, observation: &ArtifactObservation) -> Result<bool>;

    fn get_observation(&self, id: &str) -> Result<Option<ArtifactObservation>>;

    /// All observations in append order
    fn list_observations(&self) -> Result<Vec<ArtifactObservation>>;

    fn count_observations(&self) -> Result<u64>;

    /// Append a scanned sub-range and advance the address checkpoint in a
    /// single transaction. Returns the number of newly inserted observations.
    fn commit_scan_batch(
        &self,
        network: Network,
        address: &str,
        observations: &[ArtifactObservation],
        checkpoint: u64,
    ) -> Result<usize>;

    // === Duplicate Groups ===

    /// Replace the whole group set with a freshly computed one
    fn replace_duplicate_groups(&self, groups: &[DuplicateGroup]) -> Result<GroupDiff>;

    fn list_duplicate_groups(&self) -> Result<Vec<DuplicateGroup>>;

    // === Artifact Records ===

    /// Store a record (insert or update) and index its observations and tags
    fn put_artifact_record(&self, record: &ArtifactRecord) -> Result<()>;

    /// Store several records in a single transaction
    fn put_artifact_records_batch(&self, records: &[ArtifactRecord]) -> Result<()>;

    fn get_artifact_record(&self, id: RecordId) -> Result<Option<ArtifactRecord>>;

    fn list_artifact_records(&self, filter: ArtifactFilter) -> Result<Vec<ArtifactRecord>>;

    /// Records that have ever merged this observation, superseded ones included
    fn records_for_observation(&self, id: &str) -> Result<Vec<RecordId>>;

    // === Pins ===

    fn put_pin_record(&self, record: &PinRecord) -> Result<()>;

    fn get_pin_record(&self, content_id: &str) -> Result<Option<PinRecord>>;

    fn list_pin_records(&self) -> Result<Vec<PinRecord>>;

    // === Provider Health ===

    fn put_provider_health(&self, endpoints: &[ProviderEndpoint]) -> Result<()>;

    fn list_provider_health(&self) -> Result<Vec<ProviderEndpoint>>;

    // === Unavailable Content ===

    fn put_content_retry(&self, retry: &ContentRetry) -> Result<()>;

    fn remove_content_retry(&self, observation_id: &str) -> Result<()>;

    fn list_content_retries(&self) -> Result<Vec<ContentRetry>>;

    // === Metadata Cache ===

    fn put_cached_content(&self, entry: &CachedContent) -> Result<()>;

    fn get_cached_content(&self, uri: &str) -> Result<Option<CachedContent>>;

    fn remove_cached_content(&self, uri: &str) -> Result<()>;

    // === Record Documents ===

    /// Keep the exact bytes published under `cid` so every provider gets
    /// the same upload.
    fn put_record_document(&self, cid: &str, document: &[u8]) -> Result<()>;

    fn get_record_document(&self, cid: &str) -> Result<Option<Vec<u8>>>;

    // === Metadata ===

    /// Store metadata key-value pair
    fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve metadata by key
    fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>>;

    // === Maintenance ===

    /// Get database statistics
    fn stats(&self) -> Result<StorageStats>;

    /// Create a file-level backup/snapshot
    fn snapshot(&self, path: &Path) -> Result<()>;
}
