use crate::error::{ReliquaryError, Result};
use crate::network::Network;
use crate::storage::filters::{ArtifactFilter, StorageStats};
use crate::storage::traits::{GroupDiff, Storage};
use crate::types::{
    tracked_key, ArtifactObservation, ArtifactRecord, CachedContent, ContentRetry,
    DuplicateGroup, PinRecord, ProviderEndpoint, RecordId, RecordStatus, TrackedAddress,
};
use chrono::Utc;
use redb::{Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Table definitions
const TRACKED_ADDRESSES: TableDefinition<&str, &[u8]> = TableDefinition::new("tracked_addresses");
const OBSERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("observations");
const OBSERVATIONS_BY_SEQ: TableDefinition<u64, &str> = TableDefinition::new("observations_by_seq");
const DUPLICATE_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("duplicate_groups");
const ARTIFACT_RECORDS: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("artifact_records");
const PIN_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("pin_records");
const PROVIDER_HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("provider_health");
const CONTENT_RETRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("content_retries");
const METADATA_CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata_cache");
/// Raw record documents keyed by their CID; stored as-is, not bincode.
const RECORD_DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("record_documents");

// Secondary indexes
const RECORDS_BY_OBSERVATION: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("records_by_observation");
const RECORDS_BY_TAG: MultimapTableDefinition<&str, &[u8; 16]> =
    MultimapTableDefinition::new("records_by_tag");

/// Shape shared by every string-keyed table of serialized values.
type BlobTable = TableDefinition<'static, &'static str, &'static [u8]>;

// Metadata table
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Redb-based storage implementation
pub struct RedbStorage {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStorage {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReliquaryError::Validation(format!("Failed to create directory: {}", e))
            })?;
        }

        let is_new = !path.exists();
        let db = Database::create(&path)?;

        if !is_new {
            Self::check_schema_version(&db)?;
        }

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TRACKED_ADDRESSES)?;
            let _ = write_txn.open_table(OBSERVATIONS)?;
            let _ = write_txn.open_table(OBSERVATIONS_BY_SEQ)?;
            let _ = write_txn.open_table(DUPLICATE_GROUPS)?;
            let _ = write_txn.open_table(ARTIFACT_RECORDS)?;
            let _ = write_txn.open_table(PIN_RECORDS)?;
            let _ = write_txn.open_table(PROVIDER_HEALTH)?;
            let _ = write_txn.open_table(CONTENT_RETRIES)?;
            let _ = write_txn.open_table(METADATA_CACHE)?;
            let _ = write_txn.open_table(RECORD_DOCUMENTS)?;
            let _ = write_txn.open_multimap_table(RECORDS_BY_OBSERVATION)?;
            let _ = write_txn.open_multimap_table(RECORDS_BY_TAG)?;
            let mut meta = write_txn.open_table(META)?;
            if is_new {
                meta.insert(SCHEMA_VERSION_KEY, CURRENT_SCHEMA_VERSION.to_string().as_bytes())?;
            }
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Check schema version. Returns error if the file was written by a
    /// different layout.
    fn check_schema_version(db: &Database) -> Result<()> {
        let read_txn = db.begin_read()?;
        let version = {
            let table = read_txn.open_table(META).ok();
            table
                .and_then(|t| {
                    t.get(SCHEMA_VERSION_KEY).ok().flatten().and_then(|v| {
                        std::str::from_utf8(v.value())
                            .ok()
                            .and_then(|s| s.parse::<u32>().ok())
                    })
                })
                .unwrap_or(CURRENT_SCHEMA_VERSION)
        };

        match version.cmp(&CURRENT_SCHEMA_VERSION) {
            std::cmp::Ordering::Equal => Ok(()),
            std::cmp::Ordering::Less => Err(ReliquaryError::Validation(format!(
                "Database schema v{} is older than current v{}. Re-create the data directory.",
                version, CURRENT_SCHEMA_VERSION
            ))),
            std::cmp::Ordering::Greater => Err(ReliquaryError::Validation(format!(
                "Database schema v{} is newer than this binary v{}. Upgrade Reliquary.",
                version, CURRENT_SCHEMA_VERSION
            ))),
        }
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn uuid_to_bytes(id: &uuid::Uuid) -> [u8; 16] {
        *id.as_bytes()
    }

    fn bytes_to_uuid(bytes: &[u8; 16]) -> uuid::Uuid {
        uuid::Uuid::from_bytes(*bytes)
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(ReliquaryError::from)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(ReliquaryError::from)
    }

    /// Observations carry free-form metadata JSON, which bincode cannot
    /// round-trip, so they are stored as JSON.
    fn serialize_observation(observation: &ArtifactObservation) -> Result<Vec<u8>> {
        serde_json::to_vec(observation).map_err(ReliquaryError::from)
    }

    fn deserialize_observation(bytes: &[u8]) -> Result<ArtifactObservation> {
        serde_json::from_slice(bytes).map_err(ReliquaryError::from)
    }

    /// Insert-if-absent inside an open write transaction.
    fn insert_observation(txn: &redb::WriteTransaction, observation: &ArtifactObservation) -> Result<bool> {
        let mut observations = txn.open_table(OBSERVATIONS)?;
        if observations.get(observation.id.as_str())?.is_some() {
            return Ok(false);
        }

        let bytes = Self::serialize_observation(observation)?;
        observations.insert(observation.id.as_str(), bytes.as_slice())?;

        let mut by_seq = txn.open_table(OBSERVATIONS_BY_SEQ)?;
        let next_seq = by_seq.last()?.map(|(k, _)| k.value() + 1).unwrap_or(1);
        by_seq.insert(next_seq, observation.id.as_str())?;
        Ok(true)
    }

    /// Keep record indexes in step with the stored record
    fn update_record_indexes(
        txn: &redb::WriteTransaction,
        record: &ArtifactRecord,
        old: Option<&ArtifactRecord>,
    ) -> Result<()> {
        let id_bytes = Self::uuid_to_bytes(&record.id);

        let mut by_tag = txn.open_multimap_table(RECORDS_BY_TAG)?;
        if let Some(old) = old {
            for tag in old.tags.difference(&record.tags) {
                by_tag.remove(tag.as_str(), &id_bytes)?;
            }
        }
        for tag in &record.tags {
            by_tag.insert(tag.as_str(), &id_bytes)?;
        }

        // Provenance only grows, so observation entries are never removed
        let mut by_observation = txn.open_multimap_table(RECORDS_BY_OBSERVATION)?;
        for observation_id in &record.merged_from_observation_ids {
            by_observation.insert(observation_id.as_str(), &id_bytes)?;
        }
        Ok(())
    }

    fn write_record(txn: &redb::WriteTransaction, record: &ArtifactRecord) -> Result<()> {
        let id_bytes = Self::uuid_to_bytes(&record.id);
        let old = {
            let table = txn.open_table(ARTIFACT_RECORDS)?;
            let old_bytes = table.get(&id_bytes)?.map(|guard| guard.value().to_vec());
            old_bytes
                .map(|bytes| Self::deserialize::<ArtifactRecord>(&bytes))
                .transpose()?
        };

        let bytes = Self::serialize(record)?;
        {
            let mut table = txn.open_table(ARTIFACT_RECORDS)?;
            table.insert(&id_bytes, bytes.as_slice())?;
        }
        Self::update_record_indexes(txn, record, old.as_ref())
    }

    fn record_matches_filter(record: &ArtifactRecord, filter: &ArtifactFilter) -> bool {
        if !filter.include_superseded && matches!(record.status, RecordStatus::Superseded { .. }) {
            return false;
        }
        if filter.conflicting_only && !record.is_conflicting() {
            return false;
        }
        if let Some(ref tag) = filter.tag {
            if !record.tags.contains(tag) {
                return false;
            }
        }
        if let Some(network) = filter.network {
            let on_chain = record
                .blockchain_id
                .as_ref()
                .is_some_and(|id| id.network == network);
            let scraped = record.scrape_history.iter().any(|e| e.network == network);
            if !on_chain && !scraped {
                return false;
            }
        }
        true
    }

    fn list_values<T: serde::de::DeserializeOwned>(
        &self,
        definition: BlobTable,
    ) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(definition)?;
        let mut values = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            values.push(Self::deserialize(value.value())?);
        }
        Ok(values)
    }

    fn get_value<T: serde::de::DeserializeOwned>(
        &self,
        definition: BlobTable,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(definition)?;
        match table.get(key)? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn put_value<T: serde::Serialize>(
        &self,
        definition: BlobTable,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = Self::serialize(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(definition)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_value(&self, definition: BlobTable, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(definition)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn count_rows(&self, definition: BlobTable) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(definition)?;
        let mut count = 0;
        for item in table.iter()? {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

impl Storage for RedbStorage {
    fn put_tracked_address(&self, tracked: &TrackedAddress) -> Result<()> {
        self.put_value(TRACKED_ADDRESSES, &tracked.key(), tracked)
    }

    fn get_tracked_address(&self, network: Network, address: &str) -> Result<Option<TrackedAddress>> {
        self.get_value(TRACKED_ADDRESSES, &tracked_key(network, address))
    }

    fn list_tracked_addresses(&self) -> Result<Vec<TrackedAddress>> {
        let mut tracked: Vec<TrackedAddress> = self.list_values(TRACKED_ADDRESSES)?;
        tracked.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key().cmp(&b.key())));
        Ok(tracked)
    }

    fn reset_checkpoint(&self, network: Network, address: &str, to: Option<u64>) -> Result<()> {
        let mut tracked = self
            .get_tracked_address(network, address)?
            .ok_or_else(|| ReliquaryError::NotFound(format!("tracked address {}", tracked_key(network, address))))?;
        tracked.last_scanned_block = to;
        tracked.updated_at = Utc::now();
        self.put_tracked_address(&tracked)
    }

    fn append_observation(&self, observation: &ArtifactObservation) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let inserted = Self::insert_observation(&write_txn, observation)?;
        write_txn.commit()?;
        Ok(inserted)
    }

    fn get_observation(&self, id: &str) -> Result<Option<ArtifactObservation>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBSERVATIONS)?;
        match table.get(id)? {
            Some(bytes) => Ok(Some(Self::deserialize_observation(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn list_observations(&self) -> Result<Vec<ArtifactObservation>> {
        let read_txn = self.db.begin_read()?;
        let by_seq = read_txn.open_table(OBSERVATIONS_BY_SEQ)?;
        let observations = read_txn.open_table(OBSERVATIONS)?;

        let mut result = Vec::new();
        for item in by_seq.iter()? {
            let (_, id) = item?;
            if let Some(bytes) = observations.get(id.value())? {
                result.push(Self::deserialize_observation(bytes.value())?);
            }
        }
        Ok(result)
    }

    fn count_observations(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let by_seq = read_txn.open_table(OBSERVATIONS_BY_SEQ)?;
        let last = by_seq.last()?.map(|(k, _)| k.value()).unwrap_or(0);
        Ok(last)
    }

    fn commit_scan_batch(
        &self,
        network: Network,
        address: &str,
        observations: &[ArtifactObservation],
        checkpoint: u64,
    ) -> Result<usize> {
        let key = tracked_key(network, address);
        let write_txn = self.db.begin_write()?;

        let mut inserted = 0;
        for observation in observations {
            if Self::insert_observation(&write_txn, observation)? {
                inserted += 1;
            }
        }

        {
            let mut table = write_txn.open_table(TRACKED_ADDRESSES)?;
            let existing = table.get(key.as_str())?.map(|guard| guard.value().to_vec());
            let mut tracked: TrackedAddress = existing
                .map(|bytes| Self::deserialize(&bytes))
                .transpose()?
                .ok_or_else(|| ReliquaryError::NotFound(format!("tracked address {}", key)))?;

            // Checkpoints never move backwards here
            if tracked.last_scanned_block.map_or(true, |current| checkpoint > current) {
                tracked.last_scanned_block = Some(checkpoint);
                tracked.updated_at = Utc::now();
                let bytes = Self::serialize(&tracked)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
        }

        write_txn.commit()?;
        Ok(inserted)
    }

    fn replace_duplicate_groups(&self, groups: &[DuplicateGroup]) -> Result<GroupDiff> {
        let write_txn = self.db.begin_write()?;
        let mut diff = GroupDiff::default();
        {
            let mut table = write_txn.open_table(DUPLICATE_GROUPS)?;

            let mut existing: HashMap<String, DuplicateGroup> = HashMap::new();
            for item in table.iter()? {
                let (key, value) = item?;
                existing.insert(key.value().to_string(), Self::deserialize(value.value())?);
            }

            let mut seen = HashSet::new();
            for group in groups {
                seen.insert(group.group_id.clone());
                match existing.get(&group.group_id) {
                    Some(old) if old == group => diff.unchanged += 1,
                    Some(_) => diff.changed += 1,
                    None => diff.created += 1,
                }
                let bytes = Self::serialize(group)?;
                table.insert(group.group_id.as_str(), bytes.as_slice())?;
            }

            for stale in existing.keys().filter(|k| !seen.contains(*k)) {
                table.remove(stale.as_str())?;
                diff.removed += 1;
            }
        }
        write_txn.commit()?;
        Ok(diff)
    }

    fn list_duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        self.list_values(DUPLICATE_GROUPS)
    }

    fn put_artifact_record(&self, record: &ArtifactRecord) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        Self::write_record(&write_txn, record)?;
        write_txn.commit()?;
        Ok(())
    }

    fn put_artifact_records_batch(&self, records: &[ArtifactRecord]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        for record in records {
            Self::write_record(&write_txn, record)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_artifact_record(&self, id: RecordId) -> Result<Option<ArtifactRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ARTIFACT_RECORDS)?;
        match table.get(&Self::uuid_to_bytes(&id))? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn list_artifact_records(&self, filter: ArtifactFilter) -> Result<Vec<ArtifactRecord>> {
        let read_txn = self.db.begin_read()?;
        let records_table = read_txn.open_table(ARTIFACT_RECORDS)?;

        let mut records = Vec::new();

        if let Some(ref tag) = filter.tag {
            let tag_index = read_txn.open_multimap_table(RECORDS_BY_TAG)?;
            let ids: Vec<RecordId> = tag_index
                .get(tag.as_str())?
                .map(|result| result.map(|guard| Self::bytes_to_uuid(guard.value())))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for id in ids {
                if let Some(bytes) = records_table.get(&Self::uuid_to_bytes(&id))? {
                    let record: ArtifactRecord = Self::deserialize(bytes.value())?;
                    if Self::record_matches_filter(&record, &filter) {
                        records.push(record);
                    }
                }
            }
        } else {
            for item in records_table.iter()? {
                let (_, value) = item?;
                let record: ArtifactRecord = Self::deserialize(value.value())?;
                if Self::record_matches_filter(&record, &filter) {
                    records.push(record);
                }
            }
        }

        // Newest first
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let start = filter.offset.unwrap_or(0);
        let take = filter.limit.unwrap_or(usize::MAX);
        Ok(records.into_iter().skip(start).take(take).collect())
    }

    fn records_for_observation(&self, id: &str) -> Result<Vec<RecordId>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_multimap_table(RECORDS_BY_OBSERVATION)?;
        let ids = index
            .get(id)?
            .map(|result| result.map(|guard| Self::bytes_to_uuid(guard.value())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn put_pin_record(&self, record: &PinRecord) -> Result<()> {
        self.put_value(PIN_RECORDS, &record.content_id, record)
    }

    fn get_pin_record(&self, content_id: &str) -> Result<Option<PinRecord>> {
        self.get_value(PIN_RECORDS, content_id)
    }

    fn list_pin_records(&self) -> Result<Vec<PinRecord>> {
        self.list_values(PIN_RECORDS)
    }

    fn put_provider_health(&self, endpoints: &[ProviderEndpoint]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROVIDER_HEALTH)?;
            for endpoint in endpoints {
                let bytes = Self::serialize(endpoint)?;
                table.insert(endpoint.id.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list_provider_health(&self) -> Result<Vec<ProviderEndpoint>> {
        self.list_values(PROVIDER_HEALTH)
    }

    fn put_content_retry(&self, retry: &ContentRetry) -> Result<()> {
        self.put_value(CONTENT_RETRIES, &retry.observation_id, retry)
    }

    fn remove_content_retry(&self, observation_id: &str) -> Result<()> {
        self.remove_value(CONTENT_RETRIES, observation_id)
    }

    fn list_content_retries(&self) -> Result<Vec<ContentRetry>> {
        let mut retries: Vec<ContentRetry> = self.list_values(CONTENT_RETRIES)?;
        retries.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        Ok(retries)
    }

    fn put_cached_content(&self, entry: &CachedContent) -> Result<()> {
        self.put_value(METADATA_CACHE, &entry.uri, entry)
    }

    fn get_cached_content(&self, uri: &str) -> Result<Option<CachedContent>> {
        self.get_value(METADATA_CACHE, uri)
    }

    fn remove_cached_content(&self, uri: &str) -> Result<()> {
        self.remove_value(METADATA_CACHE, uri)
    }

    fn put_record_document(&self, cid: &str, document: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORD_DOCUMENTS)?;
            table.insert(cid, document)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_record_document(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORD_DOCUMENTS)?;
        Ok(table.get(cid)?.map(|bytes| bytes.value().to_vec()))
    }

    fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut meta_table = write_txn.open_table(META)?;
            meta_table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let meta_table = read_txn.open_table(META)?;

        match meta_table.get(key)? {
            Some(value) => Ok(Some(value.value().to_vec())),
            None => Ok(None),
        }
    }

    fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats {
            tracked_addresses: self.count_rows(TRACKED_ADDRESSES)?,
            observations: self.count_observations()?,
            duplicate_groups: self.count_rows(DUPLICATE_GROUPS)?,
            pending_content_retries: self.count_rows(CONTENT_RETRIES)?,
            cached_documents: self.count_rows(METADATA_CACHE)?,
            ..Default::default()
        };

        {
            let read_txn = self.db.begin_read()?;
            let records = read_txn.open_table(ARTIFACT_RECORDS)?;
            for item in records.iter()? {
                let (_, value) = item?;
                let record: ArtifactRecord = Self::deserialize(value.value())?;
                match record.status {
                    RecordStatus::Canonical => stats.artifact_records += 1,
                    RecordStatus::Conflicting { .. } => {
                        stats.artifact_records += 1;
                        stats.conflicting_records += 1;
                    }
                    RecordStatus::Superseded { .. } => {}
                }
            }
        }

        for pin in self.list_pin_records()? {
            *stats.pin_records_by_status.entry(pin.status).or_insert(0) += 1;
        }

        stats.db_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(stats)
    }

    fn snapshot(&self, path: &Path) -> Result<()> {
        std::fs::copy(&self.path, path).map_err(|e| {
            ReliquaryError::Validation(format!("Failed to create snapshot: {}", e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn create_test_storage() -> (RedbStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = RedbStorage::open(&db_path).unwrap();
        (storage, temp_dir)
    }

    fn chain_observation(tx: &str, token: &str) -> ArtifactObservation {
        ArtifactObservation::new("rpc:ethereum", SourceKind::Blockchain, Network::Ethereum)
            .with_chain_event("0xcontract", token, tx, 100)
            .with_title("Sunset Study")
            .with_raw_metadata(json!({"name": "Sunset Study", "attributes": [{"trait_type": "mood", "value": "calm"}]}))
    }

    fn test_record(title: &str, tags: &[&str]) -> ArtifactRecord {
        let now = Utc::now();
        ArtifactRecord {
            id: Uuid::now_v7(),
            canonical_title: title.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            source_uris: BTreeSet::new(),
            scrape_history: vec![],
            blockchain_id: None,
            perceptual_hash: None,
            merged_from_observation_ids: vec![],
            status: RecordStatus::Canonical,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_observation_append_is_idempotent() {
        let (storage, _temp) = create_test_storage();
        let obs = chain_observation("0x01", "1");

        assert!(storage.append_observation(&obs).unwrap());
        assert!(!storage.append_observation(&obs).unwrap());
        assert_eq!(storage.count_observations().unwrap(), 1);

        let loaded = storage.get_observation(&obs.id).unwrap().unwrap();
        assert_eq!(loaded, obs);
    }

    #[test]
    fn test_observations_listed_in_append_order() {
        let (storage, _temp) = create_test_storage();
        let ids: Vec<_> = ["0x03", "0x01", "0x02"]
            .iter()
            .map(|tx| {
                let obs = chain_observation(tx, "1");
                storage.append_observation(&obs).unwrap();
                obs.id
            })
            .collect();

        let listed: Vec<_> = storage.list_observations().unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_commit_scan_batch_advances_checkpoint_atomically() {
        let (storage, _temp) = create_test_storage();
        let tracked = TrackedAddress::new("0xabc", Network::Ethereum, 0);
        storage.put_tracked_address(&tracked).unwrap();

        let batch = vec![chain_observation("0x01", "1"), chain_observation("0x02", "2")];
        let inserted = storage
            .commit_scan_batch(Network::Ethereum, "0xabc", &batch, 1999)
            .unwrap();
        assert_eq!(inserted, 2);

        let loaded = storage.get_tracked_address(Network::Ethereum, "0xabc").unwrap().unwrap();
        assert_eq!(loaded.last_scanned_block, Some(1999));

        // Replaying the same range inserts nothing and keeps the checkpoint
        let inserted = storage
            .commit_scan_batch(Network::Ethereum, "0xabc", &batch, 999)
            .unwrap();
        assert_eq!(inserted, 0);
        let loaded = storage.get_tracked_address(Network::Ethereum, "0xabc").unwrap().unwrap();
        assert_eq!(loaded.last_scanned_block, Some(1999));
    }

    #[test]
    fn test_commit_scan_batch_for_untracked_address_writes_nothing() {
        let (storage, _temp) = create_test_storage();
        let batch = vec![chain_observation("0x01", "1")];

        let err = storage
            .commit_scan_batch(Network::Ethereum, "0xmissing", &batch, 10)
            .unwrap_err();
        assert!(matches!(err, ReliquaryError::NotFound(_)));
        assert_eq!(storage.count_observations().unwrap(), 0);
    }

    #[test]
    fn test_reset_checkpoint() {
        let (storage, _temp) = create_test_storage();
        let mut tracked = TrackedAddress::new("0xabc", Network::Polygon, 0);
        tracked.last_scanned_block = Some(5000);
        storage.put_tracked_address(&tracked).unwrap();

        storage.reset_checkpoint(Network::Polygon, "0xabc", None).unwrap();
        let loaded = storage.get_tracked_address(Network::Polygon, "0xabc").unwrap().unwrap();
        assert_eq!(loaded.last_scanned_block, None);
    }

    #[test]
    fn test_replace_duplicate_groups_reports_diff() {
        let (storage, _temp) = create_test_storage();
        let group = |id: &str, members: &[&str]| DuplicateGroup {
            group_id: id.to_string(),
            member_observation_ids: members.iter().map(|m| m.to_string()).collect(),
            match_reasons: vec![],
        };

        let diff = storage
            .replace_duplicate_groups(&[group("g1", &["a", "b"]), group("g2", &["c", "d"])])
            .unwrap();
        assert_eq!(diff.created, 2);

        let diff = storage
            .replace_duplicate_groups(&[group("g1", &["a", "b"]), group("g3", &["e", "f"])])
            .unwrap();
        assert_eq!(
            diff,
            GroupDiff {
                created: 1,
                changed: 0,
                unchanged: 1,
                removed: 1
            }
        );
        assert_eq!(storage.list_duplicate_groups().unwrap().len(), 2);
    }

    #[test]
    fn test_record_crud_and_indexes() {
        let (storage, _temp) = create_test_storage();
        let mut record = test_record("Sunset Study", &["landscape", "mood:calm"]);
        record.merged_from_observation_ids = vec!["obs-1".into(), "obs-2".into()];
        storage.put_artifact_record(&record).unwrap();

        let loaded = storage.get_artifact_record(record.id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(storage.records_for_observation("obs-2").unwrap(), vec![record.id]);

        let by_tag = storage
            .list_artifact_records(ArtifactFilter::new().with_tag("landscape"))
            .unwrap();
        assert_eq!(by_tag.len(), 1);

        // Dropping a tag removes it from the index
        record.tags.remove("landscape");
        storage.put_artifact_record(&record).unwrap();
        let by_tag = storage
            .list_artifact_records(ArtifactFilter::new().with_tag("landscape"))
            .unwrap();
        assert!(by_tag.is_empty());
    }

    #[test]
    fn test_superseded_records_hidden_by_default() {
        let (storage, _temp) = create_test_storage();
        let survivor = test_record("Kept", &[]);
        let mut absorbed = test_record("Absorbed", &[]);
        absorbed.status = RecordStatus::Superseded { by: survivor.id };
        storage
            .put_artifact_records_batch(&[survivor.clone(), absorbed.clone()])
            .unwrap();

        let visible = storage.list_artifact_records(ArtifactFilter::new()).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, survivor.id);

        let all = storage
            .list_artifact_records(ArtifactFilter::new().include_superseded())
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_record_pagination() {
        let (storage, _temp) = create_test_storage();
        for i in 0..5 {
            storage.put_artifact_record(&test_record(&format!("r{}", i), &[])).unwrap();
        }

        let page = storage
            .list_artifact_records(ArtifactFilter::new().with_offset(2).with_limit(2))
            .unwrap();
        assert_eq!(page.len(), 2);
        let tail = storage
            .list_artifact_records(ArtifactFilter::new().with_offset(4).with_limit(10))
            .unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn test_pin_and_retry_round_trip() {
        let (storage, _temp) = create_test_storage();
        let mut pin = PinRecord::new("bafyfoo", PinTier::CanonicalRecord);
        pin.target_providers.insert("pinata".into());
        pin.confirm("pinata");
        storage.put_pin_record(&pin).unwrap();
        assert_eq!(storage.get_pin_record("bafyfoo").unwrap().unwrap(), pin);

        let retry = ContentRetry {
            observation_id: "obs-1".into(),
            uri: "ipfs://bafybar".into(),
            attempts: 1,
            next_attempt_at: Utc::now(),
            last_error: Some("timeout".into()),
        };
        storage.put_content_retry(&retry).unwrap();
        assert_eq!(storage.list_content_retries().unwrap(), vec![retry]);
        storage.remove_content_retry("obs-1").unwrap();
        assert!(storage.list_content_retries().unwrap().is_empty());
    }

    #[test]
    fn test_record_document_kept_byte_for_byte() {
        let (storage, _temp) = create_test_storage();
        let document = br#"{"canonical_title":"Sunset"}"#;
        storage.put_record_document("bafkreidoc", document).unwrap();

        assert_eq!(storage.get_record_document("bafkreidoc").unwrap().as_deref(), Some(&document[..]));
        assert_eq!(storage.get_record_document("bafkreimissing").unwrap(), None);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("reopen.redb");
        {
            let storage = RedbStorage::open(&db_path).unwrap();
            storage
                .put_tracked_address(&TrackedAddress::new("0xabc", Network::Base, 7))
                .unwrap();
        }
        let storage = RedbStorage::open(&db_path).unwrap();
        assert_eq!(storage.list_tracked_addresses().unwrap().len(), 1);
        assert_eq!(
            storage.get_metadata(SCHEMA_VERSION_KEY).unwrap(),
            Some(CURRENT_SCHEMA_VERSION.to_string().into_bytes())
        );
    }

    #[test]
    fn test_stats() {
        let (storage, _temp) = create_test_storage();
        storage.append_observation(&chain_observation("0x01", "1")).unwrap();
        let mut conflicting = test_record("x", &[]);
        conflicting.status = RecordStatus::Conflicting { identities: vec![] };
        storage.put_artifact_record(&conflicting).unwrap();
        storage.put_pin_record(&PinRecord::new("c1", PinTier::Thumbnail)).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.observations, 1);
        assert_eq!(stats.artifact_records, 1);
        assert_eq!(stats.conflicting_records, 1);
        assert_eq!(stats.pin_records_by_status.get(&PinStatus::Queued), Some(&1));
    }
}
