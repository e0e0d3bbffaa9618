use crate::dedup::{DedupConfig, DedupReport, Deduplicator};
use crate::error::{requeue_at, ReliquaryError, Result};
use crate::network::{chain_prefix, classify_address, validate_address, Network};
use crate::pins::{PinConfig, PinManager, PinTarget, ProcessReport};
use crate::provider::{BackoffPolicy, HttpRpcTransport, ProviderPool};
use crate::resolver::{
    parse_content_uri, raw_cid, ContentFetcher, ContentLocator, HttpContentFetcher,
    MetadataResolver, ResolverConfig,
};
use crate::scanner::{ContentSweepReport, EventScanner, ScannerConfig};
use crate::storage::{ArtifactFilter, RedbStorage, Storage, StorageStats};
use crate::types::{
    AddressRole, ArtifactObservation, ArtifactRecord, ContentId, PinRecord, PinTier,
    ProviderEndpoint, ProviderKind, RecordId, TrackedAddress,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Config for embedded library mode.
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    pub scanner: ScannerConfig,
    pub resolver: ResolverConfig,
    pub dedup: DedupConfig,
    pub pins: PinConfig,
    /// Endpoint backoff. Also drives the requeue delay of syncs that hit
    /// provider exhaustion.
    pub backoff: BackoffPolicy,
    /// Per-request timeout for RPC calls. Default: 15s
    pub rpc_timeout: Duration,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            resolver: ResolverConfig::default(),
            dedup: DedupConfig::default(),
            pins: PinConfig::default(),
            backoff: BackoffPolicy::default(),
            rpc_timeout: Duration::from_secs(15),
        }
    }
}

/// How a sync ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    /// No provider could serve the scan. The checkpoint is intact and the
    /// address will not be retried before `retry_at`.
    TemporarilyUnavailable { retry_at: DateTime<Utc>, reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub address: String,
    pub network: Network,
    pub from_block: u64,
    /// Last committed block after this sync.
    pub to_block: Option<u64>,
    /// New observations written.
    pub observations: usize,
    pub status: SyncStatus,
}

/// Content queued for one record, each item at its tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PinPlan {
    /// Raw CID of the record document this plan publishes.
    pub record_cid: ContentId,
    pub items: BTreeMap<ContentId, PinTier>,
}

#[derive(Debug, Default)]
struct SyncBackoff {
    attempts: u32,
    retry_at: Option<DateTime<Utc>>,
}

/// High-level, embedded pipeline API. No server required.
///
/// # Example
/// ```rust,no_run
/// use reliquary_core::{LibraryConfig, Reliquary};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> reliquary_core::Result<()> {
/// let reliquary = Reliquary::open("./reliquary.redb", vec![], vec![], LibraryConfig::default())?;
/// let tracked = reliquary.track_address("ethereum:0x5af0d9827e0c53e4799bb226655a1de152a425a5", None, None, 0)?;
/// reliquary.trigger_sync(&tracked, &CancellationToken::new()).await?;
/// reliquary.run_dedup_pass()?;
/// # Ok(())
/// # }
/// ```
pub struct Reliquary {
    storage: Arc<dyn Storage>,
    pool: Arc<ProviderPool>,
    scanner: EventScanner,
    dedup: Deduplicator,
    pins: PinManager,
    config: LibraryConfig,
    backoff: Mutex<HashMap<String, SyncBackoff>>,
    scan_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reliquary {
    /// Open (or create) a database at `path` and wire the HTTP transports.
    ///
    /// `endpoints` lists every RPC node, gateway and pinning service for the
    /// health table; `pin_targets` are the clients for the pinning services.
    pub fn open(
        path: impl AsRef<Path>,
        endpoints: Vec<ProviderEndpoint>,
        pin_targets: Vec<PinTarget>,
        config: LibraryConfig,
    ) -> Result<Self> {
        let storage: Arc<dyn Storage> = Arc::new(RedbStorage::open(path.as_ref())?);
        let transport = Arc::new(HttpRpcTransport::new(config.rpc_timeout)?);
        let pool = Arc::new(
            ProviderPool::new(endpoints, transport, config.backoff)
                .with_attempt_timeout(config.rpc_timeout),
        );
        let restored = pool.restore_health(storage.as_ref())?;
        if restored > 0 {
            log::info!("Restored health for {} providers", restored);
        }
        let fetcher = Arc::new(HttpContentFetcher::new(config.resolver.gateway_timeout)?);
        Self::new(storage, pool, fetcher, pin_targets, config)
    }

    /// Assemble from parts. Pending pin work from an earlier run is queued
    /// again.
    pub fn new(
        storage: Arc<dyn Storage>,
        pool: Arc<ProviderPool>,
        fetcher: Arc<dyn ContentFetcher>,
        pin_targets: Vec<PinTarget>,
        config: LibraryConfig,
    ) -> Result<Self> {
        let resolver = Arc::new(MetadataResolver::new(
            pool.clone(),
            fetcher,
            storage.clone(),
            config.resolver.clone(),
        ));
        let scanner = EventScanner::new(pool.clone(), resolver, storage.clone(), config.scanner.clone());
        let dedup = Deduplicator::new(storage.clone(), config.dedup.clone())?;
        let pins = PinManager::new(pin_targets, storage.clone(), config.pins.clone())
            .with_health_reporting(pool.clone());
        pins.resume()?;

        Ok(Self {
            storage,
            pool,
            scanner,
            dedup,
            pins,
            config,
            backoff: Mutex::new(HashMap::new()),
            scan_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn backoff(&self) -> MutexGuard<'_, HashMap<String, SyncBackoff>> {
        self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scan_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.scan_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    // --- Tracked addresses ---

    /// Start watching an address.
    ///
    /// Without `network` the chain is inferred from the address format;
    /// ambiguous or malformed input fails with `InvalidAddressFormat`.
    /// Tracking an address again only updates its label.
    pub fn track_address(
        &self,
        raw: &str,
        network: Option<Network>,
        label: Option<String>,
        start_block: u64,
    ) -> Result<TrackedAddress> {
        self.track_address_as(raw, network, label, start_block, AddressRole::Contract)
    }

    pub fn track_address_as(
        &self,
        raw: &str,
        network: Option<Network>,
        label: Option<String>,
        start_block: u64,
        role: AddressRole,
    ) -> Result<TrackedAddress> {
        let network = match network {
            Some(network) => network,
            None => self.infer_network(raw)?,
        };
        let address = validate_address(raw, network)?;

        if let Some(mut existing) = self.storage.get_tracked_address(network, &address)? {
            if label.is_some() && label != existing.label {
                existing.label = label;
                existing.updated_at = Utc::now();
                self.storage.put_tracked_address(&existing)?;
            }
            return Ok(existing);
        }

        let mut tracked = TrackedAddress::new(address, network, start_block).with_role(role);
        tracked.label = label;
        self.storage.put_tracked_address(&tracked)?;
        log::info!(
            "Tracking {} {} ({:?}) from block {}",
            tracked.network,
            tracked.address,
            tracked.role,
            start_block
        );
        Ok(tracked)
    }

    /// Network for an address given without one. A bare 20-byte hex address
    /// is valid on every EVM chain, so it is only accepted when exactly one
    /// EVM chain has RPC providers configured.
    fn infer_network(&self, raw: &str) -> Result<Network> {
        let guessed = classify_address(raw);
        if !guessed.is_evm() || chain_prefix(raw).is_some() {
            return Ok(guessed);
        }

        let scannable: Vec<Network> = Network::ALL
            .into_iter()
            .filter(|n| n.is_evm() && self.pool.has_kind(ProviderKind::Rpc(*n)))
            .collect();
        match scannable.as_slice() {
            [only] => Ok(*only),
            _ => Err(ReliquaryError::InvalidAddressFormat {
                address: raw.to_string(),
                reason: format!(
                    "a bare EVM address is ambiguous with {} EVM chains configured; give a network or a chain: prefix",
                    scannable.len()
                ),
            }),
        }
    }

    pub fn list_tracked_addresses(&self) -> Result<Vec<TrackedAddress>> {
        self.storage.list_tracked_addresses()
    }

    /// Look up a tracked address by its user-facing form.
    pub fn find_tracked(&self, raw: &str, network: Option<Network>) -> Result<TrackedAddress> {
        let network = match network {
            Some(network) => network,
            None => self.infer_network(raw)?,
        };
        let address = validate_address(raw, network)?;
        self.storage
            .get_tracked_address(network, &address)?
            .ok_or_else(|| ReliquaryError::NotFound(format!("tracked address {} on {}", address, network)))
    }

    /// Move the checkpoint back for a full re-sync. `None` restarts from the
    /// address's start block.
    pub fn reset_checkpoint(&self, tracked: &TrackedAddress, to: Option<u64>) -> Result<()> {
        self.storage.reset_checkpoint(tracked.network, &tracked.address, to)?;
        self.backoff().remove(&tracked.key());
        log::warn!(
            "Checkpoint for {} {} reset to {:?}",
            tracked.network,
            tracked.address,
            to
        );
        Ok(())
    }

    // --- Sync ---

    /// Scan one address from its checkpoint to the chain head.
    ///
    /// Provider exhaustion does not fail the call: the report says the
    /// address is temporarily unavailable and when it will be retried.
    /// Malformed or unsupported addresses are returned as errors.
    pub async fn trigger_sync(&self, tracked: &TrackedAddress, cancel: &CancellationToken) -> Result<SyncReport> {
        let key = tracked.key();
        let lock = self.scan_lock(&key);
        let _guard = lock.lock().await;

        // Reload: another sync may have moved the checkpoint while we waited
        let tracked = self
            .storage
            .get_tracked_address(tracked.network, &tracked.address)?
            .ok_or_else(|| ReliquaryError::NotFound(format!("tracked address {}", key)))?;
        let from_block = tracked.next_block();

        let outcome = self.scanner.scan(&tracked, from_block, None, cancel).await;
        let checkpoint = self
            .storage
            .get_tracked_address(tracked.network, &tracked.address)?
            .and_then(|t| t.last_scanned_block);

        let mut report = SyncReport {
            address: tracked.address.clone(),
            network: tracked.network,
            from_block,
            to_block: checkpoint,
            observations: 0,
            status: SyncStatus::Completed,
        };

        match outcome {
            Ok(result) => {
                self.backoff().remove(&key);
                report.observations = result.inserted;
            }
            Err(ReliquaryError::Cancelled) => {
                log::info!("Sync of {} cancelled at checkpoint {:?}", key, checkpoint);
                report.status = SyncStatus::Cancelled;
            }
            Err(e) if e.is_transient() => {
                let now = Utc::now();
                let mut backoff = self.backoff();
                let entry = backoff.entry(key.clone()).or_default();
                entry.attempts += 1;
                let retry_at = requeue_at(
                    now,
                    entry.attempts,
                    self.config.backoff.base,
                    self.config.backoff.max,
                );
                entry.retry_at = Some(retry_at);
                log::warn!(
                    "Sync of {} temporarily unavailable ({}), retry {} at {}",
                    key,
                    e,
                    entry.attempts,
                    retry_at
                );
                report.status = SyncStatus::TemporarilyUnavailable {
                    retry_at,
                    reason: e.to_string(),
                };
            }
            Err(e) => return Err(e),
        }
        Ok(report)
    }

    /// When `tracked` may be synced again, if it is backing off.
    pub fn retry_at(&self, tracked: &TrackedAddress) -> Option<DateTime<Utc>> {
        self.backoff().get(&tracked.key()).and_then(|b| b.retry_at)
    }

    /// Sync every scannable address that is not backing off, concurrently.
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<Vec<SyncReport>> {
        let now = Utc::now();
        let due: Vec<TrackedAddress> = self
            .storage
            .list_tracked_addresses()?
            .into_iter()
            .filter(|t| {
                if !t.network.supports_log_scanning() {
                    log::debug!("Skipping {} {}: no log scanning backend", t.network, t.address);
                    return false;
                }
                self.retry_at(t).map_or(true, |at| at <= now)
            })
            .collect();

        let mut reports = Vec::with_capacity(due.len());
        for outcome in join_all(due.iter().map(|t| self.trigger_sync(t, cancel))).await {
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => log::error!("Sync failed: {}", e),
            }
        }
        Ok(reports)
    }

    /// Re-resolve metadata that was unavailable during a scan.
    pub async fn sweep_unavailable_content(&self, cancel: &CancellationToken) -> Result<ContentSweepReport> {
        self.scanner.sweep_content_retries(Utc::now(), cancel).await
    }

    // --- Dedup ---

    pub fn has_new_observations(&self) -> Result<bool> {
        self.dedup.has_new_observations()
    }

    /// Regroup observations, update canonical records, and queue the
    /// content of every changed record for pinning.
    pub fn run_dedup_pass(&self) -> Result<DedupReport> {
        let report = self.dedup.run_pass()?;
        for id in &report.changed_records {
            if let Some(record) = self.storage.get_artifact_record(*id)? {
                self.queue_record_content(&record)?;
            }
        }
        Ok(report)
    }

    /// Queue every live record's content. Catches up after a crash between
    /// a dedup pass and its enqueue.
    pub fn reconcile_pins(&self) -> Result<usize> {
        let mut queued = 0;
        for record in self.storage.list_artifact_records(ArtifactFilter::new())? {
            queued += self.queue_record_content(&record)?.items.len();
        }
        Ok(queued)
    }

    fn queue_record_content(&self, record: &ArtifactRecord) -> Result<PinPlan> {
        match self.pin_record(record.id) {
            Ok(plan) => Ok(plan),
            Err(ReliquaryError::ConflictingMerge { record, reason }) => {
                log::warn!("Not pinning {} until resolved: {}", record, reason);
                Ok(PinPlan::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a record's JSON and media for pinning at their tiers.
    ///
    /// Records held for review fail with `ConflictingMerge`.
    pub fn pin_record(&self, id: RecordId) -> Result<PinPlan> {
        let record = self
            .storage
            .get_artifact_record(id)?
            .ok_or_else(|| ReliquaryError::NotFound(format!("artifact record {}", id)))?;
        record.ensure_resolved()?;

        let mut members = Vec::with_capacity(record.merged_from_observation_ids.len());
        for observation_id in &record.merged_from_observation_ids {
            members.extend(self.storage.get_observation(observation_id)?);
        }
        let document = record.canonical_document()?;
        let plan = pin_plan(raw_cid(&document)?, &members);
        for (content_id, tier) in &plan.items {
            if *content_id == plan.record_cid {
                self.pins.enqueue_document(record.id, &document, *tier)?;
            } else {
                self.pins.enqueue(content_id, *tier)?;
            }
        }
        Ok(plan)
    }

    // --- Pins ---

    pub async fn process_pins(&self, cancel: &CancellationToken) -> Result<ProcessReport> {
        self.pins.process(cancel).await
    }

    pub async fn verify_pin(&self, content_id: &str) -> Result<Option<PinRecord>> {
        self.pins.verify(content_id).await
    }

    pub async fn verify_pins(&self, cancel: &CancellationToken) -> Result<usize> {
        self.pins.verify_all(cancel).await
    }

    pub fn get_pin_status(&self, content_id: &str) -> Result<Option<PinRecord>> {
        self.pins.status(content_id)
    }

    pub fn list_pin_records(&self) -> Result<Vec<PinRecord>> {
        self.storage.list_pin_records()
    }

    // --- Records ---

    pub fn get_artifact_record(&self, id: RecordId) -> Result<Option<ArtifactRecord>> {
        self.storage.get_artifact_record(id)
    }

    pub fn list_artifact_records(&self, filter: ArtifactFilter) -> Result<Vec<ArtifactRecord>> {
        self.storage.list_artifact_records(filter)
    }

    // --- Providers ---

    pub fn health_snapshot(&self) -> Vec<ProviderEndpoint> {
        self.pool.health_snapshot()
    }

    /// Write provider health so backoff survives a restart.
    pub fn persist_health(&self) -> Result<()> {
        self.pool.persist_health(self.storage.as_ref())
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.stats()
    }
}

fn ipfs_cid(uri: &str) -> Option<String> {
    match parse_content_uri(uri).ok()? {
        ContentLocator::Ipfs { cid, .. } => Some(cid),
        _ => None,
    }
}

const THUMBNAIL_FIELDS: &[&str] = &["image_thumbnail_url", "thumbnail", "thumbnail_uri"];
const ASSET_FIELDS: &[&str] = &["image", "image_url", "animation_url"];

/// Content to pin for one record. An item reachable at several tiers keeps
/// the highest one.
fn pin_plan(record_cid: ContentId, members: &[ArtifactObservation]) -> PinPlan {
    let mut items = BTreeMap::new();
    let mut add = |content_id: String, tier: PinTier| {
        let entry = items.entry(content_id).or_insert(tier);
        if tier < *entry {
            *entry = tier;
        }
    };

    add(record_cid.clone(), PinTier::CanonicalRecord);
    for member in members {
        if member.blockchain_id().is_some() {
            if let Some(cid) = member.metadata_uri.as_deref().and_then(ipfs_cid) {
                add(cid, PinTier::OwnershipProof);
            }
        }
        let media = |fields: &[&str]| -> Vec<String> {
            fields
                .iter()
                .filter_map(|f| member.raw_metadata.get(*f).and_then(Value::as_str))
                .filter_map(ipfs_cid)
                .collect()
        };
        for cid in media(THUMBNAIL_FIELDS) {
            add(cid, PinTier::Thumbnail);
        }
        for cid in media(ASSET_FIELDS) {
            add(cid, PinTier::FullAsset);
        }
    }
    PinPlan { record_cid, items }
}
