use crate::network::Network;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of an observation, derived from `(source_id, tx_hash, token_id)`.
pub type ObservationId = String;

/// Identifier of a canonical artifact record. UUIDv7 for time-sortability.
pub type RecordId = Uuid;

/// Identifier of pinnable content (usually a CID).
pub type ContentId = String;

/// Which family of backend an endpoint serves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON-RPC node for one network.
    Rpc(Network),
    /// IPFS HTTP gateway.
    Ipfs,
    /// Pinning service.
    Pin,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Rpc(network) => write!(f, "rpc:{}", network),
            ProviderKind::Ipfs => write!(f, "ipfs"),
            ProviderKind::Pin => write!(f, "pin"),
        }
    }
}

/// One RPC node, gateway, or pinning backend together with its health state.
///
/// Endpoints are never deleted, only deprioritized through backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderEndpoint {
    pub id: String,
    pub base_url: String,
    pub kind: ProviderKind,
    /// Lower value is tried first. Equal values share load round-robin.
    pub priority: u32,
    pub consecutive_failures: u32,
    /// Skip this endpoint until this instant. Cleared on success.
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
}

impl ProviderEndpoint {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        kind: ProviderKind,
        priority: u32,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            kind,
            priority,
            consecutive_failures: 0,
            backoff_until: None,
            last_error: None,
            last_success_at: None,
            total_calls: 0,
            total_failures: 0,
        }
    }

    pub fn is_in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }
}

/// Whether logs are filtered by emitting contract or by recipient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressRole {
    /// Every transfer the contract emits.
    #[default]
    Contract,
    /// Transfers into the wallet, from any contract.
    Wallet,
}

/// A wallet or contract a user watches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedAddress {
    pub address: String,
    pub network: Network,
    pub role: AddressRole,
    pub label: Option<String>,
    /// First block to scan when no checkpoint exists.
    pub start_block: u64,
    /// Resumption checkpoint. Only moves forward, except on explicit re-sync.
    pub last_scanned_block: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedAddress {
    pub fn new(address: impl Into<String>, network: Network, start_block: u64) -> Self {
        let now = Utc::now();
        Self {
            address: address.into(),
            network,
            role: AddressRole::Contract,
            label: None,
            start_block,
            last_scanned_block: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_role(mut self, role: AddressRole) -> Self {
        self.role = role;
        self
    }

    /// Storage key: one tracked entry per `(network, address)`.
    pub fn key(&self) -> String {
        tracked_key(self.network, &self.address)
    }

    /// First block the next scan should read.
    pub fn next_block(&self) -> u64 {
        match self.last_scanned_block {
            Some(block) => block + 1,
            None => self.start_block,
        }
    }
}

pub fn tracked_key(network: Network, address: &str) -> String {
    format!("{}:{}", network.as_str(), address)
}

/// Where an observation came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Read from chain logs by the event scanner.
    Blockchain,
    /// Scraped from a marketplace or gallery page.
    WebScrape,
    /// Uploaded by a user.
    FileUpload,
    /// Entered by hand.
    Manual,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Blockchain => "blockchain",
            SourceKind::WebScrape => "web_scrape",
            SourceKind::FileUpload => "file_upload",
            SourceKind::Manual => "manual",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 64-bit perceptual fingerprint of an image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Number of differing bits.
    pub fn hamming_distance(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        u64::from_str_radix(s, 16).ok().map(PerceptualHash)
    }
}

/// Exact on-chain identity of a token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockchainId {
    pub network: Network,
    pub contract_address: String,
    pub token_id: String,
}

impl fmt::Display for BlockchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.network, self.contract_address, self.token_id)
    }
}

/// One sighting of an artifact from one source. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactObservation {
    pub id: ObservationId,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub network: Network,
    pub contract_address: Option<String>,
    pub token_id: Option<String>,
    pub owner_address: Option<String>,
    pub block_number: Option<u64>,
    pub tx_hash: Option<String>,
    /// Position of the event within its block. One transaction can move
    /// several tokens.
    #[serde(default)]
    pub log_index: Option<u64>,
    /// Set when the transfer came from the zero address.
    pub is_mint: bool,
    pub metadata_uri: Option<String>,
    pub perceptual_hash: Option<PerceptualHash>,
    pub title: Option<String>,
    pub tags: BTreeSet<String>,
    /// Page or file the observation was taken from.
    pub source_url: Option<String>,
    pub raw_metadata: Value,
    pub observed_at: DateTime<Utc>,
}

impl ArtifactObservation {
    pub fn new(source_id: impl Into<String>, source_kind: SourceKind, network: Network) -> Self {
        let source_id = source_id.into();
        Self {
            id: observation_id(&source_id, None, None, None, None),
            source_id,
            source_kind,
            network,
            contract_address: None,
            token_id: None,
            owner_address: None,
            block_number: None,
            tx_hash: None,
            log_index: None,
            is_mint: false,
            metadata_uri: None,
            perceptual_hash: None,
            title: None,
            tags: BTreeSet::new(),
            source_url: None,
            raw_metadata: Value::Null,
            observed_at: Utc::now(),
        }
    }

    /// Attach the on-chain event this observation was read from. Recomputes the id.
    pub fn with_chain_event(
        mut self,
        contract_address: impl Into<String>,
        token_id: impl Into<String>,
        tx_hash: impl Into<String>,
        block_number: u64,
    ) -> Self {
        self.contract_address = Some(contract_address.into());
        self.token_id = Some(token_id.into());
        self.tx_hash = Some(tx_hash.into());
        self.block_number = Some(block_number);
        self.refresh_id();
        self
    }

    pub fn with_log_index(mut self, log_index: u64) -> Self {
        self.log_index = Some(log_index);
        self.refresh_id();
        self
    }

    /// Attach a token identity without an event (scraped listings, uploads).
    pub fn with_token(mut self, contract_address: impl Into<String>, token_id: impl Into<String>) -> Self {
        self.contract_address = Some(contract_address.into());
        self.token_id = Some(token_id.into());
        self.refresh_id();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_address = Some(owner.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_perceptual_hash(mut self, hash: PerceptualHash) -> Self {
        self.perceptual_hash = Some(hash);
        self
    }

    pub fn with_metadata_uri(mut self, uri: impl Into<String>) -> Self {
        self.metadata_uri = Some(uri.into());
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_raw_metadata(mut self, raw: Value) -> Self {
        self.raw_metadata = raw;
        self
    }

    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    pub fn blockchain_id(&self) -> Option<BlockchainId> {
        match (&self.contract_address, &self.token_id) {
            (Some(contract), Some(token)) => Some(BlockchainId {
                network: self.network,
                contract_address: contract.clone(),
                token_id: token.clone(),
            }),
            _ => None,
        }
    }

    /// Recompute the id after changing the source or chain fields.
    pub fn refresh_id(&mut self) {
        self.id = observation_id(
            &self.source_id,
            self.tx_hash.as_deref(),
            self.contract_address.as_deref(),
            self.token_id.as_deref(),
            self.log_index,
        );
    }
}

/// Append-only log key for an observation: `source|tx|contract|token`, plus
/// `|log_index` for chain events.
pub fn observation_id(
    source_id: &str,
    tx_hash: Option<&str>,
    contract_address: Option<&str>,
    token_id: Option<&str>,
    log_index: Option<u64>,
) -> ObservationId {
    let mut id = format!(
        "{}|{}|{}|{}",
        source_id,
        tx_hash.unwrap_or("-"),
        contract_address.unwrap_or("-"),
        token_id.unwrap_or("-")
    );
    if let Some(index) = log_index {
        id.push_str(&format!("|{}", index));
    }
    id
}

/// Why two observations were linked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    BlockchainIdentity,
    PerceptualHash { distance: u32 },
    TitleSimilarity { score: f32 },
    SourceUrl,
}

/// One edge of the similarity graph that produced a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupLink {
    pub a: ObservationId,
    pub b: ObservationId,
    pub reason: MatchReason,
}

/// Observations believed to describe the same artifact.
///
/// Regenerated on every dedup pass; never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateGroup {
    /// Derived from the smallest member id, so unchanged groups keep their id.
    pub group_id: String,
    /// Sorted ascending.
    pub member_observation_ids: Vec<ObservationId>,
    pub match_reasons: Vec<GroupLink>,
}

/// Single entry in a record's scrape history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScrapeEntry {
    pub observed_at: DateTime<Utc>,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub network: Network,
}

/// Review state of a canonical record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Canonical,
    /// Members disagree on chain identity; held for manual review.
    Conflicting { identities: Vec<BlockchainId> },
    /// Absorbed into another record when a new observation bridged two groups.
    Superseded { by: RecordId },
}

/// One artifact as known to the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub id: RecordId,
    pub canonical_title: String,
    pub tags: BTreeSet<String>,
    pub source_uris: BTreeSet<String>,
    /// Sorted by `observed_at` ascending.
    pub scrape_history: Vec<ScrapeEntry>,
    pub blockchain_id: Option<BlockchainId>,
    pub perceptual_hash: Option<PerceptualHash>,
    /// Provenance. Only ever grows.
    pub merged_from_observation_ids: Vec<ObservationId>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn is_conflicting(&self) -> bool {
        matches!(self.status, RecordStatus::Conflicting { .. })
    }

    /// Fails with `ConflictingMerge` when the record is held for review.
    pub fn ensure_resolved(&self) -> crate::Result<()> {
        match &self.status {
            RecordStatus::Conflicting { identities } => Err(crate::ReliquaryError::ConflictingMerge {
                record: self.id.to_string(),
                reason: format!(
                    "{} distinct chain identities: {}",
                    identities.len(),
                    identities
                        .iter()
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }),
            _ => Ok(()),
        }
    }

    /// The record as published: its JSON serialization. Every collection in
    /// the record is ordered, so equal records give equal bytes.
    pub fn canonical_document(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Raw CIDv1 of [`ArtifactRecord::canonical_document`]. Changes with every
    /// merge; each version is its own pin.
    pub fn document_cid(&self) -> crate::Result<ContentId> {
        crate::resolver::raw_cid(&self.canonical_document()?)
    }
}

/// Pinning priority. Earlier variants are drained first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PinTier {
    CanonicalRecord,
    OwnershipProof,
    Thumbnail,
    FullAsset,
}

impl PinTier {
    /// The two highest tiers pin to every provider and need confirmed redundancy.
    pub fn requires_redundancy(&self) -> bool {
        matches!(self, PinTier::CanonicalRecord | PinTier::OwnershipProof)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    Queued,
    /// Requests issued, not enough confirmations yet.
    Pending,
    Healthy,
    /// Dropped below required redundancy during verification.
    Degraded,
    /// Every target provider exhausted its attempts.
    Abandoned,
}

impl PinStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PinStatus::Healthy | PinStatus::Abandoned)
    }
}

/// Durable pin state for one content item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinRecord {
    pub content_id: ContentId,
    pub priority_tier: PinTier,
    pub target_providers: BTreeSet<String>,
    /// Always a subset of `target_providers`.
    pub confirmed_providers: BTreeSet<String>,
    /// Attempts per provider for this item.
    pub attempts: BTreeMap<String, u32>,
    pub provider_pin_ids: BTreeMap<String, String>,
    pub status: PinStatus,
    pub last_error: Option<String>,
    /// Set when the content is a record document we publish ourselves. Its
    /// bytes are kept in storage and uploaded with each pin request.
    pub record_id: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PinRecord {
    pub fn new(content_id: impl Into<ContentId>, priority_tier: PinTier) -> Self {
        let now = Utc::now();
        Self {
            content_id: content_id.into(),
            priority_tier,
            target_providers: BTreeSet::new(),
            confirmed_providers: BTreeSet::new(),
            attempts: BTreeMap::new(),
            provider_pin_ids: BTreeMap::new(),
            status: PinStatus::Queued,
            last_error: None,
            record_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.values().sum()
    }

    pub fn attempts_for(&self, provider: &str) -> u32 {
        self.attempts.get(provider).copied().unwrap_or(0)
    }

    /// Record a confirmation, keeping `confirmed ⊆ target`.
    pub fn confirm(&mut self, provider: &str) {
        self.target_providers.insert(provider.to_string());
        self.confirmed_providers.insert(provider.to_string());
    }
}

/// An observation whose metadata could not be fetched from any gateway.
/// Swept periodically until it resolves or runs out of retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentRetry {
    pub observation_id: ObservationId,
    pub uri: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Fetched content kept so repeated resolves skip the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedContent {
    pub uri: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// Hex sha256 of `bytes`, re-checked on every read.
    pub sha256: String,
    /// The bytes hashed to the raw CID in `uri`. DAG-addressed content
    /// (CIDv0, dag-pb) cannot be checked this way and stays unverified.
    pub verified: bool,
    pub fetched_at: DateTime<Utc>,
}
