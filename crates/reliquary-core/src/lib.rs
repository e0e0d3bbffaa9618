pub mod types;
pub mod network;
pub mod storage;
pub mod error;
pub mod provider;
pub mod resolver;
pub mod scanner;
pub mod dedup;
pub mod pins;
pub mod api;

pub use error::{ReliquaryError, Result};
pub use types::*;
pub use network::{chain_prefix, classify_address, parse_address, validate_address, Network};
pub use storage::{ArtifactFilter, GroupDiff, RedbStorage, Storage, StorageStats, CURRENT_SCHEMA_VERSION};
pub use api::{LibraryConfig, PinPlan, Reliquary, SyncReport, SyncStatus};
pub use provider::{BackoffPolicy, CallError, FailureScope, HttpRpcTransport, ProviderPool, RpcTransport};
pub use resolver::{
    ContentFetcher, FetchedContent, HttpContentFetcher, Metadata, MetadataResolver, ResolverConfig,
};
pub use scanner::{ContentSweepReport, EventScanner, ScanResult, ScannerConfig};
pub use dedup::{DedupConfig, DedupReport, Deduplicator, MAX_PHASH_THRESHOLD};
pub use pins::{
    HttpPinProvider, PinConfig, PinManager, PinProvider, PinReceipt, PinTarget, ProcessReport,
    RemotePinState,
};
