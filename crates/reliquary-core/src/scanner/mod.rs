//! Block-range walker that turns NFT transfer logs into observations.
//!
//! Sub-ranges of one address run strictly in order. Each sub-range's
//! observations and the advanced checkpoint are written in one transaction,
//! so an interrupted scan resumes at the first uncommitted sub-range.

pub mod abi;
mod sweep;

pub use sweep::{ContentSweepReport, RESOLVED_SUFFIX};

use crate::error::{ReliquaryError, Result};
use crate::network::Network;
use crate::provider::ProviderPool;
use crate::resolver::{Metadata, MetadataResolver};
use crate::storage::Storage;
use crate::types::{
    AddressRole, ArtifactObservation, ContentRetry, ProviderKind, SourceKind, TrackedAddress,
};
use abi::{TransferEvent, TRANSFER_SINGLE_TOPIC, TRANSFER_TOPIC};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scanner tuning
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Maximum blocks per `eth_getLogs` request.
    pub block_range: u64,
    /// Delay before the first retry of metadata no gateway could serve.
    pub content_retry_delay: Duration,
    /// Retries before unresolvable metadata is given up on.
    pub content_max_retries: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            block_range: 2000,
            content_retry_delay: Duration::from_secs(900),
            content_max_retries: 8,
        }
    }
}

/// Outcome of a completed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub from_block: u64,
    pub to_block: u64,
    pub sub_ranges: usize,
    /// Decoded transfer events, including ones already stored.
    pub observations: usize,
    /// Observations that were new to the log.
    pub inserted: usize,
}

pub fn source_id(network: Network) -> String {
    format!("rpc:{}", network.as_str())
}

/// `eth_getLogs` filters for one sub-range.
///
/// A contract is filtered by emitter. A wallet is filtered by recipient,
/// which needs one query per standard since the recipient topic position
/// differs.
pub fn log_filters(tracked: &TrackedAddress, from: u64, to: u64) -> Vec<Value> {
    let from_block = abi::to_quantity(from);
    let to_block = abi::to_quantity(to);
    match tracked.role {
        AddressRole::Contract => vec![json!({
            "address": tracked.address,
            "fromBlock": from_block,
            "toBlock": to_block,
            "topics": [[TRANSFER_TOPIC, TRANSFER_SINGLE_TOPIC]],
        })],
        AddressRole::Wallet => {
            let recipient = abi::address_to_topic(&tracked.address);
            vec![
                json!({
                    "fromBlock": from_block,
                    "toBlock": to_block,
                    "topics": [TRANSFER_TOPIC, Value::Null, recipient],
                }),
                json!({
                    "fromBlock": from_block,
                    "toBlock": to_block,
                    "topics": [TRANSFER_SINGLE_TOPIC, Value::Null, Value::Null, recipient],
                }),
            ]
        }
    }
}

pub struct EventScanner {
    pool: Arc<ProviderPool>,
    resolver: Arc<MetadataResolver>,
    storage: Arc<dyn Storage>,
    config: ScannerConfig,
}

impl EventScanner {
    pub fn new(
        pool: Arc<ProviderPool>,
        resolver: Arc<MetadataResolver>,
        storage: Arc<dyn Storage>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            pool,
            resolver,
            storage,
            config,
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub async fn latest_block(&self, network: Network) -> Result<u64> {
        let head = self
            .pool
            .call(ProviderKind::Rpc(network), "eth_blockNumber", json!([]))
            .await?;
        abi::parse_quantity(&head)
    }

    /// Scan `[from, to]` for `tracked`, committing after every sub-range.
    ///
    /// When `to` is `None` the chain head is used. On error or cancellation
    /// every sub-range committed so far stays committed.
    pub async fn scan(
        &self,
        tracked: &TrackedAddress,
        from: u64,
        to: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        if !tracked.network.supports_log_scanning() {
            return Err(ReliquaryError::UnsupportedNetwork(
                tracked.network.to_string(),
            ));
        }
        let to = match to {
            Some(to) => to,
            None => self.latest_block(tracked.network).await?,
        };

        let mut result = ScanResult {
            from_block: from,
            to_block: to,
            sub_ranges: 0,
            observations: 0,
            inserted: 0,
        };
        if from > to {
            return Ok(result);
        }

        let step = self.config.block_range.max(1);
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(step - 1).min(to);
            if cancel.is_cancelled() {
                return Err(ReliquaryError::Cancelled);
            }

            let (observations, retries) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReliquaryError::Cancelled),
                collected = self.collect_range(tracked, start, end) => collected?,
            };

            let inserted =
                self.storage
                    .commit_scan_batch(tracked.network, &tracked.address, &observations, end)?;
            for retry in &retries {
                self.storage.put_content_retry(retry)?;
            }
            log::info!(
                "Checkpoint {} {} -> {} ({} events, {} new)",
                tracked.network,
                tracked.address,
                end,
                observations.len(),
                inserted
            );

            result.sub_ranges += 1;
            result.observations += observations.len();
            result.inserted += inserted;

            match end.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }

        Ok(result)
    }

    async fn fetch_logs(&self, tracked: &TrackedAddress, from: u64, to: u64) -> Result<Vec<TransferEvent>> {
        let kind = ProviderKind::Rpc(tracked.network);
        let mut events = Vec::new();
        for filter in log_filters(tracked, from, to) {
            let logs = self.pool.call(kind, "eth_getLogs", json!([filter])).await?;
            let logs = logs.as_array().ok_or_else(|| {
                ReliquaryError::Validation(format!("eth_getLogs returned non-array: {}", logs))
            })?;
            events.extend(logs.iter().filter_map(abi::decode_transfer));
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));
        events.dedup_by(|a, b| a.tx_hash == b.tx_hash && a.log_index == b.log_index);
        Ok(events)
    }

    async fn collect_range(
        &self,
        tracked: &TrackedAddress,
        from: u64,
        to: u64,
    ) -> Result<(Vec<ArtifactObservation>, Vec<ContentRetry>)> {
        let events = self.fetch_logs(tracked, from, to).await?;
        let mut observations = Vec::with_capacity(events.len());
        let mut retries = Vec::new();
        for event in &events {
            let (observation, retry) = self.observe(tracked.network, event).await?;
            observations.push(observation);
            retries.extend(retry);
        }
        Ok((observations, retries))
    }

    /// Metadata pointer for a token. A reverting call means the token has none.
    async fn metadata_uri(&self, network: Network, event: &TransferEvent) -> Result<Option<String>> {
        let call = json!([{ "to": event.contract, "data": event.metadata_call_data() }, "latest"]);
        match self.pool.call(ProviderKind::Rpc(network), "eth_call", call).await {
            Ok(Value::String(data)) => Ok(abi::decode_abi_string(&data).map(|uri| event.expand_uri(&uri))),
            Ok(_) => Ok(None),
            Err(ReliquaryError::RequestRejected { message, .. }) => {
                log::debug!(
                    "No metadata pointer for {}/{}: {}",
                    event.contract,
                    event.token_id,
                    message
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Copy resolved metadata onto an observation.
    async fn enrich(&self, mut observation: ArtifactObservation, metadata: Metadata) -> ArtifactObservation {
        if let Some(hash) = self.resolver.perceptual_hash(&metadata).await {
            observation = observation.with_perceptual_hash(hash);
        }
        if let Some(ref name) = metadata.name {
            observation = observation.with_title(name);
        }
        if let Some(ref external) = metadata.external_url {
            observation = observation.with_source_url(external);
        }
        observation
            .with_tags(metadata.tags.iter().cloned())
            .with_raw_metadata(metadata.raw)
    }

    async fn observe(
        &self,
        network: Network,
        event: &TransferEvent,
    ) -> Result<(ArtifactObservation, Option<ContentRetry>)> {
        let mut observation = ArtifactObservation::new(source_id(network), SourceKind::Blockchain, network)
            .with_chain_event(&event.contract, &event.token_id, &event.tx_hash, event.block_number)
            .with_log_index(event.log_index)
            .with_owner(&event.to);
        observation.is_mint = event.is_mint();

        let Some(uri) = self.metadata_uri(network, event).await? else {
            return Ok((observation, None));
        };
        observation = observation.with_metadata_uri(&uri);

        match self.resolver.resolve(&uri).await {
            Ok(metadata) => Ok((self.enrich(observation, metadata).await, None)),
            Err(ReliquaryError::ContentUnavailable { .. }) => {
                log::warn!("Metadata for {} unavailable, scheduling retry", observation.id);
                let retry = ContentRetry {
                    observation_id: observation.id.clone(),
                    uri,
                    attempts: 0,
                    next_attempt_at: Utc::now()
                        + chrono::Duration::from_std(self.config.content_retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::minutes(15)),
                    last_error: Some("all gateways exhausted".to_string()),
                };
                Ok((observation, Some(retry)))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                log::warn!("Unusable metadata URI {} for {}: {}", uri, observation.id, e);
                Ok((observation, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BackoffPolicy, CallError, RpcTransport};
    use crate::resolver::{ContentFetcher, FetchedContent, ResolverConfig};
    use crate::storage::RedbStorage;
    use crate::types::ProviderEndpoint;
    use abi::{address_to_topic, ZERO_ADDRESS};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const CONTRACT: &str = "0xaaaa000000000000000000000000000000000001";
    const HOLDER: &str = "0xbeef00000000000000000000000000000000beef";

    fn word(n: u64) -> String {
        format!("{:064x}", n)
    }

    fn encode_string(s: &str) -> String {
        let mut padded = hex::encode(s.as_bytes());
        while padded.len() % 64 != 0 {
            padded.push('0');
        }
        format!("0x{}{}{}", word(32), word(s.len() as u64), padded)
    }

    fn transfer_log(block: u64, token: u64, from: &str) -> Value {
        json!({
            "address": CONTRACT,
            "topics": [
                TRANSFER_TOPIC,
                address_to_topic(from),
                address_to_topic(HOLDER),
                format!("0x{}", word(token)),
            ],
            "data": "0x",
            "blockNumber": abi::to_quantity(block),
            "transactionHash": format!("0x{:08x}{:08x}", block, token),
            "logIndex": "0x0"
        })
    }

    /// A tiny chain: fixed logs, a head block, and sub-ranges that fail on demand.
    struct FakeChain {
        logs: Vec<Value>,
        head: u64,
        token_uri: String,
        failing_from: Mutex<HashSet<u64>>,
        get_logs_calls: Mutex<Vec<(u64, u64)>>,
    }

    impl FakeChain {
        fn new(logs: Vec<Value>, head: u64, token_uri: &str) -> Self {
            Self {
                logs,
                head,
                token_uri: token_uri.to_string(),
                failing_from: Mutex::new(HashSet::new()),
                get_logs_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RpcTransport for FakeChain {
        async fn send(
            &self,
            _endpoint: &ProviderEndpoint,
            method: &str,
            params: &Value,
        ) -> std::result::Result<Value, CallError> {
            match method {
                "eth_blockNumber" => Ok(json!(abi::to_quantity(self.head))),
                "eth_getLogs" => {
                    let from = abi::parse_quantity(&params[0]["fromBlock"]).unwrap();
                    let to = abi::parse_quantity(&params[0]["toBlock"]).unwrap();
                    self.get_logs_calls.lock().unwrap().push((from, to));
                    if self.failing_from.lock().unwrap().contains(&from) {
                        return Err(CallError::Http { status: 500 });
                    }
                    let logs: Vec<Value> = self
                        .logs
                        .iter()
                        .filter(|log| {
                            let block = abi::parse_quantity(&log["blockNumber"]).unwrap();
                            block >= from && block <= to
                        })
                        .cloned()
                        .collect();
                    Ok(Value::Array(logs))
                }
                "eth_call" => Ok(json!(encode_string(&self.token_uri))),
                other => Err(CallError::Rpc {
                    code: -32601,
                    message: format!("method {} not found", other),
                }),
            }
        }
    }

    struct NoGateway;

    #[async_trait]
    impl ContentFetcher for NoGateway {
        async fn get(&self, _url: &str) -> std::result::Result<FetchedContent, CallError> {
            Err(CallError::Http { status: 504 })
        }
    }

    fn scanner_for(chain: Arc<FakeChain>, storage: Arc<RedbStorage>) -> EventScanner {
        let endpoints = vec![
            ProviderEndpoint::new("node", "http://node", ProviderKind::Rpc(Network::Ethereum), 0),
            ProviderEndpoint::new("gw", "http://gw", ProviderKind::Ipfs, 0),
        ];
        let pool = Arc::new(ProviderPool::new(endpoints, chain, BackoffPolicy::default()));
        let resolver = Arc::new(MetadataResolver::new(
            pool.clone(),
            Arc::new(NoGateway),
            storage.clone(),
            ResolverConfig::default(),
        ));
        EventScanner::new(pool, resolver, storage, ScannerConfig::default())
    }

    fn setup() -> (Arc<RedbStorage>, TrackedAddress, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(RedbStorage::open(temp.path().join("scan.redb")).unwrap());
        let tracked = TrackedAddress::new(CONTRACT, Network::Ethereum, 0);
        storage.put_tracked_address(&tracked).unwrap();
        (storage, tracked, temp)
    }

    #[tokio::test]
    async fn test_scan_walks_sub_ranges_and_checkpoints() {
        let (storage, tracked, _temp) = setup();
        let chain = Arc::new(FakeChain::new(
            vec![
                transfer_log(10, 1, ZERO_ADDRESS),
                transfer_log(2500, 2, ZERO_ADDRESS),
                transfer_log(4100, 1, HOLDER),
            ],
            4999,
            "data:application/json,{\"name\":\"Token\",\"attributes\":[{\"trait_type\":\"Mood\",\"value\":\"Calm\"}]}",
        ));
        let scanner = scanner_for(chain.clone(), storage.clone());

        let result = scanner
            .scan(&tracked, 0, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.to_block, 4999);
        assert_eq!(result.sub_ranges, 3);
        assert_eq!(result.inserted, 3);
        assert_eq!(
            *chain.get_logs_calls.lock().unwrap(),
            vec![(0, 1999), (2000, 3999), (4000, 4999)]
        );

        let stored = storage.get_tracked_address(Network::Ethereum, CONTRACT).unwrap().unwrap();
        assert_eq!(stored.last_scanned_block, Some(4999));

        let observations = storage.list_observations().unwrap();
        assert_eq!(observations.len(), 3);
        assert!(observations[0].is_mint);
        assert!(!observations[2].is_mint);
        assert_eq!(observations[0].title.as_deref(), Some("Token"));
        assert!(observations[0].tags.contains("mood:calm"));
        assert_eq!(observations[0].owner_address.as_deref(), Some(HOLDER));
        assert_eq!(observations[0].source_id, "rpc:ethereum");
    }

    #[tokio::test]
    async fn test_interrupted_scan_resumes_after_last_commit() {
        let (storage, tracked, _temp) = setup();
        let logs = vec![transfer_log(100, 1, ZERO_ADDRESS), transfer_log(2100, 2, ZERO_ADDRESS)];
        let chain = Arc::new(FakeChain::new(logs.clone(), 3999, "data:application/json,{}"));
        chain.failing_from.lock().unwrap().insert(2000);

        let err = scanner_for(chain, storage.clone())
            .scan(&tracked, 0, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let stored = storage.get_tracked_address(Network::Ethereum, CONTRACT).unwrap().unwrap();
        assert_eq!(stored.last_scanned_block, Some(1999));
        assert_eq!(stored.next_block(), 2000);
        assert_eq!(storage.count_observations().unwrap(), 1);

        // Fresh process: new pool, same database.
        let chain = Arc::new(FakeChain::new(logs, 3999, "data:application/json,{}"));
        let result = scanner_for(chain.clone(), storage.clone())
            .scan(&stored, stored.next_block(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*chain.get_logs_calls.lock().unwrap(), vec![(2000, 3999)]);
        assert_eq!(result.inserted, 1);
        assert_eq!(storage.count_observations().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rescan_inserts_nothing_new() {
        let (storage, tracked, _temp) = setup();
        let chain = Arc::new(FakeChain::new(
            vec![transfer_log(5, 9, ZERO_ADDRESS)],
            100,
            "data:application/json,{}",
        ));
        let scanner = scanner_for(chain, storage.clone());
        let cancel = CancellationToken::new();

        scanner.scan(&tracked, 0, None, &cancel).await.unwrap();
        let again = scanner.scan(&tracked, 0, None, &cancel).await.unwrap();
        assert_eq!(again.observations, 1);
        assert_eq!(again.inserted, 0);
        assert_eq!(storage.count_observations().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_metadata_schedules_retry() {
        let (storage, tracked, _temp) = setup();
        let chain = Arc::new(FakeChain::new(
            vec![transfer_log(7, 3, ZERO_ADDRESS)],
            10,
            "ipfs://QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG/3",
        ));
        let result = scanner_for(chain, storage.clone())
            .scan(&tracked, 0, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.inserted, 1);

        let observation = &storage.list_observations().unwrap()[0];
        assert!(observation.title.is_none());
        assert!(observation.metadata_uri.is_some());

        let retries = storage.list_content_retries().unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].observation_id, observation.id);
        assert_eq!(retries[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_cancelled_scan_commits_nothing() {
        let (storage, tracked, _temp) = setup();
        let chain = Arc::new(FakeChain::new(
            vec![transfer_log(5, 1, ZERO_ADDRESS)],
            100,
            "data:application/json,{}",
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scanner_for(chain, storage.clone())
            .scan(&tracked, 0, Some(100), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReliquaryError::Cancelled));
        assert_eq!(storage.count_observations().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_evm_network_is_unsupported() {
        let (storage, _tracked, _temp) = setup();
        let chain = Arc::new(FakeChain::new(vec![], 0, ""));
        let tracked = TrackedAddress::new("tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb", Network::Tezos, 0);

        let err = scanner_for(chain, storage)
            .scan(&tracked, 0, Some(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReliquaryError::UnsupportedNetwork(_)));
        assert!(err.is_surfaced());
    }

    #[tokio::test]
    async fn test_wallet_keeps_same_token_id_from_two_contracts_in_one_tx() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(RedbStorage::open(temp.path().join("wallet.redb")).unwrap());
        let wallet = TrackedAddress::new(HOLDER, Network::Ethereum, 0).with_role(AddressRole::Wallet);
        storage.put_tracked_address(&wallet).unwrap();

        let other_contract = "0xbbbb000000000000000000000000000000000002";
        let mut first = transfer_log(42, 1, ZERO_ADDRESS);
        let mut second = transfer_log(42, 1, ZERO_ADDRESS);
        second["address"] = json!(other_contract);
        second["logIndex"] = json!("0x1");
        first["transactionHash"] = json!("0xfeed");
        second["transactionHash"] = json!("0xfeed");

        let chain = Arc::new(FakeChain::new(vec![first, second], 50, "data:application/json,{}"));
        let result = scanner_for(chain, storage.clone())
            .scan(&wallet, 0, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.observations, 2);
        assert_eq!(result.inserted, 2);
        let contracts: HashSet<_> = storage
            .list_observations()
            .unwrap()
            .into_iter()
            .filter_map(|o| o.contract_address)
            .collect();
        assert_eq!(contracts, HashSet::from([CONTRACT.to_string(), other_contract.to_string()]));
    }

    #[test]
    fn test_wallet_filters_by_recipient() {
        let wallet = TrackedAddress::new(HOLDER, Network::Polygon, 0).with_role(AddressRole::Wallet);
        let filters = log_filters(&wallet, 16, 31);
        assert_eq!(filters.len(), 2);
        assert!(filters[0].get("address").is_none());
        assert_eq!(filters[0]["topics"][2], json!(address_to_topic(HOLDER)));
        assert_eq!(filters[1]["topics"][3], json!(address_to_topic(HOLDER)));
        assert_eq!(filters[1]["fromBlock"], json!("0x10"));

        let contract = TrackedAddress::new(CONTRACT, Network::Ethereum, 0);
        let filters = log_filters(&contract, 0, 1);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0]["address"], json!(CONTRACT));
    }
}
