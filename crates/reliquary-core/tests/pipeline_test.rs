use async_trait::async_trait;
use reliquary_core::scanner::abi::{address_to_topic, parse_quantity, to_quantity, TRANSFER_TOPIC, ZERO_ADDRESS};
use reliquary_core::*;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const CONTRACT: &str = "0xaaaa000000000000000000000000000000000001";
const HOLDER: &str = "0xbeef00000000000000000000000000000000beef";
const META_CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

// ── Fakes ────────────────────────────────────────────────────────────────────

fn word(n: u64) -> String {
    format!("{:064x}", n)
}

fn abi_string(s: &str) -> String {
    let mut padded = hex::encode(s.as_bytes());
    while padded.len() % 64 != 0 {
        padded.push('0');
    }
    format!("0x{}{}{}", word(32), word(s.len() as u64), padded)
}

fn mint_log(block: u64, token: u64) -> Value {
    json!({
        "address": CONTRACT,
        "topics": [
            TRANSFER_TOPIC,
            address_to_topic(ZERO_ADDRESS),
            address_to_topic(HOLDER),
            format!("0x{}", word(token)),
        ],
        "data": "0x",
        "blockNumber": to_quantity(block),
        "transactionHash": format!("0x{:08x}{:08x}", block, token),
        "logIndex": "0x0"
    })
}

/// Chain with fixed logs. `eth_getLogs` fails for sub-ranges starting at a
/// block in `failing_from`, or for everything when `down` is set.
struct FakeChain {
    logs: Vec<Value>,
    head: u64,
    failing_from: HashSet<u64>,
    down: bool,
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl FakeChain {
    fn new(logs: Vec<Value>, head: u64) -> Self {
        Self {
            logs,
            head,
            failing_from: HashSet::new(),
            down: false,
            ranges: Mutex::new(Vec::new()),
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
        if self.down {
            return Err(CallError::Http { status: 503 });
        }
        match method {
            "eth_blockNumber" => Ok(json!(to_quantity(self.head))),
            "eth_getLogs" => {
                let from = parse_quantity(&params[0]["fromBlock"]).unwrap();
                let to = parse_quantity(&params[0]["toBlock"]).unwrap();
                self.ranges.lock().unwrap().push((from, to));
                if self.failing_from.contains(&from) {
                    return Err(CallError::Http { status: 500 });
                }
                Ok(Value::Array(
                    self.logs
                        .iter()
                        .filter(|log| {
                            let block = parse_quantity(&log["blockNumber"]).unwrap();
                            (from..=to).contains(&block)
                        })
                        .cloned()
                        .collect(),
                ))
            }
            "eth_call" => {
                let data = params[0]["data"].as_str().unwrap();
                let token = u64::from_str_radix(&data[data.len() - 16..], 16).unwrap();
                Ok(json!(abi_string(&format!("ipfs://{}/{}", META_CID, token))))
            }
            other => Err(CallError::Rpc {
                code: -32601,
                message: format!("{} not supported", other),
            }),
        }
    }
}

/// Gateway serving a metadata document for any token path.
struct Gateway;

#[async_trait]
impl ContentFetcher for Gateway {
    async fn get(&self, url: &str) -> std::result::Result<FetchedContent, CallError> {
        let name = match url.rsplit('/').next() {
            Some("1") => "Harbor at Dawn",
            _ => "Quiet Field Under Snow",
        };
        let body = json!({
            "name": name,
            "attributes": [{ "trait_type": "Series", "value": "Harbor" }]
        });
        Ok(FetchedContent::new(
            serde_json::to_vec(&body).unwrap(),
            Some("application/json".into()),
        ))
    }
}

struct ConfirmingPin {
    id: String,
    calls: Mutex<u32>,
}

#[async_trait]
impl PinProvider for ConfirmingPin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn pin(&self, content_id: &str) -> std::result::Result<PinReceipt, CallError> {
        *self.calls.lock().unwrap() += 1;
        Ok(PinReceipt {
            pin_id: format!("{}:{}", self.id, content_id),
            state: RemotePinState::Confirmed,
        })
    }

    fn accepts_uploads(&self) -> bool {
        true
    }

    async fn pin_upload(&self, content_id: &str, bytes: &[u8]) -> std::result::Result<PinReceipt, CallError> {
        assert_eq!(reliquary_core::resolver::raw_cid(bytes).unwrap(), content_id);
        self.pin(content_id).await
    }

    async fn status(&self, _pin_id: &str) -> std::result::Result<RemotePinState, CallError> {
        Ok(RemotePinState::Confirmed)
    }
}

fn pipeline(db: &Path, chain: Arc<FakeChain>, pin_providers: usize) -> Reliquary {
    let _ = env_logger::builder().is_test(true).try_init();
    let storage: Arc<dyn Storage> = Arc::new(RedbStorage::open(db).unwrap());
    let endpoints = vec![
        ProviderEndpoint::new("node", "http://node", ProviderKind::Rpc(Network::Ethereum), 0),
        ProviderEndpoint::new("gw", "http://gw", ProviderKind::Ipfs, 0),
    ];
    let pool = Arc::new(ProviderPool::new(endpoints, chain, BackoffPolicy::default()));
    let targets = (0..pin_providers)
        .map(|i| {
            let provider = Arc::new(ConfirmingPin {
                id: format!("pin{}", i),
                calls: Mutex::new(0),
            });
            PinTarget::new(provider, i as u32, 600)
        })
        .collect();
    let mut config = LibraryConfig::default();
    config.resolver.compute_perceptual_hash = false;
    Reliquary::new(storage, pool, Arc::new(Gateway), targets, config).unwrap()
}

// ── Provider failover over HTTP ──────────────────────────────────────────────

#[tokio::test]
async fn test_failover_to_third_provider_over_http() {
    let mut server = mockito::Server::new_async().await;
    let failing_1 = server.mock("POST", "/p1").with_status(500).create_async().await;
    let failing_2 = server.mock("POST", "/p2").with_status(500).create_async().await;
    let healthy = server
        .mock("POST", "/p3")
        .match_body(mockito::Matcher::PartialJson(json!({ "method": "eth_blockNumber" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x2a"}"#)
        .create_async()
        .await;

    let kind = ProviderKind::Rpc(Network::Ethereum);
    let endpoints = (1..=3)
        .map(|i| ProviderEndpoint::new(format!("p{}", i), format!("{}/p{}", server.url(), i), kind, i))
        .collect();
    let transport = Arc::new(HttpRpcTransport::new(Duration::from_secs(5)).unwrap());
    let pool = ProviderPool::new(endpoints, transport, BackoffPolicy::default());

    let head = pool.call(kind, "eth_blockNumber", json!([])).await.unwrap();
    assert_eq!(head, json!("0x2a"));

    let health = pool.health_snapshot();
    let failures = |id: &str| health.iter().find(|e| e.id == id).unwrap().consecutive_failures;
    assert_eq!(failures("p1"), 1);
    assert_eq!(failures("p2"), 1);
    assert_eq!(failures("p3"), 0);
    assert!(health.iter().find(|e| e.id == "p1").unwrap().backoff_until.is_some());

    failing_1.assert_async().await;
    failing_2.assert_async().await;
    healthy.assert_async().await;
}

// ── Checkpoint safety ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_resumes_after_last_committed_sub_range() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("reliquary.redb");
    let logs = vec![mint_log(100, 1), mint_log(2100, 2), mint_log(4100, 3)];

    let mut broken = FakeChain::new(logs.clone(), 4999);
    broken.failing_from.insert(2000);
    let tracked = {
        let reliquary = pipeline(&db, Arc::new(broken), 0);
        let tracked = reliquary.track_address(CONTRACT, None, Some("harbor".into()), 0).unwrap();
        let report = reliquary.trigger_sync(&tracked, &CancellationToken::new()).await.unwrap();
        assert!(matches!(report.status, SyncStatus::TemporarilyUnavailable { .. }));
        assert_eq!(report.to_block, Some(1999));
        tracked
    };

    // New process, same database
    let chain = Arc::new(FakeChain::new(logs, 4999));
    let reliquary = pipeline(&db, chain.clone(), 0);
    let report = reliquary.trigger_sync(&tracked, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.from_block, 2000);
    assert_eq!(report.to_block, Some(4999));
    assert_eq!(report.observations, 2);
    assert_eq!(*chain.ranges.lock().unwrap(), vec![(2000, 3999), (4000, 4999)]);

    let observations = reliquary.storage().list_observations().unwrap();
    let ids: HashSet<_> = observations.iter().map(|o| o.id.clone()).collect();
    assert_eq!(observations.len(), 3);
    assert_eq!(ids.len(), 3);
}

// ── Sync status ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unreachable_chain_reports_temporarily_unavailable() {
    let dir = tempdir().unwrap();
    let mut chain = FakeChain::new(vec![mint_log(1, 1)], 10);
    chain.down = true;
    let reliquary = pipeline(&dir.path().join("down.redb"), Arc::new(chain), 0);
    let tracked = reliquary.track_address(CONTRACT, None, None, 0).unwrap();
    let cancel = CancellationToken::new();

    let report = reliquary.trigger_sync(&tracked, &cancel).await.unwrap();
    let SyncStatus::TemporarilyUnavailable { retry_at, .. } = report.status else {
        panic!("expected temporarily unavailable, got {:?}", report.status);
    };
    assert!(retry_at > chrono::Utc::now());
    assert_eq!(report.to_block, None);
    assert_eq!(reliquary.retry_at(&tracked), Some(retry_at));

    // Backing off: the periodic sweep leaves it alone
    assert!(reliquary.sync_all(&cancel).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_address_validation_and_unsupported_networks() {
    let dir = tempdir().unwrap();
    let reliquary = pipeline(&dir.path().join("addr.redb"), Arc::new(FakeChain::new(vec![], 0)), 0);

    let err = reliquary.track_address("0x1234", None, None, 0).unwrap_err();
    assert!(matches!(err, ReliquaryError::InvalidAddressFormat { .. }));
    let err = reliquary
        .track_address(CONTRACT, Some(Network::Solana), None, 0)
        .unwrap_err();
    assert!(err.is_surfaced());

    let mixed_case = "0xAAAA000000000000000000000000000000000001";
    let tracked = reliquary.track_address(mixed_case, None, None, 0).unwrap();
    assert_eq!(tracked.address, CONTRACT);
    assert_eq!(tracked.network, Network::Ethereum);

    let solana = reliquary
        .track_address("7EcDhSYGxXyscszYEp35KHN8vvw3svAuLKTzXwCFLtV", None, None, 0)
        .unwrap();
    assert_eq!(solana.network, Network::Solana);
    let err = reliquary
        .trigger_sync(&solana, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReliquaryError::UnsupportedNetwork(_)));
}

// ── End to end ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_scan_dedup_and_pin() {
    let dir = tempdir().unwrap();
    let chain = Arc::new(FakeChain::new(vec![mint_log(5, 1), mint_log(9, 2)], 50));
    let reliquary = pipeline(&dir.path().join("e2e.redb"), chain, 4);
    let cancel = CancellationToken::new();

    let tracked = reliquary.track_address(CONTRACT, None, None, 0).unwrap();
    let reports = reliquary.sync_all(&cancel).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].observations, 2);
    assert_eq!(reports[0].address, tracked.address);

    // A gallery listing the first token under a placeholder title
    let scraped = ArtifactObservation::new("gallery", SourceKind::WebScrape, Network::Ethereum)
        .with_token(CONTRACT, "1")
        .with_title("Untitled")
        .with_tags(["seascape"]);
    assert!(reliquary.storage().append_observation(&scraped).unwrap());

    assert!(reliquary.has_new_observations().unwrap());
    let dedup = reliquary.run_dedup_pass().unwrap();
    assert_eq!(dedup.groups, 2);
    assert_eq!(dedup.records_created, 2);
    assert_eq!(dedup.conflicting, 0);
    assert!(!reliquary.has_new_observations().unwrap());

    let records = reliquary
        .list_artifact_records(ArtifactFilter::new().with_tag("seascape"))
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.canonical_title, "Harbor at Dawn");
    assert_eq!(record.merged_from_observation_ids.len(), 2);
    assert!(record.tags.contains("series:harbor"));

    let report = reliquary.process_pins(&cancel).await.unwrap();
    assert_eq!(report.abandoned, 0);
    assert!(report.healthy >= 3);

    let record_cid = record.document_cid().unwrap();
    assert!(record_cid.starts_with("bafkrei"));
    let pin = reliquary.get_pin_status(&record_cid).unwrap().unwrap();
    assert_eq!(pin.priority_tier, PinTier::CanonicalRecord);
    assert_eq!(pin.record_id, Some(record.id));
    assert_eq!(pin.status, PinStatus::Healthy);
    assert!(pin.confirmed_providers.len() >= 2);
    assert!(pin.confirmed_providers.is_subset(&pin.target_providers));

    let proof = reliquary.get_pin_status(META_CID).unwrap().unwrap();
    assert_eq!(proof.priority_tier, PinTier::OwnershipProof);
    assert_eq!(proof.status, PinStatus::Healthy);

    // A second pass over the same log changes nothing
    let again = reliquary.run_dedup_pass().unwrap();
    assert!(again.changed_records.is_empty());
    assert_eq!(again.group_diff.unchanged, 2);
}
