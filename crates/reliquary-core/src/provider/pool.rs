use crate::error::{requeue_at, ReliquaryError, Result};
use crate::provider::transport::{CallError, FailureScope, RpcTransport};
use crate::storage::Storage;
use crate::types::{ProviderEndpoint, ProviderKind};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Exponential backoff applied to failing endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn backoff_until(&self, now: DateTime<Utc>, consecutive_failures: u32) -> DateTime<Utc> {
        requeue_at(now, consecutive_failures, self.base, self.max)
    }
}

/// Ordered set of interchangeable endpoints with per-endpoint health.
///
/// Endpoint state lives under one lock that is never held across an await;
/// each attempt takes a snapshot, calls out, then reports back.
pub struct ProviderPool {
    endpoints: Mutex<Vec<ProviderEndpoint>>,
    transport: Arc<dyn RpcTransport>,
    backoff: BackoffPolicy,
    attempt_timeout: Option<Duration>,
    rotation: AtomicUsize,
}

impl ProviderPool {
    pub fn new(
        endpoints: Vec<ProviderEndpoint>,
        transport: Arc<dyn RpcTransport>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            endpoints: Mutex::new(endpoints),
            transport,
            backoff,
            attempt_timeout: None,
            rotation: AtomicUsize::new(0),
        }
    }

    /// Bound each attempt; an attempt that overruns counts as a timeout failure.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProviderEndpoint>> {
        // A panic while holding the lock leaves counters consistent, so recover.
        self.endpoints.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an endpoint at runtime. Ids are unique; re-adding replaces the URL
    /// and priority but keeps health.
    pub fn add_endpoint(&self, endpoint: ProviderEndpoint) {
        let mut endpoints = self.lock();
        match endpoints.iter_mut().find(|e| e.id == endpoint.id) {
            Some(existing) => {
                existing.base_url = endpoint.base_url;
                existing.priority = endpoint.priority;
                existing.kind = endpoint.kind;
            }
            None => endpoints.push(endpoint),
        }
    }

    /// Point-in-time copy of every endpoint and its health.
    pub fn health_snapshot(&self) -> Vec<ProviderEndpoint> {
        let mut snapshot = self.lock().clone();
        snapshot.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.priority.cmp(&b.priority)).then(a.id.cmp(&b.id)));
        snapshot
    }

    pub fn endpoints_of(&self, kind: ProviderKind) -> Vec<ProviderEndpoint> {
        self.health_snapshot()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn has_kind(&self, kind: ProviderKind) -> bool {
        self.lock().iter().any(|e| e.kind == kind)
    }

    /// Endpoints of `kind` in attempt order: ascending priority, rotating
    /// within a priority tier so equal endpoints share load.
    fn attempt_order(&self, kind: ProviderKind) -> Vec<ProviderEndpoint> {
        let mut candidates: Vec<ProviderEndpoint> = self
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

        let turn = self.rotation.fetch_add(1, Ordering::Relaxed);
        let mut ordered = Vec::with_capacity(candidates.len());
        let mut start = 0;
        while start < candidates.len() {
            let priority = candidates[start].priority;
            let end = candidates[start..]
                .iter()
                .position(|e| e.priority != priority)
                .map(|offset| start + offset)
                .unwrap_or(candidates.len());
            let tier = &candidates[start..end];
            let shift = turn % tier.len();
            ordered.extend(tier[shift..].iter().cloned());
            ordered.extend(tier[..shift].iter().cloned());
            start = end;
        }
        ordered
    }

    pub fn record_success(&self, id: &str) {
        let now = Utc::now();
        let mut endpoints = self.lock();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == id) {
            if endpoint.consecutive_failures > 0 {
                log::info!(
                    "Provider {} recovered after {} consecutive failures",
                    endpoint.id,
                    endpoint.consecutive_failures
                );
            }
            endpoint.consecutive_failures = 0;
            endpoint.backoff_until = None;
            endpoint.last_success_at = Some(now);
            endpoint.total_calls += 1;
        }
    }

    pub fn record_failure(&self, id: &str, error: &CallError) {
        let now = Utc::now();
        let mut endpoints = self.lock();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.consecutive_failures = endpoint.consecutive_failures.saturating_add(1);
            endpoint.total_calls += 1;
            endpoint.total_failures += 1;
            endpoint.last_error = Some(error.to_string());

            let mut until = self.backoff.backoff_until(now, endpoint.consecutive_failures);
            if let CallError::RateLimited {
                retry_after: Some(retry_after),
            } = error
            {
                let requested = now + chrono::Duration::milliseconds(retry_after.as_millis() as i64);
                until = until.max(requested);
            }
            endpoint.backoff_until = Some(until);

            log::warn!(
                "Provider {} failed ({}), failures={}, backing off until {}",
                endpoint.id,
                error,
                endpoint.consecutive_failures,
                until
            );
        }
    }

    /// Count a call that missed an item without holding it against the endpoint.
    fn record_miss(&self, id: &str, error: &CallError) {
        let mut endpoints = self.lock();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.total_calls += 1;
            log::debug!("Provider {} missed item ({}), trying next", endpoint.id, error);
        }
    }

    /// Run `op` against endpoints of `kind` until one succeeds, classifying
    /// failures as JSON-RPC errors.
    ///
    /// Endpoints in backoff are skipped. A failure advances the endpoint's
    /// backoff and moves on to the next candidate. A client error is
    /// returned at once without penalizing the endpoint.
    pub async fn call_with<T, F, Fut>(&self, kind: ProviderKind, op: F) -> Result<T>
    where
        F: FnMut(ProviderEndpoint) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        self.call_scoped(kind, CallError::rpc_scope, op).await
    }

    /// Like [`call_with`](Self::call_with), with `scope` deciding whether a
    /// failure stops the call, skips to the next endpoint, or backs the
    /// endpoint off.
    pub async fn call_scoped<T, F, Fut>(
        &self,
        kind: ProviderKind,
        scope: fn(&CallError) -> FailureScope,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(ProviderEndpoint) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let now = Utc::now();
        let mut attempted = 0;
        let mut in_backoff = 0;

        for endpoint in self.attempt_order(kind) {
            if endpoint.is_in_backoff(now) {
                in_backoff += 1;
                continue;
            }
            attempted += 1;
            let id = endpoint.id.clone();

            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op(endpoint)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CallError::Timeout),
                },
                None => op(endpoint).await,
            };

            let error = match outcome {
                Ok(value) => {
                    self.record_success(&id);
                    return Ok(value);
                }
                Err(error) => error,
            };

            match scope(&error) {
                FailureScope::Request => {
                    self.record_success(&id);
                    let (code, message) = match error {
                        CallError::Rpc { code, message } => (code, message),
                        CallError::Http { status } => (i64::from(status), format!("HTTP {}", status)),
                        other => (0, other.to_string()),
                    };
                    return Err(ReliquaryError::RequestRejected {
                        provider: id,
                        code,
                        message,
                    });
                }
                FailureScope::Item => self.record_miss(&id, &error),
                FailureScope::Endpoint => self.record_failure(&id, &error),
            }
        }

        log::warn!(
            "All {} providers exhausted: {} attempted, {} in backoff",
            kind,
            attempted,
            in_backoff
        );
        Err(ReliquaryError::AllProvidersExhausted {
            kind: kind.to_string(),
            attempted,
            in_backoff,
        })
    }

    /// JSON-RPC call through the pool's transport.
    pub async fn call(&self, kind: ProviderKind, method: &str, params: Value) -> Result<Value> {
        let transport = Arc::clone(&self.transport);
        let params = Arc::new(params);
        self.call_with(kind, |endpoint| {
            let transport = Arc::clone(&transport);
            let params = Arc::clone(&params);
            let method = method.to_string();
            async move { transport.send(&endpoint, &method, &params).await }
        })
        .await
    }

    /// Write current health to storage so restarts keep backoff state.
    pub fn persist_health(&self, storage: &dyn Storage) -> Result<()> {
        storage.put_provider_health(&self.health_snapshot())
    }

    /// Re-apply health saved by [`persist_health`](Self::persist_health) to
    /// endpoints that still exist. Configuration stays authoritative for URL
    /// and priority.
    pub fn restore_health(&self, storage: &dyn Storage) -> Result<usize> {
        let saved = storage.list_provider_health()?;
        let mut endpoints = self.lock();
        let mut restored = 0;
        for saved in saved {
            if let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == saved.id) {
                endpoint.consecutive_failures = saved.consecutive_failures;
                endpoint.backoff_until = saved.backoff_until;
                endpoint.last_error = saved.last_error;
                endpoint.last_success_at = saved.last_success_at;
                endpoint.total_calls = saved.total_calls;
                endpoint.total_failures = saved.total_failures;
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};

    const RPC: ProviderKind = ProviderKind::Rpc(Network::Ethereum);

    /// Answers per endpoint id from a script; unscripted calls succeed.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<HashMap<String, VecDeque<std::result::Result<Value, CallError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn push(&self, id: &str, outcome: std::result::Result<Value, CallError>) {
            self.script
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default()
                .push_back(outcome);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn send(
            &self,
            endpoint: &ProviderEndpoint,
            _method: &str,
            _params: &Value,
        ) -> std::result::Result<Value, CallError> {
            self.calls.lock().unwrap().push(endpoint.id.clone());
            self.script
                .lock()
                .unwrap()
                .get_mut(&endpoint.id)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Ok(json!(endpoint.id)))
        }
    }

    fn pool_with(priorities: &[(&str, u32)], transport: Arc<ScriptedTransport>) -> ProviderPool {
        let endpoints = priorities
            .iter()
            .map(|(id, p)| ProviderEndpoint::new(*id, format!("http://{}", id), RPC, *p))
            .collect();
        ProviderPool::new(endpoints, transport, BackoffPolicy::default())
    }

    #[tokio::test]
    async fn test_fails_over_in_priority_order() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push("p1", Err(CallError::Http { status: 500 }));
        transport.push("p2", Err(CallError::Timeout));
        let pool = pool_with(&[("p1", 0), ("p2", 1), ("p3", 2)], transport.clone());

        let result = pool.call(RPC, "eth_blockNumber", json!([])).await.unwrap();
        assert_eq!(result, json!("p3"));
        assert_eq!(transport.calls(), vec!["p1", "p2", "p3"]);

        let health = pool.health_snapshot();
        let by_id: HashMap<_, _> = health.iter().map(|e| (e.id.as_str(), e)).collect();
        assert_eq!(by_id["p1"].consecutive_failures, 1);
        assert!(by_id["p1"].backoff_until.is_some());
        assert_eq!(by_id["p2"].consecutive_failures, 1);
        assert_eq!(by_id["p3"].consecutive_failures, 0);
        assert!(by_id["p3"].backoff_until.is_none());
    }

    #[tokio::test]
    async fn test_skips_endpoints_in_backoff() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push("p1", Err(CallError::Http { status: 503 }));
        let pool = pool_with(&[("p1", 0), ("p2", 1)], transport.clone());

        pool.call(RPC, "eth_blockNumber", json!([])).await.unwrap();
        pool.call(RPC, "eth_blockNumber", json!([])).await.unwrap();

        // Second call goes straight to p2
        assert_eq!(transport.calls(), vec!["p1", "p2", "p2"]);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_counts() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push("p1", Err(CallError::Http { status: 500 }));
        transport.push("p2", Err(CallError::Connection("refused".into())));
        let pool = pool_with(&[("p1", 0), ("p2", 1)], transport.clone());

        let err = pool.call(RPC, "eth_getLogs", json!([])).await.unwrap_err();
        assert!(matches!(
            err,
            ReliquaryError::AllProvidersExhausted { attempted: 2, in_backoff: 0, .. }
        ));
        assert!(err.is_transient());

        let err = pool.call(RPC, "eth_getLogs", json!([])).await.unwrap_err();
        assert!(matches!(
            err,
            ReliquaryError::AllProvidersExhausted { attempted: 0, in_backoff: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_client_errors_do_not_penalize() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push("p1", Err(CallError::from_rpc(-32602, "invalid params")));
        let pool = pool_with(&[("p1", 0), ("p2", 1)], transport.clone());

        let err = pool.call(RPC, "eth_call", json!([])).await.unwrap_err();
        assert!(matches!(err, ReliquaryError::RequestRejected { code: -32602, .. }));
        assert_eq!(transport.calls(), vec!["p1"]);
        assert_eq!(pool.endpoints_of(RPC)[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let transport = Arc::new(ScriptedTransport::default());
        let pool = ProviderPool::new(
            vec![ProviderEndpoint::new("p1", "http://p1", RPC, 0)],
            transport.clone(),
            BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
        );
        transport.push("p1", Err(CallError::Http { status: 502 }));
        assert!(pool.call(RPC, "m", json!([])).await.is_err());
        assert_eq!(pool.endpoints_of(RPC)[0].consecutive_failures, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.call(RPC, "m", json!([])).await.unwrap();
        let endpoint = &pool.endpoints_of(RPC)[0];
        assert_eq!(endpoint.consecutive_failures, 0);
        assert!(endpoint.backoff_until.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(
            "p1",
            Err(CallError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            }),
        );
        let pool = pool_with(&[("p1", 0)], transport.clone());

        let err = pool.call(RPC, "m", json!([])).await.unwrap_err();
        assert!(err.is_transient());
        let until = pool.endpoints_of(RPC)[0].backoff_until.unwrap();
        assert!(until > Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_equal_priorities_rotate() {
        let transport = Arc::new(ScriptedTransport::default());
        let pool = pool_with(&[("a", 0), ("b", 0)], transport.clone());

        pool.call(RPC, "m", json!([])).await.unwrap();
        pool.call(RPC, "m", json!([])).await.unwrap();
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0], calls[1]);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        struct Slow;
        #[async_trait]
        impl RpcTransport for Slow {
            async fn send(
                &self,
                _endpoint: &ProviderEndpoint,
                _method: &str,
                _params: &Value,
            ) -> std::result::Result<Value, CallError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }
        }

        let pool = ProviderPool::new(
            vec![ProviderEndpoint::new("slow", "http://slow", RPC, 0)],
            Arc::new(Slow),
            BackoffPolicy::default(),
        )
        .with_attempt_timeout(Duration::from_millis(10));

        let err = pool.call(RPC, "m", json!([])).await.unwrap_err();
        assert!(matches!(err, ReliquaryError::AllProvidersExhausted { .. }));
        assert_eq!(
            pool.endpoints_of(RPC)[0].last_error.as_deref(),
            Some("request timed out")
        );
    }

    #[tokio::test]
    async fn test_health_persists_across_pools() {
        let temp = tempfile::TempDir::new().unwrap();
        let storage = crate::storage::RedbStorage::open(temp.path().join("h.redb")).unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        transport.push("p1", Err(CallError::Http { status: 500 }));
        let pool = pool_with(&[("p1", 0), ("p2", 1)], transport.clone());
        pool.call(RPC, "m", json!([])).await.unwrap();
        pool.persist_health(&storage).unwrap();

        let fresh = pool_with(&[("p1", 0), ("p2", 1)], Arc::new(ScriptedTransport::default()));
        assert_eq!(fresh.restore_health(&storage).unwrap(), 2);
        let p1 = fresh.endpoints_of(RPC).into_iter().find(|e| e.id == "p1").unwrap();
        assert_eq!(p1.consecutive_failures, 1);
        assert!(p1.backoff_until.is_some());
    }
}
