//! Wire calls to a single endpoint and classification of their failures.

use crate::types::ProviderEndpoint;
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Failure of one call against one endpoint.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Bytes did not hash to the content identifier they were served for.
    #[error("content integrity: {0}")]
    Integrity(String),
}

impl CallError {
    /// Map a reqwest failure without leaking URLs or credentials into logs.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            CallError::Timeout
        } else if error.is_connect() {
            CallError::Connection("connection refused or unreachable".into())
        } else if error.is_decode() || error.is_body() {
            CallError::InvalidResponse("response body error".into())
        } else if let Some(status) = error.status() {
            CallError::from_status(status, None)
        } else {
            CallError::Connection("network error".into())
        }
    }

    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            CallError::RateLimited { retry_after }
        } else {
            CallError::Http {
                status: status.as_u16(),
            }
        }
    }

    /// JSON-RPC `error` object. `-32005` is the de-facto rate limit code.
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        if code == -32005 {
            CallError::RateLimited { retry_after: None }
        } else {
            CallError::Rpc {
                code,
                message: message.into(),
            }
        }
    }

    /// The request itself was bad. The endpoint is healthy and another
    /// endpoint would answer the same way.
    pub fn is_client_error(&self) -> bool {
        match self {
            CallError::Rpc { code, message } => {
                (-32602..=-32600).contains(code)
                    || *code == 3
                    || message.to_ascii_lowercase().contains("execution reverted")
            }
            CallError::Http { status } => matches!(status, 400 | 422),
            _ => false,
        }
    }
}

/// How far a failed attempt reaches: the request, the item on this
/// endpoint, or the endpoint itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// Every endpoint would reject it. Stop and surface.
    Request,
    /// This endpoint lacks the item. Try the next one, health untouched.
    Item,
    /// The endpoint is unhealthy. Back it off and try the next one.
    Endpoint,
}

impl CallError {
    /// Classification for JSON-RPC nodes.
    pub fn rpc_scope(&self) -> FailureScope {
        if self.is_client_error() {
            FailureScope::Request
        } else {
            FailureScope::Endpoint
        }
    }

    /// Classification for content gateways. Any non-2xx advances to the next
    /// gateway; only server-side trouble counts against gateway health.
    pub fn gateway_scope(&self) -> FailureScope {
        match self {
            CallError::Http { status } if *status < 500 => FailureScope::Item,
            CallError::Timeout | CallError::InvalidResponse(_) => FailureScope::Item,
            CallError::Http { .. } | CallError::Connection(_) | CallError::RateLimited { .. } => {
                FailureScope::Endpoint
            }
            // A gateway serving the wrong bytes for a CID is not to be trusted
            CallError::Integrity(_) | CallError::Rpc { .. } => FailureScope::Endpoint,
        }
    }
}

/// Parse `Retry-After` when given as delta-seconds.
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Sends one JSON-RPC request to one endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(
        &self,
        endpoint: &ProviderEndpoint,
        method: &str,
        params: &Value,
    ) -> std::result::Result<Value, CallError>;
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct HttpRpcTransport {
    client: Client,
    next_id: AtomicU64,
}

impl HttpRpcTransport {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .pool_idle_timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn send(
        &self,
        endpoint: &ProviderEndpoint,
        method: &str,
        params: &Value,
    ) -> std::result::Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&endpoint.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            return Err(CallError::from_status(status, retry_after));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CallError::InvalidResponse(e.to_string()))?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(CallError::from_rpc(code, message));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| CallError::InvalidResponse("missing result".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_classification() {
        assert!(CallError::from_rpc(-32602, "invalid params").is_client_error());
        assert!(CallError::from_rpc(3, "execution reverted: nonexistent token").is_client_error());
        assert!(CallError::from_rpc(-32000, "execution reverted").is_client_error());
        assert!(!CallError::from_rpc(-32603, "internal error").is_client_error());
        assert_eq!(
            CallError::from_rpc(-32005, "limit exceeded"),
            CallError::RateLimited { retry_after: None }
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            CallError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))),
            CallError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(!CallError::from_status(StatusCode::BAD_GATEWAY, None).is_client_error());
        assert!(!CallError::from_status(StatusCode::NOT_FOUND, None).is_client_error());
        assert!(CallError::from_status(StatusCode::BAD_REQUEST, None).is_client_error());
    }

    #[test]
    fn test_gateway_scope_never_rejects() {
        let bad_request = CallError::from_status(StatusCode::BAD_REQUEST, None);
        assert_eq!(bad_request.rpc_scope(), FailureScope::Request);
        assert_eq!(bad_request.gateway_scope(), FailureScope::Item);

        assert_eq!(CallError::Http { status: 404 }.gateway_scope(), FailureScope::Item);
        assert_eq!(CallError::Http { status: 410 }.gateway_scope(), FailureScope::Item);
        assert_eq!(CallError::Timeout.gateway_scope(), FailureScope::Item);
        assert_eq!(CallError::Http { status: 502 }.gateway_scope(), FailureScope::Endpoint);
        assert_eq!(
            CallError::RateLimited { retry_after: None }.gateway_scope(),
            FailureScope::Endpoint
        );
        assert_eq!(
            CallError::Connection("refused".into()).gateway_scope(),
            FailureScope::Endpoint
        );
        assert_eq!(
            CallError::Integrity("digest mismatch".into()).gateway_scope(),
            FailureScope::Endpoint
        );
    }
}
