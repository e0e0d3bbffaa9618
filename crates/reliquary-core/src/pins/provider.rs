//! Pinning backends behind one uniform seam.

use crate::provider::{parse_retry_after, CallError};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// What a provider reports for one pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePinState {
    Confirmed,
    Pending,
    Failed,
}

impl RemotePinState {
    /// Pinning Service API status string.
    pub fn from_api(status: &str) -> Self {
        match status {
            "pinned" => RemotePinState::Confirmed,
            "failed" => RemotePinState::Failed,
            _ => RemotePinState::Pending,
        }
    }
}

/// Acknowledgement of a pin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinReceipt {
    pub pin_id: String,
    pub state: RemotePinState,
}

#[async_trait]
pub trait PinProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Ask the provider to retain `content_id`.
    async fn pin(&self, content_id: &str) -> std::result::Result<PinReceipt, CallError>;

    /// Whether [`PinProvider::pin_upload`] can be used. Documents we author
    /// exist nowhere else on the network, so pinning them by CID alone
    /// would never complete.
    fn accepts_uploads(&self) -> bool;

    /// Upload `bytes`, check the provider derived `content_id` from them,
    /// then pin.
    async fn pin_upload(&self, content_id: &str, bytes: &[u8]) -> std::result::Result<PinReceipt, CallError>;

    /// Current state of an earlier request.
    async fn status(&self, pin_id: &str) -> std::result::Result<RemotePinState, CallError>;
}

#[derive(Debug, Deserialize)]
struct PinStatusBody {
    requestid: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct AddBody {
    #[serde(rename = "Hash")]
    hash: String,
}

/// IPFS Pinning Service API client (`POST /pins`, `GET /pins/{requestid}`).
///
/// With an upload URL, documents are first added through the Kubo RPC
/// `/api/v0/add` endpoint as a single raw CIDv1 block.
pub struct HttpPinProvider {
    id: String,
    base_url: String,
    upload_url: Option<String>,
    token: Option<String>,
    client: Client,
}

impl HttpPinProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reliquary/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            upload_url: None,
            token,
            client,
        })
    }

    pub fn with_upload_url(mut self, upload_url: impl Into<String>) -> Self {
        self.upload_url = Some(upload_url.into().trim_end_matches('/').to_string());
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_status(
        response: reqwest::Response,
    ) -> std::result::Result<PinStatusBody, CallError> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            return Err(CallError::from_status(status, retry_after));
        }
        response
            .json::<PinStatusBody>()
            .await
            .map_err(|e| CallError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PinProvider for HttpPinProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn pin(&self, content_id: &str) -> std::result::Result<PinReceipt, CallError> {
        let request = self
            .client
            .post(format!("{}/pins", self.base_url))
            .json(&json!({ "cid": content_id, "name": content_id }));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;
        let body = Self::read_status(response).await?;
        Ok(PinReceipt {
            pin_id: body.requestid,
            state: RemotePinState::from_api(&body.status),
        })
    }

    fn accepts_uploads(&self) -> bool {
        self.upload_url.is_some()
    }

    async fn pin_upload(&self, content_id: &str, bytes: &[u8]) -> std::result::Result<PinReceipt, CallError> {
        let upload_url = self
            .upload_url
            .as_deref()
            .ok_or_else(|| CallError::InvalidResponse(format!("{} has no upload endpoint", self.id)))?;
        let form = Form::new().part("file", Part::bytes(bytes.to_vec()).file_name("record.json"));
        let request = self
            .client
            .post(format!(
                "{}/api/v0/add?cid-version=1&raw-leaves=true&hash=sha2-256&pin=false",
                upload_url
            ))
            .multipart(form);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            return Err(CallError::from_status(status, retry_after));
        }
        let added = response
            .json::<AddBody>()
            .await
            .map_err(|e| CallError::InvalidResponse(e.to_string()))?;
        if added.hash != content_id {
            return Err(CallError::Integrity(format!(
                "{} stored upload as {}, expected {}",
                self.id, added.hash, content_id
            )));
        }
        self.pin(content_id).await
    }

    async fn status(&self, pin_id: &str) -> std::result::Result<RemotePinState, CallError> {
        let request = self.client.get(format!("{}/pins/{}", self.base_url, pin_id));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;
        let body = Self::read_status(response).await?;
        Ok(RemotePinState::from_api(&body.status))
    }
}
