use crate::provider::{parse_retry_after, CallError};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use std::time::Duration;

/// Body and declared type of one HTTP fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedContent {
    pub fn new(bytes: Vec<u8>, content_type: Option<String>) -> Self {
        Self {
            bytes,
            content_type,
        }
    }

    fn declared(&self) -> String {
        self.content_type
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase()
    }

    pub fn is_json(&self) -> bool {
        self.declared().contains("json") || serde_json::from_slice::<serde_json::Value>(&self.bytes).is_ok()
    }

    pub fn is_image(&self) -> bool {
        self.declared().starts_with("image/") || image::guess_format(&self.bytes).is_ok()
    }

    /// Gateways serve error pages with 200 now and then; only JSON or an
    /// image counts as the content we asked for.
    pub fn is_usable(&self) -> bool {
        !self.bytes.is_empty() && (self.is_json() || self.is_image())
    }
}

/// Fetches a URL. Gateways and direct metadata hosts go through this seam.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn get(&self, url: &str) -> std::result::Result<FetchedContent, CallError>;
}

pub struct HttpContentFetcher {
    client: Client,
}

impl HttpContentFetcher {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reliquary/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn get(&self, url: &str) -> std::result::Result<FetchedContent, CallError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            return Err(CallError::from_status(status, retry_after));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;

        Ok(FetchedContent::new(bytes.to_vec(), content_type))
    }
}
