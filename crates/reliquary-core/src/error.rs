use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReliquaryError>;

#[derive(Debug, Error)]
pub enum ReliquaryError {
    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage operation error: {0}")]
    StorageOperation(#[from] redb::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A single provider failed; the caller may fail over to the next one.
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// A provider asked us to slow down. Treated as a provider outage with
    /// a forced backoff.
    #[error("Provider {provider} rate limited")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// Every provider of a kind is in backoff or failed for this call.
    #[error("All {kind} providers unavailable ({attempted} attempted, {in_backoff} in backoff)")]
    AllProvidersExhausted {
        kind: String,
        attempted: usize,
        in_backoff: usize,
    },

    /// The provider is healthy but refused this particular request
    /// (malformed call, reverted contract call). Never failed over.
    #[error("Request rejected by {provider}: {code} {message}")]
    RequestRejected {
        provider: String,
        code: i64,
        message: String,
    },

    #[error("Invalid address format: {address} ({reason})")]
    InvalidAddressFormat { address: String, reason: String },

    #[error("Network {0} has no log-scanning backend")]
    UnsupportedNetwork(String),

    /// Every gateway was tried and none returned usable content.
    #[error("Content unavailable: {uri}")]
    ContentUnavailable { uri: String },

    /// Observations sharing a group disagree on immutable chain identity.
    #[error("Conflicting merge for record {record}: {reason}")]
    ConflictingMerge { record: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ReliquaryError {
    /// Returns `true` when the failed operation should be requeued rather
    /// than surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::RateLimited { .. }
                | Self::AllProvidersExhausted { .. }
                | Self::ContentUnavailable { .. }
                | Self::Http(_)
        )
    }

    /// Returns `true` for errors the caller must see and act on.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddressFormat { .. }
                | Self::ConflictingMerge { .. }
                | Self::UnsupportedNetwork(_)
                | Self::Validation(_)
        )
    }
}

/// Exponential requeue schedule for operations that failed with a transient
/// error: `base * 2^attempt`, capped at `max`.
pub fn requeue_at(
    now: DateTime<Utc>,
    attempt: u32,
    base: std::time::Duration,
    max: std::time::Duration,
) -> DateTime<Utc> {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    let delay_ms = (base.as_millis() as u64)
        .saturating_mul(factor)
        .min(max.as_millis() as u64);
    now + chrono::Duration::milliseconds(delay_ms as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_classification() {
        let err = ReliquaryError::AllProvidersExhausted {
            kind: "rpc:ethereum".into(),
            attempted: 3,
            in_backoff: 0,
        };
        assert!(err.is_transient());
        assert!(!err.is_surfaced());

        let err = ReliquaryError::InvalidAddressFormat {
            address: "nope".into(),
            reason: "unknown format".into(),
        };
        assert!(!err.is_transient());
        assert!(err.is_surfaced());
    }

    #[test]
    fn test_requeue_at_grows_and_caps() {
        let now = Utc::now();
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);

        assert_eq!(requeue_at(now, 0, base, max) - now, chrono::Duration::seconds(1));
        assert_eq!(requeue_at(now, 2, base, max) - now, chrono::Duration::seconds(4));
        assert_eq!(requeue_at(now, 8, base, max) - now, chrono::Duration::seconds(10));
        assert_eq!(requeue_at(now, 200, base, max) - now, chrono::Duration::seconds(10));
    }
}
