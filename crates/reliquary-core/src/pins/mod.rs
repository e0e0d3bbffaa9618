//! Tiered pinning with per-provider redundancy.
//!
//! Items are pinned in [`PinTier`](crate::types::PinTier) order. The two
//! highest tiers must be confirmed by at least `min_redundancy` distinct
//! providers before they count as healthy; lower tiers are best effort on
//! the primary provider.

mod manager;
mod provider;
mod queue;
mod rate_limit;

pub use manager::{PinConfig, PinManager, PinTarget, ProcessReport};
pub use provider::{HttpPinProvider, PinProvider, PinReceipt, RemotePinState};
pub use queue::PinQueue;
pub use rate_limit::TokenBucket;
