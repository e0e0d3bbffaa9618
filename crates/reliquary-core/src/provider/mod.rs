//! Failover across interchangeable RPC nodes, IPFS gateways and pinning services.

mod pool;
mod transport;

pub use pool::{BackoffPolicy, ProviderPool};
pub use transport::{parse_retry_after, CallError, FailureScope, HttpRpcTransport, RpcTransport};
