//! Chain identification from raw address strings.

use crate::error::{ReliquaryError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static EVM_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("valid regex"));
static FLOW_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{16}$").expect("valid regex"));
static TEZOS_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(tz1|tz2|tz3|KT1)[1-9A-HJ-NP-Za-km-z]{33}$").expect("valid regex")
});
static SOLANA_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Ethereum,
    Polygon,
    Base,
    Arbitrum,
    Optimism,
    Solana,
    Tezos,
    Flow,
    Unknown,
}

impl Network {
    pub const ALL: [Network; 8] = [
        Network::Ethereum,
        Network::Polygon,
        Network::Base,
        Network::Arbitrum,
        Network::Optimism,
        Network::Solana,
        Network::Tezos,
        Network::Flow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Polygon => "polygon",
            Network::Base => "base",
            Network::Arbitrum => "arbitrum",
            Network::Optimism => "optimism",
            Network::Solana => "solana",
            Network::Tezos => "tezos",
            Network::Flow => "flow",
            Network::Unknown => "unknown",
        }
    }

    /// EVM chains share address format and the ERC-721/1155 log layout.
    pub fn is_evm(&self) -> bool {
        matches!(
            self,
            Network::Ethereum
                | Network::Polygon
                | Network::Base
                | Network::Arbitrum
                | Network::Optimism
        )
    }

    /// Networks the event scanner can read logs from.
    pub fn supports_log_scanning(&self) -> bool {
        self.is_evm()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ReliquaryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(Network::Ethereum),
            "polygon" | "matic" => Ok(Network::Polygon),
            "base" => Ok(Network::Base),
            "arbitrum" | "arb" => Ok(Network::Arbitrum),
            "optimism" | "op" => Ok(Network::Optimism),
            "solana" | "sol" => Ok(Network::Solana),
            "tezos" | "tz" | "xtz" => Ok(Network::Tezos),
            "flow" => Ok(Network::Flow),
            other => Err(ReliquaryError::Validation(format!(
                "unknown network '{}'",
                other
            ))),
        }
    }
}

/// Split an optional `chain:` prefix off an address.
fn split_prefix(raw: &str) -> (Option<Network>, &str) {
    if let Some((prefix, rest)) = raw.split_once(':') {
        if let Ok(network) = prefix.parse::<Network>() {
            return (Some(network), rest);
        }
    }
    (None, raw)
}

/// The network named by a `chain:` prefix, if `raw` carries one.
pub fn chain_prefix(raw: &str) -> Option<Network> {
    split_prefix(raw.trim()).0
}

fn matches_format(body: &str, network: Network) -> bool {
    match network {
        n if n.is_evm() => EVM_ADDRESS.is_match(body),
        Network::Flow => FLOW_ADDRESS.is_match(body),
        Network::Tezos => TEZOS_ADDRESS.is_match(body),
        Network::Solana => SOLANA_ADDRESS.is_match(body),
        _ => false,
    }
}

/// Infer the network from an address string.
///
/// An explicit `chain:` prefix wins when the rest has that chain's format.
/// Otherwise the shape decides: a bare 20-byte hex address is taken to be
/// Ethereum, an 8-byte hex address is Flow, `tz1`/`tz2`/`tz3`/`KT1` is
/// Tezos, and any other base58 string of 32 to 44 characters is Solana.
///
/// The bare-hex guess is only a default. Callers that act on the result
/// should settle EVM addresses against the chains they can actually scan.
pub fn classify_address(raw: &str) -> Network {
    let raw = raw.trim();
    let (prefixed, body) = split_prefix(raw);
    if let Some(network) = prefixed {
        return if matches_format(body, network) {
            network
        } else {
            Network::Unknown
        };
    }

    if EVM_ADDRESS.is_match(body) {
        Network::Ethereum
    } else if FLOW_ADDRESS.is_match(body) {
        Network::Flow
    } else if TEZOS_ADDRESS.is_match(body) {
        Network::Tezos
    } else if SOLANA_ADDRESS.is_match(body) {
        Network::Solana
    } else {
        Network::Unknown
    }
}

/// Check `raw` against the address format of `network` and return its
/// normalized form (prefix stripped, EVM hex lowercased).
pub fn validate_address(raw: &str, network: Network) -> Result<String> {
    let trimmed = raw.trim();
    let (prefixed, body) = split_prefix(trimmed);
    let invalid = |reason: String| ReliquaryError::InvalidAddressFormat {
        address: raw.to_string(),
        reason,
    };

    if let Some(prefixed) = prefixed {
        if prefixed != network {
            return Err(invalid(format!(
                "prefix names {} but {} was requested",
                prefixed, network
            )));
        }
    }

    if network == Network::Unknown {
        return Err(invalid("network could not be determined".into()));
    }
    if !matches_format(body, network) {
        return Err(invalid(format!("not a valid {} address", network)));
    }

    if network.is_evm() || network == Network::Flow {
        Ok(body.to_ascii_lowercase())
    } else {
        Ok(body.to_string())
    }
}

/// Classify then validate in one step. Unknown formats fail.
pub fn parse_address(raw: &str) -> Result<(Network, String)> {
    let network = classify_address(raw);
    let normalized = validate_address(raw, network)?;
    Ok((network, normalized))
}
