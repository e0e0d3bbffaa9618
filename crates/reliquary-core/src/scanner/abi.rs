//! Just enough ABI handling to read NFT transfer logs and metadata pointers.

use crate::error::{ReliquaryError, Result};
use serde_json::Value;

/// `Transfer(address,address,uint256)`
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// `TransferSingle(address,address,address,uint256,uint256)`
pub const TRANSFER_SINGLE_TOPIC: &str =
    "0xc3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62";

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// `tokenURI(uint256)`
pub const TOKEN_URI_SELECTOR: &str = "c87b56dd";

/// `uri(uint256)`
pub const URI_SELECTOR: &str = "0e89341c";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStandard {
    Erc721,
    Erc1155,
}

/// A decoded NFT transfer log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub standard: TokenStandard,
    pub contract: String,
    pub from: String,
    pub to: String,
    /// Decimal token id
    pub token_id: String,
    /// Token id as a 64-char lowercase hex word
    pub token_word: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
}

impl TransferEvent {
    pub fn is_mint(&self) -> bool {
        self.from == ZERO_ADDRESS
    }

    /// `eth_call` data for the metadata pointer of this token.
    pub fn metadata_call_data(&self) -> String {
        let selector = match self.standard {
            TokenStandard::Erc721 => TOKEN_URI_SELECTOR,
            TokenStandard::Erc1155 => URI_SELECTOR,
        };
        format!("0x{}{}", selector, self.token_word)
    }

    /// ERC-1155 URIs may carry an `{id}` placeholder.
    pub fn expand_uri(&self, uri: &str) -> String {
        match self.standard {
            TokenStandard::Erc1155 => uri.replace("{id}", &self.token_word),
            TokenStandard::Erc721 => uri.to_string(),
        }
    }
}

pub fn to_quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

pub fn parse_quantity(value: &Value) -> Result<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| ReliquaryError::Validation(format!("expected hex quantity, got {}", value)))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ReliquaryError::Validation(format!("bad hex quantity {}: {}", s, e)))
}

fn strip_hex(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// 32-byte topic holding a left-padded address.
pub fn topic_to_address(topic: &str) -> Option<String> {
    let digits = strip_hex(topic);
    if digits.len() != 64 {
        return None;
    }
    Some(format!("0x{}", digits[24..].to_ascii_lowercase()))
}

pub fn address_to_topic(address: &str) -> String {
    format!("0x{:0>64}", strip_hex(address).to_ascii_lowercase())
}

/// Big-endian unsigned integer to decimal, by repeated division.
pub fn word_to_decimal(bytes: &[u8]) -> String {
    let mut digits = bytes.to_vec();
    let mut out = Vec::new();
    while digits.iter().any(|&b| b != 0) {
        let mut remainder: u32 = 0;
        for byte in digits.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            *byte = (acc / 10) as u8;
            remainder = acc % 10;
        }
        out.push(b'0' + remainder as u8);
    }
    if out.is_empty() {
        return "0".to_string();
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn word_at(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * 32..(index + 1) * 32)
}

fn word_as_usize(word: &[u8]) -> Option<usize> {
    // Offsets and lengths beyond 8 bytes are not meaningful here
    if word[..24].iter().any(|&b| b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(buf)).ok()
}

/// Decode an ABI-encoded dynamic `string` return value.
pub fn decode_abi_string(hex_data: &str) -> Option<String> {
    let data = hex::decode(strip_hex(hex_data)).ok()?;
    let offset = word_as_usize(word_at(&data, 0)?)?;
    let len_word = data.get(offset..offset + 32)?;
    let len = word_as_usize(len_word)?;
    let start = offset + 32;
    let bytes = data.get(start..start.checked_add(len)?)?;
    let s = String::from_utf8_lossy(bytes).trim_matches('\0').trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Decode an `eth_getLogs` entry into a transfer, if it is one we read.
pub fn decode_transfer(log: &Value) -> Option<TransferEvent> {
    let topics: Vec<&str> = log
        .get("topics")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    let contract = log.get("address")?.as_str()?.to_ascii_lowercase();
    let tx_hash = log.get("transactionHash")?.as_str()?.to_ascii_lowercase();
    let block_number = parse_quantity(log.get("blockNumber")?).ok()?;
    let log_index = log
        .get("logIndex")
        .and_then(|v| parse_quantity(v).ok())
        .unwrap_or(0);

    let topic0 = topics.first()?.to_ascii_lowercase();
    let (standard, from, to, token_word) = if topic0 == TRANSFER_TOPIC && topics.len() == 4 {
        // ERC-20 Transfer has 3 topics; only the indexed-tokenId form is an NFT
        (
            TokenStandard::Erc721,
            topic_to_address(topics[1])?,
            topic_to_address(topics[2])?,
            strip_hex(topics[3]).to_ascii_lowercase(),
        )
    } else if topic0 == TRANSFER_SINGLE_TOPIC && topics.len() == 4 {
        let data = strip_hex(log.get("data")?.as_str()?);
        if data.len() < 128 {
            return None;
        }
        (
            TokenStandard::Erc1155,
            topic_to_address(topics[2])?,
            topic_to_address(topics[3])?,
            data[..64].to_ascii_lowercase(),
        )
    } else {
        return None;
    };

    let token_id = word_to_decimal(&hex::decode(&token_word).ok()?);

    Some(TransferEvent {
        standard,
        contract,
        from,
        to,
        token_id,
        token_word,
        tx_hash,
        block_number,
        log_index,
    })
}
