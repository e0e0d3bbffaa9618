//! Content identifiers: deriving them for documents we publish and checking
//! fetched bytes against the identifier they were requested by.

use crate::error::{ReliquaryError, Result};
use cid::multihash::Multihash;
use cid::Cid;
use sha2::{Digest, Sha256};

/// Multicodec for raw bytes (a single block, no UnixFS framing).
pub const RAW_CODEC: u64 = 0x55;
/// Multihash code for sha2-256.
pub const SHA2_256: u64 = 0x12;

/// CIDv1 of `bytes` as one raw sha2-256 block, base32 encoded.
pub fn raw_cid(bytes: &[u8]) -> Result<String> {
    let digest = Sha256::digest(bytes);
    let hash = Multihash::<64>::wrap(SHA2_256, &digest)
        .map_err(|e| ReliquaryError::Validation(format!("multihash: {}", e)))?;
    Ok(Cid::new_v1(RAW_CODEC, hash).to_string())
}

/// Outcome of checking fetched bytes against a CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidCheck {
    /// Raw sha2-256 CID and the digest matches.
    Verified,
    /// The CID names a DAG (dag-pb, UnixFS) or a hash we do not compute, so
    /// the served bytes are not the hashed block.
    Unverifiable,
    /// Raw sha2-256 CID and the digest differs.
    Mismatch,
}

pub fn check_bytes(cid: &str, bytes: &[u8]) -> CidCheck {
    let Ok(parsed) = Cid::try_from(cid) else {
        return CidCheck::Unverifiable;
    };
    let hash = parsed.hash();
    if parsed.codec() != RAW_CODEC || hash.code() != SHA2_256 {
        return CidCheck::Unverifiable;
    }
    if hash.digest() == Sha256::digest(bytes).as_slice() {
        CidCheck::Verified
    } else {
        CidCheck::Mismatch
    }
}
