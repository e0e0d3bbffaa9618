//! Where a metadata or media URI points and how to reach it.

use crate::error::{ReliquaryError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLocator {
    /// Content-addressed; reachable through any gateway.
    Ipfs { cid: String, path: String },
    /// Plain web URL, fetched directly.
    Http(String),
    /// Inline `data:` URI, already decoded.
    Inline {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
}

impl ContentLocator {
    /// Stable cache key. Inline content is never cached.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            ContentLocator::Ipfs { cid, path } => Some(format!("ipfs://{}{}", cid, path)),
            ContentLocator::Http(url) => Some(url.clone()),
            ContentLocator::Inline { .. } => None,
        }
    }

    /// Gateway URL for an IPFS locator.
    pub fn gateway_url(&self, gateway_base: &str) -> Option<String> {
        match self {
            ContentLocator::Ipfs { cid, path } => Some(format!(
                "{}/ipfs/{}{}",
                gateway_base.trim_end_matches('/'),
                cid,
                path
            )),
            _ => None,
        }
    }
}

fn looks_like_cid(s: &str) -> bool {
    (s.starts_with("Qm") && s.len() == 46) || (s.starts_with("baf") && s.len() > 50)
}

fn split_cid(rest: &str) -> (String, String) {
    match rest.find(['/', '?', '#']) {
        Some(i) => (rest[..i].to_string(), rest[i..].to_string()),
        None => (rest.to_string(), String::new()),
    }
}

/// Percent-decode a `data:` payload. Invalid escapes are kept verbatim.
fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = hex {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn parse_data_uri(uri: &str) -> Result<ContentLocator> {
    let rest = &uri["data:".len()..];
    let (header, payload) = rest.split_once(',').ok_or_else(|| {
        ReliquaryError::Validation(format!("malformed data URI: {}", truncate(uri)))
    })?;

    let is_base64 = header.ends_with(";base64");
    let media = header.trim_end_matches(";base64");
    let content_type = media
        .split(';')
        .next()
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let bytes = if is_base64 {
        STANDARD.decode(payload.trim()).map_err(|e| {
            ReliquaryError::Validation(format!("invalid base64 in data URI: {}", e))
        })?
    } else {
        percent_decode(payload)
    };

    Ok(ContentLocator::Inline {
        bytes,
        content_type,
    })
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(64) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Classify a URI taken from token metadata.
pub fn parse_content_uri(uri: &str) -> Result<ContentLocator> {
    let uri = uri.trim();

    if let Some(rest) = uri.strip_prefix("ipfs://") {
        let rest = rest.strip_prefix("ipfs/").unwrap_or(rest);
        let (cid, path) = split_cid(rest);
        if cid.is_empty() {
            return Err(ReliquaryError::Validation(format!("empty CID in {}", uri)));
        }
        return Ok(ContentLocator::Ipfs { cid, path });
    }

    if uri.starts_with("data:") {
        return parse_data_uri(uri);
    }

    if uri.starts_with("https://") || uri.starts_with("http://") {
        // Public gateway links are re-routed through the configured gateways
        if let Some(idx) = uri.find("/ipfs/") {
            let (cid, path) = split_cid(&uri[idx + "/ipfs/".len()..]);
            if looks_like_cid(&cid) {
                return Ok(ContentLocator::Ipfs { cid, path });
            }
        }
        return Ok(ContentLocator::Http(uri.to_string()));
    }

    let (cid, path) = split_cid(uri);
    if looks_like_cid(&cid) {
        return Ok(ContentLocator::Ipfs { cid, path });
    }

    Err(ReliquaryError::Validation(format!(
        "unsupported content URI: {}",
        truncate(uri)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    #[test]
    fn test_ipfs_scheme_variants() {
        let expected = ContentLocator::Ipfs {
            cid: CID.into(),
            path: "/1.json".into(),
        };
        assert_eq!(parse_content_uri(&format!("ipfs://{}/1.json", CID)).unwrap(), expected);
        assert_eq!(parse_content_uri(&format!("ipfs://ipfs/{}/1.json", CID)).unwrap(), expected);
        assert_eq!(
            parse_content_uri(&format!("https://ipfs.io/ipfs/{}/1.json", CID)).unwrap(),
            expected
        );
    }

    #[test]
    fn test_plain_https_is_direct() {
        let locator = parse_content_uri("https://api.example.com/token/7").unwrap();
        assert_eq!(locator, ContentLocator::Http("https://api.example.com/token/7".into()));
        assert_eq!(locator.gateway_url("https://gw"), None);
    }

    #[test]
    fn test_data_uris() {
        let encoded = STANDARD.encode(br#"{"name":"Inline"}"#);
        let locator = parse_content_uri(&format!("data:application/json;base64,{}", encoded)).unwrap();
        assert_eq!(
            locator,
            ContentLocator::Inline {
                bytes: br#"{"name":"Inline"}"#.to_vec(),
                content_type: Some("application/json".into()),
            }
        );
        assert_eq!(locator.cache_key(), None);

        let locator = parse_content_uri("data:application/json,%7B%22name%22%3A%22x%22%7D").unwrap();
        match locator {
            ContentLocator::Inline { bytes, .. } => assert_eq!(bytes, br#"{"name":"x"}"#.to_vec()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gateway_url() {
        let locator = parse_content_uri(&format!("ipfs://{}", CID)).unwrap();
        assert_eq!(
            locator.gateway_url("https://gw.example/"),
            Some(format!("https://gw.example/ipfs/{}", CID))
        );
        assert_eq!(locator.cache_key(), Some(format!("ipfs://{}", CID)));
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(parse_content_uri("ar://abc").is_err());
        assert!(parse_content_uri("ipfs://").is_err());
    }
}
