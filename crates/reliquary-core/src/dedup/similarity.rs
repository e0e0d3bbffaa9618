use crate::dedup::config::DedupConfig;
use crate::types::{ArtifactObservation, BlockchainId, MatchReason, ObservationId, PerceptualHash};
use regex::Regex;
use std::sync::LazyLock;

/// Placeholder titles that say nothing about the artifact.
const GENERIC_TITLES: &[&str] = &[
    "untitled",
    "no title",
    "unnamed",
    "artwork",
    "new artwork",
    "image",
    "photo",
    "nft",
    "token",
    "asset",
];

static FILENAME_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\S+\.(png|jpe?g|gif|webp|svg|bmp|tiff?|mp4|mov|json)|(img|dsc|dscn|image|photo|screenshot)[\s_-]?\d+)$")
        .expect("valid regex")
});

static NUMBERED_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(token\s*)?#?\d+$").expect("valid regex"));

/// Lowercase, punctuation folded to spaces, whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a raw title is a placeholder rather than a name.
pub fn is_generic_title(title: &str) -> bool {
    let trimmed = title.trim();
    if trimmed.is_empty() || FILENAME_TITLE.is_match(trimmed) {
        return true;
    }
    let normalized = normalize_title(trimmed);
    normalized.is_empty()
        || GENERIC_TITLES.contains(&normalized.as_str())
        || NUMBERED_TITLE.is_match(&normalized)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Edit-distance ratio of two already-normalized titles, in `[0, 1]`.
pub fn title_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f32 / longest as f32
}

fn normalize_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// The comparable features of one observation, computed once per pass.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub id: ObservationId,
    pub blockchain_id: Option<BlockchainId>,
    pub perceptual_hash: Option<PerceptualHash>,
    /// `None` for missing or generic titles; those never link.
    pub title: Option<String>,
    pub source_url: Option<String>,
}

impl Fingerprint {
    pub fn of(observation: &ArtifactObservation) -> Self {
        Self {
            id: observation.id.clone(),
            blockchain_id: observation.blockchain_id(),
            perceptual_hash: observation.perceptual_hash,
            title: observation
                .title
                .as_deref()
                .filter(|t| !is_generic_title(t))
                .map(normalize_title),
            source_url: observation.source_url.as_deref().and_then(normalize_url),
        }
    }
}

/// First rule that links `a` and `b`, in order of strength.
pub fn match_reason(a: &Fingerprint, b: &Fingerprint, config: &DedupConfig) -> Option<MatchReason> {
    if let (Some(x), Some(y)) = (&a.blockchain_id, &b.blockchain_id) {
        if x == y {
            return Some(MatchReason::BlockchainIdentity);
        }
    }

    if let (Some(x), Some(y)) = (&a.perceptual_hash, &b.perceptual_hash) {
        let distance = x.hamming_distance(y);
        if distance <= config.phash_threshold {
            return Some(MatchReason::PerceptualHash { distance });
        }
    }

    if let (Some(x), Some(y)) = (&a.title, &b.title) {
        let score = title_similarity(x, y);
        if score >= config.title_similarity {
            return Some(MatchReason::TitleSimilarity { score });
        }
    }

    match (&a.source_url, &b.source_url) {
        (Some(x), Some(y)) if x == y => Some(MatchReason::SourceUrl),
        _ => None,
    }
}
