use crate::dedup::similarity::is_generic_title;
use crate::types::{
    ArtifactObservation, ArtifactRecord, BlockchainId, PerceptualHash, RecordId, RecordStatus,
    ScrapeEntry,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};

/// Title shown when no member carries one.
pub const FALLBACK_TITLE: &str = "Untitled";

/// Longest non-generic title. Equal lengths resolve to the lexicographically
/// smallest, so the choice never depends on member order. Falls back to the
/// longest generic title, then to [`FALLBACK_TITLE`].
pub fn canonical_title<'a, I>(titles: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let titles: Vec<&str> = titles
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    let pick = |candidates: Vec<&'a str>| {
        candidates
            .into_iter()
            .min_by(|a, b| b.chars().count().cmp(&a.chars().count()).then_with(|| a.cmp(b)))
    };

    let specific: Vec<&str> = titles.iter().copied().filter(|t| !is_generic_title(t)).collect();
    pick(specific)
        .or_else(|| pick(titles))
        .unwrap_or(FALLBACK_TITLE)
        .to_string()
}

fn scrape_entry(observation: &ArtifactObservation) -> ScrapeEntry {
    ScrapeEntry {
        observed_at: observation.observed_at,
        source_id: observation.source_id.clone(),
        source_kind: observation.source_kind,
        network: observation.network,
    }
}

/// Build the record for one group.
///
/// `prior` holds the records this group already maps to, survivor first.
/// Everything they carry is kept: tags, URIs and history are unioned and
/// provenance is appended to, never replaced. A record without prior state
/// gets `record_id` and `now` as its creation time.
pub fn merge(
    record_id: RecordId,
    members: &[&ArtifactObservation],
    prior: &[ArtifactRecord],
    now: DateTime<Utc>,
) -> ArtifactRecord {
    let mut tags = BTreeSet::new();
    let mut source_uris = BTreeSet::new();
    let mut history = BTreeSet::new();
    let mut provenance = Vec::new();
    let mut seen = HashSet::new();
    let mut identities = BTreeSet::new();
    let mut titles: Vec<&str> = Vec::new();
    let mut perceptual_hash: Option<PerceptualHash> = None;

    for record in prior {
        tags.extend(record.tags.iter().cloned());
        source_uris.extend(record.source_uris.iter().cloned());
        history.extend(record.scrape_history.iter().cloned());
        identities.extend(record.blockchain_id.iter().cloned());
        if let RecordStatus::Conflicting { identities: held } = &record.status {
            identities.extend(held.iter().cloned());
        }
        if record.canonical_title != FALLBACK_TITLE {
            titles.push(&record.canonical_title);
        }
        perceptual_hash = perceptual_hash.or(record.perceptual_hash);
        for id in &record.merged_from_observation_ids {
            if seen.insert(id.as_str()) {
                provenance.push(id.clone());
            }
        }
    }

    let mut members: Vec<&ArtifactObservation> = members.to_vec();
    members.sort_by(|a, b| a.id.cmp(&b.id));
    for observation in &members {
        tags.extend(observation.tags.iter().map(|t| t.trim().to_lowercase()));
        source_uris.extend(observation.source_url.iter().cloned());
        source_uris.extend(observation.metadata_uri.iter().cloned());
        history.insert(scrape_entry(observation));
        identities.extend(observation.blockchain_id());
        titles.extend(observation.title.as_deref());
        perceptual_hash = perceptual_hash.or(observation.perceptual_hash);
        if seen.insert(observation.id.as_str()) {
            provenance.push(observation.id.clone());
        }
    }

    let identities: Vec<BlockchainId> = identities.into_iter().collect();
    let (blockchain_id, status) = match identities.len() {
        0 => (None, RecordStatus::Canonical),
        1 => (identities.into_iter().next(), RecordStatus::Canonical),
        _ => (None, RecordStatus::Conflicting { identities }),
    };

    let created_at = prior.first().map(|r| r.created_at).unwrap_or(now);

    ArtifactRecord {
        id: prior.first().map(|r| r.id).unwrap_or(record_id),
        canonical_title: canonical_title(titles),
        tags,
        source_uris,
        scrape_history: history.into_iter().collect(),
        blockchain_id,
        perceptual_hash,
        merged_from_observation_ids: provenance,
        status,
        created_at,
        updated_at: now,
    }
}

/// Equal apart from `updated_at`.
pub fn same_content(a: &ArtifactRecord, b: &ArtifactRecord) -> bool {
    a.id == b.id
        && a.canonical_title == b.canonical_title
        && a.tags == b.tags
        && a.source_uris == b.source_uris
        && a.scrape_history == b.scrape_history
        && a.blockchain_id == b.blockchain_id
        && a.perceptual_hash == b.perceptual_hash
        && a.merged_from_observation_ids == b.merged_from_observation_ids
        && a.status == b.status
}
