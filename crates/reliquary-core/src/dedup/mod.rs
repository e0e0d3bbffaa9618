//! Duplicate detection and canonical record maintenance.

mod config;
mod grouping;
mod merge;
mod similarity;

pub use config::{DedupConfig, MAX_PHASH_THRESHOLD};
pub use grouping::{find_duplicates, group_id_for};
pub use merge::{canonical_title, merge, same_content, FALLBACK_TITLE};
pub use similarity::{is_generic_title, match_reason, normalize_title, title_similarity, Fingerprint};

use crate::error::Result;
use crate::storage::{GroupDiff, Storage};
use crate::types::{ArtifactObservation, ArtifactRecord, RecordId, RecordStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

const WATERMARK_KEY: &str = "dedup_observation_watermark";

/// Summary of one dedup pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupReport {
    pub observations: usize,
    pub groups: usize,
    pub group_diff: GroupDiff,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_superseded: usize,
    pub conflicting: usize,
    /// Ids of groups over `max_group_size`
    pub oversized_groups: Vec<String>,
    /// Live records created or changed by this pass
    pub changed_records: Vec<RecordId>,
}

/// Runs batch passes over the observation log.
pub struct Deduplicator {
    storage: Arc<dyn Storage>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(storage: Arc<dyn Storage>, config: DedupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { storage, config })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Whether observations arrived since the last completed pass.
    pub fn has_new_observations(&self) -> Result<bool> {
        let current = self.storage.count_observations()?;
        let watermark = self
            .storage
            .get_metadata(WATERMARK_KEY)?
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(u64::from_be_bytes);
        Ok(watermark != Some(current))
    }

    /// Regroup the full observation log and bring records in line.
    pub fn run_pass(&self) -> Result<DedupReport> {
        self.run_pass_at(Utc::now())
    }

    pub(crate) fn run_pass_at(&self, now: DateTime<Utc>) -> Result<DedupReport> {
        let observations = self.storage.list_observations()?;
        let groups = find_duplicates(&observations, &self.config);
        let group_diff = self.storage.replace_duplicate_groups(&groups)?;

        let by_id: HashMap<&str, &ArtifactObservation> =
            observations.iter().map(|o| (o.id.as_str(), o)).collect();

        let mut report = DedupReport {
            observations: observations.len(),
            groups: groups.len(),
            group_diff,
            ..Default::default()
        };

        let mut claimed: HashSet<RecordId> = HashSet::new();
        let mut writes: Vec<ArtifactRecord> = Vec::new();

        for group in &groups {
            if let Some(max) = self.config.max_group_size {
                if group.member_observation_ids.len() > max {
                    log::warn!(
                        "Group {} has {} members (limit {}), possible over-merge",
                        group.group_id,
                        group.member_observation_ids.len(),
                        max
                    );
                    report.oversized_groups.push(group.group_id.clone());
                }
            }

            let members: Vec<&ArtifactObservation> = group
                .member_observation_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();

            let prior = self.prior_records(&group.member_observation_ids, &claimed)?;
            let record = merge(Uuid::now_v7(), &members, &prior, now);
            claimed.insert(record.id);

            match prior.first() {
                None => report.records_created += 1,
                Some(survivor) if !same_content(survivor, &record) => report.records_updated += 1,
                Some(_) => {}
            }

            for absorbed in prior.iter().skip(1) {
                let mut absorbed = absorbed.clone();
                log::info!("Record {} superseded by {}", absorbed.id, record.id);
                absorbed.status = RecordStatus::Superseded { by: record.id };
                absorbed.updated_at = now;
                claimed.insert(absorbed.id);
                report.records_superseded += 1;
                writes.push(absorbed);
            }

            if record.is_conflicting() {
                log::warn!(
                    "Record {} held for review: members disagree on chain identity",
                    record.id
                );
                report.conflicting += 1;
            }

            let unchanged = prior.first().is_some_and(|p| same_content(p, &record));
            if !unchanged {
                report.changed_records.push(record.id);
                writes.push(record);
            }
        }

        self.storage.put_artifact_records_batch(&writes)?;
        self.storage
            .put_metadata(WATERMARK_KEY, &(observations.len() as u64).to_be_bytes())?;

        log::info!(
            "Dedup pass: {} observations, {} groups ({} new, {} changed, {} removed), {} records created, {} updated, {} superseded, {} conflicting",
            report.observations,
            report.groups,
            report.group_diff.created,
            report.group_diff.changed,
            report.group_diff.removed,
            report.records_created,
            report.records_updated,
            report.records_superseded,
            report.conflicting
        );
        Ok(report)
    }

    /// Live records already holding any member, oldest first. Records
    /// claimed earlier in this pass are left to the group that claimed them.
    fn prior_records(
        &self,
        member_ids: &[String],
        claimed: &HashSet<RecordId>,
    ) -> Result<Vec<ArtifactRecord>> {
        let mut ids = BTreeSet::new();
        for member in member_ids {
            ids.extend(self.storage.records_for_observation(member)?);
        }

        let mut records = Vec::new();
        for id in ids {
            if claimed.contains(&id) {
                continue;
            }
            if let Some(record) = self.storage.get_artifact_record(id)? {
                if !matches!(record.status, RecordStatus::Superseded { .. }) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}
