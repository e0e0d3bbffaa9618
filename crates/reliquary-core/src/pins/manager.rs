use crate::error::{requeue_at, Result};
use crate::pins::provider::{PinProvider, PinReceipt, RemotePinState};
use crate::pins::queue::PinQueue;
use crate::pins::rate_limit::TokenBucket;
use crate::provider::{CallError, ProviderPool};
use crate::resolver::raw_cid;
use crate::storage::Storage;
use crate::types::{ContentId, PinRecord, PinStatus, PinTier, RecordId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pin manager tuning
#[derive(Debug, Clone)]
pub struct PinConfig {
    /// Distinct confirmations needed by the two highest tiers. Default: 2.
    pub min_redundancy: usize,
    /// Pin requests per provider per item before that provider is skipped
    /// for the item. Default: 3.
    pub max_attempts: u32,
    /// Delay before a partly failed item is retried, doubled per attempt.
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            min_redundancy: 2,
            max_attempts: 3,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(3600),
        }
    }
}

/// One configured pinning backend with its own request budget.
pub struct PinTarget {
    provider: Arc<dyn PinProvider>,
    priority: u32,
    limiter: TokenBucket,
}

impl PinTarget {
    pub fn new(provider: Arc<dyn PinProvider>, priority: u32, requests_per_minute: u32) -> Self {
        Self {
            provider,
            priority,
            limiter: TokenBucket::per_minute(requests_per_minute),
        }
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    /// Record documents can only go to providers that take uploads.
    fn can_hold(&self, record: &PinRecord) -> bool {
        record.record_id.is_none() || self.provider.accepts_uploads()
    }
}

/// Counts from one drain of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub processed: usize,
    pub healthy: usize,
    pub pending: usize,
    pub degraded: usize,
    pub abandoned: usize,
    /// Items scheduled for a later retry
    pub deferred: usize,
}

/// Drains the pin queue across providers and keeps redundancy in check.
pub struct PinManager {
    targets: Vec<PinTarget>,
    storage: Arc<dyn Storage>,
    health: Option<Arc<ProviderPool>>,
    queue: Mutex<PinQueue>,
    deferred: Mutex<Vec<(DateTime<Utc>, ContentId, PinTier)>>,
    config: PinConfig,
}

impl PinManager {
    pub fn new(mut targets: Vec<PinTarget>, storage: Arc<dyn Storage>, config: PinConfig) -> Self {
        targets.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id().cmp(b.id())));
        Self {
            targets,
            storage,
            health: None,
            queue: Mutex::new(PinQueue::new()),
            deferred: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Report call outcomes into the pool's health table under the
    /// provider's id.
    pub fn with_health_reporting(mut self, pool: Arc<ProviderPool>) -> Self {
        self.health = Some(pool);
        self
    }

    pub fn config(&self) -> &PinConfig {
        &self.config
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.id().to_string()).collect()
    }

    fn queue(&self) -> MutexGuard<'_, PinQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deferred(&self) -> MutexGuard<'_, Vec<(DateTime<Utc>, ContentId, PinTier)>> {
        self.deferred.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    fn required_for(&self, tier: PinTier) -> usize {
        if tier.requires_redundancy() {
            self.config.min_redundancy
        } else {
            1
        }
    }

    fn target(&self, id: &str) -> Option<&PinTarget> {
        self.targets.iter().find(|t| t.id() == id)
    }

    fn report_outcome<T>(&self, provider: &str, outcome: &std::result::Result<T, CallError>) {
        if let Some(ref pool) = self.health {
            match outcome {
                Ok(_) => pool.record_success(provider),
                Err(e) => pool.record_failure(provider, e),
            }
        }
    }

    /// Queue `content_id` for pinning.
    ///
    /// Creates the durable record on first sight. A repeat request at a
    /// higher tier upgrades the record; healthy and abandoned items are left
    /// alone.
    pub fn enqueue(&self, content_id: &str, tier: PinTier) -> Result<PinRecord> {
        self.enqueue_as(content_id, tier, None)
    }

    /// Queue a record document we publish ourselves. The bytes are stored
    /// under their raw CID and uploaded to each provider that pins them.
    pub fn enqueue_document(&self, record_id: RecordId, document: &[u8], tier: PinTier) -> Result<PinRecord> {
        let cid = raw_cid(document)?;
        self.storage.put_record_document(&cid, document)?;
        self.enqueue_as(&cid, tier, Some(record_id))
    }

    fn enqueue_as(&self, content_id: &str, tier: PinTier, record_id: Option<RecordId>) -> Result<PinRecord> {
        let existing = self.storage.get_pin_record(content_id)?;
        let mut record = existing
            .clone()
            .unwrap_or_else(|| PinRecord::new(content_id, tier));

        if record.record_id.is_none() {
            record.record_id = record_id;
        }
        if tier < record.priority_tier {
            record.priority_tier = tier;
        }
        if record.priority_tier.requires_redundancy() {
            let holders: Vec<String> = self
                .targets
                .iter()
                .filter(|t| t.can_hold(&record))
                .map(|t| t.id().to_string())
                .collect();
            record.target_providers.extend(holders);
        }
        if existing.as_ref() != Some(&record) {
            record.updated_at = Utc::now();
            self.storage.put_pin_record(&record)?;
        }

        if !record.status.is_terminal() && self.queue().push(content_id, record.priority_tier) {
            log::debug!("Queued {} at {:?}", content_id, record.priority_tier);
        }
        Ok(record)
    }

    /// Re-queue every non-terminal record, e.g. after a restart.
    pub fn resume(&self) -> Result<usize> {
        let mut resumed = 0;
        for record in self.storage.list_pin_records()? {
            if !record.status.is_terminal() && self.queue().push(record.content_id.clone(), record.priority_tier) {
                resumed += 1;
            }
        }
        if resumed > 0 {
            log::info!("Resumed {} unfinished pin records", resumed);
        }
        Ok(resumed)
    }

    fn promote_due(&self, now: DateTime<Utc>) {
        let due: Vec<_> = {
            let mut deferred = self.deferred();
            let (due, later): (Vec<_>, Vec<_>) = deferred.drain(..).partition(|(at, _, _)| *at <= now);
            *deferred = later;
            due
        };
        let mut queue = self.queue();
        for (_, content_id, tier) in due {
            queue.push(content_id, tier);
        }
    }

    /// Targets to send a pin request to now.
    fn select_targets(&self, record: &PinRecord) -> Vec<&PinTarget> {
        let untried = |t: &&PinTarget| {
            t.can_hold(record)
                && !record.confirmed_providers.contains(t.id())
                && !record.provider_pin_ids.contains_key(t.id())
                && record.attempts_for(t.id()) < self.config.max_attempts
        };

        if record.priority_tier.requires_redundancy() {
            return self.targets.iter().filter(untried).collect();
        }

        // Best effort: one provider at a time, primary first
        if !record.confirmed_providers.is_empty() || !record.provider_pin_ids.is_empty() {
            return Vec::new();
        }
        self.targets.iter().find(untried).into_iter().collect()
    }

    /// Recompute status. Returns `true` when another pin round is possible.
    fn settle(&self, record: &mut PinRecord) -> bool {
        let required = self.required_for(record.priority_tier);
        let confirmed = record.confirmed_providers.len();
        let awaiting = record
            .provider_pin_ids
            .keys()
            .any(|p| !record.confirmed_providers.contains(p));
        let retryable = !self.select_targets(record).is_empty();

        let previous = record.status;
        record.status = if confirmed >= required {
            PinStatus::Healthy
        } else if !awaiting && !retryable {
            PinStatus::Abandoned
        } else if matches!(previous, PinStatus::Healthy | PinStatus::Degraded) {
            PinStatus::Degraded
        } else {
            PinStatus::Pending
        };
        record.updated_at = Utc::now();

        if record.status != previous {
            match record.status {
                PinStatus::Healthy => log::info!(
                    "Pin {} healthy on {} provider(s)",
                    record.content_id,
                    confirmed
                ),
                PinStatus::Abandoned => log::warn!(
                    "Pin {} abandoned with {}/{} confirmations: {}",
                    record.content_id,
                    confirmed,
                    required,
                    record.last_error.as_deref().unwrap_or("no error recorded")
                ),
                PinStatus::Degraded => log::warn!(
                    "Pin {} degraded to {}/{} confirmations",
                    record.content_id,
                    confirmed,
                    required
                ),
                _ => {}
            }
        }

        !record.status.is_terminal() && retryable
    }

    async fn request_pin(
        &self,
        target: &PinTarget,
        content_id: &str,
        document: Option<&[u8]>,
    ) -> std::result::Result<PinReceipt, CallError> {
        target.limiter.acquire().await;
        let outcome = match document {
            Some(bytes) => target.provider.pin_upload(content_id, bytes).await,
            None => target.provider.pin(content_id).await,
        };
        self.report_outcome(target.id(), &outcome);
        outcome
    }

    /// One pin round for one item.
    pub async fn pin_one(&self, content_id: &str) -> Result<Option<PinRecord>> {
        let Some(mut record) = self.storage.get_pin_record(content_id)? else {
            log::warn!("Pin {} dequeued without a record", content_id);
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(Some(record));
        }

        let document = match record.record_id {
            Some(_) => match self.storage.get_record_document(content_id)? {
                Some(bytes) => Some(bytes),
                None => {
                    log::error!("Record document {} is missing from storage", content_id);
                    record.status = PinStatus::Abandoned;
                    record.last_error = Some("record document missing".into());
                    record.updated_at = Utc::now();
                    self.storage.put_pin_record(&record)?;
                    return Ok(Some(record));
                }
            },
            None => None,
        };

        let chosen = self.select_targets(&record);
        let ids: Vec<String> = chosen.iter().map(|t| t.id().to_string()).collect();
        for id in &ids {
            record.target_providers.insert(id.clone());
            *record.attempts.entry(id.clone()).or_insert(0) += 1;
        }

        let outcomes = join_all(
            chosen
                .iter()
                .map(|t| self.request_pin(t, content_id, document.as_deref())),
        )
        .await;
        for (provider, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(receipt) => {
                    match receipt.state {
                        RemotePinState::Confirmed => {
                            record.confirm(&provider);
                            record.provider_pin_ids.insert(provider, receipt.pin_id);
                        }
                        RemotePinState::Pending => {
                            record.provider_pin_ids.insert(provider, receipt.pin_id);
                        }
                        RemotePinState::Failed => {
                            record.last_error = Some(format!("{} reported the pin as failed", provider));
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Pin {} on {} failed: {}", content_id, provider, e);
                    record.last_error = Some(format!("{}: {}", provider, e));
                }
            }
        }

        let retry = self.settle(&mut record);
        self.storage.put_pin_record(&record)?;

        if retry {
            let at = requeue_at(
                Utc::now(),
                record.total_attempts(),
                self.config.retry_base,
                self.config.retry_max,
            );
            self.deferred()
                .push((at, record.content_id.clone(), record.priority_tier));
        }
        Ok(Some(record))
    }

    /// Drain everything currently queued, highest tier first.
    pub async fn process(&self, cancel: &CancellationToken) -> Result<ProcessReport> {
        self.promote_due(Utc::now());
        let mut report = ProcessReport::default();

        loop {
            let Some((content_id, tier)) = self.queue().pop() else {
                break;
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Nothing is lost: the stored record still says what is outstanding
                    self.queue().push(content_id, tier);
                    break;
                }
                outcome = self.pin_one(&content_id) => outcome?,
            };

            let Some(record) = outcome else { continue };
            report.processed += 1;
            match record.status {
                PinStatus::Healthy => report.healthy += 1,
                PinStatus::Abandoned => report.abandoned += 1,
                PinStatus::Degraded => report.degraded += 1,
                PinStatus::Queued | PinStatus::Pending => report.pending += 1,
            }
        }

        report.deferred = self.deferred().len();
        Ok(report)
    }

    /// Re-query every provider holding a pin for `content_id` and recompute
    /// confirmations. An item that falls below its required redundancy is
    /// queued again.
    pub async fn verify(&self, content_id: &str) -> Result<Option<PinRecord>> {
        let Some(mut record) = self.storage.get_pin_record(content_id)? else {
            return Ok(None);
        };
        if record.status == PinStatus::Abandoned {
            return Ok(Some(record));
        }

        let pins: Vec<(String, String)> = record
            .provider_pin_ids
            .iter()
            .map(|(p, id)| (p.clone(), id.clone()))
            .collect();
        let checks = pins.iter().map(|(provider, pin_id)| async move {
            let target = self.target(provider)?;
            target.limiter.acquire().await;
            let outcome = target.provider.status(pin_id).await;
            self.report_outcome(provider, &outcome);
            Some((provider.clone(), outcome))
        });

        for (provider, outcome) in join_all(checks).await.into_iter().flatten() {
            match outcome {
                Ok(RemotePinState::Confirmed) => record.confirm(&provider),
                Ok(RemotePinState::Pending) => {
                    record.confirmed_providers.remove(&provider);
                }
                Ok(RemotePinState::Failed) | Err(CallError::Http { status: 404 }) => {
                    log::warn!("Pin {} lost on {}", content_id, provider);
                    record.confirmed_providers.remove(&provider);
                    record.provider_pin_ids.remove(&provider);
                    record.last_error = Some(format!("{} no longer holds the pin", provider));
                }
                Err(e) => {
                    log::debug!("Status check for {} on {} failed: {}", content_id, provider, e);
                }
            }
        }

        let retry = self.settle(&mut record);
        self.storage.put_pin_record(&record)?;
        if retry {
            self.queue().push(record.content_id.clone(), record.priority_tier);
        }
        Ok(Some(record))
    }

    /// Verify every record that holds at least one provider pin.
    pub async fn verify_all(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut verified = 0;
        for record in self.storage.list_pin_records()? {
            if cancel.is_cancelled() {
                break;
            }
            if record.status == PinStatus::Abandoned || record.provider_pin_ids.is_empty() {
                continue;
            }
            self.verify(&record.content_id).await?;
            verified += 1;
        }
        Ok(verified)
    }

    pub fn status(&self, content_id: &str) -> Result<Option<PinRecord>> {
        self.storage.get_pin_record(content_id)
    }
}
