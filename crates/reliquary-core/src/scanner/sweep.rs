use super::EventScanner;
use crate::error::{requeue_at, ReliquaryError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Source id suffix of observations produced by a successful retry.
pub const RESOLVED_SUFFIX: &str = "+resolved";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentSweepReport {
    pub due: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub given_up: usize,
}

impl EventScanner {
    /// Retry metadata that no gateway could serve at scan time.
    ///
    /// Observations are immutable, so a successful retry appends a second,
    /// enriched observation under the original source id plus
    /// [`RESOLVED_SUFFIX`]. Dedup links the two by chain identity.
    pub async fn sweep_content_retries(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ContentSweepReport> {
        let mut report = ContentSweepReport::default();
        let due: Vec<_> = self
            .storage
            .list_content_retries()?
            .into_iter()
            .filter(|r| r.next_attempt_at <= now)
            .collect();
        report.due = due.len();

        for mut retry in due {
            if cancel.is_cancelled() {
                return Err(ReliquaryError::Cancelled);
            }
            let Some(original) = self.storage.get_observation(&retry.observation_id)? else {
                self.storage.remove_content_retry(&retry.observation_id)?;
                continue;
            };

            match self.resolver.resolve(&retry.uri).await {
                Ok(metadata) => {
                    let mut enriched = original.clone();
                    enriched.source_id = format!("{}{}", original.source_id, RESOLVED_SUFFIX);
                    enriched.refresh_id();
                    enriched.observed_at = now;
                    let enriched = self.enrich(enriched, metadata).await;

                    self.storage.append_observation(&enriched)?;
                    self.storage.remove_content_retry(&retry.observation_id)?;
                    log::info!("Resolved metadata for {} on retry {}", original.id, retry.attempts + 1);
                    report.resolved += 1;
                }
                Err(e) if e.is_transient() => {
                    retry.attempts += 1;
                    retry.last_error = Some(e.to_string());
                    if retry.attempts >= self.config.content_max_retries {
                        log::warn!(
                            "Giving up on metadata for {} after {} retries: {}",
                            retry.observation_id,
                            retry.attempts,
                            e
                        );
                        self.storage.remove_content_retry(&retry.observation_id)?;
                        report.given_up += 1;
                    } else {
                        retry.next_attempt_at =
                            requeue_at(now, retry.attempts, self.config.content_retry_delay, MAX_RETRY_DELAY);
                        self.storage.put_content_retry(&retry)?;
                        report.rescheduled += 1;
                    }
                }
                Err(e) => {
                    log::warn!("Metadata for {} is unusable: {}", retry.observation_id, e);
                    self.storage.remove_content_retry(&retry.observation_id)?;
                    report.given_up += 1;
                }
            }
        }

        if report.due > 0 {
            log::info!(
                "Content sweep: {} due, {} resolved, {} rescheduled, {} given up",
                report.due,
                report.resolved,
                report.rescheduled,
                report.given_up
            );
        }
        Ok(report)
    }
}
