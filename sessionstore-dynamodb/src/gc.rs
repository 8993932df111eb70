//! Garbage collection of expired session records.
//!
//! A sweep scans the table for records whose `created_at` is older than
//! `max_age` or whose `updated_at` is older than `max_stale`, reading only
//! the key attribute. Each scan page is deleted in batches of at most
//! [`BATCH_WRITE_LIMIT`] keys before the next page is requested. Keys a batch
//! reports as unprocessed are resubmitted with exponential backoff, up to
//! `gc_max_batch_attempts` submissions per batch.
//!
//! Backend errors end the sweep. There is no request to degrade for, so the
//! error handler is not consulted.

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::record::{CREATED_AT, UPDATED_AT, now_seconds};
use crate::table::{AttrValue, BATCH_WRITE_LIMIT, BatchDelete, Condition, Item, Scan, SessionTable};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Scan requests issued.
    pub pages: usize,
    /// Keys returned by the scan.
    pub scanned: usize,
    /// Keys deleted.
    pub deleted: usize,
    /// Batch delete requests issued, resubmissions included.
    pub batches: usize,
    /// Batch delete requests that only carried previously unprocessed keys.
    pub resubmissions: usize,
}

/// Deletes expired sessions.
pub struct GarbageCollector {
    table: Arc<dyn SessionTable>,
    config: Arc<SessionConfig>,
}

impl GarbageCollector {
    pub fn new(table: Arc<dyn SessionTable>, config: Arc<SessionConfig>) -> Self {
        Self { table, config }
    }

    /// Scan filter for a sweep starting at `now`.
    ///
    /// `None` when neither `max_age` nor `max_stale` is configured.
    pub fn filter(&self, now: f64) -> Option<Condition> {
        let older = |attribute: &str, limit: Duration| {
            Condition::less_than(attribute, AttrValue::N(now - limit.as_secs_f64()))
        };
        let by_age = self.config.max_age.map(|limit| older(CREATED_AT, limit));
        let by_staleness = self.config.max_stale.map(|limit| older(UPDATED_AT, limit));

        match (by_age, by_staleness) {
            (Some(age), Some(stale)) => Some(age.or(stale)),
            (age, stale) => age.or(stale),
        }
    }

    /// Delay before resubmission number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(30);
        self.config
            .gc_retry_base_delay
            .saturating_mul(factor)
            .min(self.config.gc_retry_max_delay)
    }

    /// Run one full sweep.
    pub async fn sweep(&self) -> SessionResult<SweepReport> {
        let mut report = SweepReport::default();
        let Some(filter) = self.filter(now_seconds()) else {
            info!(table = %self.config.table_name, "No max_age or max_stale configured, skipping sweep");
            return Ok(report);
        };

        let mut start_key: Option<Item> = None;
        loop {
            let page = self
                .table
                .scan(Scan {
                    table_name: self.config.table_name.clone(),
                    projection: vec![self.config.table_key.clone()],
                    filter: Some(filter.clone()),
                    limit: self.config.gc_scan_limit,
                    exclusive_start_key: start_key.take(),
                })
                .await?;

            report.pages += 1;
            report.scanned += page.items.len();
            debug!(
                page = report.pages,
                items = page.items.len(),
                more = page.last_evaluated_key.is_some(),
                "Scanned expired sessions"
            );

            self.delete_all(page.items, &mut report).await?;

            match page.last_evaluated_key {
                Some(key) => start_key = Some(key),
                None => break,
            }
        }

        info!(
            table = %self.config.table_name,
            pages = report.pages,
            deleted = report.deleted,
            batches = report.batches,
            resubmissions = report.resubmissions,
            "Garbage collection finished"
        );
        Ok(report)
    }

    async fn delete_all(&self, keys: Vec<Item>, report: &mut SweepReport) -> SessionResult<()> {
        let mut keys = keys.into_iter().peekable();
        while keys.peek().is_some() {
            let batch: Vec<Item> = keys.by_ref().take(BATCH_WRITE_LIMIT).collect();
            self.delete_batch(batch, report).await?;
        }
        Ok(())
    }

    async fn delete_batch(&self, keys: Vec<Item>, report: &mut SweepReport) -> SessionResult<()> {
        let mut pending = keys;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                report.resubmissions += 1;
            }
            report.batches += 1;

            let submitted = pending.len();
            let output = self
                .table
                .batch_delete(BatchDelete {
                    table_name: self.config.table_name.clone(),
                    keys: pending,
                })
                .await?;
            report.deleted += submitted - output.unprocessed.len();

            if output.unprocessed.is_empty() {
                return Ok(());
            }
            pending = output.unprocessed;

            if attempt >= self.config.gc_max_batch_attempts {
                warn!(
                    remaining = pending.len(),
                    attempts = attempt,
                    "Giving up on unprocessed session deletes"
                );
                return Err(SessionError::GcRetriesExhausted {
                    remaining: pending.len(),
                });
            }

            let delay = self.backoff(attempt);
            debug!(
                remaining = pending.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Resubmitting unprocessed session deletes"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
