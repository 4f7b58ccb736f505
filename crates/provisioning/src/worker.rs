//! Fixed-interval batch worker for the provisioning queue.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::PayerId;
use domain::{BackoffSchedule, FailureDisposition, QueueItem, QueueTask};
use serde::Serialize;
use store::{KeyValueCache, RecordStore};
use tokio::sync::watch;

use crate::compensation::CompensationManager;
use crate::engine::ProvisioningEngine;
use crate::error::{ProvisioningError, Result};
use crate::payer_cache;
use crate::processor::PaymentProcessor;
use crate::retry::RetryPolicy;

/// Worker scheduling and retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// Pause between consecutive items, to stay under processor rate limits.
    pub rate_limit_delay: Duration,
    pub schedule: BackoffSchedule,
    /// How long a claim holds an item. An item still `processing` after this
    /// is treated as abandoned and selected again.
    pub lease: chrono::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            rate_limit_delay: Duration::from_millis(100),
            schedule: BackoffSchedule::default(),
            lease: chrono::Duration::minutes(5),
        }
    }
}

/// Counts from one worker invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Due items returned by the store.
    pub selected: usize,
    /// Items another worker claimed first.
    pub skipped: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Items taken over from a claim whose lease had expired.
    pub reclaimed: usize,
}

/// Drains due queue items: claim, execute, settle.
#[derive(Clone)]
pub struct QueueWorker<S, C, P> {
    store: S,
    cache: C,
    engine: ProvisioningEngine<S, C, P>,
    compensation: CompensationManager<C, P>,
    retry: RetryPolicy,
    config: WorkerConfig,
}

impl<S, C, P> QueueWorker<S, C, P>
where
    S: RecordStore,
    C: KeyValueCache,
    P: PaymentProcessor,
{
    pub fn new(
        store: S,
        cache: C,
        engine: ProvisioningEngine<S, C, P>,
        compensation: CompensationManager<C, P>,
        retry: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            engine,
            compensation,
            retry,
            config,
        }
    }

    /// Processes one batch of items due at `now`.
    ///
    /// With nothing due this makes exactly one store call. Items whose claim
    /// lease ran out are due again.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let started = Instant::now();
        let due = self
            .store
            .due_queue_items(now, self.config.batch_size)
            .await?;
        let mut report = BatchReport {
            selected: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let mut touched_payers = BTreeSet::new();
        for (position, mut item) in due.into_iter().enumerate() {
            if position > 0 && !self.config.rate_limit_delay.is_zero() {
                tokio::time::sleep(self.config.rate_limit_delay).await;
            }

            let lease_expires_at = now + self.config.lease;
            if !self
                .store
                .claim_queue_item(item.queue_id, now, lease_expires_at)
                .await?
            {
                tracing::debug!(queue_id = %item.queue_id, "item claimed elsewhere, skipping");
                report.skipped += 1;
                continue;
            }
            if item.lease_expired(now) {
                tracing::warn!(
                    queue_id = %item.queue_id,
                    attempts = item.attempts,
                    "reclaiming item abandoned in processing"
                );
                report.reclaimed += 1;
            }
            item.claim(now, self.config.lease)?;

            let payer = item.unit.payer_id.clone();
            match self.process_item(&mut item, now).await {
                Ok(()) => {
                    item.complete(now)?;
                    report.completed += 1;
                }
                Err(err) => match item.record_failure(&err.to_string(), now, &self.config.schedule)? {
                    FailureDisposition::Retry { next_retry_at } => {
                        tracing::warn!(
                            queue_id = %item.queue_id,
                            attempts = item.attempts,
                            %next_retry_at,
                            error = %err,
                            "queue item failed, will retry"
                        );
                        report.retried += 1;
                    }
                    FailureDisposition::Exhausted => {
                        tracing::error!(
                            queue_id = %item.queue_id,
                            attempts = item.attempts,
                            error = %err,
                            "queue item exhausted its attempts"
                        );
                        metrics::counter!("queue_items_failed_total", "task" => item.task.as_str())
                            .increment(1);
                        self.compensation.compensate_exhausted(&mut item).await;
                        report.failed += 1;
                    }
                },
            }

            if let Err(err) = self.save(&item).await {
                metrics::counter!("queue_writeback_failures_total").increment(1);
                tracing::error!(
                    queue_id = %item.queue_id,
                    status = %item.status,
                    lease_expires_at = %lease_expires_at,
                    error = %err,
                    "could not write back queue item, it is picked up again once its lease expires"
                );
            }
            touched_payers.insert(payer);
        }

        for payer in &touched_payers {
            self.refresh_cache(payer).await;
        }

        metrics::histogram!("worker_batch_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            selected = report.selected,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            reclaimed = report.reclaimed,
            "worker batch finished"
        );
        Ok(report)
    }

    /// Runs batches on the configured interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.config.interval.as_secs(), "queue worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once(Utc::now()).await {
                        tracing::error!(error = %err, "worker batch failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("queue worker stopped");
    }

    async fn process_item(&self, item: &mut QueueItem, now: DateTime<Utc>) -> Result<()> {
        match item.task {
            QueueTask::Provision => {
                let key = self.engine.execute_unit(&mut item.unit, now).await?;
                tracing::debug!(queue_id = %item.queue_id, license_key = %key, "unit provisioned");
                Ok(())
            }
            QueueTask::Deactivate => self.deactivate(item, now).await,
        }
    }

    async fn deactivate(&self, item: &QueueItem, now: DateTime<Utc>) -> Result<()> {
        let mut license = self
            .store
            .get_license(&item.unit.license_key)
            .await?
            .ok_or_else(|| ProvisioningError::LicenseNotFound(item.unit.license_key.to_string()))?;
        if !license.is_active() {
            return Ok(());
        }
        license.deactivate(now);
        self.store.update_license(&license).await?;
        Ok(())
    }

    async fn save(&self, item: &QueueItem) -> Result<()> {
        let store = &self.store;
        self.retry
            .run("save_queue_item", || async move {
                store
                    .save_queue_item(item)
                    .await
                    .map_err(ProvisioningError::from)
            })
            .await
    }

    async fn refresh_cache(&self, payer: &PayerId) {
        payer_cache::refresh_best_effort(&self.store, &self.cache, payer).await;
    }
}
