//! At-most-once execution per operation key.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use domain::{IdempotencyRecord, IdempotencyStatus};
use serde::Serialize;
use store::{ClaimOutcome, RecordStore};

use crate::error::Result;

/// How long a claimed key blocks duplicates before it may be reclaimed.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// What happened when an operation was submitted to the guard.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentOutcome<T> {
    /// This caller ran the operation.
    Executed(T),
    /// The operation already completed; its stored result is returned.
    Cached(serde_json::Value),
    /// Another caller holds the key and has not finished.
    InFlight,
}

/// Gates side effects behind an idempotency record.
///
/// The record is written `pending` before the operation runs, so the store's
/// unique-key insert is the only duplicate check.
#[derive(Clone)]
pub struct IdempotencyGuard<S> {
    store: S,
    ttl: Duration,
}

impl<S: RecordStore> IdempotencyGuard<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Runs `operation` at most once for `key`.
    ///
    /// On success the serialized result is stored as `completed`. On failure
    /// the record is marked `failed` so a later submission can retry, and the
    /// error is returned.
    #[tracing::instrument(skip(self, operation))]
    pub async fn with_idempotency<T, F, Fut>(
        &self,
        key: &str,
        now: DateTime<Utc>,
        operation: F,
    ) -> Result<IdempotentOutcome<T>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let record = IdempotencyRecord::pending(key, now, self.ttl);
        match self.store.claim_operation(record, now).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Existing(existing) => {
                return Ok(match existing.status {
                    IdempotencyStatus::Completed => {
                        metrics::counter!("idempotent_replays_total").increment(1);
                        tracing::info!("operation already completed, returning cached result");
                        IdempotentOutcome::Cached(
                            existing.result.unwrap_or(serde_json::Value::Null),
                        )
                    }
                    IdempotencyStatus::Pending | IdempotencyStatus::Failed => {
                        tracing::info!(status = existing.status.as_str(), "operation in flight");
                        IdempotentOutcome::InFlight
                    }
                });
            }
        }

        match operation().await {
            Ok(value) => {
                let result = serde_json::to_value(&value)?;
                self.store.complete_operation(key, result).await?;
                Ok(IdempotentOutcome::Executed(value))
            }
            Err(err) => {
                if let Err(mark_err) = self.store.fail_operation(key, &err.to_string()).await {
                    tracing::error!(
                        error = %mark_err,
                        "could not mark operation failed; it stays blocked until it expires"
                    );
                }
                Err(err)
            }
        }
    }
}
