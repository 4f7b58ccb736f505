use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ArrangementId, PayerId, QueueItemId};
use domain::{
    BillingArrangement, IdempotencyRecord, License, LicenseKey, PaymentRecord, PurchaseEvent,
    QueueItem, QueueStatus,
};
use serde::Serialize;

use crate::Result;

/// Outcome of trying to take ownership of an operation key.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The key was free (or reclaimable) and is now `pending` for this caller.
    Claimed,
    /// Someone else holds the key; their record is returned untouched.
    Existing(IdempotencyRecord),
}

/// Per-status counts for a set of queue items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueSummary {
    /// Tallies the given items.
    pub fn from_items(items: &[QueueItem]) -> Self {
        let mut summary = QueueSummary {
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            match item.status {
                QueueStatus::Pending => summary.pending += 1,
                QueueStatus::Processing => summary.processing += 1,
                QueueStatus::Completed => summary.completed += 1,
                QueueStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

/// The relational side of the persistence adapter.
///
/// Every component talks to storage through this trait. Implementations must
/// provide two atomic primitives: [`claim_operation`](RecordStore::claim_operation)
/// (unique-key insert) and [`claim_queue_item`](RecordStore::claim_queue_item)
/// (conditional status update). Nothing else is assumed to be atomic across
/// calls.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores an inbound event for audit and replay detection.
    ///
    /// Returns false if an event with the same id was already recorded.
    async fn record_event(&self, event: &PurchaseEvent) -> Result<bool>;

    /// Atomically inserts a `pending` idempotency record.
    ///
    /// An existing record that is `failed` or past `expires_at` is replaced.
    async fn claim_operation(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Marks an operation `completed` and caches its result.
    async fn complete_operation(&self, key: &str, result: serde_json::Value) -> Result<()>;

    /// Marks an operation `failed` so a later attempt may reclaim it.
    async fn fail_operation(&self, key: &str, reason: &str) -> Result<()>;

    /// Returns true if any license (active or not) uses this key.
    async fn license_exists(&self, key: &LicenseKey) -> Result<bool>;

    /// Inserts a license; `Conflict` if the key or the (reference, unit) pair is taken.
    async fn insert_license(&self, license: &License) -> Result<()>;

    async fn get_license(&self, key: &LicenseKey) -> Result<Option<License>>;

    /// Finds the license produced for a unit of a purchase.
    async fn find_license_for_unit(
        &self,
        reference: &str,
        unit_index: u32,
    ) -> Result<Option<License>>;

    /// Persists the mutable license fields (status, bound resource, updated_at).
    async fn update_license(&self, license: &License) -> Result<()>;

    async fn licenses_for_payer(&self, payer_id: &PayerId) -> Result<Vec<License>>;

    async fn upsert_arrangement(&self, arrangement: &BillingArrangement) -> Result<()>;

    async fn get_arrangement(&self, id: &ArrangementId) -> Result<Option<BillingArrangement>>;

    /// Appends a ledger entry. Entries are never updated.
    ///
    /// `Conflict` if an entry with the same reference is already recorded.
    async fn append_payment(&self, payment: &PaymentRecord) -> Result<()>;

    /// The ledger entry recorded for `reference`, if any.
    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>>;

    async fn payments_for_payer(&self, payer_id: &PayerId) -> Result<Vec<PaymentRecord>>;

    async fn enqueue(&self, items: &[QueueItem]) -> Result<()>;

    /// Items the worker may take at `now`, oldest first: pending items whose
    /// retry time has passed, and processing items whose lease has expired.
    async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>>;

    /// Atomically moves a due item to `processing`, leased until `lease_expires_at`.
    ///
    /// Accepts `pending` items and `processing` items whose lease expired
    /// before `now`. Returns false if another worker got there first.
    async fn claim_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Writes back an item after a transition.
    async fn save_queue_item(&self, item: &QueueItem) -> Result<()>;

    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>>;

    /// Items whose payer, arrangement or originating event matches `reference`.
    async fn queue_items_for_reference(&self, reference: &str) -> Result<Vec<QueueItem>>;

    /// Finds the provisioning item queued for a unit of a purchase.
    async fn find_queue_item_for_unit(
        &self,
        reference: &str,
        unit_index: u32,
    ) -> Result<Option<QueueItem>>;

    /// Moves a `failed` item back to `pending`; `NotFound` unless it is failed.
    async fn reset_failed_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<QueueItem>;
}
