use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ArrangementId, PayerId, QueueItemId};
use domain::{
    BillingArrangement, IdempotencyRecord, IdempotencyStatus, License, LicenseKey, PaymentRecord,
    PurchaseEvent, QueueItem, QueueStatus, QueueTask,
};
use tokio::sync::RwLock;

use crate::store::{ClaimOutcome, RecordStore};
use crate::{Result, StoreError};

/// Store operations that tests can make fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    RecordEvent,
    InsertLicense,
    UpdateLicense,
    AppendPayment,
    UpsertArrangement,
    Enqueue,
    SaveQueueItem,
}

#[derive(Default)]
struct Tables {
    events: HashMap<String, PurchaseEvent>,
    idempotency: HashMap<String, IdempotencyRecord>,
    licenses: HashMap<LicenseKey, License>,
    arrangements: HashMap<ArrangementId, BillingArrangement>,
    payments: Vec<PaymentRecord>,
    queue: Vec<QueueItem>,
}

/// In-memory record store for testing and single-process deployments.
///
/// All tables sit behind one lock, so every call is atomic with respect to
/// the others, matching the guarantees the PostgreSQL implementation gets
/// from unique constraints and conditional updates.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Mutex<HashMap<FaultPoint, u32>>>,
    operations: Arc<Mutex<Vec<&'static str>>>,
}

impl InMemoryRecordStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls at `point` fail with a transient error.
    pub fn fail_next(&self, point: FaultPoint, n: u32) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(point, n);
    }

    /// Every operation performed so far, in call order.
    pub fn operations(&self) -> Vec<&'static str> {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forgets the recorded operation log.
    pub fn clear_operations(&self) {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub async fn license_count(&self) -> usize {
        self.tables.read().await.licenses.len()
    }

    pub async fn payment_count(&self) -> usize {
        self.tables.read().await.payments.len()
    }

    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Snapshot of every queue item, in insertion order.
    pub async fn queue_items(&self) -> Vec<QueueItem> {
        self.tables.read().await.queue.clone()
    }

    pub async fn idempotency_record(&self, key: &str) -> Option<IdempotencyRecord> {
        self.tables.read().await.idempotency.get(key).cloned()
    }

    fn track(&self, op: &'static str) {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
    }

    fn check_fault(&self, point: FaultPoint) -> Result<()> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(remaining) = faults.get_mut(&point)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StoreError::Unavailable(format!(
                "injected fault at {point:?}"
            )));
        }
        Ok(())
    }
}

fn matches_reference(item: &QueueItem, reference: &str) -> bool {
    item.unit.reference == reference
        || item.unit.payer_id.as_str() == reference
        || item
            .unit
            .billing_arrangement_id
            .as_ref()
            .is_some_and(|a| a.as_str() == reference)
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn record_event(&self, event: &PurchaseEvent) -> Result<bool> {
        self.track("record_event");
        self.check_fault(FaultPoint::RecordEvent)?;
        let mut tables = self.tables.write().await;
        if tables.events.contains_key(&event.event_id) {
            return Ok(false);
        }
        tables
            .events
            .insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn claim_operation(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        self.track("claim_operation");
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.idempotency.get(&record.operation_key)
            && !existing.is_reclaimable(now)
        {
            return Ok(ClaimOutcome::Existing(existing.clone()));
        }
        tables
            .idempotency
            .insert(record.operation_key.clone(), record);
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete_operation(&self, key: &str, result: serde_json::Value) -> Result<()> {
        self.track("complete_operation");
        let mut tables = self.tables.write().await;
        let record = tables
            .idempotency
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "idempotency record",
                key: key.to_string(),
            })?;
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        Ok(())
    }

    async fn fail_operation(&self, key: &str, reason: &str) -> Result<()> {
        self.track("fail_operation");
        let mut tables = self.tables.write().await;
        let record = tables
            .idempotency
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "idempotency record",
                key: key.to_string(),
            })?;
        record.status = IdempotencyStatus::Failed;
        record.result = Some(serde_json::json!({ "error": reason }));
        Ok(())
    }

    async fn license_exists(&self, key: &LicenseKey) -> Result<bool> {
        self.track("license_exists");
        Ok(self.tables.read().await.licenses.contains_key(key))
    }

    async fn insert_license(&self, license: &License) -> Result<()> {
        self.track("insert_license");
        self.check_fault(FaultPoint::InsertLicense)?;
        let mut tables = self.tables.write().await;
        let unit_taken = tables.licenses.values().any(|l| {
            l.reference == license.reference && l.unit_index == license.unit_index
        });
        if unit_taken || tables.licenses.contains_key(&license.license_key) {
            return Err(StoreError::Conflict {
                entity: "license",
                key: license.license_key.to_string(),
            });
        }
        tables
            .licenses
            .insert(license.license_key.clone(), license.clone());
        Ok(())
    }

    async fn get_license(&self, key: &LicenseKey) -> Result<Option<License>> {
        self.track("get_license");
        Ok(self.tables.read().await.licenses.get(key).cloned())
    }

    async fn find_license_for_unit(
        &self,
        reference: &str,
        unit_index: u32,
    ) -> Result<Option<License>> {
        self.track("find_license_for_unit");
        let tables = self.tables.read().await;
        Ok(tables
            .licenses
            .values()
            .find(|l| l.reference == reference && l.unit_index == unit_index)
            .cloned())
    }

    async fn update_license(&self, license: &License) -> Result<()> {
        self.track("update_license");
        self.check_fault(FaultPoint::UpdateLicense)?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .licenses
            .get_mut(&license.license_key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "license",
                key: license.license_key.to_string(),
            })?;
        stored.status = license.status;
        stored.bound_resource_id = license.bound_resource_id.clone();
        stored.updated_at = license.updated_at;
        Ok(())
    }

    async fn licenses_for_payer(&self, payer_id: &PayerId) -> Result<Vec<License>> {
        self.track("licenses_for_payer");
        let tables = self.tables.read().await;
        let mut licenses: Vec<License> = tables
            .licenses
            .values()
            .filter(|l| &l.payer_id == payer_id)
            .cloned()
            .collect();
        licenses.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.unit_index.cmp(&b.unit_index))
        });
        Ok(licenses)
    }

    async fn upsert_arrangement(&self, arrangement: &BillingArrangement) -> Result<()> {
        self.track("upsert_arrangement");
        self.check_fault(FaultPoint::UpsertArrangement)?;
        self.tables
            .write()
            .await
            .arrangements
            .insert(arrangement.arrangement_id.clone(), arrangement.clone());
        Ok(())
    }

    async fn get_arrangement(&self, id: &ArrangementId) -> Result<Option<BillingArrangement>> {
        self.track("get_arrangement");
        Ok(self.tables.read().await.arrangements.get(id).cloned())
    }

    async fn append_payment(&self, payment: &PaymentRecord) -> Result<()> {
        self.track("append_payment");
        self.check_fault(FaultPoint::AppendPayment)?;
        let mut tables = self.tables.write().await;
        if tables.payments.iter().any(|p| p.reference == payment.reference) {
            return Err(StoreError::Conflict {
                entity: "payment record",
                key: payment.reference.clone(),
            });
        }
        tables.payments.push(payment.clone());
        Ok(())
    }

    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>> {
        self.track("find_payment");
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.reference == reference)
            .cloned())
    }

    async fn payments_for_payer(&self, payer_id: &PayerId) -> Result<Vec<PaymentRecord>> {
        self.track("payments_for_payer");
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .filter(|p| &p.payer_id == payer_id)
            .cloned()
            .collect())
    }

    async fn enqueue(&self, items: &[QueueItem]) -> Result<()> {
        self.track("enqueue");
        self.check_fault(FaultPoint::Enqueue)?;
        let mut tables = self.tables.write().await;
        if let Some(dup) = items
            .iter()
            .find(|i| tables.queue.iter().any(|q| q.queue_id == i.queue_id))
        {
            return Err(StoreError::Conflict {
                entity: "queue item",
                key: dup.queue_id.to_string(),
            });
        }
        tables.queue.extend(items.iter().cloned());
        Ok(())
    }

    async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        self.track("due_queue_items");
        let tables = self.tables.read().await;
        let mut due: Vec<QueueItem> = tables
            .queue
            .iter()
            .filter(|item| item.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|item| item.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.track("claim_queue_item");
        let mut tables = self.tables.write().await;
        match tables.queue.iter_mut().find(|item| item.queue_id == id) {
            Some(item) if item.status == QueueStatus::Pending || item.lease_expired(now) => {
                item.status = QueueStatus::Processing;
                item.lease_expires_at = Some(lease_expires_at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "queue item",
                key: id.to_string(),
            }),
        }
    }

    async fn save_queue_item(&self, item: &QueueItem) -> Result<()> {
        self.track("save_queue_item");
        self.check_fault(FaultPoint::SaveQueueItem)?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .queue
            .iter_mut()
            .find(|q| q.queue_id == item.queue_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "queue item",
                key: item.queue_id.to_string(),
            })?;
        *stored = item.clone();
        Ok(())
    }

    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        self.track("get_queue_item");
        let tables = self.tables.read().await;
        Ok(tables.queue.iter().find(|q| q.queue_id == id).cloned())
    }

    async fn queue_items_for_reference(&self, reference: &str) -> Result<Vec<QueueItem>> {
        self.track("queue_items_for_reference");
        let tables = self.tables.read().await;
        Ok(tables
            .queue
            .iter()
            .filter(|item| matches_reference(item, reference))
            .cloned()
            .collect())
    }

    async fn find_queue_item_for_unit(
        &self,
        reference: &str,
        unit_index: u32,
    ) -> Result<Option<QueueItem>> {
        self.track("find_queue_item_for_unit");
        let tables = self.tables.read().await;
        Ok(tables
            .queue
            .iter()
            .find(|item| {
                item.task == QueueTask::Provision
                    && item.unit.reference == reference
                    && item.unit.unit_index == unit_index
            })
            .cloned())
    }

    async fn reset_failed_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        self.track("reset_failed_queue_item");
        let mut tables = self.tables.write().await;
        let item = tables
            .queue
            .iter_mut()
            .find(|q| q.queue_id == id && q.status == QueueStatus::Failed)
            .ok_or_else(|| StoreError::NotFound {
                entity: "failed queue item",
                key: id.to_string(),
            })?;
        item.reset(now)?;
        Ok(item.clone())
    }
}
