//! Compensating actions for steps that cannot be rolled back by the store.

use std::collections::BTreeMap;

use domain::{Money, QueueItem, QueueTask};
use store::{CacheKey, KeyValueCache};

use crate::error::Result;
use crate::processor::PaymentProcessor;
use crate::retry::RetryPolicy;

/// Restores cache snapshots and refunds units that could not be provisioned.
#[derive(Clone)]
pub struct CompensationManager<C, P> {
    cache: C,
    processor: P,
    retry: RetryPolicy,
}

impl<C, P> CompensationManager<C, P>
where
    C: KeyValueCache,
    P: PaymentProcessor,
{
    pub fn new(cache: C, processor: P, retry: RetryPolicy) -> Self {
        Self {
            cache,
            processor,
            retry,
        }
    }

    /// Puts a captured cache entry back, or removes the key if it was absent.
    ///
    /// Best effort: returns whether the restore landed.
    pub async fn restore_snapshot(&self, key: &CacheKey, snapshot: Option<serde_json::Value>) -> bool {
        let restored = match snapshot {
            Some(value) => self.cache.put(key, value).await,
            None => self.cache.delete(key).await,
        };
        match restored {
            Ok(()) => {
                metrics::counter!("compensations_total", "kind" => "cache_restore", "outcome" => "ok")
                    .increment(1);
                tracing::info!(cache_key = %key, "cache snapshot restored");
                true
            }
            Err(err) => {
                metrics::counter!("compensations_total", "kind" => "cache_restore", "outcome" => "failed")
                    .increment(1);
                tracing::error!(cache_key = %key, error = %err, "cache snapshot restore failed");
                false
            }
        }
    }

    /// Compensates a queue item that ran out of attempts.
    ///
    /// Provision items are refunded for one unit and any billing item already
    /// created for them is removed. Every outcome is appended to the item's
    /// trail; nothing here fails the caller.
    #[tracing::instrument(skip(self, item), fields(queue_id = %item.queue_id, task = item.task.as_str()))]
    pub async fn compensate_exhausted(&self, item: &mut QueueItem) {
        if item.task == QueueTask::Deactivate {
            item.append_trail("compensation not applicable: deactivate task carries no charge");
            return;
        }

        if let Some(billing_item) = item.unit.billing_item_id.clone() {
            let processor = &self.processor;
            let billing_item_ref = &billing_item;
            match self
                .retry
                .run("delete_billing_item", || async move {
                    processor.delete_billing_item(billing_item_ref).await
                })
                .await
            {
                Ok(()) => {
                    item.append_trail(format!("billing item {billing_item} removed"));
                    item.unit.billing_item_id = None;
                }
                Err(err) => item.append_trail(format!(
                    "billing item {billing_item} could not be removed: {err}"
                )),
            }
        }

        let amount = self.refund_amount(item).await;
        let metadata = BTreeMap::from([
            (
                "reason".to_string(),
                item.error_message().unwrap_or("retries exhausted").to_string(),
            ),
            ("queue_id".to_string(), item.queue_id.to_string()),
            ("attempts".to_string(), item.attempts.to_string()),
            ("reference".to_string(), item.unit.reference.clone()),
        ]);

        let processor = &self.processor;
        let charge_ref = item.unit.charge_ref.as_deref();
        let metadata = &metadata;
        let refunded = self
            .retry
            .run("refund", || async move {
                processor.refund(charge_ref, amount, metadata).await
            })
            .await;

        match refunded {
            Ok(refund_id) => {
                metrics::counter!("refunds_issued_total").increment(1);
                tracing::info!(%refund_id, %amount, "refunded exhausted unit");
                item.append_trail(format!("refund {refund_id} issued for {amount}"));
                item.refund_id = Some(refund_id);
            }
            Err(err) => {
                metrics::counter!("refund_failures_total").increment(1);
                tracing::error!(%amount, error = %err, "refund for exhausted unit failed");
                item.append_trail(format!("refund of {amount} failed: {err}"));
            }
        }
    }

    /// Unit price from the processor catalog, else an even share of the purchase.
    async fn refund_amount(&self, item: &QueueItem) -> Money {
        let fallback = item.unit.purchase_total.per_unit(item.unit.purchase_units);
        let Some(price_ref) = item.unit.price_ref.as_deref() else {
            return fallback;
        };
        match self.unit_price(price_ref).await {
            Ok(Some(price)) => price,
            Ok(None) => fallback,
            Err(err) => {
                tracing::warn!(price_ref, error = %err, "unit price lookup failed, using purchase share");
                fallback
            }
        }
    }

    async fn unit_price(&self, price_ref: &str) -> Result<Option<Money>> {
        let processor = &self.processor;
        self.retry
            .run("get_unit_price", || async move {
                processor.get_unit_price(price_ref).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::{ArrangementId, BillingItemId, PayerId};
    use domain::{LicenseKey, PurchaseKind, QueueStatus, UnitOfWork};
    use serde_json::json;
    use store::InMemoryCache;

    use super::*;
    use crate::processor::{InMemoryPaymentProcessor, ProcessorCall};

    fn exhausted_item(task: QueueTask, price_ref: Option<&str>) -> QueueItem {
        let mut item = QueueItem::new(
            task,
            UnitOfWork {
                payer_id: PayerId::new("cus_1"),
                billing_arrangement_id: Some(ArrangementId::new("sub_1")),
                license_key: LicenseKey::generate(),
                price_ref: price_ref.map(str::to_string),
                unit_amount: Money::from_cents(300),
                currency: "usd".to_string(),
                charge_ref: Some("pi_1".to_string()),
                purchase_total: Money::from_cents(4500),
                purchase_units: 15,
                purchase_kind: PurchaseKind::Bulk,
                billing_item_id: None,
                bound_resource_id: None,
                reference: "evt_1".to_string(),
                unit_index: 9,
            },
            Utc::now(),
        );
        item.status = QueueStatus::Failed;
        item.attempts = 3;
        item.append_trail("attempt 3: processor unavailable");
        item
    }

    fn manager(
        cache: &InMemoryCache,
        processor: &InMemoryPaymentProcessor,
    ) -> CompensationManager<InMemoryCache, InMemoryPaymentProcessor> {
        CompensationManager::new(cache.clone(), processor.clone(), RetryPolicy::immediate())
    }

    #[tokio::test]
    async fn test_refund_prefers_catalog_price() {
        let cache = InMemoryCache::new();
        let processor = InMemoryPaymentProcessor::new();
        processor.set_unit_price("price_seat", Money::from_cents(500));
        let mut item = exhausted_item(QueueTask::Provision, Some("price_seat"));

        manager(&cache, &processor).compensate_exhausted(&mut item).await;

        let refunds = processor.refunds();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, Money::from_cents(500));
        assert_eq!(refunds[0].metadata["attempts"], "3");
        assert_eq!(refunds[0].metadata["queue_id"], item.queue_id.to_string());
        assert_eq!(item.refund_id.as_deref(), Some(refunds[0].refund_id.as_str()));
        assert!(item.error_message().unwrap().starts_with("refund "));
    }

    #[tokio::test]
    async fn test_refund_falls_back_to_purchase_share() {
        let cache = InMemoryCache::new();
        let processor = InMemoryPaymentProcessor::new();
        let mut item = exhausted_item(QueueTask::Provision, Some("price_unknown"));

        manager(&cache, &processor).compensate_exhausted(&mut item).await;

        assert_eq!(processor.refunds()[0].amount, Money::from_cents(300));
    }

    #[tokio::test]
    async fn test_refund_failure_is_recorded_on_trail() {
        let cache = InMemoryCache::new();
        let processor = InMemoryPaymentProcessor::new();
        processor.set_fail_always(ProcessorCall::Refund, true);
        let mut item = exhausted_item(QueueTask::Provision, None);

        manager(&cache, &processor).compensate_exhausted(&mut item).await;

        assert!(item.refund_id.is_none());
        assert!(item.error_message().unwrap().contains("failed"));
        assert_eq!(item.error_trail.len(), 2);
    }

    #[tokio::test]
    async fn test_billed_unit_has_its_item_removed() {
        let cache = InMemoryCache::new();
        let processor = InMemoryPaymentProcessor::new();
        let billing_item = processor
            .create_billing_item(&ArrangementId::new("sub_1"), None, &BTreeMap::new())
            .await
            .unwrap();
        let mut item = exhausted_item(QueueTask::Provision, None);
        item.unit.billing_item_id = Some(billing_item.clone());

        manager(&cache, &processor).compensate_exhausted(&mut item).await;

        assert!(!processor.has_billing_item(&billing_item));
        assert!(item.refund_id.is_some());
        assert_eq!(item.unit.billing_item_id, None::<BillingItemId>);
    }

    #[tokio::test]
    async fn test_deactivate_items_are_not_refunded() {
        let cache = InMemoryCache::new();
        let processor = InMemoryPaymentProcessor::new();
        let mut item = exhausted_item(QueueTask::Deactivate, None);

        manager(&cache, &processor).compensate_exhausted(&mut item).await;

        assert!(processor.refunds().is_empty());
        assert!(item.error_message().unwrap().contains("not applicable"));
    }

    #[tokio::test]
    async fn test_restore_snapshot_puts_or_deletes() {
        let cache = InMemoryCache::new();
        let processor = InMemoryPaymentProcessor::new();
        let manager = manager(&cache, &processor);
        let key = CacheKey::new("payer_licenses", "cus_1");

        cache.put(&key, json!(["changed"])).await.unwrap();
        assert!(manager.restore_snapshot(&key, Some(json!(["original"]))).await);
        assert_eq!(cache.peek(&key).await, Some(json!(["original"])));

        assert!(manager.restore_snapshot(&key, None).await);
        assert_eq!(cache.peek(&key).await, None);

        cache.fail_next_puts(1);
        assert!(!manager.restore_snapshot(&key, Some(json!([]))).await);
    }
}
