//! License removal saga.
//!
//! Steps, in order:
//! 1. Snapshot the payer's cache entry
//! 2. Write the entry without the license
//! 3. Delete the billing item at the processor
//! 4. Mark the license inactive in the relational store
//!
//! A failure in step 3 restores the snapshot from step 1. A failure in step 4
//! is not rolled back: the billing side is already gone, so the deactivation
//! is queued for the worker instead.

use chrono::{DateTime, Utc};
use common::QueueItemId;
use domain::{LicenseKey, QueueItem, QueueTask, UnitOfWork};
use serde::Serialize;
use store::{CacheKey, KeyValueCache, RecordStore};

use crate::compensation::CompensationManager;
use crate::error::{ProvisioningError, Result};
use crate::payer_cache::{self, CachedLicense};
use crate::processor::PaymentProcessor;
use crate::retry::RetryPolicy;

/// The saga type identifier for license removal.
pub const SAGA_TYPE: &str = "LicenseRemoval";

/// Step name: capture the payer's cache entry.
pub const STEP_SNAPSHOT_CACHE: &str = "snapshot_cache";

/// Step name: write the cache entry without the license.
pub const STEP_UPDATE_CACHE: &str = "update_cache";

/// Step name: delete the billing item at the processor.
pub const STEP_DELETE_BILLING_ITEM: &str = "delete_billing_item";

/// Step name: mark the license inactive.
pub const STEP_DEACTIVATE_LICENSE: &str = "deactivate_license";

/// Successful end states of a removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemovalOutcome {
    Removed {
        license_key: LicenseKey,
    },
    /// Billing and cache are updated; the relational deactivation is queued.
    DeactivationDeferred {
        license_key: LicenseKey,
        queue_id: Option<QueueItemId>,
    },
}

/// Orchestrates license removal with cache compensation.
#[derive(Clone)]
pub struct RemovalSaga<S, C, P> {
    store: S,
    cache: C,
    processor: P,
    compensation: CompensationManager<C, P>,
    retry: RetryPolicy,
}

impl<S, C, P> RemovalSaga<S, C, P>
where
    S: RecordStore,
    C: KeyValueCache,
    P: PaymentProcessor,
{
    pub fn new(
        store: S,
        cache: C,
        processor: P,
        compensation: CompensationManager<C, P>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            processor,
            compensation,
            retry,
        }
    }

    /// Removes one provisioned license.
    #[tracing::instrument(skip(self), fields(saga_type = SAGA_TYPE))]
    pub async fn remove_license(
        &self,
        license_key: &LicenseKey,
        now: DateTime<Utc>,
    ) -> Result<RemovalOutcome> {
        metrics::counter!("saga_executions_total", "saga" => SAGA_TYPE).increment(1);

        let mut license = self
            .store
            .get_license(license_key)
            .await?
            .ok_or_else(|| ProvisioningError::LicenseNotFound(license_key.to_string()))?;
        if !license.is_active() {
            return Err(ProvisioningError::LicenseInactive(license_key.to_string()));
        }
        let cache_key = CacheKey::payer_licenses(&license.payer_id);

        // 1. Snapshot
        tracing::info!(step = STEP_SNAPSHOT_CACHE, "saga step started");
        let snapshot = self
            .cache
            .get(&cache_key)
            .await
            .map_err(|e| ProvisioningError::StepFailed {
                step: STEP_SNAPSHOT_CACHE,
                reason: e.to_string(),
            })?;

        // 2. Cache without the license
        tracing::info!(step = STEP_UPDATE_CACHE, "saga step started");
        let remaining = match &snapshot {
            Some(value) => serde_json::from_value::<Vec<CachedLicense>>(value.clone())?,
            None => {
                let licenses = self.store.licenses_for_payer(&license.payer_id).await?;
                payer_cache::active_entries(&licenses)
            }
        };
        let remaining: Vec<CachedLicense> = remaining
            .into_iter()
            .filter(|entry| &entry.license_key != license_key)
            .collect();
        let updated = serde_json::to_value(remaining)?;

        let cache = &self.cache;
        let cache_key_ref = &cache_key;
        let updated_ref = &updated;
        self.retry
            .run("cache_put", || async move {
                cache
                    .put(cache_key_ref, updated_ref.clone())
                    .await
                    .map_err(ProvisioningError::from)
            })
            .await
            .map_err(|e| ProvisioningError::StepFailed {
                step: STEP_UPDATE_CACHE,
                reason: e.to_string(),
            })?;

        // 3. Billing item
        tracing::info!(step = STEP_DELETE_BILLING_ITEM, "saga step started");
        let processor = &self.processor;
        let billing_item = &license.billing_item_id;
        if let Err(err) = self
            .retry
            .run("delete_billing_item", || async move {
                processor.delete_billing_item(billing_item).await
            })
            .await
        {
            tracing::warn!(
                step = STEP_DELETE_BILLING_ITEM,
                error = %err,
                "saga step failed, compensating"
            );
            let snapshot_restored = self
                .compensation
                .restore_snapshot(&cache_key, snapshot)
                .await;
            metrics::counter!("saga_compensations_total", "saga" => SAGA_TYPE).increment(1);
            return Err(ProvisioningError::Compensated {
                step: STEP_DELETE_BILLING_ITEM,
                reason: err.to_string(),
                snapshot_restored,
            });
        }

        // 4. Relational deactivation
        tracing::info!(step = STEP_DEACTIVATE_LICENSE, "saga step started");
        license.deactivate(now);
        let store = &self.store;
        let license_ref = &license;
        let deactivated = self
            .retry
            .run("update_license", || async move {
                store
                    .update_license(license_ref)
                    .await
                    .map_err(ProvisioningError::from)
            })
            .await;

        match deactivated {
            Ok(()) => {
                tracing::info!(license_key = %license_key, "license removed");
                Ok(RemovalOutcome::Removed {
                    license_key: license_key.clone(),
                })
            }
            Err(err) => {
                tracing::warn!(
                    step = STEP_DEACTIVATE_LICENSE,
                    error = %err,
                    "deactivation failed after billing removal, queueing it"
                );
                let mut item = QueueItem::new(
                    QueueTask::Deactivate,
                    UnitOfWork {
                        payer_id: license.payer_id.clone(),
                        billing_arrangement_id: Some(license.billing_arrangement_id.clone()),
                        license_key: license.license_key.clone(),
                        price_ref: None,
                        unit_amount: domain::Money::zero(),
                        currency: String::new(),
                        charge_ref: None,
                        purchase_total: domain::Money::zero(),
                        purchase_units: 1,
                        purchase_kind: license.purchase_kind,
                        billing_item_id: Some(license.billing_item_id.clone()),
                        bound_resource_id: license.bound_resource_id.clone(),
                        reference: license.reference.clone(),
                        unit_index: license.unit_index,
                    },
                    now,
                );
                item.append_trail(format!("deferred: {err}"));

                let queue_id = match self.store.enqueue(std::slice::from_ref(&item)).await {
                    Ok(()) => Some(item.queue_id),
                    Err(enqueue_err) => {
                        tracing::error!(
                            license_key = %license_key,
                            error = %enqueue_err,
                            "could not queue deactivation; license stays active in the store"
                        );
                        None
                    }
                };
                Ok(RemovalOutcome::DeactivationDeferred {
                    license_key: license_key.clone(),
                    queue_id,
                })
            }
        }
    }
}
