//! Synchronous provisioning path.
//!
//! Per unit: pick a fresh license key, create the billing item at the
//! processor, persist the license. A unit whose persistence fails after the
//! billing call succeeded is queued for deferred reconciliation instead of
//! failing the purchase. A unit that fails inline for any other reason is
//! handed to the worker together with every unit after it. Intents larger
//! than the sync threshold provision a first slice inline and queue the rest.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{ArrangementId, BillingItemId, PayerId, QueueItemId};
use domain::{
    BillingArrangement, BillingMode, Classification, DomainError, Intent, License, LicenseKey,
    LicenseStatus, PaymentRecord, PurchaseEvent, PurchaseKind, QueueItem, QueueTask, UnitOfWork,
    metadata_keys,
};
use serde::{Deserialize, Serialize};
use store::{KeyValueCache, RecordStore, StoreError};

use crate::error::{ProvisioningError, Result};
use crate::payer_cache;
use crate::processor::PaymentProcessor;
use crate::retry::RetryPolicy;

/// Sizing knobs for the synchronous path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Intents with more units than this are split between inline and queued work.
    pub sync_threshold: u32,
    /// Units provisioned inline when an intent exceeds the threshold.
    pub sync_slice: u32,
    /// Regeneration attempts before giving up on a unique license key.
    pub key_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_threshold: 10,
            sync_slice: 5,
            key_attempts: 5,
        }
    }
}

/// Summary of one provisioning run, stored as the idempotent result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningReport {
    pub intent: String,
    pub fallback: bool,
    pub units: u32,
    /// Licenses created inline by this run.
    pub licenses: Vec<LicenseKey>,
    /// Units that already had a license or queue item from an earlier run.
    pub already_provisioned: u32,
    /// Units billed but not persisted, left for the worker.
    pub deferred: Vec<QueueItemId>,
    /// Units beyond the inline slice, plus any handed over after an inline failure.
    pub queued: Vec<QueueItemId>,
    /// Why inline provisioning stopped early, if it did.
    #[serde(default)]
    pub inline_failure: Option<String>,
    pub proration_charge: Option<String>,
}

/// Ledger reference of the proration collected for an add-item purchase.
pub fn proration_reference(event_id: &str) -> String {
    format!("{event_id}:proration")
}

/// What happened to one unit on the synchronous path.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Provisioned(LicenseKey),
    AlreadyProvisioned(LicenseKey),
    AlreadyQueued(QueueItemId),
    Deferred(QueueItemId),
}

/// Creates billing items and licenses for classified purchases.
#[derive(Clone)]
pub struct ProvisioningEngine<S, C, P> {
    store: S,
    cache: C,
    processor: P,
    retry: RetryPolicy,
    config: EngineConfig,
}

impl<S, C, P> ProvisioningEngine<S, C, P>
where
    S: RecordStore,
    C: KeyValueCache,
    P: PaymentProcessor,
{
    pub fn new(store: S, cache: C, processor: P, retry: RetryPolicy, config: EngineConfig) -> Self {
        Self {
            store,
            cache,
            processor,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Provisions every unit of a classified purchase.
    ///
    /// Safe to re-run for the same event: units that already have a license
    /// or a queue item are skipped, and ledger entries are keyed by event.
    /// Errors only when a failed unit could not be handed to the worker.
    #[tracing::instrument(
        skip(self, event, classification),
        fields(event_id = %event.event_id, intent = classification.intent.name())
    )]
    pub async fn provision(
        &self,
        event: &PurchaseEvent,
        classification: &Classification,
        now: DateTime<Utc>,
    ) -> Result<ProvisioningReport> {
        let intent = &classification.intent;
        let arrangement =
            intent
                .arrangement()
                .cloned()
                .ok_or_else(|| DomainError::MissingArrangement {
                    event_id: event.event_id.clone(),
                    intent: intent.name(),
                })?;
        let units = intent.units();
        let purchase_kind = match intent {
            Intent::BulkQuantity { .. } => PurchaseKind::Bulk,
            Intent::NewSubscription { .. } | Intent::AddItem { .. } => PurchaseKind::Immediate,
        };
        let inline_units = if units > self.config.sync_threshold {
            self.config.sync_slice.min(units)
        } else {
            units
        };

        self.mirror_arrangement(event, &arrangement).await;

        let mut report = ProvisioningReport {
            intent: intent.name().to_string(),
            fallback: classification.fallback,
            units,
            ..Default::default()
        };

        let mut handoff = None;
        for unit_index in 0..inline_units {
            let mut unit = unit_of_work(event, &arrangement, purchase_kind, units, unit_index);
            match self.provision_unit(&mut unit, now).await {
                Ok(UnitOutcome::Provisioned(key)) => report.licenses.push(key),
                Ok(UnitOutcome::AlreadyProvisioned(_) | UnitOutcome::AlreadyQueued(_)) => {
                    report.already_provisioned += 1
                }
                Ok(UnitOutcome::Deferred(queue_id)) => report.deferred.push(queue_id),
                Err(err) => {
                    tracing::warn!(
                        unit_index,
                        remaining = units - unit_index,
                        error = %err,
                        "inline provisioning failed, handing the remaining units to the worker"
                    );
                    handoff = Some((unit, err));
                    break;
                }
            }
        }

        match handoff {
            Some((failed, err)) => {
                let note = format!("inline attempt failed: {err}");
                let first = failed.unit_index;
                let mut item = QueueItem::new(QueueTask::Provision, failed, now);
                item.append_trail(note.as_str());
                let queued = self
                    .enqueue_units(
                        event,
                        &arrangement,
                        purchase_kind,
                        first + 1..units,
                        Some(item),
                        now,
                    )
                    .await;
                report.queued = match queued {
                    Ok(ids) => ids,
                    Err(enqueue_err) => {
                        tracing::error!(
                            error = %enqueue_err,
                            "could not hand the remaining units to the worker"
                        );
                        return Err(err);
                    }
                };
                metrics::counter!("units_handed_off_total").increment(report.queued.len() as u64);
                report.inline_failure = Some(note);
            }
            None if inline_units < units => {
                report.queued = self
                    .enqueue_units(
                        event,
                        &arrangement,
                        purchase_kind,
                        inline_units..units,
                        None,
                        now,
                    )
                    .await?;
            }
            None => {}
        }

        self.record_payment(event, &arrangement, now).await;
        if matches!(intent, Intent::AddItem { .. })
            && event.meta(metadata_keys::COLLECT_PRORATION) == Some("true")
        {
            report.proration_charge = self.collect_proration(event, &arrangement, now).await;
        }

        payer_cache::refresh_best_effort(&self.store, &self.cache, &event.payer_id).await;

        tracing::info!(
            created = report.licenses.len(),
            deferred = report.deferred.len(),
            queued = report.queued.len(),
            skipped = report.already_provisioned,
            handed_off = report.inline_failure.is_some(),
            "provisioning finished"
        );
        Ok(report)
    }

    /// Provisions one unit inline, deferring it if persistence fails after billing.
    pub async fn provision_unit(
        &self,
        unit: &mut UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<UnitOutcome> {
        if let Some(existing) = self
            .store
            .find_license_for_unit(&unit.reference, unit.unit_index)
            .await?
        {
            return Ok(UnitOutcome::AlreadyProvisioned(existing.license_key));
        }
        if let Some(queued) = self
            .store
            .find_queue_item_for_unit(&unit.reference, unit.unit_index)
            .await?
        {
            return Ok(UnitOutcome::AlreadyQueued(queued.queue_id));
        }

        unit.license_key = self.unique_license_key().await?;
        self.ensure_billing_item(unit).await?;

        match self.persist_license(unit, now).await {
            Ok(key) => Ok(UnitOutcome::Provisioned(key)),
            Err(err) => {
                tracing::warn!(
                    reference = %unit.reference,
                    unit_index = unit.unit_index,
                    error = %err,
                    "license persistence failed after billing succeeded, deferring"
                );
                let mut item = QueueItem::new(QueueTask::Provision, unit.clone(), now);
                item.append_trail(format!("deferred: {err}"));
                self.enqueue_with_retry(std::slice::from_ref(&item)).await?;
                metrics::counter!("units_deferred_total").increment(1);
                Ok(UnitOutcome::Deferred(item.queue_id))
            }
        }
    }

    /// Runs a queued unit to completion. Used by the worker.
    ///
    /// Returns the license key of the unit, whether created now or earlier.
    pub async fn execute_unit(&self, unit: &mut UnitOfWork, now: DateTime<Utc>) -> Result<LicenseKey> {
        if let Some(existing) = self
            .store
            .find_license_for_unit(&unit.reference, unit.unit_index)
            .await?
        {
            return Ok(existing.license_key);
        }
        if self.store.license_exists(&unit.license_key).await? {
            unit.license_key = self.unique_license_key().await?;
        }
        self.ensure_billing_item(unit).await?;
        self.persist_license(unit, now).await
    }

    async fn unique_license_key(&self) -> Result<LicenseKey> {
        for _ in 0..self.config.key_attempts {
            let key = LicenseKey::generate();
            if !self.store.license_exists(&key).await? {
                return Ok(key);
            }
            tracing::warn!(license_key = %key, "generated license key collided, regenerating");
        }
        Err(ProvisioningError::KeyGenerationExhausted {
            attempts: self.config.key_attempts,
        })
    }

    /// Creates the processor-side item unless an earlier attempt already did.
    async fn ensure_billing_item(&self, unit: &mut UnitOfWork) -> Result<BillingItemId> {
        if let Some(existing) = &unit.billing_item_id {
            return Ok(existing.clone());
        }

        let arrangement = unit
            .billing_arrangement_id
            .clone()
            .ok_or_else(|| DomainError::MissingArrangement {
                event_id: unit.reference.clone(),
                intent: "billing item",
            })?;
        let metadata = BTreeMap::from([
            ("license_key".to_string(), unit.license_key.to_string()),
            ("reference".to_string(), unit.reference.clone()),
            ("unit_index".to_string(), unit.unit_index.to_string()),
        ]);

        let processor = &self.processor;
        let arrangement = &arrangement;
        let price_ref = unit.price_ref.as_deref();
        let metadata = &metadata;
        let item = self
            .retry
            .run("create_billing_item", || async move {
                processor
                    .create_billing_item(arrangement, price_ref, metadata)
                    .await
            })
            .await?;

        unit.billing_item_id = Some(item.clone());
        Ok(item)
    }

    async fn persist_license(&self, unit: &UnitOfWork, now: DateTime<Utc>) -> Result<LicenseKey> {
        let arrangement = unit.billing_arrangement_id.clone().ok_or_else(|| {
            DomainError::MissingArrangement {
                event_id: unit.reference.clone(),
                intent: "license",
            }
        })?;
        let billing_item_id = unit.billing_item_id.clone().ok_or_else(|| {
            ProvisioningError::StepFailed {
                step: "persist_license",
                reason: "unit has no billing item".to_string(),
            }
        })?;

        let license = License {
            license_key: unit.license_key.clone(),
            payer_id: unit.payer_id.clone(),
            billing_arrangement_id: arrangement,
            billing_item_id,
            bound_resource_id: unit.bound_resource_id.clone(),
            status: LicenseStatus::Active,
            purchase_kind: unit.purchase_kind,
            reference: unit.reference.clone(),
            unit_index: unit.unit_index,
            created_at: now,
            updated_at: now,
        };

        let store = &self.store;
        let license_ref = &license;
        let inserted = self
            .retry
            .run("insert_license", || async move {
                store
                    .insert_license(license_ref)
                    .await
                    .map_err(ProvisioningError::from)
            })
            .await;

        match inserted {
            Ok(()) => {
                metrics::counter!(
                    "licenses_provisioned_total",
                    "kind" => license.purchase_kind.as_str()
                )
                .increment(1);
                Ok(license.license_key)
            }
            Err(ProvisioningError::Store(StoreError::Conflict { entity, key })) => {
                // Another run stored this unit first.
                match self
                    .store
                    .find_license_for_unit(&unit.reference, unit.unit_index)
                    .await?
                {
                    Some(existing) => Ok(existing.license_key),
                    None => Err(StoreError::Conflict { entity, key }.into()),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Queues the given units of a purchase, after `first` when it is set.
    async fn enqueue_units(
        &self,
        event: &PurchaseEvent,
        arrangement: &ArrangementId,
        purchase_kind: PurchaseKind,
        indexes: std::ops::Range<u32>,
        first: Option<QueueItem>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>> {
        let units = indexes.end;
        let mut items: Vec<QueueItem> = first.into_iter().collect();
        for unit_index in indexes {
            if self
                .store
                .find_queue_item_for_unit(&event.event_id, unit_index)
                .await?
                .is_some()
                || self
                    .store
                    .find_license_for_unit(&event.event_id, unit_index)
                    .await?
                    .is_some()
            {
                continue;
            }
            let unit = unit_of_work(event, arrangement, purchase_kind, units, unit_index);
            items.push(QueueItem::new(QueueTask::Provision, unit, now));
        }

        if !items.is_empty() {
            self.enqueue_with_retry(&items).await?;
            metrics::counter!("queue_items_enqueued_total").increment(items.len() as u64);
        }
        Ok(items.iter().map(|item| item.queue_id).collect())
    }

    async fn enqueue_with_retry(&self, items: &[QueueItem]) -> Result<()> {
        let store = &self.store;
        self.retry
            .run("enqueue", || async move {
                store.enqueue(items).await.map_err(ProvisioningError::from)
            })
            .await
    }

    /// Mirrors a newly created arrangement the first time it is seen.
    async fn mirror_arrangement(&self, event: &PurchaseEvent, arrangement: &ArrangementId) {
        if event.billing_mode != BillingMode::Recurring
            || event.billing_arrangement_id.as_ref() != Some(arrangement)
        {
            return;
        }
        match self.store.get_arrangement(arrangement).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(arrangement_id = %arrangement, error = %err, "arrangement lookup failed");
                return;
            }
        }

        let mirror = BillingArrangement {
            arrangement_id: arrangement.clone(),
            payer_id: event.payer_id.clone(),
            status: "active".to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
        };
        let store = &self.store;
        let mirror = &mirror;
        if let Err(err) = self
            .retry
            .run("upsert_arrangement", || async move {
                store
                    .upsert_arrangement(mirror)
                    .await
                    .map_err(ProvisioningError::from)
            })
            .await
        {
            tracing::error!(arrangement_id = %arrangement, error = %err, "could not mirror arrangement");
        }
    }

    /// Appends the purchase to the ledger, once per event.
    async fn record_payment(
        &self,
        event: &PurchaseEvent,
        arrangement: &ArrangementId,
        now: DateTime<Utc>,
    ) {
        if !event.amount.is_positive() {
            return;
        }
        let payment = PaymentRecord::succeeded(
            event.event_id.clone(),
            event.payer_id.clone(),
            Some(arrangement.clone()),
            event.amount,
            event.currency.clone(),
            now,
        )
        .with_charge_ref(event.charge_ref.clone());
        if let Err(err) = self.append_payment(&payment).await {
            metrics::counter!("persistence_failures_total", "record" => "payment").increment(1);
            tracing::error!(
                event_id = %event.event_id,
                amount = %event.amount,
                error = %err,
                "could not record payment"
            );
        }
    }

    /// Appends a ledger entry. An entry already recorded under the same
    /// reference counts as written.
    async fn append_payment(&self, payment: &PaymentRecord) -> Result<()> {
        let store = &self.store;
        let appended = self
            .retry
            .run("append_payment", || async move {
                store
                    .append_payment(payment)
                    .await
                    .map_err(ProvisioningError::from)
            })
            .await;
        match appended {
            Err(ProvisioningError::Store(StoreError::Conflict { .. })) => {
                tracing::debug!(reference = %payment.reference, "payment already recorded");
                Ok(())
            }
            other => other,
        }
    }

    /// Charges the prorated amount for items added mid-period.
    async fn collect_proration(
        &self,
        event: &PurchaseEvent,
        arrangement: &ArrangementId,
        now: DateTime<Utc>,
    ) -> Option<String> {
        match self.charge_proration(&event.payer_id, arrangement, &event.event_id, now).await {
            Ok(charge) => charge,
            Err(err) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    error = %err,
                    "proration could not be collected, it will be billed at the next invoice"
                );
                None
            }
        }
    }

    async fn charge_proration(
        &self,
        payer: &PayerId,
        arrangement: &ArrangementId,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let reference = proration_reference(event_id);
        if let Some(existing) = self.store.find_payment(&reference).await? {
            tracing::info!(%reference, "proration already collected");
            return Ok(existing.charge_ref);
        }

        let processor = &self.processor;
        let upcoming = self
            .retry
            .run("get_upcoming_charge", || async move {
                processor.get_upcoming_charge(payer, arrangement).await
            })
            .await?;
        if !upcoming.amount_due.is_positive() {
            return Ok(None);
        }

        let amount = upcoming.amount_due;
        let currency = upcoming.currency.as_str();
        let description = format!("proration for {event_id}");
        let description = description.as_str();
        let key = reference.as_str();
        let charge = self
            .retry
            .run("create_charge", || async move {
                processor
                    .create_charge(payer, amount, currency, description, key)
                    .await
            })
            .await?;

        let payment = PaymentRecord::succeeded(
            reference.clone(),
            payer.clone(),
            Some(arrangement.clone()),
            amount,
            upcoming.currency.clone(),
            now,
        )
        .with_charge_ref(Some(charge.clone()));
        self.append_payment(&payment).await?;
        Ok(Some(charge))
    }
}

/// Builds the replayable context for one unit of a purchase.
fn unit_of_work(
    event: &PurchaseEvent,
    arrangement: &ArrangementId,
    purchase_kind: PurchaseKind,
    units: u32,
    unit_index: u32,
) -> UnitOfWork {
    UnitOfWork {
        payer_id: event.payer_id.clone(),
        billing_arrangement_id: Some(arrangement.clone()),
        license_key: LicenseKey::generate(),
        price_ref: event.price_ref().map(str::to_string),
        unit_amount: event.amount.per_unit(units),
        currency: event.currency.clone(),
        charge_ref: event.charge_ref.clone(),
        purchase_total: event.amount,
        purchase_units: units,
        purchase_kind,
        billing_item_id: None,
        bound_resource_id: if unit_index == 0 {
            event.meta(metadata_keys::BOUND_RESOURCE).map(str::to_string)
        } else {
            None
        },
        reference: event.event_id.clone(),
        unit_index,
    }
}
