//! Single dispatch point for normalized inbound notifications.

use chrono::{DateTime, Utc};
use domain::{BillingArrangement, Ownership, PurchaseEvent, classify, ownership};
use serde::Serialize;
use store::{KeyValueCache, RecordStore};

use crate::engine::{ProvisioningEngine, ProvisioningReport};
use crate::error::Result;
use crate::idempotency::{IdempotencyGuard, IdempotentOutcome};
use crate::processor::PaymentProcessor;

/// A verified notification, reduced to what the service acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    /// A purchase that may provision licenses.
    Purchase(PurchaseEvent),
    /// Processor-side arrangement changed; mirror it locally.
    ArrangementSync {
        event_id: String,
        arrangement: BillingArrangement,
    },
    /// A notification type the service does not handle.
    Ignored { event_id: String, event_type: String },
}

/// What the dispatcher did with a notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Provisioned { report: ProvisioningReport },
    /// Duplicate of a completed operation; the stored result.
    Cached { result: serde_json::Value },
    InFlight,
    /// The other notification type for this purchase provisions it.
    OwnedElsewhere { intent: String, owner: String },
    /// Accepted but provisioning failed; a redelivery may retry it.
    Failed { error: String },
    ArrangementSynced { arrangement_id: String },
    Ignored { event_type: String },
}

/// Idempotency key for provisioning a purchase event.
pub fn provisioning_key(event_id: &str) -> String {
    format!("provision:{event_id}")
}

/// Routes verified notifications to the engine behind the idempotency guard.
#[derive(Clone)]
pub struct WebhookProcessor<S, C, P> {
    store: S,
    guard: IdempotencyGuard<S>,
    engine: ProvisioningEngine<S, C, P>,
}

impl<S, C, P> WebhookProcessor<S, C, P>
where
    S: RecordStore,
    C: KeyValueCache,
    P: PaymentProcessor,
{
    pub fn new(store: S, guard: IdempotencyGuard<S>, engine: ProvisioningEngine<S, C, P>) -> Self {
        Self {
            store,
            guard,
            engine,
        }
    }

    /// Handles one notification.
    ///
    /// Errors only when the notification could not be recorded; provisioning
    /// failures are reported as [`DispatchOutcome::Failed`].
    pub async fn handle(&self, event: NormalizedEvent, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        match event {
            NormalizedEvent::Purchase(purchase) => self.handle_purchase(purchase, now).await,
            NormalizedEvent::ArrangementSync {
                event_id,
                arrangement,
            } => {
                self.store.upsert_arrangement(&arrangement).await?;
                tracing::info!(
                    %event_id,
                    arrangement_id = %arrangement.arrangement_id,
                    status = %arrangement.status,
                    "arrangement synced"
                );
                Ok(DispatchOutcome::ArrangementSynced {
                    arrangement_id: arrangement.arrangement_id.to_string(),
                })
            }
            NormalizedEvent::Ignored {
                event_id,
                event_type,
            } => {
                tracing::debug!(%event_id, %event_type, "ignoring notification");
                Ok(DispatchOutcome::Ignored { event_type })
            }
        }
    }

    #[tracing::instrument(
        skip(self, event, now),
        fields(event_id = %event.event_id, event_type = %event.event_type)
    )]
    async fn handle_purchase(&self, event: PurchaseEvent, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        if !self.store.record_event(&event).await? {
            tracing::info!("event already recorded, checking for a cached result");
        }

        let classification = classify(&event);
        if let Ownership::OwnedElsewhere { owner } = ownership(&event.event_type, &classification.intent) {
            tracing::info!(
                intent = classification.intent.name(),
                owner = %owner,
                "intent owned by another notification type"
            );
            return Ok(DispatchOutcome::OwnedElsewhere {
                intent: classification.intent.name().to_string(),
                owner: owner.as_str().to_string(),
            });
        }

        let key = provisioning_key(&event.event_id);
        let engine = &self.engine;
        let event_ref = &event;
        let classification_ref = &classification;
        let outcome = self
            .guard
            .with_idempotency(&key, now, || async move {
                engine.provision(event_ref, classification_ref, now).await
            })
            .await;

        Ok(match outcome {
            Ok(IdempotentOutcome::Executed(report)) => DispatchOutcome::Provisioned { report },
            Ok(IdempotentOutcome::Cached(result)) => DispatchOutcome::Cached { result },
            Ok(IdempotentOutcome::InFlight) => DispatchOutcome::InFlight,
            Err(err) => {
                metrics::counter!("provisioning_failures_total").increment(1);
                tracing::error!(error = %err, transient = err.is_transient(), "provisioning failed");
                DispatchOutcome::Failed {
                    error: err.to_string(),
                }
            }
        })
    }
}
