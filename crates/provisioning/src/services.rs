//! Wiring for the provisioning components.

use chrono::Duration;
use store::{KeyValueCache, RecordStore};

use crate::compensation::CompensationManager;
use crate::dispatcher::WebhookProcessor;
use crate::engine::{EngineConfig, ProvisioningEngine};
use crate::idempotency::{DEFAULT_TTL_HOURS, IdempotencyGuard};
use crate::processor::PaymentProcessor;
use crate::retry::RetryPolicy;
use crate::reversal::RemovalSaga;
use crate::worker::{QueueWorker, WorkerConfig};

/// Settings shared by every component.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningConfig {
    pub engine: EngineConfig,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub idempotency_ttl: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            idempotency_ttl: Duration::hours(DEFAULT_TTL_HOURS),
        }
    }
}

/// Every entry point, built over one store, cache and processor.
#[derive(Clone)]
pub struct Provisioning<S, C, P> {
    pub webhooks: WebhookProcessor<S, C, P>,
    pub removal: RemovalSaga<S, C, P>,
    pub worker: QueueWorker<S, C, P>,
}

impl<S, C, P> Provisioning<S, C, P>
where
    S: RecordStore + Clone,
    C: KeyValueCache + Clone,
    P: PaymentProcessor + Clone,
{
    pub fn new(store: S, cache: C, processor: P, config: ProvisioningConfig) -> Self {
        let engine = ProvisioningEngine::new(
            store.clone(),
            cache.clone(),
            processor.clone(),
            config.retry.clone(),
            config.engine,
        );
        let compensation =
            CompensationManager::new(cache.clone(), processor.clone(), config.retry.clone());
        let guard = IdempotencyGuard::new(store.clone(), config.idempotency_ttl);

        Self {
            webhooks: WebhookProcessor::new(store.clone(), guard, engine.clone()),
            removal: RemovalSaga::new(
                store.clone(),
                cache.clone(),
                processor,
                compensation.clone(),
                config.retry.clone(),
            ),
            worker: QueueWorker::new(
                store,
                cache,
                engine,
                compensation,
                config.retry,
                config.worker,
            ),
        }
    }
}
