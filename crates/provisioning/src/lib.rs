//! License provisioning for purchase reconciliation.
//!
//! A verified notification flows through:
//! 1. the [`WebhookProcessor`], which records it and checks ownership
//! 2. the [`IdempotencyGuard`], keyed on the event id
//! 3. the [`ProvisioningEngine`], inline or by queueing units
//!
//! The [`QueueWorker`] drains queued units on an interval and hands exhausted
//! ones to the [`CompensationManager`] for refund. License removal runs as the
//! [`RemovalSaga`], restoring the payer's cache entry when billing removal fails.

pub mod compensation;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod payer_cache;
pub mod processor;
pub mod retry;
pub mod reversal;
pub mod services;
pub mod worker;

pub use compensation::CompensationManager;
pub use dispatcher::{DispatchOutcome, NormalizedEvent, WebhookProcessor, provisioning_key};
pub use engine::{
    EngineConfig, ProvisioningEngine, ProvisioningReport, UnitOutcome, proration_reference,
};
pub use error::{ProvisioningError, Result};
pub use idempotency::{IdempotencyGuard, IdempotentOutcome};
pub use payer_cache::CachedLicense;
pub use processor::{
    InMemoryPaymentProcessor, PaymentProcessor, ProcessorCall, RefundReceipt, UpcomingCharge,
};
pub use retry::RetryPolicy;
pub use reversal::{RemovalOutcome, RemovalSaga};
pub use services::{Provisioning, ProvisioningConfig};
pub use worker::{BatchReport, QueueWorker, WorkerConfig};
