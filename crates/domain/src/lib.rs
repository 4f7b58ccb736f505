//! Domain layer for the purchase reconciliation service.
//!
//! This crate provides:
//! - the canonical [`PurchaseEvent`] and its metadata vocabulary
//! - persistent records (licenses, arrangements, ledger, idempotency)
//! - the provisioning queue item and its state machine
//! - the use-case router

pub mod error;
pub mod event;
pub mod queue;
pub mod records;
pub mod router;
pub mod value_objects;

pub use error::DomainError;
pub use event::{BillingMode, EventType, PurchaseEvent, metadata_keys};
pub use queue::{BackoffSchedule, FailureDisposition, QueueItem, QueueStatus, QueueTask, UnitOfWork};
pub use records::{
    BillingArrangement, IdempotencyRecord, IdempotencyStatus, License, LicenseStatus,
    PaymentRecord, PurchaseKind,
};
pub use router::{Classification, Intent, Ownership, classify, ownership};
pub use value_objects::{LicenseKey, Money};
