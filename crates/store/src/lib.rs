//! Persistence adapter for the reconciliation service.
//!
//! Two stores sit behind traits:
//! - [`RecordStore`]: the durable relational side (events, licenses,
//!   arrangements, ledger, idempotency records, provisioning queue)
//! - [`KeyValueCache`]: a best-effort cache of current payer state
//!
//! Each has an in-memory implementation for tests and single-process runs;
//! the record store also has a PostgreSQL implementation.

pub mod cache;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use cache::{CacheKey, InMemoryCache, KeyValueCache};
pub use error::{Result, StoreError};
pub use memory::{FaultPoint, InMemoryRecordStore};
pub use postgres::PostgresRecordStore;
pub use store::{ClaimOutcome, QueueSummary, RecordStore};
