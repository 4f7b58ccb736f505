//! Identifier newtypes shared by every crate in the workspace.

mod types;

pub use types::{ArrangementId, BillingItemId, PayerId, QueueItemId};
