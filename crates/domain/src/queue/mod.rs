//! Provisioning queue items and their lifecycle.

mod item;
mod state;

pub use item::{BackoffSchedule, FailureDisposition, QueueItem, QueueTask, UnitOfWork};
pub use state::QueueStatus;
