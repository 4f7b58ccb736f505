//! HTTP handlers.

pub mod health;
pub mod licenses;
pub mod metrics;
pub mod queue;
pub mod webhook;
