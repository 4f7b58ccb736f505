//! Domain error types.

use thiserror::Error;

use crate::queue::QueueStatus;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A queue item was asked to make a transition its lifecycle forbids.
    #[error("Invalid queue transition: cannot {action} from {current} state")]
    InvalidTransition {
        current: QueueStatus,
        action: &'static str,
    },

    /// A license key did not match the expected format.
    #[error("Invalid license key: {0}")]
    InvalidLicenseKey(String),

    /// An enum column or field held a value this build doesn't know.
    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    /// The event carries no arrangement to provision against.
    #[error("Event {event_id} has no billing arrangement for {intent}")]
    MissingArrangement {
        event_id: String,
        intent: &'static str,
    },
}

/// Convenience type alias for domain results.
pub type Result<T> = std::result::Result<T, DomainError>;
