//! Provisioning error types.

use domain::DomainError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur while provisioning, compensating or reversing.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The payment processor rejected or failed a call.
    #[error("Processor call '{operation}' failed: {message}")]
    Processor {
        operation: &'static str,
        message: String,
        transient: bool,
    },

    /// Persistence adapter error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No license with this key exists.
    #[error("License not found: {0}")]
    LicenseNotFound(String),

    /// The license was already deactivated.
    #[error("License already inactive: {0}")]
    LicenseInactive(String),

    /// Every generated key collided with an existing one.
    #[error("Could not generate a unique license key after {attempts} attempts")]
    KeyGenerationExhausted { attempts: u32 },

    /// A saga step failed before anything needed compensating.
    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: &'static str, reason: String },

    /// A saga step failed and earlier steps were rolled back.
    #[error("Step '{step}' failed and was compensated (snapshot restored: {snapshot_restored}): {reason}")]
    Compensated {
        step: &'static str,
        reason: String,
        snapshot_restored: bool,
    },
}

impl ProvisioningError {
    /// Creates a processor error that is worth retrying.
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        ProvisioningError::Processor {
            operation,
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a processor error that will fail the same way again.
    pub fn permanent(operation: &'static str, message: impl Into<String>) -> Self {
        ProvisioningError::Processor {
            operation,
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if the retry policy should try again.
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisioningError::Processor { transient, .. } => *transient,
            ProvisioningError::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Convenience type alias for provisioning results.
pub type Result<T> = std::result::Result<T, ProvisioningError>;
