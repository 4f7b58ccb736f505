use domain::DomainError;
use thiserror::Error;

/// Errors that can occur when interacting with the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("{entity} already exists: {key}")]
    Conflict { entity: &'static str, key: String },

    /// The targeted row does not exist (or is not in the expected state).
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// The backend could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be mapped back onto the domain model.
    #[error("Corrupt row: {0}")]
    Domain(#[from] DomainError),
}

impl StoreError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            _ => false,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
