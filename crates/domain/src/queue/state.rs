//! Queue item state machine.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// The state of a provisioning queue item in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Processing ──┬──► Completed
///    ▲                     ├──► Pending   (retry scheduled)
///    │                     └──► Failed
///    └──────── manual reset ◄───┘
/// ```
///
/// A `Processing` item whose lease expired can be claimed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be picked up by the worker.
    #[default]
    Pending,

    /// Claimed by a worker run.
    Processing,

    /// Unit provisioned (terminal state).
    Completed,

    /// Retries exhausted and compensation issued (terminal until reset).
    Failed,
}

impl QueueStatus {
    /// Returns true if a worker may claim the item.
    pub fn can_claim(&self) -> bool {
        matches!(self, QueueStatus::Pending)
    }

    /// Returns true if the outcome of an attempt can be recorded.
    pub fn can_settle(&self) -> bool {
        matches!(self, QueueStatus::Processing)
    }

    /// Returns true if an operator may put the item back in the queue.
    pub fn can_reset(&self) -> bool {
        matches!(self, QueueStatus::Failed)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    /// Returns the state name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    /// Parses a stored state name.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(DomainError::UnknownVariant {
                kind: "queue status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
