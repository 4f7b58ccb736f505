//! A single unit of deferred provisioning work.

use chrono::{DateTime, Duration, Utc};
use common::{ArrangementId, BillingItemId, PayerId, QueueItemId};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::queue::QueueStatus;
use crate::records::PurchaseKind;
use crate::value_objects::{LicenseKey, Money};

/// What the worker does with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTask {
    /// Create the billing item (unless already created) and persist the license.
    Provision,
    /// Mark an already-removed license inactive in the relational store.
    Deactivate,
}

impl QueueTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueTask::Provision => "provision",
            QueueTask::Deactivate => "deactivate",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "provision" => Ok(QueueTask::Provision),
            "deactivate" => Ok(QueueTask::Deactivate),
            other => Err(DomainError::UnknownVariant {
                kind: "queue task",
                value: other.to_string(),
            }),
        }
    }
}

/// Everything needed to provision one purchased unit, inline or from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub payer_id: PayerId,
    pub billing_arrangement_id: Option<ArrangementId>,
    /// Generated once, before the unit is first attempted.
    pub license_key: LicenseKey,
    pub price_ref: Option<String>,
    pub unit_amount: Money,
    pub currency: String,
    pub charge_ref: Option<String>,
    pub purchase_total: Money,
    pub purchase_units: u32,
    pub purchase_kind: PurchaseKind,
    /// Set when the processor-side item already exists.
    pub billing_item_id: Option<BillingItemId>,
    pub bound_resource_id: Option<String>,
    /// Event id of the originating purchase.
    pub reference: String,
    pub unit_index: u32,
}

/// Retry schedule for queue items: `base * 2^(attempts - 1)` up to `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSchedule {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl BackoffSchedule {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the next attempt after `attempts` failures (1-based).
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base_delay * 2_i32.pow(exponent)
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::minutes(2),
        }
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending`, eligible again at the given instant.
    Retry { next_retry_at: DateTime<Utc> },
    /// Moved to `failed`; the item needs compensation.
    Exhausted,
}

/// A provisioning queue row.
///
/// Owned by the queue worker; status changes only through the transition
/// methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: QueueItemId,
    pub task: QueueTask,
    #[serde(flatten)]
    pub unit: UnitOfWork,
    pub status: QueueStatus,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// While `processing`: when the claim lapses and another run may take over.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Append-only trail of failures and compensation outcomes.
    pub error_trail: Vec<String>,
    pub refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Creates a pending item for the given task.
    pub fn new(task: QueueTask, unit: UnitOfWork, now: DateTime<Utc>) -> Self {
        Self {
            queue_id: QueueItemId::new(),
            task,
            unit,
            status: QueueStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            lease_expires_at: None,
            error_trail: Vec::new(),
            refund_id: None,
            created_at: now,
            processed_at: None,
        }
    }

    /// Returns true if the worker may select this item at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Pending => self.next_retry_at.is_none_or(|at| at <= now),
            QueueStatus::Processing => self.lease_expired(now),
            QueueStatus::Completed | QueueStatus::Failed => false,
        }
    }

    /// Returns true if a claimed item was never settled by its worker.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Processing && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// The most recent trail entry, surfaced as `errorMessage`.
    pub fn error_message(&self) -> Option<&str> {
        self.error_trail.last().map(String::as_str)
    }

    /// Appends an entry to the error trail.
    pub fn append_trail(&mut self, entry: impl Into<String>) {
        self.error_trail.push(entry.into());
    }

    /// pending → processing, held until `now + lease`.
    ///
    /// A processing item whose lease ran out is taken over the same way; the
    /// abandoned run does not count as an attempt.
    pub fn claim(&mut self, now: DateTime<Utc>, lease: Duration) -> Result<()> {
        let abandoned = self.lease_expired(now);
        if !self.status.can_claim() && !abandoned {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                action: "claim",
            });
        }
        if abandoned {
            self.append_trail(format!("lease expired, reclaimed at {}", now.to_rfc3339()));
        }
        self.status = QueueStatus::Processing;
        self.lease_expires_at = Some(now + lease);
        Ok(())
    }

    /// processing → completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_settle() {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                action: "complete",
            });
        }
        self.status = QueueStatus::Completed;
        self.next_retry_at = None;
        self.lease_expires_at = None;
        self.processed_at = Some(now);
        Ok(())
    }

    /// processing → pending (retry) or failed, depending on attempts so far.
    pub fn record_failure(
        &mut self,
        error: &str,
        now: DateTime<Utc>,
        schedule: &BackoffSchedule,
    ) -> Result<FailureDisposition> {
        if !self.status.can_settle() {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                action: "record failure",
            });
        }

        self.attempts += 1;
        self.append_trail(format!("attempt {}: {}", self.attempts, error));
        self.processed_at = Some(now);
        self.lease_expires_at = None;

        if self.attempts < schedule.max_attempts {
            let next_retry_at = now + schedule.delay_after(self.attempts);
            self.status = QueueStatus::Pending;
            self.next_retry_at = Some(next_retry_at);
            Ok(FailureDisposition::Retry { next_retry_at })
        } else {
            self.status = QueueStatus::Failed;
            self.next_retry_at = None;
            Ok(FailureDisposition::Exhausted)
        }
    }

    /// failed → pending, with a fresh attempt budget.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_reset() {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                action: "reset",
            });
        }
        self.status = QueueStatus::Pending;
        self.attempts = 0;
        self.next_retry_at = None;
        self.append_trail(format!("manually reset at {}", now.to_rfc3339()));
        Ok(())
    }
}
