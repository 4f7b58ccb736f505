//! Persistent records mirrored across the relational store and the cache.

use chrono::{DateTime, Duration, Utc};
use common::{ArrangementId, BillingItemId, PayerId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, Result};
use crate::value_objects::{LicenseKey, Money};

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(IdempotencyStatus::Pending),
            "completed" => Ok(IdempotencyStatus::Completed),
            "failed" => Ok(IdempotencyStatus::Failed),
            other => Err(DomainError::UnknownVariant {
                kind: "idempotency status",
                value: other.to_string(),
            }),
        }
    }
}

/// Gate record guaranteeing at-most-once execution of one logical operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub operation_key: String,
    pub status: IdempotencyStatus,
    /// Cached response of the completed operation, or the failure reason.
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Creates a `pending` record that stops blocking retries after `ttl`.
    pub fn pending(operation_key: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            operation_key: operation_key.into(),
            status: IdempotencyStatus::Pending,
            result: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Returns true once the record no longer blocks a new attempt.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns true if a new attempt may take over this key.
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Failed || self.is_expired(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    Inactive,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Active => "active",
            LicenseStatus::Inactive => "inactive",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(LicenseStatus::Active),
            "inactive" => Ok(LicenseStatus::Inactive),
            other => Err(DomainError::UnknownVariant {
                kind: "license status",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether the license was issued inside the request or by the queue worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseKind {
    Immediate,
    Bulk,
}

impl PurchaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseKind::Immediate => "immediate",
            PurchaseKind::Bulk => "bulk",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "immediate" => Ok(PurchaseKind::Immediate),
            "bulk" => Ok(PurchaseKind::Bulk),
            other => Err(DomainError::UnknownVariant {
                kind: "purchase kind",
                value: other.to_string(),
            }),
        }
    }
}

/// An activation credential bound to one purchased unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub license_key: LicenseKey,
    pub payer_id: PayerId,
    pub billing_arrangement_id: ArrangementId,
    pub billing_item_id: BillingItemId,
    pub bound_resource_id: Option<String>,
    pub status: LicenseStatus,
    pub purchase_kind: PurchaseKind,
    /// Event id of the purchase that provisioned this license.
    pub reference: String,
    /// Position of the unit within that purchase.
    pub unit_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl License {
    /// Marks the license inactive.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.status = LicenseStatus::Inactive;
        self.updated_at = now;
    }

    pub fn is_active(&self) -> bool {
        self.status == LicenseStatus::Active
    }
}

/// Local mirror of a processor-side recurring arrangement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingArrangement {
    pub arrangement_id: ArrangementId,
    pub payer_id: PayerId,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Append-only ledger entry for one successful charge.
///
/// `reference` names what the entry settles (a purchase event, or its
/// proration) and is unique across the ledger, so a replayed purchase cannot
/// record the same money twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: Uuid,
    pub reference: String,
    pub payer_id: PayerId,
    pub arrangement_id: Option<ArrangementId>,
    pub amount: Money,
    pub currency: String,
    /// Processor charge the entry was paid by, when known.
    pub charge_ref: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Creates a `succeeded` ledger entry.
    pub fn succeeded(
        reference: impl Into<String>,
        payer_id: PayerId,
        arrangement_id: Option<ArrangementId>,
        amount: Money,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            payment_id: Uuid::new_v4(),
            reference: reference.into(),
            payer_id,
            arrangement_id,
            amount,
            currency: currency.into(),
            charge_ref: None,
            status: "succeeded".to_string(),
            created_at: now,
        }
    }

    pub fn with_charge_ref(mut self, charge_ref: Option<String>) -> Self {
        self.charge_ref = charge_ref;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_record_expiry() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending("op", now, Duration::minutes(10));
        assert!(!record.is_expired(now));
        assert!(!record.is_reclaimable(now));
        assert!(record.is_expired(now + Duration::minutes(10)));
        assert!(record.is_reclaimable(now + Duration::minutes(11)));
    }

    #[test]
    fn test_failed_record_is_reclaimable() {
        let now = Utc::now();
        let mut record = IdempotencyRecord::pending("op", now, Duration::hours(1));
        record.status = IdempotencyStatus::Failed;
        assert!(record.is_reclaimable(now));
    }

    #[test]
    fn test_status_strings_parse_back() {
        for status in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(LicenseStatus::parse("revoked").is_err());
        assert_eq!(PurchaseKind::parse("bulk").unwrap(), PurchaseKind::Bulk);
    }
}
