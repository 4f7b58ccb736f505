//! Canonical purchase notifications.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{ArrangementId, PayerId};
use serde::{Deserialize, Serialize};

use crate::value_objects::Money;

/// Metadata keys the router and engine understand.
pub mod metadata_keys {
    /// `"bulk"` or `"add_item"`.
    pub const PURCHASE_TYPE: &str = "purchase_type";
    /// Requested unit count.
    pub const QUANTITY: &str = "quantity";
    /// An existing arrangement the purchase should attach to.
    pub const TARGET_ARRANGEMENT: &str = "target_arrangement";
    /// Processor price reference for one unit.
    pub const PRICE_REF: &str = "price_ref";
    /// `"true"` to collect the prorated amount immediately on AddItem.
    pub const COLLECT_PRORATION: &str = "collect_proration";
    /// Resource (site, seat) to bind the first license to.
    pub const BOUND_RESOURCE: &str = "bound_resource";
}

/// The notification types the service distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// `checkout.session.completed`
    CheckoutCompleted,
    /// `invoice.payment_succeeded`
    PaymentSucceeded,
    /// `customer.subscription.updated`
    ArrangementUpdated,
    /// `customer.subscription.deleted`
    ArrangementDeleted,
    /// Anything else; acknowledged and ignored.
    Other(String),
}

impl EventType {
    /// Maps a wire-level type string onto a known event type.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "checkout.session.completed" => EventType::CheckoutCompleted,
            "invoice.payment_succeeded" => EventType::PaymentSucceeded,
            "customer.subscription.updated" => EventType::ArrangementUpdated,
            "customer.subscription.deleted" => EventType::ArrangementDeleted,
            other => EventType::Other(other.to_string()),
        }
    }

    /// Returns the wire-level type string.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::CheckoutCompleted => "checkout.session.completed",
            EventType::PaymentSucceeded => "invoice.payment_succeeded",
            EventType::ArrangementUpdated => "customer.subscription.updated",
            EventType::ArrangementDeleted => "customer.subscription.deleted",
            EventType::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the purchase is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// A recurring arrangement (subscription) was set up by this purchase.
    Recurring,
    /// A single charge.
    #[default]
    OneTime,
}

/// An immutable, normalized purchase notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub payer_id: PayerId,
    /// Absent for purchases that don't yet have an arrangement.
    pub billing_arrangement_id: Option<ArrangementId>,
    pub amount: Money,
    pub currency: String,
    pub billing_mode: BillingMode,
    /// Processor reference of the charge, used for refunds.
    pub charge_ref: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl PurchaseEvent {
    /// Returns a trimmed, non-empty metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Returns the requested quantity if present and parseable.
    pub fn quantity(&self) -> Option<u32> {
        self.meta(metadata_keys::QUANTITY)
            .and_then(|q| q.parse().ok())
    }

    /// Returns the processor price reference for one unit.
    pub fn price_ref(&self) -> Option<&str> {
        self.meta(metadata_keys::PRICE_REF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with(metadata: &[(&str, &str)]) -> PurchaseEvent {
        PurchaseEvent {
            event_id: "evt_1".to_string(),
            event_type: EventType::CheckoutCompleted,
            occurred_at: Utc::now(),
            payer_id: PayerId::new("cus_1"),
            billing_arrangement_id: None,
            amount: Money::from_cents(1000),
            currency: "usd".to_string(),
            billing_mode: BillingMode::OneTime,
            charge_ref: None,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_event_type_wire_names() {
        for raw in [
            "checkout.session.completed",
            "invoice.payment_succeeded",
            "customer.subscription.updated",
            "customer.subscription.deleted",
            "charge.dispute.created",
        ] {
            assert_eq!(EventType::parse(raw).as_str(), raw);
        }
        assert_eq!(
            EventType::parse("charge.dispute.created"),
            EventType::Other("charge.dispute.created".to_string())
        );
    }

    #[test]
    fn test_meta_ignores_blank_values() {
        let event = event_with(&[("target_arrangement", "   "), ("price_ref", " price_1 ")]);
        assert_eq!(event.meta("target_arrangement"), None);
        assert_eq!(event.price_ref(), Some("price_1"));
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(event_with(&[("quantity", "15")]).quantity(), Some(15));
        assert_eq!(event_with(&[("quantity", "many")]).quantity(), None);
        assert_eq!(event_with(&[]).quantity(), None);
    }
}
