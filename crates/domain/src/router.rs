//! Use-case classification for purchase events.
//!
//! [`classify`] is a pure, total function: every event maps to exactly one
//! [`Intent`]. Rules are evaluated in order and the first match wins:
//!
//! 1. recurring billing with no prior arrangement bound → `NewSubscription`
//! 2. `purchase_type = bulk` → `BulkQuantity`
//! 3. `purchase_type = add_item` with a `target_arrangement` → `AddItem`
//! 4. anything else → `NewSubscription`, flagged as a fallback
//!
//! [`ownership`] partitions intents between the two notification types a
//! single purchase produces, so only one of them provisions.

use common::ArrangementId;
use serde::{Deserialize, Serialize};

use crate::event::{BillingMode, EventType, PurchaseEvent, metadata_keys};

const PURCHASE_TYPE_BULK: &str = "bulk";
const PURCHASE_TYPE_ADD_ITEM: &str = "add_item";

/// A provisioning intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Items on a freshly created recurring arrangement.
    NewSubscription {
        arrangement: Option<ArrangementId>,
        units: u32,
    },
    /// Items added to an arrangement the payer already has.
    AddItem {
        arrangement: ArrangementId,
        units: u32,
    },
    /// A one-off purchase of `count` units.
    BulkQuantity {
        arrangement: Option<ArrangementId>,
        count: u32,
    },
}

impl Intent {
    /// Returns the intent name.
    pub fn name(&self) -> &'static str {
        match self {
            Intent::NewSubscription { .. } => "new_subscription",
            Intent::AddItem { .. } => "add_item",
            Intent::BulkQuantity { .. } => "bulk_quantity",
        }
    }

    /// Number of units to provision.
    pub fn units(&self) -> u32 {
        match self {
            Intent::NewSubscription { units, .. } | Intent::AddItem { units, .. } => *units,
            Intent::BulkQuantity { count, .. } => *count,
        }
    }

    /// Arrangement the billing items attach to, if known.
    pub fn arrangement(&self) -> Option<&ArrangementId> {
        match self {
            Intent::NewSubscription { arrangement, .. }
            | Intent::BulkQuantity { arrangement, .. } => arrangement.as_ref(),
            Intent::AddItem { arrangement, .. } => Some(arrangement),
        }
    }

    /// The notification type responsible for provisioning this intent.
    pub fn owner(&self) -> EventType {
        match self {
            Intent::NewSubscription { .. } | Intent::BulkQuantity { .. } => {
                EventType::CheckoutCompleted
            }
            Intent::AddItem { .. } => EventType::PaymentSucceeded,
        }
    }
}

/// Result of classifying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    /// True when no rule matched and the default was applied.
    pub fallback: bool,
}

/// Whether an event is the one that provisions its intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    OwnedElsewhere { owner: EventType },
}

/// Classifies an event into exactly one intent.
pub fn classify(event: &PurchaseEvent) -> Classification {
    let target = event
        .meta(metadata_keys::TARGET_ARRANGEMENT)
        .map(ArrangementId::from);
    let purchase_type = event.meta(metadata_keys::PURCHASE_TYPE);

    if event.billing_mode == BillingMode::Recurring && target.is_none() {
        return Classification {
            intent: Intent::NewSubscription {
                arrangement: event.billing_arrangement_id.clone(),
                units: requested_units(event),
            },
            fallback: false,
        };
    }

    if purchase_type == Some(PURCHASE_TYPE_BULK) {
        return Classification {
            intent: Intent::BulkQuantity {
                arrangement: target.or_else(|| event.billing_arrangement_id.clone()),
                count: requested_units(event),
            },
            fallback: false,
        };
    }

    if purchase_type == Some(PURCHASE_TYPE_ADD_ITEM)
        && let Some(arrangement) = target
    {
        return Classification {
            intent: Intent::AddItem {
                arrangement,
                units: requested_units(event),
            },
            fallback: false,
        };
    }

    tracing::warn!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        purchase_type = purchase_type.unwrap_or("none"),
        "unrecognized purchase shape, defaulting to new subscription"
    );
    Classification {
        intent: Intent::NewSubscription {
            arrangement: event.billing_arrangement_id.clone(),
            units: requested_units(event),
        },
        fallback: true,
    }
}

/// Decides whether `event_type` provisions `intent` or defers to the owner.
pub fn ownership(event_type: &EventType, intent: &Intent) -> Ownership {
    let owner = intent.owner();
    if *event_type == owner {
        Ownership::Owned
    } else {
        Ownership::OwnedElsewhere { owner }
    }
}

/// Unit count from metadata; anything missing, zero or unparseable counts as one.
fn requested_units(event: &PurchaseEvent) -> u32 {
    match event.quantity() {
        Some(n) if n >= 1 => n,
        _ => {
            if event.meta(metadata_keys::QUANTITY).is_some() {
                tracing::warn!(
                    event_id = %event.event_id,
                    "invalid quantity in metadata, using 1"
                );
            }
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::PayerId;

    use super::*;
    use crate::value_objects::Money;

    fn event(
        event_type: EventType,
        mode: BillingMode,
        arrangement: Option<&str>,
        metadata: &[(&str, &str)],
    ) -> PurchaseEvent {
        PurchaseEvent {
            event_id: "evt_1".to_string(),
            event_type,
            occurred_at: Utc::now(),
            payer_id: PayerId::new("cus_1"),
            billing_arrangement_id: arrangement.map(ArrangementId::from),
            amount: Money::from_cents(1500),
            currency: "usd".to_string(),
            billing_mode: mode,
            charge_ref: Some("pi_1".to_string()),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_recurring_without_target_is_new_subscription() {
        let e = event(
            EventType::CheckoutCompleted,
            BillingMode::Recurring,
            Some("sub_new"),
            &[("quantity", "3")],
        );
        let c = classify(&e);
        assert!(!c.fallback);
        assert_eq!(
            c.intent,
            Intent::NewSubscription {
                arrangement: Some(ArrangementId::new("sub_new")),
                units: 3
            }
        );
    }

    #[test]
    fn test_recurring_rule_wins_over_bulk_tag() {
        let e = event(
            EventType::CheckoutCompleted,
            BillingMode::Recurring,
            Some("sub_new"),
            &[("purchase_type", "bulk"), ("quantity", "20")],
        );
        assert_eq!(classify(&e).intent.name(), "new_subscription");
    }

    #[test]
    fn test_bulk_tag_carries_count() {
        let e = event(
            EventType::CheckoutCompleted,
            BillingMode::OneTime,
            None,
            &[
                ("purchase_type", "bulk"),
                ("quantity", "15"),
                ("target_arrangement", "sub_9"),
            ],
        );
        let c = classify(&e);
        assert_eq!(
            c.intent,
            Intent::BulkQuantity {
                arrangement: Some(ArrangementId::new("sub_9")),
                count: 15
            }
        );
        assert_eq!(c.intent.units(), 15);
    }

    #[test]
    fn test_bulk_with_bad_quantity_counts_one() {
        for raw in ["0", "-4", "lots"] {
            let e = event(
                EventType::CheckoutCompleted,
                BillingMode::OneTime,
                Some("sub_9"),
                &[("purchase_type", "bulk"), ("quantity", raw)],
            );
            assert_eq!(classify(&e).intent.units(), 1, "quantity {raw}");
        }
    }

    #[test]
    fn test_add_item_needs_target() {
        let with_target = event(
            EventType::PaymentSucceeded,
            BillingMode::Recurring,
            Some("sub_9"),
            &[("purchase_type", "add_item"), ("target_arrangement", "sub_9")],
        );
        assert_eq!(
            classify(&with_target).intent,
            Intent::AddItem {
                arrangement: ArrangementId::new("sub_9"),
                units: 1
            }
        );

        let without_target = event(
            EventType::PaymentSucceeded,
            BillingMode::OneTime,
            None,
            &[("purchase_type", "add_item")],
        );
        let c = classify(&without_target);
        assert!(c.fallback);
        assert_eq!(c.intent.name(), "new_subscription");
    }

    #[test]
    fn test_unknown_shape_falls_back() {
        let e = event(
            EventType::CheckoutCompleted,
            BillingMode::OneTime,
            Some("sub_1"),
            &[],
        );
        let c = classify(&e);
        assert!(c.fallback);
        assert_eq!(
            c.intent,
            Intent::NewSubscription {
                arrangement: Some(ArrangementId::new("sub_1")),
                units: 1
            }
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let e = event(
            EventType::CheckoutCompleted,
            BillingMode::OneTime,
            None,
            &[("purchase_type", "bulk"), ("quantity", "7")],
        );
        let first = classify(&e);
        for _ in 0..50 {
            assert_eq!(classify(&e), first);
        }
    }

    #[test]
    fn test_bulk_purchase_is_owned_by_exactly_one_notification() {
        let metadata = [("purchase_type", "bulk"), ("quantity", "15")];
        let checkout = event(
            EventType::CheckoutCompleted,
            BillingMode::OneTime,
            Some("sub_9"),
            &metadata,
        );
        let payment = event(
            EventType::PaymentSucceeded,
            BillingMode::OneTime,
            Some("sub_9"),
            &metadata,
        );

        let owned: Vec<bool> = [checkout, payment]
            .iter()
            .map(|e| ownership(&e.event_type, &classify(e).intent) == Ownership::Owned)
            .collect();
        assert_eq!(owned, vec![true, false]);
    }

    #[test]
    fn test_add_item_owned_by_payment_notification() {
        let intent = Intent::AddItem {
            arrangement: ArrangementId::new("sub_9"),
            units: 1,
        };
        assert_eq!(
            ownership(&EventType::CheckoutCompleted, &intent),
            Ownership::OwnedElsewhere {
                owner: EventType::PaymentSucceeded
            }
        );
        assert_eq!(
            ownership(&EventType::PaymentSucceeded, &intent),
            Ownership::Owned
        );
    }
}
