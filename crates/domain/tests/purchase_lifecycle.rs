//! Integration tests for routing and the queue item lifecycle.
//!
//! These tests drive the public API the way the provisioning crate does:
//! classify an event, check which notification owns it, then walk queue items
//! through retries, exhaustion and manual reset.

use chrono::{Duration, Utc};
use common::{ArrangementId, PayerId};
use domain::{
    BackoffSchedule, BillingMode, DomainError, EventType, FailureDisposition, Intent, LicenseKey,
    Money, Ownership, PurchaseEvent, PurchaseKind, QueueItem, QueueStatus, QueueTask, UnitOfWork,
    classify, ownership,
};

fn event(
    event_type: EventType,
    mode: BillingMode,
    arrangement: Option<&str>,
    metadata: &[(&str, &str)],
) -> PurchaseEvent {
    PurchaseEvent {
        event_id: "evt_lifecycle".to_string(),
        event_type,
        occurred_at: Utc::now(),
        payer_id: PayerId::new("cus_lifecycle"),
        billing_arrangement_id: arrangement.map(ArrangementId::from),
        amount: Money::from_cents(3000),
        currency: "usd".to_string(),
        billing_mode: mode,
        charge_ref: Some("pi_lifecycle".to_string()),
        metadata: metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn lease() -> Duration {
    Duration::minutes(5)
}

fn unit(index: u32) -> UnitOfWork {
    UnitOfWork {
        payer_id: PayerId::new("cus_lifecycle"),
        billing_arrangement_id: Some(ArrangementId::new("sub_lifecycle")),
        license_key: LicenseKey::generate(),
        price_ref: None,
        unit_amount: Money::from_cents(200),
        currency: "usd".to_string(),
        charge_ref: Some("pi_lifecycle".to_string()),
        purchase_total: Money::from_cents(3000),
        purchase_units: 15,
        purchase_kind: PurchaseKind::Bulk,
        billing_item_id: None,
        bound_resource_id: None,
        reference: "evt_lifecycle".to_string(),
        unit_index: index,
    }
}

mod routing {
    use super::*;

    /// Every shape the router can see, across both purchase notification types.
    fn shapes() -> Vec<PurchaseEvent> {
        let metadata: [&[(&str, &str)]; 5] = [
            &[],
            &[("purchase_type", "bulk"), ("quantity", "15")],
            &[("purchase_type", "add_item"), ("target_arrangement", "sub_old")],
            &[("purchase_type", "add_item")],
            &[("purchase_type", "mystery")],
        ];
        let mut events = Vec::new();
        for event_type in [EventType::CheckoutCompleted, EventType::PaymentSucceeded] {
            for mode in [BillingMode::Recurring, BillingMode::OneTime] {
                for arrangement in [None, Some("sub_new")] {
                    for meta in metadata {
                        events.push(event(event_type.clone(), mode, arrangement, meta));
                    }
                }
            }
        }
        events
    }

    #[test]
    fn classification_is_deterministic() {
        for e in shapes() {
            assert_eq!(classify(&e), classify(&e));
        }
    }

    #[test]
    fn every_purchase_is_provisioned_by_exactly_one_notification() {
        for e in shapes() {
            let intent = classify(&e).intent;
            let owners = [EventType::CheckoutCompleted, EventType::PaymentSucceeded]
                .iter()
                .filter(|t| ownership(t, &intent) == Ownership::Owned)
                .count();
            assert_eq!(owners, 1, "intent {intent:?} must have one owner");
        }
    }

    #[test]
    fn bulk_checkout_carries_its_count() {
        let e = event(
            EventType::CheckoutCompleted,
            BillingMode::OneTime,
            Some("sub_new"),
            &[("purchase_type", "bulk"), ("quantity", "15")],
        );
        let classification = classify(&e);
        assert!(!classification.fallback);
        assert_eq!(
            classification.intent,
            Intent::BulkQuantity {
                arrangement: Some(ArrangementId::new("sub_new")),
                count: 15,
            }
        );
        assert_eq!(ownership(&e.event_type, &classification.intent), Ownership::Owned);
    }

    #[test]
    fn unknown_shapes_fall_back_to_new_subscription() {
        let e = event(
            EventType::CheckoutCompleted,
            BillingMode::OneTime,
            None,
            &[("purchase_type", "mystery")],
        );
        let classification = classify(&e);
        assert!(classification.fallback);
        assert_eq!(classification.intent.name(), "new_subscription");
        assert_eq!(classification.intent.arrangement(), None);
    }
}

mod queue_lifecycle {
    use super::*;

    #[test]
    fn item_fails_only_after_the_last_attempt() {
        let schedule = BackoffSchedule::default();
        let mut item = QueueItem::new(QueueTask::Provision, unit(7), Utc::now());
        let mut now = Utc::now();
        let mut waits = Vec::new();

        loop {
            assert!(item.is_due(now));
            item.claim(now, lease()).unwrap();
            match item.record_failure("processor unavailable", now, &schedule).unwrap() {
                FailureDisposition::Retry { next_retry_at } => {
                    assert_eq!(item.status, QueueStatus::Pending);
                    assert!(!item.is_due(next_retry_at - Duration::seconds(1)));
                    waits.push(next_retry_at - now);
                    now = next_retry_at;
                }
                FailureDisposition::Exhausted => break,
            }
        }

        assert_eq!(waits, vec![Duration::minutes(2), Duration::minutes(4)]);
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.attempts, 3);
        assert_eq!(item.error_trail.len(), 3);
        assert!(!item.is_due(now + Duration::days(1)));
    }

    #[test]
    fn reset_gives_a_fresh_budget() {
        let schedule = BackoffSchedule::new(1, Duration::minutes(2));
        let mut item = QueueItem::new(QueueTask::Provision, unit(0), Utc::now());
        item.claim(Utc::now(), lease()).unwrap();
        item.record_failure("declined", Utc::now(), &schedule).unwrap();
        assert_eq!(item.status, QueueStatus::Failed);

        item.reset(Utc::now()).unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.is_due(Utc::now()));

        item.claim(Utc::now(), lease()).unwrap();
        item.complete(Utc::now()).unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
    }

    #[test]
    fn terminal_items_reject_further_transitions() {
        let mut item = QueueItem::new(QueueTask::Deactivate, unit(0), Utc::now());
        item.claim(Utc::now(), lease()).unwrap();
        item.complete(Utc::now()).unwrap();

        assert!(matches!(
            item.claim(Utc::now(), lease()),
            Err(DomainError::InvalidTransition {
                current: QueueStatus::Completed,
                ..
            })
        ));
        assert!(item.reset(Utc::now()).is_err());
        assert!(
            item.record_failure("late", Utc::now(), &BackoffSchedule::default())
                .is_err()
        );
    }
}
