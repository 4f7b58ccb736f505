//! Signed envelope verification and parsing into [`NormalizedEvent`]s.
//!
//! The `Webhook-Signature` header has the form `t=<unix secs>,v1=<hex>` where
//! the hex digest is HMAC-SHA256 over `"<t>.<raw body>"` with the shared
//! secret. Several `v1` entries may be present during secret rotation; any
//! match is accepted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{ArrangementId, PayerId};
use domain::{BillingArrangement, BillingMode, EventType, Money, PurchaseEvent};
use hmac::{Hmac, Mac};
use provisioning::NormalizedEvent;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the envelope signature.
pub const SIGNATURE_HEADER: &str = "webhook-signature";

/// Why an inbound envelope was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizerError {
    #[error("missing Webhook-Signature header")]
    MissingSignature,

    #[error("malformed signature header: {0}")]
    MalformedSignature(&'static str),

    #[error("signature timestamp outside tolerance ({age_secs}s)")]
    StaleTimestamp { age_secs: u64 },

    #[error("signature does not match payload")]
    SignatureMismatch,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl NormalizerError {
    /// Short machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            NormalizerError::MissingSignature
            | NormalizerError::MalformedSignature(_)
            | NormalizerError::StaleTimestamp { .. }
            | NormalizerError::SignatureMismatch => "invalid_signature",
            NormalizerError::MalformedPayload(_) => "malformed_payload",
        }
    }
}

/// Verifies `Webhook-Signature` headers against a shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Checks the header against `payload` as of `now` (unix seconds).
    pub fn verify(&self, payload: &[u8], header: Option<&str>, now: i64) -> Result<(), NormalizerError> {
        let header = header.ok_or(NormalizerError::MissingSignature)?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| NormalizerError::MalformedSignature("timestamp is not a number"))?,
                    )
                }
                Some(("v1", value)) => signatures.push(value),
                Some(_) => {}
                None => return Err(NormalizerError::MalformedSignature("expected key=value pairs")),
            }
        }
        let timestamp = timestamp.ok_or(NormalizerError::MalformedSignature("missing timestamp"))?;
        if signatures.is_empty() {
            return Err(NormalizerError::MalformedSignature("missing v1 signature"));
        }

        let age_secs = now.abs_diff(timestamp);
        if age_secs > self.tolerance_secs.max(0) as u64 {
            return Err(NormalizerError::StaleTimestamp { age_secs });
        }

        let matched = signatures.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            self.mac(timestamp, payload)
                .is_some_and(|mac| mac.verify_slice(&expected).is_ok())
        });
        if matched {
            Ok(())
        } else {
            Err(NormalizerError::SignatureMismatch)
        }
    }

    /// Produces a header value for `payload`. Used by senders and tests.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let digest = self
            .mac(timestamp, payload)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default();
        format!("t={timestamp},v1={digest}")
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Some(mac)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// Purchase-shaped object: a checkout session or a paid invoice.
#[derive(Debug, Deserialize)]
struct PurchaseObject {
    customer: Option<String>,
    subscription: Option<String>,
    amount_total: Option<i64>,
    amount_paid: Option<i64>,
    currency: Option<String>,
    mode: Option<String>,
    payment_intent: Option<String>,
    charge: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ArrangementObject {
    id: String,
    customer: String,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
}

/// Parses a verified envelope.
pub fn normalize(payload: &[u8]) -> Result<NormalizedEvent, NormalizerError> {
    let envelope: Envelope = serde_json::from_slice(payload).map_err(malformed)?;
    let event_type = EventType::parse(&envelope.event_type);

    match event_type {
        EventType::CheckoutCompleted | EventType::PaymentSucceeded => {
            let object: PurchaseObject =
                serde_json::from_value(envelope.data.object).map_err(malformed)?;
            purchase_event(envelope.id, event_type, envelope.created, object)
                .map(NormalizedEvent::Purchase)
        }
        EventType::ArrangementUpdated | EventType::ArrangementDeleted => {
            let object: ArrangementObject =
                serde_json::from_value(envelope.data.object).map_err(malformed)?;
            Ok(NormalizedEvent::ArrangementSync {
                event_id: envelope.id,
                arrangement: BillingArrangement {
                    arrangement_id: ArrangementId::new(object.id),
                    payer_id: PayerId::new(object.customer),
                    status: object.status,
                    current_period_start: object.current_period_start.and_then(from_unix),
                    current_period_end: object.current_period_end.and_then(from_unix),
                    cancel_at_period_end: object.cancel_at_period_end,
                },
            })
        }
        EventType::Other(raw) => Ok(NormalizedEvent::Ignored {
            event_id: envelope.id,
            event_type: raw,
        }),
    }
}

fn purchase_event(
    event_id: String,
    event_type: EventType,
    created: i64,
    object: PurchaseObject,
) -> Result<PurchaseEvent, NormalizerError> {
    let payer = object
        .customer
        .filter(|c| !c.is_empty())
        .ok_or_else(|| NormalizerError::MalformedPayload("object has no customer".to_string()))?;
    let occurred_at = from_unix(created)
        .ok_or_else(|| NormalizerError::MalformedPayload(format!("invalid created timestamp {created}")))?;

    let amount = match event_type {
        EventType::CheckoutCompleted => object.amount_total,
        _ => object.amount_paid,
    }
    .or(object.amount_total)
    .unwrap_or(0);
    if amount < 0 {
        return Err(NormalizerError::MalformedPayload(format!("negative amount {amount}")));
    }

    let billing_mode = match object.mode.as_deref() {
        Some("subscription") => BillingMode::Recurring,
        Some(_) => BillingMode::OneTime,
        None if object.subscription.is_some() => BillingMode::Recurring,
        None => BillingMode::OneTime,
    };

    Ok(PurchaseEvent {
        event_id,
        event_type,
        occurred_at,
        payer_id: PayerId::new(payer),
        billing_arrangement_id: object.subscription.map(ArrangementId::new),
        amount: Money::from_cents(amount),
        currency: object.currency.unwrap_or_else(|| "usd".to_string()).to_lowercase(),
        billing_mode,
        charge_ref: object.payment_intent.or(object.charge),
        metadata: object
            .metadata
            .into_iter()
            .filter_map(|(key, value)| metadata_value(value).map(|v| (key, v)))
            .collect(),
    })
}

/// Metadata values arrive as strings, but some senders emit numbers and booleans.
fn metadata_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn malformed(err: serde_json::Error) -> NormalizerError {
    NormalizerError::MalformedPayload(err.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET, 300)
    }

    fn checkout(metadata: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": NOW,
            "data": { "object": {
                "customer": "cus_1",
                "subscription": "sub_1",
                "amount_total": 4500,
                "currency": "USD",
                "mode": "subscription",
                "payment_intent": "pi_1",
                "metadata": metadata
            }}
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_signature_is_accepted() {
        let body = checkout(json!({}));
        let header = verifier().sign(&body, NOW);
        assert_eq!(verifier().verify(&body, Some(&header), NOW + 10), Ok(()));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let body = checkout(json!({}));
        let header = SignatureVerifier::new("whsec_other", 300).sign(&body, NOW);
        assert_eq!(
            verifier().verify(&body, Some(&header), NOW),
            Err(NormalizerError::SignatureMismatch)
        );
    }

    #[test]
    fn test_modified_payload_is_rejected() {
        let header = verifier().sign(&checkout(json!({})), NOW);
        let tampered = checkout(json!({ "quantity": "50" }));
        assert_eq!(
            verifier().verify(&tampered, Some(&header), NOW),
            Err(NormalizerError::SignatureMismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let body = checkout(json!({}));
        let header = verifier().sign(&body, NOW - 600);
        assert_eq!(
            verifier().verify(&body, Some(&header), NOW),
            Err(NormalizerError::StaleTimestamp { age_secs: 600 })
        );
    }

    #[test]
    fn test_extreme_timestamps_are_stale() {
        let body = checkout(json!({}));
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={t},v1=00");
            assert!(matches!(
                verifier().verify(&body, Some(&header), NOW),
                Err(NormalizerError::StaleTimestamp { .. })
            ));
        }
    }

    #[test]
    fn test_rotated_signatures_match_any() {
        let body = checkout(json!({}));
        let good = verifier().sign(&body, NOW);
        let digest = good.split_once(",v1=").unwrap().1;
        let header = format!("t={NOW},v1=deadbeef,v1={digest}");
        assert_eq!(verifier().verify(&body, Some(&header), NOW), Ok(()));
    }

    #[test]
    fn test_malformed_headers() {
        let body = checkout(json!({}));
        let v = verifier();
        assert_eq!(v.verify(&body, None, NOW), Err(NormalizerError::MissingSignature));
        assert!(matches!(
            v.verify(&body, Some("garbage"), NOW),
            Err(NormalizerError::MalformedSignature(_))
        ));
        assert!(matches!(
            v.verify(&body, Some("v1=abcd"), NOW),
            Err(NormalizerError::MalformedSignature(_))
        ));
        assert!(matches!(
            v.verify(&body, Some("t=1700000000"), NOW),
            Err(NormalizerError::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_checkout_becomes_purchase_event() {
        let body = checkout(json!({ "purchase_type": "bulk", "quantity": 15, "flag": true }));
        let NormalizedEvent::Purchase(event) = normalize(&body).unwrap() else {
            panic!("expected a purchase");
        };
        assert_eq!(event.event_id, "evt_1");
        assert_eq!(event.event_type, EventType::CheckoutCompleted);
        assert_eq!(event.payer_id, PayerId::new("cus_1"));
        assert_eq!(event.billing_arrangement_id, Some(ArrangementId::new("sub_1")));
        assert_eq!(event.amount, Money::from_cents(4500));
        assert_eq!(event.currency, "usd");
        assert_eq!(event.billing_mode, BillingMode::Recurring);
        assert_eq!(event.charge_ref.as_deref(), Some("pi_1"));
        assert_eq!(event.quantity(), Some(15));
        assert_eq!(event.meta("flag"), Some("true"));
        assert_eq!(event.occurred_at.timestamp(), NOW);
    }

    #[test]
    fn test_invoice_uses_amount_paid_and_charge() {
        let body = serde_json::to_vec(&json!({
            "id": "evt_2",
            "type": "invoice.payment_succeeded",
            "created": NOW,
            "data": { "object": {
                "customer": "cus_1",
                "subscription": "sub_1",
                "amount_paid": 1200,
                "currency": "usd",
                "charge": "ch_1",
                "metadata": { "purchase_type": "add_item", "target_arrangement": "sub_1" }
            }}
        }))
        .unwrap();
        let NormalizedEvent::Purchase(event) = normalize(&body).unwrap() else {
            panic!("expected a purchase");
        };
        assert_eq!(event.event_type, EventType::PaymentSucceeded);
        assert_eq!(event.amount, Money::from_cents(1200));
        assert_eq!(event.charge_ref.as_deref(), Some("ch_1"));
        assert_eq!(event.billing_mode, BillingMode::Recurring);
    }

    #[test]
    fn test_subscription_update_becomes_arrangement_sync() {
        let body = serde_json::to_vec(&json!({
            "id": "evt_3",
            "type": "customer.subscription.updated",
            "created": NOW,
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "current_period_start": NOW,
                "current_period_end": NOW + 2_592_000,
                "cancel_at_period_end": true
            }}
        }))
        .unwrap();
        let NormalizedEvent::ArrangementSync { event_id, arrangement } = normalize(&body).unwrap() else {
            panic!("expected an arrangement sync");
        };
        assert_eq!(event_id, "evt_3");
        assert_eq!(arrangement.arrangement_id, ArrangementId::new("sub_1"));
        assert_eq!(arrangement.status, "active");
        assert!(arrangement.cancel_at_period_end);
        assert_eq!(arrangement.current_period_end.map(|t| t.timestamp()), Some(NOW + 2_592_000));
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let body = br#"{"id":"evt_4","type":"charge.refunded","created":1700000000,"data":{"object":{}}}"#;
        assert_eq!(
            normalize(body).unwrap(),
            NormalizedEvent::Ignored {
                event_id: "evt_4".to_string(),
                event_type: "charge.refunded".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(normalize(b"not json"), Err(NormalizerError::MalformedPayload(_))));
        let no_customer = serde_json::to_vec(&json!({
            "id": "evt_5",
            "type": "checkout.session.completed",
            "created": NOW,
            "data": { "object": { "amount_total": 100 } }
        }))
        .unwrap();
        assert!(matches!(normalize(&no_customer), Err(NormalizerError::MalformedPayload(_))));
    }
}
