//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::AppState;
use api::config::Config;
use api::normalizer::SignatureVerifier;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use provisioning::ProcessorCall;
use serde_json::{Value, json};
use store::{FaultPoint, InMemoryRecordStore};
use tower::ServiceExt;

const SECRET: &str = "whsec_integration";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn config() -> Config {
    Config {
        webhook_secret: SECRET.to_string(),
        sync_threshold: 5,
        sync_slice: 5,
        rate_limit_delay_ms: 0,
        ..Config::default()
    }
}

fn setup() -> (axum::Router, Arc<AppState<InMemoryRecordStore>>) {
    let state = api::create_default_state(InMemoryRecordStore::new(), "memory", &config());
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn checkout(event_id: &str, metadata: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "customer": "cus_api",
            "subscription": "sub_api",
            "amount_total": 4500,
            "currency": "usd",
            "mode": "subscription",
            "payment_intent": "pi_api",
            "metadata": metadata
        }}
    }))
    .unwrap()
}

fn signed_webhook(body: Vec<u8>) -> Request<Body> {
    let header = SignatureVerifier::new(SECRET, 300).sign(&body, Utc::now().timestamp());
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("Webhook-Signature", header)
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, json_body(response).await)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["store"], "memory");
}

#[tokio::test]
async fn test_signed_checkout_provisions_a_license() {
    let (app, state) = setup();

    let (status, json) = send(&app, signed_webhook(checkout("evt_api_1", json!({})))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "provisioned");
    assert_eq!(json["report"]["licenses"].as_array().unwrap().len(), 1);
    assert_eq!(state.store.license_count().await, 1);
    assert_eq!(state.store.payment_count().await, 1);
}

#[tokio::test]
async fn test_redelivery_returns_cached_result() {
    let (app, state) = setup();
    let body = checkout("evt_api_dup", json!({}));

    let (first, _) = send(&app, signed_webhook(body.clone())).await;
    let (second, json) = send(&app, signed_webhook(body)).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(json["outcome"], "cached");
    assert_eq!(state.store.license_count().await, 1);
}

#[tokio::test]
async fn test_bad_signature_is_rejected() {
    let (app, state) = setup();
    let body = checkout("evt_api_bad", json!({}));
    let header = SignatureVerifier::new("whsec_wrong", 300).sign(&body, Utc::now().timestamp());
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Webhook-Signature", header)
        .body(Body::from(body))
        .unwrap();

    let (status, json) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "invalid_signature");
    assert_eq!(state.store.event_count().await, 0);
}

#[tokio::test]
async fn test_missing_signature_is_rejected() {
    let (app, _) = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from(checkout("evt_api_nosig", json!({}))))
        .unwrap();

    let (status, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let (app, _) = setup();

    let (status, json) = send(&app, signed_webhook(b"{\"id\":\"evt\"}".to_vec())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "malformed_payload");
}

#[tokio::test]
async fn test_billing_failure_hands_the_purchase_to_the_worker() {
    let (app, state) = setup();
    state
        .processor
        .set_fail_always(ProcessorCall::CreateBillingItem, true);

    let (status, json) = send(&app, signed_webhook(checkout("evt_api_handoff", json!({})))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "provisioned");
    assert_eq!(json["report"]["queued"].as_array().unwrap().len(), 1);
    assert!(json["report"]["inline_failure"].is_string());
    assert_eq!(state.store.license_count().await, 0);
    assert_eq!(state.store.payment_count().await, 1);
    assert_eq!(state.store.queue_items().await.len(), 1);
}

#[tokio::test]
async fn test_provisioning_failure_still_acknowledges() {
    let (app, state) = setup();
    state
        .processor
        .set_fail_always(ProcessorCall::CreateBillingItem, true);
    state.store.fail_next(FaultPoint::Enqueue, 3);

    let (status, json) = send(&app, signed_webhook(checkout("evt_api_fail", json!({})))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "failed");
    assert_eq!(state.store.event_count().await, 1);
    assert_eq!(state.store.license_count().await, 0);
}

#[tokio::test]
async fn test_unhandled_event_types_are_acknowledged() {
    let (app, _) = setup();
    let body = serde_json::to_vec(&json!({
        "id": "evt_api_other",
        "type": "charge.refunded",
        "created": Utc::now().timestamp(),
        "data": { "object": {} }
    }))
    .unwrap();

    let (status, json) = send(&app, signed_webhook(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "ignored");
}

#[tokio::test]
async fn test_bulk_purchase_shows_in_queue_status() {
    let (app, state) = setup();
    let metadata = json!({
        "purchase_type": "bulk",
        "quantity": "8",
        "target_arrangement": "sub_api"
    });
    send(&app, signed_webhook(checkout("evt_api_bulk", metadata))).await;

    let (status, json) = send(&app, get("/queue-status?reference=evt_api_bulk")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 3);
    assert_eq!(json["pending"], 3);
    assert_eq!(json["items"].as_array().unwrap().len(), 3);

    state.services.worker.run_once(Utc::now()).await.unwrap();

    let (_, json) = send(&app, get("/queue-status?reference=cus_api")).await;
    assert_eq!(json["completed"], 3);
    assert_eq!(state.store.license_count().await, 8);
}

#[tokio::test]
async fn test_queue_status_requires_reference() {
    let (app, _) = setup();

    let (status, json) = send(&app, get("/queue-status")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_failed_item_reset_round_trip() {
    let (app, state) = setup();
    let metadata = json!({
        "purchase_type": "bulk",
        "quantity": "6",
        "target_arrangement": "sub_api"
    });
    send(&app, signed_webhook(checkout("evt_api_reset", metadata))).await;

    state
        .processor
        .set_fail_always(ProcessorCall::CreateBillingItem, true);
    let start = Utc::now();
    for minutes in [0, 2, 6] {
        state
            .services
            .worker
            .run_once(start + chrono::Duration::minutes(minutes))
            .await
            .unwrap();
    }

    let (_, json) = send(&app, get("/queue-status?reference=evt_api_reset")).await;
    assert_eq!(json["failed"], 1);
    let item = &json["items"][0];
    assert!(item["refundId"].is_string());
    let queue_id = item["queueId"].as_str().unwrap().to_string();

    let reset = Request::builder()
        .method("POST")
        .uri(format!("/queue-items/{queue_id}/reset"))
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app, reset).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "pending");
    assert_eq!(json["attempts"], 0);

    let again = Request::builder()
        .method("POST")
        .uri(format!("/queue-items/{queue_id}/reset"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, again).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset_with_invalid_id() {
    let (app, _) = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/queue-items/not-a-uuid/reset")
        .body(Body::empty())
        .unwrap();

    let (status, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_license_removal() {
    let (app, state) = setup();
    let (_, json) = send(&app, signed_webhook(checkout("evt_api_rm", json!({})))).await;
    let key = json["report"]["licenses"][0].as_str().unwrap().to_string();

    let remove = || {
        Request::builder()
            .method("DELETE")
            .uri(format!("/licenses/{key}"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, json) = send(&app, remove()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "removed");
    assert_eq!(state.processor.billing_item_count(), 0);

    let (status, json) = send(&app, remove()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "license_inactive");
}

#[tokio::test]
async fn test_license_removal_rolls_back_on_billing_failure() {
    let (app, state) = setup();
    let (_, json) = send(&app, signed_webhook(checkout("evt_api_rb", json!({})))).await;
    let key = json["report"]["licenses"][0].as_str().unwrap().to_string();
    state
        .processor
        .set_fail_always(ProcessorCall::DeleteBillingItem, true);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/licenses/{key}"))
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"]["code"], "compensated");
    assert_eq!(state.processor.billing_item_count(), 1);
}

#[tokio::test]
async fn test_license_removal_errors() {
    let (app, _) = setup();

    let (status, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/licenses/not-a-key")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = domain::LicenseKey::generate();
    let (status, json) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/licenses/{unknown}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();
    send(&app, signed_webhook(checkout("evt_api_metrics", json!({})))).await;

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("webhooks_received_total"));
}
