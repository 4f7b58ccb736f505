//! Inbound payment notification endpoint.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use provisioning::{DispatchOutcome, NormalizedEvent};
use store::RecordStore;

use crate::AppState;
use crate::error::ApiError;
use crate::normalizer::{self, SIGNATURE_HEADER};

/// POST /webhook: verifies, records and dispatches one notification.
///
/// Once the event is recorded the response is 200 whatever the provisioning
/// outcome, so the sender does not redeliver it. Only a failure to record
/// surfaces as a 5xx.
#[tracing::instrument(skip_all)]
pub async fn receive<S: RecordStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DispatchOutcome>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(err) = state.verifier.verify(&body, signature, Utc::now().timestamp()) {
        metrics::counter!("webhooks_rejected_total", "reason" => err.code()).increment(1);
        return Err(err.into());
    }

    let event = normalizer::normalize(&body).inspect_err(|err| {
        metrics::counter!("webhooks_rejected_total", "reason" => err.code()).increment(1);
    })?;
    metrics::counter!("webhooks_received_total", "type" => event_kind(&event)).increment(1);

    let outcome = state.services.webhooks.handle(event, Utc::now()).await?;
    tracing::info!(outcome = ?outcome, "webhook accepted");

    Ok(Json(outcome))
}

fn event_kind(event: &NormalizedEvent) -> String {
    match event {
        NormalizedEvent::Purchase(purchase) => purchase.event_type.to_string(),
        NormalizedEvent::ArrangementSync { .. } => "arrangement_sync".to_string(),
        NormalizedEvent::Ignored { .. } => "ignored".to_string(),
    }
}
