//! Queue inspection and manual reset endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Utc;
use common::QueueItemId;
use domain::QueueItem;
use serde::{Deserialize, Serialize};
use store::{QueueSummary, RecordStore};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct QueueStatusQuery {
    pub reference: Option<String>,
}

#[derive(Serialize)]
pub struct QueueStatusResponse {
    #[serde(flatten)]
    pub summary: QueueSummary,
    pub items: Vec<QueueItemResponse>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemResponse {
    pub queue_id: String,
    pub task: &'static str,
    pub status: String,
    pub attempts: u32,
    pub license_key: String,
    pub reference: String,
    pub unit_index: u32,
    pub next_retry_at: Option<chrono::DateTime<Utc>>,
    pub error_message: Option<String>,
    pub refund_id: Option<String>,
}

impl From<&QueueItem> for QueueItemResponse {
    fn from(item: &QueueItem) -> Self {
        Self {
            queue_id: item.queue_id.to_string(),
            task: item.task.as_str(),
            status: item.status.to_string(),
            attempts: item.attempts,
            license_key: item.unit.license_key.to_string(),
            reference: item.unit.reference.clone(),
            unit_index: item.unit.unit_index,
            next_retry_at: item.next_retry_at,
            error_message: item.error_message().map(str::to_string),
            refund_id: item.refund_id.clone(),
        }
    }
}

/// GET /queue-status?reference=: items for a payer, arrangement or event id.
#[tracing::instrument(skip(state))]
pub async fn status<S: RecordStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<QueueStatusQuery>,
) -> Result<Json<QueueStatusResponse>, ApiError> {
    let reference = query
        .reference
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("reference query parameter is required".to_string()))?;

    let items = state.store.queue_items_for_reference(&reference).await?;
    Ok(Json(QueueStatusResponse {
        summary: QueueSummary::from_items(&items),
        items: items.iter().map(QueueItemResponse::from).collect(),
    }))
}

/// POST /queue-items/{id}/reset: puts a failed item back to pending.
#[tracing::instrument(skip(state))]
pub async fn reset<S: RecordStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<QueueItemResponse>, ApiError> {
    let uuid = uuid::Uuid::parse_str(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid queue item id: {e}")))?;

    let item = state
        .store
        .reset_failed_queue_item(QueueItemId::from_uuid(uuid), Utc::now())
        .await?;
    metrics::counter!("queue_items_reset_total").increment(1);
    tracing::info!(queue_id = %item.queue_id, "queue item reset by operator");
    Ok(Json(QueueItemResponse::from(&item)))
}
