//! License removal endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use domain::LicenseKey;
use provisioning::{ProvisioningError, RemovalOutcome};
use store::RecordStore;

use crate::AppState;
use crate::error::ApiError;

/// DELETE /licenses/{key}: runs the removal saga.
///
/// 200 when the license is deactivated, 202 when billing was removed and
/// deactivation was left to the worker.
#[tracing::instrument(skip(state))]
pub async fn remove<S: RecordStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
) -> Result<(StatusCode, Json<RemovalOutcome>), ApiError> {
    let license_key = LicenseKey::parse(&key).map_err(ProvisioningError::from)?;

    let outcome = state
        .services
        .removal
        .remove_license(&license_key, Utc::now())
        .await?;
    let status = match outcome {
        RemovalOutcome::Removed { .. } => StatusCode::OK,
        RemovalOutcome::DeactivationDeferred { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}
