//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::DomainError;
use provisioning::ProvisioningError;
use store::StoreError;

use crate::normalizer::NormalizerError;

/// API-level error type that maps to HTTP responses.
///
/// Every variant renders as `{ "error": { "code", "message" } }`.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Signature or envelope rejected.
    Webhook(NormalizerError),
    /// Provisioning or reversal failed.
    Provisioning(ProvisioningError),
    /// Persistence failed outside a provisioning flow.
    Store(StoreError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Webhook(err) => {
                tracing::warn!(error = %err, "webhook rejected");
                (StatusCode::BAD_REQUEST, err.code(), err.to_string())
            }
            ApiError::Provisioning(err) => provisioning_error_to_response(err),
            ApiError::Store(err) => store_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        };

        let body = serde_json::json!({ "error": { "code": code, "message": message } });
        (status, axum::Json(body)).into_response()
    }
}

fn provisioning_error_to_response(err: ProvisioningError) -> (StatusCode, &'static str, String) {
    match err {
        ProvisioningError::Store(store_err) => store_error_to_response(store_err),
        ProvisioningError::LicenseNotFound(_) => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
        ProvisioningError::LicenseInactive(_) => (StatusCode::CONFLICT, "license_inactive", err.to_string()),
        ProvisioningError::Domain(DomainError::InvalidLicenseKey(_)) => {
            (StatusCode::BAD_REQUEST, "bad_request", err.to_string())
        }
        ProvisioningError::Compensated { .. } => {
            tracing::error!(error = %err, "operation rolled back");
            (StatusCode::BAD_GATEWAY, "compensated", err.to_string())
        }
        ProvisioningError::Processor { transient: true, .. } | ProvisioningError::StepFailed { .. } => {
            tracing::error!(error = %err, "operation failed after retries");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
        }
        ProvisioningError::Processor { .. } => (StatusCode::BAD_GATEWAY, "processor_error", err.to_string()),
        _ => {
            tracing::error!(error = %err, "internal provisioning error");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
        }
    }
}

fn store_error_to_response(err: StoreError) -> (StatusCode, &'static str, String) {
    match &err {
        StoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
        StoreError::Conflict { .. } => (StatusCode::CONFLICT, "conflict", err.to_string()),
        _ if err.is_transient() => {
            tracing::error!(error = %err, "store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "store error");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
        }
    }
}

impl From<NormalizerError> for ApiError {
    fn from(err: NormalizerError) -> Self {
        ApiError::Webhook(err)
    }
}

impl From<ProvisioningError> for ApiError {
    fn from(err: ProvisioningError) -> Self {
        ApiError::Provisioning(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn render(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_body_shape() {
        let (status, body) = render(ApiError::BadRequest("missing reference".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
        assert_eq!(body["error"]["message"], "missing reference");
    }

    #[tokio::test]
    async fn test_provisioning_error_statuses() {
        let cases = [
            (ProvisioningError::LicenseNotFound("K".into()), StatusCode::NOT_FOUND),
            (ProvisioningError::LicenseInactive("K".into()), StatusCode::CONFLICT),
            (
                ProvisioningError::Compensated {
                    step: "delete_billing_item",
                    reason: "declined".into(),
                    snapshot_restored: true,
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ProvisioningError::transient("delete_billing_item", "timeout"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProvisioningError::permanent("delete_billing_item", "no such item"),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ProvisioningError::Store(StoreError::Unavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            let (status, _) = render(ApiError::from(err)).await;
            assert_eq!(status, expected);
        }
    }

    #[tokio::test]
    async fn test_webhook_errors_are_bad_requests() {
        let (status, body) = render(ApiError::from(NormalizerError::SignatureMismatch)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_signature");
    }
}
