//! HTTP surface of the purchase reconciliation service.
//!
//! Accepts signed payment notifications, exposes queue and license operator
//! endpoints, and hosts the queue worker, with structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod normalizer;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use provisioning::{InMemoryPaymentProcessor, Provisioning};
use store::{InMemoryCache, RecordStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use normalizer::SignatureVerifier;

/// Provisioning services as wired by this binary.
pub type Services<S> = Provisioning<S, InMemoryCache, InMemoryPaymentProcessor>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: RecordStore> {
    pub store: S,
    pub cache: InMemoryCache,
    pub processor: InMemoryPaymentProcessor,
    pub services: Services<S>,
    pub verifier: SignatureVerifier,
    /// Which record store backs this instance, reported by `/health`.
    pub backend: &'static str,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: RecordStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/webhook", post(routes::webhook::receive::<S>))
        .route("/queue-status", get(routes::queue::status::<S>))
        .route("/queue-items/{id}/reset", post(routes::queue::reset::<S>))
        .route("/licenses/{key}", delete(routes::licenses::remove::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state over `store` with the in-memory cache and processor.
pub fn create_default_state<S: RecordStore + Clone + 'static>(
    store: S,
    backend: &'static str,
    config: &Config,
) -> Arc<AppState<S>> {
    let cache = InMemoryCache::new();
    let processor = InMemoryPaymentProcessor::new();
    let services = Provisioning::new(
        store.clone(),
        cache.clone(),
        processor.clone(),
        config.provisioning(),
    );

    Arc::new(AppState {
        store,
        cache,
        processor,
        services,
        verifier: SignatureVerifier::new(
            config.webhook_secret.clone(),
            config.signature_tolerance_secs,
        ),
        backend,
    })
}
