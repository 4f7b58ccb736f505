//! API server entry point.

use api::config::{Config, DEV_WEBHOOK_SECRET};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use store::{InMemoryRecordStore, PostgresRecordStore, RecordStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Serves HTTP and runs the queue worker until shutdown.
async fn serve<S: RecordStore + Clone + 'static>(
    store: S,
    backend: &'static str,
    config: Config,
    metrics_handle: PrometheusHandle,
) {
    let state = api::create_default_state(store, backend, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(state.services.worker.clone().run(shutdown_rx));

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, store = backend, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(err) = worker.await {
        tracing::error!(error = %err, "queue worker task failed");
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    if config.webhook_secret == DEV_WEBHOOK_SECRET {
        tracing::warn!("WEBHOOK_SECRET not set, using the development secret");
    }

    // 3. Pick the record store
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresRecordStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            serve(store, "postgres", config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory record store");
            serve(InMemoryRecordStore::new(), "memory", config, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
