use anyhow::{Context, Result};
use ingestor_service::api::{start_api_server, AppState};
use ingestor_service::config::Config;
use ingestor_service::ingest::Ingestor;
use ingestor_service::storage::build_store;
use ingestor_service::transform::SystemClock;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration; a missing bucket/table is fatal
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = %config.storage.backend,
        region = %config.storage.region,
        "Starting ingestor service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = build_store(&config.storage)
        .await
        .context("Failed to initialize storage backend")?;

    let ingestor = Arc::new(Ingestor::new(store, Arc::new(SystemClock::new())));

    let api_state = AppState {
        ingestor,
        service_name: Arc::from(config.service.name.as_str()),
        backend: config.storage.backend,
        region: Arc::from(config.storage.region.as_str()),
    };

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("Ingestor service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_lowercase()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_current_span(true))
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down, draining in-flight requests");
}
