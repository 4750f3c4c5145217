use anyhow::{Context, Result};
use predict_service::api::{start_api_server, AppState, PredictSettings};
use predict_service::config::{Config, StorageBackend};
use predict_service::detection::{Detector, YoloDetector};
use predict_service::storage::{MemoryStore, ObjectStore, S3Store};
use predict_service::Alerter;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        route = %config.api.predict_route,
        "Starting Predict Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let storage = init_storage(&config).await?;

    // Model is loaded once and shared by every request
    let model_config = config.model.clone();
    let detector: Arc<dyn Detector> = Arc::new(
        tokio::task::spawn_blocking(move || YoloDetector::load(&model_config))
            .await
            .context("Model loading task failed")?
            .context("Failed to load detection model")?,
    );

    tokio::fs::create_dir_all(&config.results.result_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create result directory {}",
                config.results.result_dir.display()
            )
        })?;

    let state = AppState {
        detector,
        storage,
        settings: Arc::new(PredictSettings::from_config(&config)),
        alerter: Arc::new(Alerter::new(&config.service.name, &config.alerting)),
    };

    start_api_server(state, &config.api, &config.limits, shutdown_signal()).await?;

    info!("Predict service stopped");

    Ok(())
}

/// Select and initialize the object store backend
async fn init_storage(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.backend {
        StorageBackend::S3 => {
            let store = S3Store::new(&config.storage, config.service.project_id.clone())
                .await
                .context("Failed to initialize S3 store")?;
            store
                .ensure_bucket()
                .await
                .context("Failed to prepare bucket")?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, results are lost on restart");
            Ok(Arc::new(MemoryStore::new(config.storage.bucket.clone())))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
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
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
}
