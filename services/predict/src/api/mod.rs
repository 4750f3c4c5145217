//! HTTP surface of the prediction service.

mod error;
mod predict;
mod response;

pub use error::{ApiError, ErrorResponse};
pub use predict::{sanitize_filename, upload_result, IMAGE_FIELD};
pub use response::{format_timestamp, PredictResponse, ResultRecord};

use crate::alerting::Alerter;
use crate::config::{ApiConfig, Config, LimitsConfig, LinkMode};
use crate::detection::Detector;
use crate::identifier::IdGenerator;
use crate::storage::ObjectStore;
use crate::validator::FileValidator;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Per-request settings derived from configuration
#[derive(Debug, Clone)]
pub struct PredictSettings {
    pub service_name: String,
    pub validator: FileValidator,
    pub result_dir: PathBuf,
    pub storage_prefix: String,
    pub resolution: u32,
    pub link_mode: LinkMode,
    pub presigned_url_expiry: Duration,
    pub ids: IdGenerator,
}

impl PredictSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_name: config.service.name.clone(),
            validator: FileValidator::from_limits(&config.limits),
            result_dir: config.results.result_dir.clone(),
            storage_prefix: config.results.storage_prefix.clone(),
            resolution: config.model.resolution,
            link_mode: config.storage.link_mode,
            presigned_url_expiry: config.presigned_url_expiry(),
            ids: IdGenerator::new(config.results.id_max_attempts),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub detector: Arc<dyn Detector>,
    pub storage: Arc<dyn ObjectStore>,
    pub settings: Arc<PredictSettings>,
    pub alerter: Arc<Alerter>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig, limits: &LimitsConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route(
            &config.predict_route,
            post(predict::predict).fallback(method_not_allowed),
        )
        .route("/health", get(health_check))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(limits.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.settings.service_name,
        "model": state.detector.name(),
        "storage": state.storage.backend(),
    }))
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Start the prediction API server, stopping when `shutdown` resolves
pub async fn start_api_server<F>(
    state: AppState,
    config: &ApiConfig,
    limits: &LimitsConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config, limits);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, route = %config.predict_route, "Starting prediction API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
