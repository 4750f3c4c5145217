use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest processing resolution; below it the YOLOv5 anchor count drops
/// under the attribute count and the output layout becomes ambiguous
pub const MIN_RESOLUTION: u32 = 64;

/// Main configuration for the prediction service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Request payload limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Local result staging and storage layout
    #[serde(default)]
    pub results: ResultsConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Detection model configuration
    #[serde(default)]
    pub model: ModelConfig,
    /// Failure alerting configuration
    #[serde(default)]
    pub alerting: AlertingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Cloud project identifier, attached to uploaded objects
    pub project_id: Option<String>,
}

/// API configuration for the prediction endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Route serving predictions
    #[serde(default = "default_predict_route")]
    pub predict_route: String,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Limits applied to incoming prediction payloads
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of `image` parts per request
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Maximum size of one image part in bytes
    #[serde(default = "default_max_item_bytes")]
    pub max_item_bytes: u64,
    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Content type tokens an image part must contain
    #[serde(default = "default_accepted_types")]
    pub accepted_types: Vec<String>,
}

/// Local staging directory and storage key layout
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsConfig {
    /// Directory annotated images are written to
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
    /// Key prefix for uploaded results
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    /// Attempts before identifier generation gives up
    #[serde(default = "default_id_max_attempts")]
    pub id_max_attempts: u32,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Memory,
}

/// How download links are produced for uploaded results
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Objects are made public and the public URL is returned
    #[default]
    Public,
    /// Objects stay private and a presigned URL is returned
    Signed,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: StorageBackend,
    /// Bucket name for result storage
    #[serde(default)]
    pub bucket: String,
    /// Storage region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL for public object links (CDN, access point)
    pub public_base_url: Option<String>,
    /// Download link mode
    #[serde(default)]
    pub link_mode: LinkMode,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Create the bucket at startup when it does not exist
    #[serde(default = "default_true")]
    pub create_bucket_if_missing: bool,
}

/// Detection model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Path to the ONNX model file
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
    /// Optional label file, one class name per line
    pub labels_path: Option<PathBuf>,
    /// Processing resolution (320 favours speed, 640 accuracy)
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    /// Minimum confidence for a detection
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// IoU threshold for non-maximum suppression
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Maximum detections kept per image
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    /// Intra-op threads for the inference session
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

/// Alerting configuration for internal failures
#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    /// Enable alert delivery
    #[serde(default)]
    pub enabled: bool,
    /// SMTP server alerts are mailed through
    pub mail_server: Option<String>,
    /// SMTP port
    #[serde(default = "default_mail_port")]
    pub mail_port: u16,
    /// SMTP username
    pub mail_username: Option<String>,
    /// SMTP password
    pub mail_password: Option<String>,
    /// Use STARTTLS when talking to the mail server
    #[serde(default = "default_true")]
    pub mail_use_tls: bool,
    /// Webhook relay receiving alert payloads
    pub webhook_url: Option<String>,
    /// Sender address
    pub from_addr: Option<String>,
    /// Recipient addresses
    #[serde(default)]
    pub to_addrs: Vec<String>,
    /// Alert subject line
    #[serde(default = "default_alert_subject")]
    pub subject: String,
}

// Default value functions
fn default_service_name() -> String {
    "predict-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_predict_route() -> String {
    "/predict".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_items() -> usize {
    2
}

fn default_max_item_bytes() -> u64 {
    2 * 1024 * 1024 // 2MB
}

fn default_max_body_bytes() -> usize {
    6_097_152
}

fn default_accepted_types() -> Vec<String> {
    vec!["image".to_string()]
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("results/detect")
}

fn default_storage_prefix() -> String {
    "results".to_string()
}

fn default_id_max_attempts() -> u32 {
    16
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    900 // 15 minutes
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_model_path() -> PathBuf {
    PathBuf::from("resources/models/yolov5s.onnx")
}

fn default_resolution() -> u32 {
    320
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_max_detections() -> usize {
    1000
}

fn default_intra_threads() -> usize {
    4
}

fn default_mail_port() -> u16 {
    587
}

fn default_alert_subject() -> String {
    "Application Error".to_string()
}

impl Config {
    /// Load configuration from `.env`, config files and environment
    pub fn load() -> anyhow::Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/predict").required(false))
            .add_source(config::File::with_name("/etc/predict/predict").required(false))
            // Override with environment variables
            // PREDICT__STORAGE__BUCKET -> storage.bucket
            .add_source(
                config::Environment::with_prefix("PREDICT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("limits.accepted_types")
                    .with_list_parse_key("api.cors_origins")
                    .with_list_parse_key("alerting.to_addrs")
                    .try_parsing(true),
            )
            // Flat variable names used by existing deployments
            .set_override_option("service.project_id", env_var("PROJECT_ID"))?
            .set_override_option("storage.region", env_var("PROJECT_REGION"))?
            .set_override_option("storage.bucket", env_var("BUCKET_NAME"))?
            .set_override_option("results.result_dir", env_var("RESULT_PATH"))?
            .set_override_option("results.storage_prefix", env_var("CLOUD_BUCKET_PREFIX"))?
            .set_override_option("limits.max_body_bytes", env_var("MAX_CONTENT_LENGTH"))?
            .set_override_option("alerting.mail_server", env_var("MAIL_SERVER"))?
            .set_override_option("alerting.mail_port", env_var("MAIL_PORT"))?
            .set_override_option("alerting.mail_username", env_var("MAIL_USERNAME"))?
            .set_override_option("alerting.mail_password", env_var("MAIL_PASSWORD"))?
            .set_override_option("alerting.from_addr", env_var("FROM_ADDR"))?
            .set_override_option("alerting.to_addrs", env_var("TO_ADDR").map(|v| split_list(&v)))?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.bucket".to_string(),
            ));
        }

        if !self.api.predict_route.starts_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.predict_route".to_string(),
                message: "Route must start with '/'".to_string(),
            });
        }

        if self.limits.max_items == 0 || self.limits.max_item_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "limits".to_string(),
                message: "Item limits must be greater than 0".to_string(),
            });
        }

        if self.limits.max_body_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "limits.max_body_bytes".to_string(),
                message: "Body limit must be greater than 0".to_string(),
            });
        }

        if self.model.resolution < MIN_RESOLUTION {
            return Err(ConfigValidationError::InvalidValue {
                field: "model.resolution".to_string(),
                message: format!("Resolution must be at least {}", MIN_RESOLUTION),
            });
        }

        if self.alerting.enabled
            && self.alerting.mail_server.is_some()
            && (self.alerting.from_addr.is_none() || self.alerting.to_addrs.is_empty())
        {
            return Err(ConfigValidationError::MissingField(
                "alerting.from_addr/alerting.to_addrs".to_string(),
            ));
        }

        if self.results.id_max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "results.id_max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
            project_id: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            predict_route: default_predict_route(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            max_item_bytes: default_max_item_bytes(),
            max_body_bytes: default_max_body_bytes(),
            accepted_types: default_accepted_types(),
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            result_dir: default_result_dir(),
            storage_prefix: default_storage_prefix(),
            id_max_attempts: default_id_max_attempts(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
            link_mode: LinkMode::default(),
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
            create_bucket_if_missing: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            labels_path: None,
            resolution: default_resolution(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            intra_threads: default_intra_threads(),
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mail_server: None,
            mail_port: default_mail_port(),
            mail_username: None,
            mail_password: None,
            mail_use_tls: true,
            webhook_url: None,
            from_addr: None,
            to_addrs: Vec::new(),
            subject: default_alert_subject(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            api: ApiConfig::default(),
            limits: LimitsConfig::default(),
            results: ResultsConfig::default(),
            storage: StorageConfig {
                bucket: "test-bucket".to_string(),
                ..StorageConfig::default()
            },
            model: ModelConfig::default(),
            alerting: AlertingConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_items(), 2);
        assert_eq!(default_max_item_bytes(), 2_097_152);
        assert_eq!(default_resolution(), 320);
        assert_eq!(default_presigned_url_expiry_secs(), 900);
        assert_eq!(default_storage_prefix(), "results");
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.presigned_url_expiry(), Duration::from_secs(900));
    }

    #[test]
    fn test_missing_bucket() {
        let mut config = create_test_config();
        config.storage.bucket = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));

        // The in-memory backend has no bucket to check
        config.storage.backend = StorageBackend::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_route() {
        let mut config = create_test_config();
        config.api.predict_route = "predict".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = create_test_config();
        config.limits.max_items = 0;
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.model.resolution = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolution_bounds() {
        let mut config = create_test_config();
        config.model.resolution = 32;
        assert!(config.validate().is_err());

        config.model.resolution = MIN_RESOLUTION;
        assert!(config.validate().is_ok());

        config.model.resolution = 640;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mail_alerting_needs_envelope() {
        let mut config = create_test_config();
        config.alerting.enabled = true;
        config.alerting.mail_server = Some("smtp.example.com".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));

        config.alerting.from_addr = Some("predict@example.com".to_string());
        config.alerting.to_addrs = vec!["ops@example.com".to_string()];
        assert!(config.validate().is_ok());
        assert_eq!(config.alerting.mail_port, 587);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("ops@example.com, dev@example.com,,"),
            vec!["ops@example.com", "dev@example.com"]
        );
    }

    #[test]
    fn test_enum_deserialization() {
        let mode: LinkMode = serde_json::from_str("\"signed\"").unwrap();
        assert_eq!(mode, LinkMode::Signed);
        let backend: StorageBackend = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(backend, StorageBackend::Memory);
    }
}
