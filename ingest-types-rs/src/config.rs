// ingest-types-rs/src/config.rs
// Configuration loader for the ingestion pipeline

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{lookback_window, RecoveryStrategy, SourceKind};

/// Environment variable pointing at the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "INGEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "./config/ingest.toml";

/// Source name under which run summaries are recorded.
pub const PIPELINE_SOURCE: &str = "pipeline";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything `ingestd` reads at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    pub resilience: ResilienceConfig,
    pub pipeline: PipelineConfig,
    pub monitoring: MonitoringConfig,
    pub storage: StorageConfig,
    pub logging: LoggingSettings,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub max_retry_delay_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_ms: u64,
    /// Tried in order after the first invocation fails.
    pub fallback_strategies: Vec<RecoveryStrategy>,
    pub max_dead_letters_per_source: usize,
    pub snapshot_ttl_ms: u64,
    /// Extra time a snapshot may be served after its TTL expired.
    pub snapshot_max_stale_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            exponential_backoff: true,
            max_retry_delay_ms: 30_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
            fallback_strategies: vec![
                RecoveryStrategy::Retry,
                RecoveryStrategy::Partial,
                RecoveryStrategy::Cached,
                RecoveryStrategy::Skip,
            ],
            max_dead_letters_per_source: 1_000,
            snapshot_ttl_ms: 3_600_000,
            snapshot_max_stale_ms: 21_600_000,
        }
    }
}

impl ResilienceConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn snapshot_max_stale(&self) -> Duration {
        Duration::from_millis(self.snapshot_max_stale_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_concurrent_sources: usize,
    pub processing_timeout_ms: u64,
    /// Per-call connector budget; falls back to `processing_timeout_ms`.
    pub connector_timeout_ms: Option<u64>,
    pub default_lookback: String,
    pub record_types: Vec<String>,
    pub result_limit: usize,
    pub collection_interval_secs: u64,
    /// Fields every record must carry to pass validation.
    pub required_fields: Vec<String>,
    /// Fingerprints remembered across runs by the deduplicator.
    pub dedup_window: usize,
    /// Identify records by this field instead of their full content.
    pub dedup_key_field: Option<String>,
    /// Passed to every connector with each query.
    pub source_filters: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_concurrent_sources: 5,
            processing_timeout_ms: 300_000,
            connector_timeout_ms: None,
            default_lookback: "24h".to_string(),
            record_types: vec![
                "alert".to_string(),
                "incident".to_string(),
                "detection".to_string(),
            ],
            result_limit: 10_000,
            collection_interval_secs: 300,
            required_fields: Vec::new(),
            dedup_window: 100_000,
            dedup_key_field: None,
            source_filters: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn connector_timeout(&self) -> Duration {
        Duration::from_millis(self.connector_timeout_ms.unwrap_or(self.processing_timeout_ms))
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub error_rate: f64,
    pub latency_ms: f64,
    pub throughput_min: f64,
    pub queue_size: u64,
    pub memory_usage_percent: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            latency_ms: 5_000.0,
            throughput_min: 1.0,
            queue_size: 1_000,
            memory_usage_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub alert_thresholds: AlertThresholds,
    pub retention_days: u32,
    /// Number of most recent samples a health check looks at.
    pub health_window_samples: usize,
    pub alert_webhook_url: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_interval_ms: 60_000,
            health_check_interval_ms: 30_000,
            alert_thresholds: AlertThresholds::default(),
            retention_days: 7,
            health_window_samples: 5,
            alert_webhook_url: None,
        }
    }
}

impl MonitoringConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/ingested"),
            file_prefix: "records".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub log_dir: Option<PathBuf>,
    pub service_name: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
            service_name: "ingestd".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

/// One upstream platform to pull telemetry from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSON pointer to the record array inside the response body.
    #[serde(default)]
    pub records_pointer: Option<String>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub api_token_env: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl IngestConfig {
    /// Loads configuration from `INGEST_CONFIG_PATH` (or the default path),
    /// applies environment overrides and validates the result.
    ///
    /// A missing default file yields the built-in defaults; a missing file
    /// named explicitly through the environment is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = env::var(CONFIG_PATH_ENV).ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else if let Some(explicit) = explicit {
            return Err(ConfigError::FileNotFound(explicit));
        } else {
            info!(path = %path.display(), "No configuration file found, using defaults");
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Applies `INGEST_*` overrides obtained through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, value)))
        }

        fn flag(key: &str, value: &str) -> Result<bool, ConfigError> {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue(format!("{}={}", key, value))),
            }
        }

        if let Some(v) = lookup("INGEST_MAX_RETRIES") {
            self.resilience.max_retries = parse("INGEST_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("INGEST_MAX_CONCURRENT_SOURCES") {
            self.pipeline.max_concurrent_sources = parse("INGEST_MAX_CONCURRENT_SOURCES", &v)?;
        }
        if let Some(v) = lookup("INGEST_PROCESSING_TIMEOUT_MS") {
            self.pipeline.processing_timeout_ms = parse("INGEST_PROCESSING_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("INGEST_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("INGEST_LOG_JSON") {
            self.logging.json = flag("INGEST_LOG_JSON", &v)?;
        }
        if let Some(v) = lookup("INGEST_ALERT_WEBHOOK_URL") {
            self.monitoring.alert_webhook_url = Some(v).filter(|url| !url.trim().is_empty());
        }
        if let Some(v) = lookup("INGEST_STORAGE_PATH") {
            self.storage.output_dir = PathBuf::from(v);
        }
        Ok(())
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidValue(msg));
        let r = &self.resilience;
        let p = &self.pipeline;
        let m = &self.monitoring;

        if r.circuit_breaker_threshold == 0 {
            return invalid("circuit_breaker_threshold must be at least 1".into());
        }
        if r.retry_delay_ms > r.max_retry_delay_ms {
            return invalid(format!(
                "retry_delay_ms ({}) exceeds max_retry_delay_ms ({})",
                r.retry_delay_ms, r.max_retry_delay_ms
            ));
        }
        let mut strategies = HashSet::new();
        for strategy in &r.fallback_strategies {
            if !strategies.insert(strategy) {
                return invalid(format!("fallback strategy '{}' listed twice", strategy));
            }
        }
        if r.max_dead_letters_per_source == 0 {
            return invalid("max_dead_letters_per_source must be at least 1".into());
        }

        if p.max_concurrent_sources == 0 {
            return invalid("max_concurrent_sources must be at least 1".into());
        }
        if p.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if p.processing_timeout_ms == 0 || p.connector_timeout_ms == Some(0) {
            return invalid("processing and connector timeouts must be positive".into());
        }
        if p.collection_interval_secs == 0 {
            return invalid("collection_interval_secs must be positive".into());
        }
        if let Err(e) = lookback_window(&p.default_lookback, chrono::Utc::now()) {
            return invalid(e.to_string());
        }

        if m.metrics_interval_ms == 0 || m.health_check_interval_ms == 0 {
            return invalid("monitoring intervals must be positive".into());
        }
        if m.retention_days == 0 || m.retention_days > 36_500 {
            return invalid("retention_days must be between 1 and 36500".into());
        }
        if m.health_window_samples == 0 {
            return invalid("health_window_samples must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&m.alert_thresholds.error_rate) {
            return invalid(format!(
                "alert_thresholds.error_rate must be within [0, 1], got {}",
                m.alert_thresholds.error_rate
            ));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            let name = source.name.trim();
            if name.is_empty() {
                return invalid("source name must not be empty".into());
            }
            if name == PIPELINE_SOURCE {
                return invalid(format!("source name '{}' is reserved", PIPELINE_SOURCE));
            }
            if !names.insert(name) {
                return invalid(format!("duplicate source name '{}'", name));
            }
            if source.endpoint.trim().is_empty() {
                return invalid(format!("source '{}' has no endpoint", name));
            }
        }

        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}
