// ingest-types-rs/src/model.rs
// Data model shared by every stage of an ingestion run

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque record as returned by a source connector.
pub type RawRecord = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("invalid time range token '{0}': expected <n><s|m|h|d|w>")]
    InvalidTimeRange(String),
}

/// Platform family a source belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Siem,
    Soar,
    Edr,
    #[default]
    Other,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Siem => write!(f, "siem"),
            SourceKind::Soar => write!(f, "soar"),
            SourceKind::Edr => write!(f, "edr"),
            SourceKind::Other => write!(f, "other"),
        }
    }
}

/// Parses a lookback token such as `15m`, `24h` or `7d`.
pub fn parse_lookback(token: &str) -> Result<Duration, ModelError> {
    let token = token.trim();
    let invalid = || ModelError::InvalidTimeRange(token.to_string());

    let unit = token.chars().last().ok_or_else(invalid)?;
    let amount: i64 = token[..token.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }

    let span = match unit {
        's' => Duration::try_seconds(amount),
        'm' => Duration::try_minutes(amount),
        'h' => Duration::try_hours(amount),
        'd' => Duration::try_days(amount),
        'w' => Duration::try_weeks(amount),
        _ => None,
    };
    span.ok_or_else(invalid)
}

/// Resolves `token` into a window ending at `latest`.
pub fn lookback_window(token: &str, latest: DateTime<Utc>) -> Result<TimeWindow, ModelError> {
    let span = parse_lookback(token)?;
    let earliest = latest
        .checked_sub_signed(span)
        .ok_or_else(|| ModelError::InvalidTimeRange(token.trim().to_string()))?;
    Ok(TimeWindow { earliest, latest })
}

/// Absolute `[earliest, latest)` window a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.earliest && at < self.latest
    }

    pub fn is_empty(&self) -> bool {
        self.earliest >= self.latest
    }
}

/// Query handed to every connector during one run.
///
/// The window is resolved when the query is built so that retries of the
/// same collection ask for exactly the same slice of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceQuery {
    pub time_range: String,
    pub window: TimeWindow,
    pub record_types: Vec<String>,
    pub result_limit: usize,
    pub source_filters: Vec<String>,
}

impl SourceQuery {
    /// Builds a query covering `token` back from now.
    pub fn lookback(
        token: &str,
        record_types: Vec<String>,
        result_limit: usize,
    ) -> Result<Self, ModelError> {
        let window = lookback_window(token, Utc::now())?;
        Ok(Self {
            time_range: token.trim().to_string(),
            window,
            record_types,
            result_limit,
            source_filters: Vec::new(),
        })
    }

    /// Builds an incremental query from `earliest` up to now.
    pub fn since(earliest: DateTime<Utc>, record_types: Vec<String>, result_limit: usize) -> Self {
        let latest = Utc::now();
        Self {
            time_range: format!("since:{}", earliest.to_rfc3339()),
            window: TimeWindow {
                earliest: earliest.min(latest),
                latest,
            },
            record_types,
            result_limit,
            source_filters: Vec::new(),
        }
    }

    pub fn with_source_filters(mut self, filters: Vec<String>) -> Self {
        self.source_filters = filters;
        self
    }
}

/// Recovery strategies the resilience engine can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Retry,
    Skip,
    Partial,
    Cached,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::Retry => write!(f, "retry"),
            RecoveryStrategy::Skip => write!(f, "skip"),
            RecoveryStrategy::Partial => write!(f, "partial"),
            RecoveryStrategy::Cached => write!(f, "cached"),
        }
    }
}

/// How the records of a guarded call were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyUsed {
    /// First invocation succeeded.
    Direct,
    Retry,
    Skip,
    Partial,
    Cached,
    CircuitReset,
    Failed,
}

impl StrategyUsed {
    /// True when the records came from somewhere other than the source itself.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            StrategyUsed::Skip | StrategyUsed::Partial | StrategyUsed::Cached
        )
    }
}

impl From<RecoveryStrategy> for StrategyUsed {
    fn from(strategy: RecoveryStrategy) -> Self {
        match strategy {
            RecoveryStrategy::Retry => StrategyUsed::Retry,
            RecoveryStrategy::Skip => StrategyUsed::Skip,
            RecoveryStrategy::Partial => StrategyUsed::Partial,
            RecoveryStrategy::Cached => StrategyUsed::Cached,
        }
    }
}

impl fmt::Display for StrategyUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyUsed::Direct => "direct",
            StrategyUsed::Retry => "retry",
            StrategyUsed::Skip => "skip",
            StrategyUsed::Partial => "partial",
            StrategyUsed::Cached => "cached",
            StrategyUsed::CircuitReset => "circuit_reset",
            StrategyUsed::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one source's collection within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_name: String,
    pub source_kind: SourceKind,
    pub success: bool,
    pub record_count: usize,
    pub elapsed_ms: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub strategy_used: StrategyUsed,
    pub attempt_count: u32,
    /// Time slice the source was asked for.
    pub window: TimeWindow,
}

impl SourceResult {
    /// True when the source answered for its whole window, so the window
    /// need not be requested again. Skipped, cached or partial answers do
    /// not count.
    pub fn covered_window(&self) -> bool {
        self.success
            && matches!(
                self.strategy_used,
                StrategyUsed::Direct | StrategyUsed::Retry | StrategyUsed::CircuitReset
            )
    }
}

/// Whether a sample came from a pipeline run or from the periodic poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    #[default]
    Collection,
    System,
}

/// One point of a source's metrics time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionMetrics {
    pub timestamp: DateTime<Utc>,
    pub source_name: String,
    pub sample_kind: SampleKind,
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_records: u64,
    pub duplicate_records: u64,
    pub elapsed_ms: u64,
    pub throughput_per_second: f64,
    pub error_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub queue_size: u64,
    pub cache_hit_rate: f64,
    pub memory_usage_percent: f64,
    pub cpu_usage_percent: f64,
}

/// Partial sample handed to the monitoring service; unset fields become zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub timestamp: Option<DateTime<Utc>>,
    pub sample_kind: SampleKind,
    pub total_records: Option<u64>,
    pub processed_records: Option<u64>,
    pub failed_records: Option<u64>,
    pub duplicate_records: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub throughput_per_second: Option<f64>,
    pub error_rate: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub queue_size: Option<u64>,
    pub cache_hit_rate: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
}

impl MetricsUpdate {
    pub fn into_sample(self, source_name: &str) -> IngestionMetrics {
        IngestionMetrics {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source_name: source_name.to_string(),
            sample_kind: self.sample_kind,
            total_records: self.total_records.unwrap_or(0),
            processed_records: self.processed_records.unwrap_or(0),
            failed_records: self.failed_records.unwrap_or(0),
            duplicate_records: self.duplicate_records.unwrap_or(0),
            elapsed_ms: self.elapsed_ms.unwrap_or(0),
            throughput_per_second: self.throughput_per_second.unwrap_or(0.0),
            error_rate: self.error_rate.unwrap_or(0.0).clamp(0.0, 1.0),
            latency_p50_ms: self.latency_p50_ms.unwrap_or(0.0),
            latency_p95_ms: self.latency_p95_ms.unwrap_or(0.0),
            latency_p99_ms: self.latency_p99_ms.unwrap_or(0.0),
            queue_size: self.queue_size.unwrap_or(0),
            cache_hit_rate: self.cache_hit_rate.unwrap_or(0.0),
            memory_usage_percent: self.memory_usage_percent.unwrap_or(0.0),
            cpu_usage_percent: self.cpu_usage_percent.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Low => write!(f, "LOW"),
            AlertSeverity::Medium => write!(f, "MEDIUM"),
            AlertSeverity::High => write!(f, "HIGH"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Threshold,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub source_name: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    /// Metric dimension that was breached, e.g. `error_rate`.
    pub metric: String,
    pub message: String,
    pub observed: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn threshold(
        source_name: &str,
        severity: AlertSeverity,
        metric: &str,
        observed: f64,
        threshold: f64,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_name: source_name.to_string(),
            kind: AlertKind::Threshold,
            severity,
            metric: metric.to_string(),
            message,
            observed,
            threshold,
            raised_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        }
    }

    pub fn resolve(&mut self) {
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: AlertSeverity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub source_name: String,
    pub status: HealthState,
    pub issues: Vec<HealthIssue>,
    pub last_checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// Derives the overall state from the collected issues.
    pub fn from_issues(source_name: &str, issues: Vec<HealthIssue>) -> Self {
        let status = if issues.iter().any(|i| i.severity >= AlertSeverity::High) {
            HealthState::Unhealthy
        } else if issues.iter().any(|i| i.severity == AlertSeverity::Medium) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        Self {
            source_name: source_name.to_string(),
            status,
            issues,
            last_checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Full,
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Stages of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Collecting,
    Processing,
    Validating,
    Deduplicating,
    Storing,
    RecordingMetrics,
    Done,
    Errored,
}

impl RunStage {
    /// The stage that follows a successful `self`.
    pub fn next(self) -> RunStage {
        match self {
            RunStage::Collecting => RunStage::Processing,
            RunStage::Processing => RunStage::Validating,
            RunStage::Validating => RunStage::Deduplicating,
            RunStage::Deduplicating => RunStage::Storing,
            RunStage::Storing => RunStage::RecordingMetrics,
            RunStage::RecordingMetrics | RunStage::Done => RunStage::Done,
            RunStage::Errored => RunStage::Errored,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStage::Done | RunStage::Errored)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Collecting => "collecting",
            RunStage::Processing => "processing",
            RunStage::Validating => "validating",
            RunStage::Deduplicating => "deduplicating",
            RunStage::Storing => "storing",
            RunStage::RecordingMetrics => "recording_metrics",
            RunStage::Done => "done",
            RunStage::Errored => "errored",
        };
        write!(f, "{}", name)
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub total_records: usize,
    pub processed_records: usize,
    pub failed_records: usize,
    pub duplicate_records: usize,
    pub elapsed_ms: u64,
    pub per_source_results: Vec<SourceResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub completed_stage: RunStage,
}

impl IngestionResult {
    pub fn new(run_id: Uuid, mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            mode,
            started_at,
            success: false,
            total_records: 0,
            processed_records: 0,
            failed_records: 0,
            duplicate_records: 0,
            elapsed_ms: 0,
            per_source_results: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            completed_stage: RunStage::Collecting,
        }
    }
}
