//! # Pipeline Orchestrator
//!
//! Drives one ingestion run through
//! `Collecting → Processing → Validating → Deduplicating → Storing →
//! RecordingMetrics → Done`, or `Errored` when a pipeline stage fails.
//!
//! Collection fans out over every connector with bounded concurrency, each
//! call guarded by the [`ResilienceEngine`], so one source failing never
//! aborts the run. Later stages run sequentially over the records grouped by
//! source, each bounded by the processing timeout. Every run, failed or not,
//! ends with a summary sample for the `pipeline` source and one sample per
//! source in the monitoring service.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use ingest_types_rs::{
    IngestionResult, MetricsUpdate, PipelineConfig, RawRecord, RunMode, RunStage, SourceQuery,
    SourceResult, PIPELINE_SOURCE,
};
use metrics::{counter, histogram};
use monitoring_rs::MonitoringService;
use resilience_rs::{operation, Error, ReprocessReport, ResilienceEngine, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collaborators::{Deduplicator, SourceConnector, StorageSink, Validator};
use crate::probe::EngineProbe;
use crate::watermark::Watermarks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    /// Every connector answered
    Healthy,
    /// Some connectors are down
    Degraded,
    /// No connector answered
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorCheck {
    pub source_name: String,
    pub up: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub healthy: bool,
    pub status: OverallHealth,
    pub issues: Vec<String>,
    pub checks: Vec<ConnectorCheck>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
struct SourceTally {
    collected: usize,
    processed: usize,
    failed: usize,
    duplicate: usize,
}

/// Which query each connector is asked during one run.
type Plan = Vec<(Arc<dyn SourceConnector>, SourceQuery)>;

struct Collected {
    result: SourceResult,
    records: Vec<RawRecord>,
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    connectors: Vec<Arc<dyn SourceConnector>>,
    validator: Arc<dyn Validator>,
    deduplicator: Arc<dyn Deduplicator>,
    sink: Arc<dyn StorageSink>,
    engine: Arc<ResilienceEngine>,
    monitoring: Arc<MonitoringService>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        engine: Arc<ResilienceEngine>,
        monitoring: Arc<MonitoringService>,
        validator: Arc<dyn Validator>,
        deduplicator: Arc<dyn Deduplicator>,
        sink: Arc<dyn StorageSink>,
    ) -> Self {
        Self {
            config,
            connectors: Vec::new(),
            validator,
            deduplicator,
            sink,
            engine,
            monitoring,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        if self.connectors.iter().any(|c| c.name() == connector.name()) {
            warn!(source = %connector.name(), "Connector already registered, ignoring duplicate");
            return self;
        }
        self.connectors.push(connector);
        self
    }

    pub fn source_names(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn engine(&self) -> &Arc<ResilienceEngine> {
        &self.engine
    }

    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }

    /// Registers one monitoring probe per source reporting the engine's
    /// backlog and snapshot cache hit rate.
    pub async fn register_probes(&self) {
        for connector in &self.connectors {
            let probe = EngineProbe::new(Arc::clone(&self.engine), connector.name());
            self.monitoring
                .register_probe(connector.name(), Arc::new(probe))
                .await;
        }
    }

    /// Collects the configured lookback window from every source.
    pub async fn run_full(&self) -> IngestionResult {
        match SourceQuery::lookback(
            &self.config.default_lookback,
            self.config.record_types.clone(),
            self.config.result_limit,
        ) {
            Ok(query) => {
                let query = query.with_source_filters(self.config.source_filters.clone());
                self.run(RunMode::Full, self.shared_plan(&query)).await
            }
            Err(err) => {
                let mut result = IngestionResult::new(Uuid::new_v4(), RunMode::Full, Utc::now());
                error!(error = %err, "Cannot build query for full run");
                result.errors.push(format!("invalid lookback: {}", err));
                result.completed_stage = RunStage::Errored;
                self.record_run_metrics(&result, &BTreeMap::new()).await;
                result
            }
        }
    }

    /// Collects everything newer than `last_run` from every source.
    pub async fn run_incremental(&self, last_run: DateTime<Utc>) -> IngestionResult {
        let query = self.query_since(last_run);
        self.run(RunMode::Incremental, self.shared_plan(&query)).await
    }

    /// Collects each source from its own resume point, so a source that was
    /// skipped or short-circuited earlier is asked for its missed window again.
    pub async fn run_incremental_from(&self, watermarks: &Watermarks) -> IngestionResult {
        let plan = self
            .connectors
            .iter()
            .map(|c| (Arc::clone(c), self.query_since(watermarks.resume_from(c.name()))))
            .collect();
        self.run(RunMode::Incremental, plan).await
    }

    fn query_since(&self, earliest: DateTime<Utc>) -> SourceQuery {
        SourceQuery::since(
            earliest,
            self.config.record_types.clone(),
            self.config.result_limit,
        )
        .with_source_filters(self.config.source_filters.clone())
    }

    fn shared_plan(&self, query: &SourceQuery) -> Plan {
        self.connectors
            .iter()
            .map(|c| (Arc::clone(c), query.clone()))
            .collect()
    }

    async fn run(&self, mode: RunMode, plan: Plan) -> IngestionResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_run", run_id = %run_id, mode = %mode);
        self.execute_run(run_id, mode, plan).instrument(span).await
    }

    async fn execute_run(&self, run_id: Uuid, mode: RunMode, plan: Plan) -> IngestionResult {
        let started = Instant::now();
        let mut result = IngestionResult::new(run_id, mode, Utc::now());
        let mut tallies: BTreeMap<String, SourceTally> = BTreeMap::new();

        info!(
            sources = plan.len(),
            earliest = ?plan.iter().map(|(_, q)| q.window.earliest).min(),
            latest = ?plan.iter().map(|(_, q)| q.window.latest).max(),
            "Starting ingestion run"
        );

        debug!(stage = %RunStage::Collecting, "Entering stage");
        let mut groups: BTreeMap<String, Vec<RawRecord>> = BTreeMap::new();
        for Collected {
            result: source_result,
            records,
        } in self.collect(plan, run_id, mode).await
        {
            let name = source_result.source_name.clone();
            for reason in &source_result.errors {
                result.warnings.push(format!("{}: {}", name, reason));
            }
            for warning in &source_result.warnings {
                result.warnings.push(format!("{}: {}", name, warning));
            }
            tallies.entry(name.clone()).or_default().collected = records.len();
            result.total_records += records.len();
            if !records.is_empty() {
                groups.insert(name, records);
            }
            result.per_source_results.push(source_result);
        }
        result
            .per_source_results
            .sort_by(|a, b| a.source_name.cmp(&b.source_name));

        let stage = if mode == RunMode::Incremental && result.total_records == 0 {
            info!("No new records since last run");
            RunStage::RecordingMetrics
        } else {
            self.process(groups, &mut result, &mut tallies).await
        };

        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result.success = result.errors.is_empty();
        self.record_run_metrics(&result, &tallies).await;
        result.completed_stage = if stage == RunStage::Errored || !result.success {
            RunStage::Errored
        } else {
            RunStage::Done
        };

        counter!(
            "ingestion.runs", 1,
            "mode" => mode.to_string(),
            "success" => result.success.to_string()
        );
        histogram!("ingestion.run_duration_ms", result.elapsed_ms as f64, "mode" => mode.to_string());

        if result.success {
            info!(
                total = result.total_records,
                processed = result.processed_records,
                failed = result.failed_records,
                duplicates = result.duplicate_records,
                elapsed_ms = result.elapsed_ms,
                warnings = result.warnings.len(),
                "Ingestion run finished"
            );
        } else {
            error!(
                errors = ?result.errors,
                elapsed_ms = result.elapsed_ms,
                "Ingestion run failed"
            );
        }
        result
    }

    async fn collect(&self, plan: Plan, run_id: Uuid, mode: RunMode) -> Vec<Collected> {
        let limit = self.config.max_concurrent_sources.max(1);
        stream::iter(plan)
            .map(|(connector, query)| self.collect_source(connector, query, run_id, mode))
            .buffer_unordered(limit)
            .collect()
            .await
    }

    async fn collect_source(
        &self,
        connector: Arc<dyn SourceConnector>,
        query: SourceQuery,
        run_id: Uuid,
        mode: RunMode,
    ) -> Collected {
        let name = connector.name().to_string();
        let kind = connector.kind();
        let budget = self.config.connector_timeout();

        let mut metadata = serde_json::Map::new();
        metadata.insert("run_id".into(), json!(run_id.to_string()));
        metadata.insert("mode".into(), json!(mode.to_string()));
        metadata.insert("time_range".into(), json!(query.time_range));
        let window = query.window;

        let query = Arc::new(query);
        let op = {
            let connector = Arc::clone(&connector);
            operation(move || {
                let connector = Arc::clone(&connector);
                let query = Arc::clone(&query);
                async move { fetch_within(connector.as_ref(), &query, budget).await }
            })
        };

        let outcome = self.engine.execute(&name, "fetch", op, metadata).await;

        let mut warnings = Vec::new();
        if outcome.succeeded && outcome.strategy_used.is_degraded() {
            warnings.push(format!(
                "served by {} fallback after {} attempt(s)",
                outcome.strategy_used, outcome.attempt_count
            ));
        }
        if !outcome.succeeded {
            warn!(
                source = %name,
                reason = outcome.failure_reason.as_deref().unwrap_or("unknown"),
                attempts = outcome.attempt_count,
                "Source collection failed"
            );
        }

        let result = SourceResult {
            source_name: name.clone(),
            source_kind: kind,
            success: outcome.succeeded,
            record_count: outcome.records().len(),
            elapsed_ms: outcome.elapsed_ms,
            errors: outcome.failure_reason.clone().into_iter().collect(),
            warnings,
            strategy_used: outcome.strategy_used,
            attempt_count: outcome.attempt_count,
            window,
        };
        counter!("ingestion.records_collected", result.record_count as u64, "source" => name);

        Collected {
            result,
            records: outcome.into_records(),
        }
    }

    /// Runs validation, deduplication and storage over the grouped records.
    /// Returns the stage reached: `RecordingMetrics`, or `Errored`.
    async fn process(
        &self,
        groups: BTreeMap<String, Vec<RawRecord>>,
        result: &mut IngestionResult,
        tallies: &mut BTreeMap<String, SourceTally>,
    ) -> RunStage {
        let mut stage = RunStage::Processing;
        debug!(stage = %stage, groups = groups.len(), "Grouped records by source");

        stage = stage.next();
        let validated = match self.within(stage, self.validate_all(groups)).await {
            Ok(validated) => validated,
            Err(message) => return fail(stage, message, result),
        };
        let mut accepted = BTreeMap::new();
        for (source, outcome) in validated {
            let tally = tallies.entry(source.clone()).or_default();
            tally.processed += outcome.accepted_count;
            tally.failed += outcome.rejected_count;
            result.processed_records += outcome.accepted_count;
            result.failed_records += outcome.rejected_count;
            for message in outcome.errors.iter().chain(outcome.warnings.iter()) {
                result.warnings.push(format!("{}: {}", source, message));
            }
            if !outcome.accepted.is_empty() {
                accepted.insert(source, outcome.accepted);
            }
        }

        stage = stage.next();
        let deduplicated = match self.within(stage, self.deduplicate_all(accepted)).await {
            Ok(deduplicated) => deduplicated,
            Err(message) => return fail(stage, message, result),
        };
        let mut unique = Vec::new();
        let mut fingerprints = Vec::new();
        for (source, outcome) in deduplicated {
            tallies.entry(source).or_default().duplicate += outcome.duplicate_count;
            result.duplicate_records += outcome.duplicate_count;
            unique.extend(outcome.unique_records);
            fingerprints.extend(outcome.fingerprints);
        }

        stage = stage.next();
        match self.within(stage, self.store_all(unique)).await {
            Ok(stored) => debug!(stored, "Stored unique records"),
            Err(message) => return fail(stage, message, result),
        }

        // Only stored records may suppress later copies.
        if let Err(err) = self.deduplicator.commit(&fingerprints).await {
            warn!(error = %err, "Failed to remember stored records for deduplication");
            result
                .warnings
                .push(format!("dedup commit failed: {}", err.message));
        }

        stage.next()
    }

    async fn within<T>(&self, stage: RunStage, phase: impl Future<Output = Result<T>>) -> std::result::Result<T, String> {
        debug!(stage = %stage, "Entering stage");
        let budget = self.config.processing_timeout();
        match tokio::time::timeout(budget, phase).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(format!("{} failed: {}", stage, err)),
            Err(_) => Err(format!("{} exceeded {}ms", stage, budget.as_millis())),
        }
    }

    async fn validate_all(
        &self,
        groups: BTreeMap<String, Vec<RawRecord>>,
    ) -> Result<Vec<(String, crate::collaborators::ValidationOutcome)>> {
        let mut validated = Vec::with_capacity(groups.len());
        for (source, records) in groups {
            let outcome = self
                .validator
                .validate(&records, &source)
                .await
                .map_err(|e| e.source_name(&source))?;
            validated.push((source, outcome));
        }
        Ok(validated)
    }

    async fn deduplicate_all(
        &self,
        groups: BTreeMap<String, Vec<RawRecord>>,
    ) -> Result<Vec<(String, crate::collaborators::DedupOutcome)>> {
        let mut deduplicated = Vec::with_capacity(groups.len());
        for (source, records) in groups {
            let outcome = self
                .deduplicator
                .deduplicate(&records, &source)
                .await
                .map_err(|e| e.source_name(&source))?;
            deduplicated.push((source, outcome));
        }
        Ok(deduplicated)
    }

    async fn store_all(&self, records: Vec<RawRecord>) -> Result<usize> {
        let batch_size = self.config.batch_size.max(1);
        for (index, batch) in records.chunks(batch_size).enumerate() {
            self.sink.store(batch).await?;
            debug!(batch = index, records = batch.len(), "Stored batch");
        }
        Ok(records.len())
    }

    async fn record_run_metrics(&self, result: &IngestionResult, tallies: &BTreeMap<String, SourceTally>) {
        for source in &result.per_source_results {
            let tally = tallies.get(&source.source_name).copied().unwrap_or_default();
            let error_rate = if !source.success {
                1.0
            } else {
                ratio(tally.failed, tally.collected)
            };
            let latency = source.elapsed_ms as f64;
            self.monitoring
                .record_metrics(
                    &source.source_name,
                    MetricsUpdate {
                        total_records: Some(tally.collected as u64),
                        processed_records: Some(tally.processed as u64),
                        failed_records: Some(tally.failed as u64),
                        duplicate_records: Some(tally.duplicate as u64),
                        elapsed_ms: Some(source.elapsed_ms),
                        throughput_per_second: Some(per_second(tally.collected, source.elapsed_ms)),
                        error_rate: Some(error_rate),
                        latency_p50_ms: Some(latency),
                        latency_p95_ms: Some(latency),
                        latency_p99_ms: Some(latency),
                        ..MetricsUpdate::default()
                    },
                )
                .await;
        }

        let stats = self.engine.statistics().await;
        let queue_size: usize = stats.dead_letter_sizes.values().sum::<usize>()
            + stats.retry_queue_sizes.values().sum::<usize>();
        let (hits, lookups) = stats
            .snapshot_cache
            .values()
            .fold((0u64, 0u64), |(h, l), s| (h + s.hits, l + s.hits + s.misses));

        let mut latencies: Vec<f64> = result
            .per_source_results
            .iter()
            .map(|s| s.elapsed_ms as f64)
            .collect();
        latencies.sort_by(f64::total_cmp);

        let error_rate = if !result.success {
            1.0
        } else {
            ratio(result.failed_records, result.total_records)
        };

        self.monitoring
            .record_metrics(
                PIPELINE_SOURCE,
                MetricsUpdate {
                    total_records: Some(result.total_records as u64),
                    processed_records: Some(result.processed_records as u64),
                    failed_records: Some(result.failed_records as u64),
                    duplicate_records: Some(result.duplicate_records as u64),
                    elapsed_ms: Some(result.elapsed_ms),
                    throughput_per_second: Some(per_second(result.total_records, result.elapsed_ms)),
                    error_rate: Some(error_rate),
                    latency_p50_ms: Some(percentile(&latencies, 0.50)),
                    latency_p95_ms: Some(percentile(&latencies, 0.95)),
                    latency_p99_ms: Some(percentile(&latencies, 0.99)),
                    queue_size: Some(queue_size as u64),
                    cache_hit_rate: Some(if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 }),
                    ..MetricsUpdate::default()
                },
            )
            .await;
    }

    /// Probes every connector's connectivity test concurrently.
    pub async fn health_check(&self) -> PipelineHealth {
        let budget = self.config.connector_timeout();
        let checks: Vec<ConnectorCheck> = join_all(self.connectors.iter().map(|connector| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(budget, connector.test_connection()).await;
            let response_time_ms = started.elapsed().as_millis() as u64;
            let (up, error) = match outcome {
                Ok(Ok(true)) => (true, None),
                Ok(Ok(false)) => (false, Some("connection test failed".to_string())),
                Ok(Err(err)) => (false, Some(err.message)),
                Err(_) => (false, Some(format!("no response within {}ms", budget.as_millis()))),
            };
            ConnectorCheck {
                source_name: connector.name().to_string(),
                up,
                response_time_ms,
                error,
            }
        }))
        .await;

        let mut issues: Vec<String> = checks
            .iter()
            .filter(|c| !c.up)
            .map(|c| format!("{}: {}", c.source_name, c.error.as_deref().unwrap_or("down")))
            .collect();

        let up = checks.iter().filter(|c| c.up).count();
        let status = if checks.is_empty() {
            issues.push("no sources configured".to_string());
            OverallHealth::Down
        } else if up == checks.len() {
            OverallHealth::Healthy
        } else if up > 0 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Down
        };

        match status {
            OverallHealth::Healthy => info!(sources = checks.len(), "All sources reachable"),
            _ => warn!(status = ?status, issues = ?issues, "Source connectivity problems"),
        }

        PipelineHealth {
            healthy: status == OverallHealth::Healthy,
            status,
            issues,
            checks,
            checked_at: Utc::now(),
        }
    }

    /// Re-attempts every source's dead letters and pushes whatever they
    /// recover through validation, deduplication and storage.
    pub async fn reprocess_dead_letters(&self) -> Vec<ReprocessReport> {
        let mut reports = Vec::new();
        let mut groups = BTreeMap::new();

        for connector in &self.connectors {
            let report = self.engine.process_dead_letter_queue(connector.name()).await;
            if report.attempted == 0 && !report.deferred {
                continue;
            }
            if !report.recovered_records.is_empty() {
                groups.insert(connector.name().to_string(), report.recovered_records.clone());
            }
            reports.push(report);
        }

        if !groups.is_empty() {
            let mut result = IngestionResult::new(Uuid::new_v4(), RunMode::Incremental, Utc::now());
            result.total_records = groups.values().map(Vec::len).sum();
            let mut tallies = BTreeMap::new();
            match self.process(groups, &mut result, &mut tallies).await {
                RunStage::Errored => error!(errors = ?result.errors, "Storing reprocessed dead letters failed"),
                _ => info!(
                    recovered = result.total_records,
                    processed = result.processed_records,
                    duplicates = result.duplicate_records,
                    "Stored records recovered from dead letters"
                ),
            }
        }
        reports
    }
}

async fn fetch_within(connector: &dyn SourceConnector, query: &SourceQuery, budget: Duration) -> Result<Vec<RawRecord>> {
    match tokio::time::timeout(budget, connector.fetch(query)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::timeout(format!("fetch exceeded {}ms", budget.as_millis()))
            .source_name(connector.name())),
    }
}

fn fail(stage: RunStage, message: String, result: &mut IngestionResult) -> RunStage {
    error!(stage = %stage, error = %message, "Pipeline stage failed");
    result.errors.push(message);
    RunStage::Errored
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn per_second(count: usize, elapsed_ms: u64) -> f64 {
    count as f64 / (elapsed_ms.max(1) as f64 / 1000.0)
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        DedupOutcome, MockDeduplicator, MockStorageSink, MockValidator, ValidationOutcome,
    };
    use async_trait::async_trait;
    use ingest_types_rs::{MonitoringConfig, ResilienceConfig, SourceKind};
    use monitoring_rs::{HostUsage, StaticHostProbe};
    use serde_json::json;

    struct StaticConnector {
        name: String,
        records: Vec<RawRecord>,
        queries: std::sync::Mutex<Vec<SourceQuery>>,
    }

    impl StaticConnector {
        fn new(name: &str, records: Vec<RawRecord>) -> Self {
            Self {
                name: name.to_string(),
                records,
                queries: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for StaticConnector {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Siem
        }

        async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>> {
            self.queries.lock().unwrap().push(query.clone());
            Ok(self.records.clone())
        }

        async fn test_connection(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn monitoring() -> Arc<MonitoringService> {
        Arc::new(
            MonitoringService::new(MonitoringConfig::default(), vec![])
                .with_host_probe(Arc::new(StaticHostProbe(HostUsage::default()))),
        )
    }

    fn passthrough_validator() -> MockValidator {
        let mut validator = MockValidator::new();
        validator.expect_validate().returning(|records, _| {
            Ok(ValidationOutcome {
                accepted: records.to_vec(),
                accepted_count: records.len(),
                ..ValidationOutcome::default()
            })
        });
        validator
    }

    fn passthrough_dedup() -> MockDeduplicator {
        let mut dedup = MockDeduplicator::new();
        dedup.expect_deduplicate().returning(|records, _| {
            Ok(DedupOutcome {
                unique_records: records.to_vec(),
                unique_count: records.len(),
                duplicate_count: 0,
                fingerprints: (0..records.len() as u64).collect(),
            })
        });
        dedup.expect_commit().returning(|_| Ok(()));
        dedup
    }

    fn orchestrator(
        config: PipelineConfig,
        validator: MockValidator,
        dedup: MockDeduplicator,
        sink: MockStorageSink,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            config,
            Arc::new(ResilienceEngine::new(&ResilienceConfig::default())),
            monitoring(),
            Arc::new(validator),
            Arc::new(dedup),
            Arc::new(sink),
        )
        .with_connector(Arc::new(StaticConnector::new(
            "siem",
            (0..5).map(|n| json!({"id": n})).collect(),
        )))
    }

    #[tokio::test]
    async fn test_storage_is_batched() {
        let mut sink = MockStorageSink::new();
        sink.expect_store()
            .times(3)
            .withf(|batch| batch.len() <= 2)
            .returning(|_| Ok(()));

        let config = PipelineConfig {
            batch_size: 2,
            ..PipelineConfig::default()
        };
        let result = orchestrator(config, passthrough_validator(), passthrough_dedup(), sink)
            .run_full()
            .await;

        assert!(result.success);
        assert_eq!(result.total_records, 5);
        assert_eq!(result.processed_records, 5);
        assert_eq!(result.completed_stage, RunStage::Done);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_later_stages() {
        let mut validator = MockValidator::new();
        validator.expect_validate().returning(|_, _| {
            Err(Error::new(resilience_rs::ErrorKind::Validation, "schema registry unavailable"))
        });
        let mut dedup = MockDeduplicator::new();
        dedup.expect_deduplicate().never();
        dedup.expect_commit().never();
        let mut sink = MockStorageSink::new();
        sink.expect_store().never();

        let orchestrator = orchestrator(PipelineConfig::default(), validator, dedup, sink);
        let result = orchestrator.run_full().await;

        assert!(!result.success);
        assert_eq!(result.completed_stage, RunStage::Errored);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("validating failed"));
        assert_eq!(orchestrator.monitoring().get_metrics(PIPELINE_SOURCE, None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejections_and_duplicates_are_tallied() {
        let mut validator = MockValidator::new();
        validator.expect_validate().returning(|records, _| {
            Ok(ValidationOutcome {
                accepted: records[..4].to_vec(),
                accepted_count: 4,
                rejected_count: 1,
                errors: vec!["record 4: missing field(s) id".to_string()],
                warnings: vec![],
            })
        });
        let mut dedup = MockDeduplicator::new();
        dedup.expect_deduplicate().returning(|records, _| {
            Ok(DedupOutcome {
                unique_records: records[..3].to_vec(),
                unique_count: 3,
                duplicate_count: 1,
                ..DedupOutcome::default()
            })
        });
        dedup.expect_commit().times(1).returning(|_| Ok(()));
        let mut sink = MockStorageSink::new();
        sink.expect_store().times(1).withf(|batch| batch.len() == 3).returning(|_| Ok(()));

        let orchestrator = orchestrator(PipelineConfig::default(), validator, dedup, sink);
        let result = orchestrator.run_full().await;

        assert!(result.success);
        assert_eq!(result.processed_records, 4);
        assert_eq!(result.failed_records, 1);
        assert_eq!(result.duplicate_records, 1);
        assert_eq!(result.warnings, vec!["siem: record 4: missing field(s) id".to_string()]);

        let sample = orchestrator.monitoring().get_metrics("siem", None).await.remove(0);
        assert_eq!(sample.failed_records, 1);
        assert_eq!(sample.duplicate_records, 1);
        assert!((sample.error_rate - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stored_fingerprints_are_committed() {
        let mut dedup = MockDeduplicator::new();
        dedup.expect_deduplicate().returning(|records, _| {
            Ok(DedupOutcome {
                unique_records: records.to_vec(),
                unique_count: records.len(),
                duplicate_count: 0,
                fingerprints: vec![11, 12, 13, 14, 15],
            })
        });
        dedup
            .expect_commit()
            .times(1)
            .withf(|fingerprints| fingerprints.to_vec() == vec![11, 12, 13, 14, 15])
            .returning(|_| Ok(()));
        let mut sink = MockStorageSink::new();
        sink.expect_store().returning(|_| Ok(()));

        let result = orchestrator(PipelineConfig::default(), passthrough_validator(), dedup, sink)
            .run_full()
            .await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_failed_storage_commits_nothing() {
        let mut dedup = MockDeduplicator::new();
        dedup.expect_deduplicate().returning(|records, _| {
            Ok(DedupOutcome {
                unique_records: records.to_vec(),
                unique_count: records.len(),
                duplicate_count: 0,
                fingerprints: vec![1, 2, 3, 4, 5],
            })
        });
        dedup.expect_commit().never();
        let mut sink = MockStorageSink::new();
        sink.expect_store()
            .returning(|_| Err(Error::storage("disk full")));

        let result = orchestrator(PipelineConfig::default(), passthrough_validator(), dedup, sink)
            .run_full()
            .await;

        assert!(!result.success);
        assert!(result.errors[0].starts_with("storing failed"));
    }

    #[tokio::test]
    async fn test_commit_failure_is_only_a_warning() {
        let mut dedup = MockDeduplicator::new();
        dedup.expect_deduplicate().returning(|records, _| {
            Ok(DedupOutcome {
                unique_records: records.to_vec(),
                unique_count: records.len(),
                ..DedupOutcome::default()
            })
        });
        dedup.expect_commit().returning(|_| {
            Err(Error::new(resilience_rs::ErrorKind::Deduplication, "window unavailable"))
        });
        let mut sink = MockStorageSink::new();
        sink.expect_store().returning(|_| Ok(()));

        let result = orchestrator(PipelineConfig::default(), passthrough_validator(), dedup, sink)
            .run_full()
            .await;

        assert!(result.success);
        assert_eq!(result.completed_stage, RunStage::Done);
        assert_eq!(result.warnings, vec!["dedup commit failed: window unavailable".to_string()]);
    }

    #[tokio::test]
    async fn test_queries_carry_source_filters() {
        let mut sink = MockStorageSink::new();
        sink.expect_store().returning(|_| Ok(()));
        let config = PipelineConfig {
            source_filters: vec!["severity>=high".to_string()],
            ..PipelineConfig::default()
        };
        let edr = Arc::new(StaticConnector::new("edr", vec![]));
        let orchestrator = orchestrator(config, passthrough_validator(), passthrough_dedup(), sink)
            .with_connector(edr.clone());

        orchestrator.run_full().await;
        orchestrator.run_incremental(Utc::now() - chrono::Duration::minutes(5)).await;

        let queries = edr.queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        for query in queries.iter() {
            assert_eq!(query.source_filters, vec!["severity>=high".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_each_source_resumes_from_its_own_watermark() {
        let mut sink = MockStorageSink::new();
        sink.expect_store().returning(|_| Ok(()));
        let edr = Arc::new(StaticConnector::new("edr", vec![]));
        let orchestrator = orchestrator(
            PipelineConfig::default(),
            passthrough_validator(),
            passthrough_dedup(),
            sink,
        )
        .with_connector(edr.clone());

        let initial = Utc::now() - chrono::Duration::hours(24);
        let stale = Utc::now() - chrono::Duration::hours(3);
        let mut watermarks = Watermarks::new(initial);
        watermarks.set("siem", Utc::now() - chrono::Duration::minutes(5));
        watermarks.set("edr", stale);

        let result = orchestrator.run_incremental_from(&watermarks).await;
        assert!(result.success);

        let edr_query = edr.queries.lock().unwrap().remove(0);
        assert_eq!(edr_query.window.earliest, stale);
        let edr_result = result
            .per_source_results
            .iter()
            .find(|s| s.source_name == "edr")
            .unwrap();
        assert_eq!(edr_result.window.earliest, stale);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 0.5), 20.0);
        assert_eq!(percentile(&values, 0.95), 40.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }
}
