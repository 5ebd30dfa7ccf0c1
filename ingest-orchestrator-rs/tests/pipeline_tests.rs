use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_orchestrator_rs::{
    DedupOutcome, Deduplicator, FingerprintDeduplicator, OverallHealth, PipelineOrchestrator,
    SourceConnector, StorageSink, ValidationOutcome, Validator, Watermarks,
};
use ingest_types_rs::{
    MonitoringConfig, PipelineConfig, RawRecord, ResilienceConfig, RecoveryStrategy, RunStage,
    SourceKind, SourceQuery, StrategyUsed, PIPELINE_SOURCE,
};
use monitoring_rs::MonitoringService;
use resilience_rs::{Error, ResilienceEngine, Result};
use serde_json::json;

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct FakeConnector {
    name: String,
    records: Vec<RawRecord>,
    failing: bool,
    reachable: bool,
    delay: Duration,
    calls: AtomicUsize,
    gauge: Arc<Gauge>,
}

impl FakeConnector {
    fn new(name: &str, count: usize) -> Self {
        let stamped = Utc::now() - chrono::Duration::minutes(1);
        Self {
            name: name.to_string(),
            records: (0..count)
                .map(|n| json!({"id": format!("{}-{}", name, n), "timestamp": stamped.to_rfc3339()}))
                .collect(),
            failing: false,
            reachable: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            gauge: Arc::new(Gauge::default()),
        }
    }

    fn failing(mut self) -> Self {
        self.failing = true;
        self.reachable = false;
        self
    }

    fn slow(mut self, delay: Duration, gauge: Arc<Gauge>) -> Self {
        self.delay = delay;
        self.gauge = gauge;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for FakeConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Edr
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);

        if self.failing {
            return Err(Error::connector("upstream refused connection").source_name(&self.name));
        }
        Ok(self
            .records
            .iter()
            .filter(|r| {
                r["timestamp"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map_or(true, |at| query.window.contains(at.with_timezone(&Utc)))
            })
            .cloned()
            .collect())
    }

    async fn test_connection(&self) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        Ok(self.reachable)
    }
}

#[derive(Default)]
struct Counting {
    validated: AtomicUsize,
    deduplicated: AtomicUsize,
    committed: AtomicUsize,
    stored: Mutex<Vec<RawRecord>>,
    /// Store calls left to reject
    storage_failures: AtomicUsize,
    validation_delay: Duration,
}

impl Counting {
    fn failing_storage(times: usize) -> Self {
        Self {
            storage_failures: AtomicUsize::new(times),
            ..Self::default()
        }
    }
}

struct CountingValidator(Arc<Counting>);

#[async_trait]
impl Validator for CountingValidator {
    async fn validate(&self, records: &[RawRecord], _source_name: &str) -> Result<ValidationOutcome> {
        self.0.validated.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.0.validation_delay).await;
        Ok(ValidationOutcome {
            accepted: records.to_vec(),
            accepted_count: records.len(),
            ..ValidationOutcome::default()
        })
    }
}

struct CountingDeduplicator(Arc<Counting>);

#[async_trait]
impl Deduplicator for CountingDeduplicator {
    async fn deduplicate(&self, records: &[RawRecord], _source_name: &str) -> Result<DedupOutcome> {
        self.0.deduplicated.fetch_add(1, Ordering::SeqCst);
        Ok(DedupOutcome {
            unique_records: records.to_vec(),
            duplicate_count: 0,
            unique_count: records.len(),
            ..DedupOutcome::default()
        })
    }

    async fn commit(&self, _fingerprints: &[u64]) -> Result<()> {
        self.0.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySink(Arc<Counting>);

#[async_trait]
impl StorageSink for MemorySink {
    async fn store(&self, records: &[RawRecord]) -> Result<()> {
        let rejected = self
            .0
            .storage_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(Error::storage("disk full"));
        }
        self.0.stored.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}

fn resilience(threshold: u32, strategies: Vec<RecoveryStrategy>) -> ResilienceConfig {
    ResilienceConfig {
        max_retries: 1,
        retry_delay_ms: 1,
        max_retry_delay_ms: 2,
        circuit_breaker_threshold: threshold,
        circuit_breaker_timeout_ms: 60_000,
        fallback_strategies: strategies,
        ..ResilienceConfig::default()
    }
}

fn pipeline(max_concurrent_sources: usize) -> PipelineConfig {
    PipelineConfig {
        max_concurrent_sources,
        connector_timeout_ms: Some(500),
        ..PipelineConfig::default()
    }
}

fn build(
    config: PipelineConfig,
    resilience: ResilienceConfig,
    counting: Arc<Counting>,
    connectors: Vec<Arc<FakeConnector>>,
) -> PipelineOrchestrator {
    let deduplicator = Arc::new(CountingDeduplicator(counting.clone()));
    build_with(config, resilience, counting, deduplicator, connectors)
}

fn build_with(
    config: PipelineConfig,
    resilience: ResilienceConfig,
    counting: Arc<Counting>,
    deduplicator: Arc<dyn Deduplicator>,
    connectors: Vec<Arc<FakeConnector>>,
) -> PipelineOrchestrator {
    let mut orchestrator = PipelineOrchestrator::new(
        config,
        Arc::new(ResilienceEngine::new(&resilience)),
        Arc::new(MonitoringService::new(MonitoringConfig::default(), vec![])),
        Arc::new(CountingValidator(counting.clone())),
        deduplicator,
        Arc::new(MemorySink(counting)),
    );
    for connector in connectors {
        let connector: Arc<dyn SourceConnector> = connector;
        orchestrator = orchestrator.with_connector(connector);
    }
    orchestrator
}

#[tokio::test]
async fn test_collection_respects_concurrency_bound() {
    let gauge = Arc::new(Gauge::default());
    let connectors: Vec<_> = (0..6)
        .map(|n| {
            Arc::new(FakeConnector::new(&format!("src{}", n), 2).slow(Duration::from_millis(30), gauge.clone()))
        })
        .collect();
    let counting = Arc::new(Counting::default());

    let result = build(pipeline(2), resilience(3, vec![]), counting.clone(), connectors)
        .run_full()
        .await;

    assert!(result.success);
    assert_eq!(result.total_records, 12);
    assert_eq!(counting.stored.lock().unwrap().len(), 12);
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak in flight was {}", peak);
}

#[tokio::test]
async fn test_failing_source_trips_breaker_without_failing_runs() {
    let broken = Arc::new(FakeConnector::new("a-edr", 3).failing());
    let mut connectors = vec![broken.clone()];
    for name in ["b-siem", "c-soar", "d-edr", "e-siem"] {
        connectors.push(Arc::new(FakeConnector::new(name, 2)));
    }
    let orchestrator = build(pipeline(5), resilience(3, vec![]), Arc::new(Counting::default()), connectors);

    for _ in 0..3 {
        let result = orchestrator.run_full().await;
        assert!(result.success);
        assert_eq!(result.total_records, 8);
        assert!(result.warnings.iter().any(|w| w.starts_with("a-edr: ")));
    }
    assert_eq!(broken.calls(), 3);
    assert_eq!(orchestrator.engine().dead_letter_len("a-edr").await, 3);

    let result = orchestrator.run_full().await;
    assert!(result.success);
    assert_eq!(result.completed_stage, RunStage::Done);
    assert_eq!(result.per_source_results.len(), 5);
    assert_eq!(broken.calls(), 3);

    let a = &result.per_source_results[0];
    assert_eq!(a.source_name, "a-edr");
    assert!(!a.success);
    assert_eq!(a.errors, vec!["circuit open".to_string()]);
    assert_eq!(a.attempt_count, 0);
    assert_eq!(a.strategy_used, StrategyUsed::Failed);
    assert!(result.per_source_results[1..].iter().all(|s| s.success && s.record_count == 2));

    // Breaker still open, so the dead letters wait.
    let reports = orchestrator.reprocess_dead_letters().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].deferred);
    assert_eq!(orchestrator.engine().dead_letter_len("a-edr").await, 3);
}

#[tokio::test]
async fn test_skip_fallback_is_reported_as_warning() {
    let connectors = vec![
        Arc::new(FakeConnector::new("a-edr", 1).failing()),
        Arc::new(FakeConnector::new("b-siem", 1)),
    ];
    let orchestrator = build(
        pipeline(2),
        resilience(10, vec![RecoveryStrategy::Skip]),
        Arc::new(Counting::default()),
        connectors,
    );

    let result = orchestrator.run_full().await;

    assert!(result.success);
    let a = &result.per_source_results[0];
    assert!(a.success);
    assert_eq!(a.strategy_used, StrategyUsed::Skip);
    assert_eq!(a.record_count, 0);
    assert!(result
        .warnings
        .contains(&"a-edr: served by skip fallback after 1 attempt(s)".to_string()));
}

#[tokio::test]
async fn test_incremental_run_without_new_records_skips_processing() {
    let counting = Arc::new(Counting::default());
    let connectors = vec![Arc::new(FakeConnector::new("siem", 4)), Arc::new(FakeConnector::new("edr", 2))];
    let orchestrator = build(pipeline(2), resilience(3, vec![]), counting.clone(), connectors);

    let result = orchestrator.run_incremental(Utc::now()).await;

    assert!(result.success);
    assert_eq!(result.completed_stage, RunStage::Done);
    assert_eq!(result.total_records, 0);
    assert_eq!(counting.validated.load(Ordering::SeqCst), 0);
    assert_eq!(counting.deduplicated.load(Ordering::SeqCst), 0);
    assert!(counting.stored.lock().unwrap().is_empty());

    let samples = orchestrator.monitoring().get_metrics(PIPELINE_SOURCE, None).await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].total_records, 0);
}

#[tokio::test]
async fn test_storage_failure_fails_the_run_but_records_metrics() {
    let counting = Arc::new(Counting::failing_storage(usize::MAX));
    let orchestrator = build(
        pipeline(2),
        resilience(3, vec![]),
        counting.clone(),
        vec![Arc::new(FakeConnector::new("siem", 3))],
    );

    let result = orchestrator.run_full().await;

    assert!(!result.success);
    assert_eq!(result.completed_stage, RunStage::Errored);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("storing failed"), "{}", result.errors[0]);
    assert_eq!(counting.validated.load(Ordering::SeqCst), 1);
    assert_eq!(counting.deduplicated.load(Ordering::SeqCst), 1);
    assert_eq!(counting.committed.load(Ordering::SeqCst), 0);

    let samples = orchestrator.monitoring().get_metrics(PIPELINE_SOURCE, None).await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].error_rate, 1.0);
}

#[tokio::test]
async fn test_health_check_grades_connectivity() {
    let up = Arc::new(FakeConnector::new("siem", 0));
    let down = Arc::new(FakeConnector::new("edr", 0).failing());
    let hung = Arc::new(FakeConnector::new("soar", 0).slow(Duration::from_secs(5), Arc::new(Gauge::default())));

    let degraded = build(
        pipeline(3),
        resilience(3, vec![]),
        Arc::new(Counting::default()),
        vec![up.clone(), down.clone(), hung],
    )
    .health_check()
    .await;
    assert!(!degraded.healthy);
    assert_eq!(degraded.status, OverallHealth::Degraded);
    assert_eq!(degraded.checks.len(), 3);
    assert_eq!(degraded.issues.len(), 2);
    assert!(degraded.issues.iter().any(|i| i.starts_with("soar: no response within")));

    let down_only = build(pipeline(1), resilience(3, vec![]), Arc::new(Counting::default()), vec![down])
        .health_check()
        .await;
    assert_eq!(down_only.status, OverallHealth::Down);

    let empty = build(pipeline(1), resilience(3, vec![]), Arc::new(Counting::default()), vec![])
        .health_check()
        .await;
    assert_eq!(empty.status, OverallHealth::Down);
    assert_eq!(empty.issues, vec!["no sources configured".to_string()]);

    assert!(tokio_test::assert_ok!(up.test_connection().await));
}

#[tokio::test]
async fn test_records_lost_to_storage_failure_are_stored_on_retry() {
    let counting = Arc::new(Counting::failing_storage(1));
    let orchestrator = build_with(
        pipeline(1),
        resilience(3, vec![]),
        counting.clone(),
        Arc::new(FingerprintDeduplicator::new(100)),
        vec![Arc::new(FakeConnector::new("siem", 3))],
    );

    let first = orchestrator.run_full().await;
    assert!(!first.success);
    assert!(counting.stored.lock().unwrap().is_empty());

    let second = orchestrator.run_full().await;
    assert!(second.success, "{:?}", second.errors);
    assert_eq!(second.duplicate_records, 0);
    assert_eq!(counting.stored.lock().unwrap().len(), 3);

    // Stored now, so the same window is suppressed.
    let third = orchestrator.run_full().await;
    assert!(third.success);
    assert_eq!(third.duplicate_records, 3);
    assert_eq!(counting.stored.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_skipped_source_keeps_its_watermark() {
    let connectors = vec![
        Arc::new(FakeConnector::new("a-edr", 1).failing()),
        Arc::new(FakeConnector::new("b-siem", 2)),
    ];
    let orchestrator = build(
        pipeline(2),
        resilience(10, vec![RecoveryStrategy::Skip]),
        Arc::new(Counting::default()),
        connectors,
    );
    let initial = Utc::now() - chrono::Duration::hours(24);
    let mut watermarks = Watermarks::new(initial);

    let first = orchestrator.run_incremental_from(&watermarks).await;
    assert!(first.success);
    assert_eq!(first.per_source_results[0].strategy_used, StrategyUsed::Skip);
    assert_eq!(watermarks.advance(&first), 1);

    let b_covered_until = first.per_source_results[1].window.latest;
    assert_eq!(watermarks.resume_from("a-edr"), initial);
    assert_eq!(watermarks.resume_from("b-siem"), b_covered_until);

    let second = orchestrator.run_incremental_from(&watermarks).await;
    assert_eq!(second.per_source_results[0].window.earliest, initial);
    assert_eq!(second.per_source_results[1].window.earliest, b_covered_until);
}

#[tokio::test]
async fn test_short_circuited_source_keeps_its_watermark() {
    let broken = Arc::new(FakeConnector::new("a-edr", 1).failing());
    let orchestrator = build(
        pipeline(2),
        resilience(1, vec![]),
        Arc::new(Counting::default()),
        vec![broken.clone(), Arc::new(FakeConnector::new("b-siem", 2))],
    );
    let initial = Utc::now() - chrono::Duration::hours(6);
    let mut watermarks = Watermarks::new(initial);

    for _ in 0..2 {
        let result = orchestrator.run_incremental_from(&watermarks).await;
        assert!(result.success);
        watermarks.advance(&result);
    }

    let result = orchestrator.run_incremental_from(&watermarks).await;
    let a = &result.per_source_results[0];
    assert_eq!(a.errors, vec!["circuit open".to_string()]);
    assert_eq!(a.window.earliest, initial);
    assert_eq!(broken.calls(), 1);
    assert!(watermarks.resume_from("b-siem") > initial);
}

#[tokio::test]
async fn test_slow_source_times_out_without_holding_back_siblings() {
    let slow = Arc::new(
        FakeConnector::new("a-edr", 2).slow(Duration::from_secs(2), Arc::new(Gauge::default())),
    );
    let counting = Arc::new(Counting::default());
    let config = PipelineConfig {
        max_concurrent_sources: 3,
        connector_timeout_ms: Some(50),
        ..PipelineConfig::default()
    };
    let orchestrator = build(
        config,
        resilience(3, vec![]),
        counting.clone(),
        vec![slow, Arc::new(FakeConnector::new("b-siem", 2)), Arc::new(FakeConnector::new("c-soar", 3))],
    );

    let result = orchestrator.run_full().await;

    assert!(result.success);
    assert_eq!(result.completed_stage, RunStage::Done);
    let a = &result.per_source_results[0];
    assert!(!a.success);
    assert_eq!(a.errors, vec!["fetch exceeded 50ms".to_string()]);
    assert!(result.per_source_results[1..].iter().all(|s| s.success));
    assert_eq!(result.total_records, 5);
    assert_eq!(counting.stored.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn test_hanging_validation_errors_the_run() {
    let counting = Arc::new(Counting {
        validation_delay: Duration::from_secs(5),
        ..Counting::default()
    });
    let config = PipelineConfig {
        processing_timeout_ms: 50,
        connector_timeout_ms: Some(500),
        ..PipelineConfig::default()
    };
    let orchestrator = build(
        config,
        resilience(3, vec![]),
        counting.clone(),
        vec![Arc::new(FakeConnector::new("siem", 2))],
    );

    let result = orchestrator.run_full().await;

    assert!(!result.success);
    assert_eq!(result.completed_stage, RunStage::Errored);
    assert!(result.errors[0].contains("exceeded"), "{}", result.errors[0]);
    assert_eq!(result.errors[0], "validating exceeded 50ms");
    assert_eq!(counting.deduplicated.load(Ordering::SeqCst), 0);
    assert!(counting.stored.lock().unwrap().is_empty());
}
