//! # Resilience Engine
//!
//! Wraps source-scoped operations with circuit breaking, the configured
//! recovery chain and dead-lettering. One engine owns all breaker, snapshot
//! and dead-letter state for the sources it guards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use ingest_types_rs::{RawRecord, ResilienceConfig, StrategyUsed};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{
    Admission, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState,
};
use crate::context::{ErrorContext, Operation};
use crate::dead_letter::DeadLetterQueue;
use crate::fallback::{
    build_chain, FallbackStrategy, PartialRecovery, RecoverySession, RetryTracker, SnapshotCache,
    SnapshotStats,
};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::types::Result;

/// Terminal outcome of a guarded call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryResult {
    pub succeeded: bool,
    pub recovered_records: Option<Vec<RawRecord>>,
    pub failure_reason: Option<String>,
    pub strategy_used: StrategyUsed,
    pub attempt_count: u32,
    pub elapsed_ms: u64,
}

impl RecoveryResult {
    fn success(strategy: StrategyUsed, records: Vec<RawRecord>, attempts: u32, started: Instant) -> Self {
        Self {
            succeeded: true,
            recovered_records: Some(records),
            failure_reason: None,
            strategy_used: strategy,
            attempt_count: attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failure<S: Into<String>>(reason: S, attempts: u32, started: Instant) -> Self {
        Self {
            succeeded: false,
            recovered_records: None,
            failure_reason: Some(reason.into()),
            strategy_used: StrategyUsed::Failed,
            attempt_count: attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn records(&self) -> &[RawRecord] {
        self.recovered_records.as_deref().unwrap_or(&[])
    }

    pub fn into_records(self) -> Vec<RawRecord> {
        self.recovered_records.unwrap_or_default()
    }
}

/// Outcome of reprocessing one source's dead letters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReprocessReport {
    pub source_name: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub recovered_records: Vec<RawRecord>,
    /// Entries that failed again and were removed from the queue
    pub dropped: Vec<ErrorContext>,
    /// Reprocessing did not run because the source's breaker is open
    pub deferred: bool,
}

/// Snapshot of everything the engine tracks.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStatistics {
    pub circuit_breakers: HashMap<String, CircuitBreakerState>,
    pub dead_letter_sizes: HashMap<String, usize>,
    pub retry_queue_sizes: HashMap<String, usize>,
    pub snapshot_cache: HashMap<String, SnapshotStats>,
}

pub struct ResilienceEngine {
    breakers: CircuitBreakerRegistry,
    retry_policy: RetryPolicy,
    chain: Vec<Box<dyn FallbackStrategy>>,
    dead_letters: DeadLetterQueue,
    snapshots: SnapshotCache,
    retries: RetryTracker,
    partial_handlers: RwLock<HashMap<String, Arc<dyn PartialRecovery>>>,
}

impl ResilienceEngine {
    pub fn new(config: &ResilienceConfig) -> Self {
        info!(
            threshold = config.circuit_breaker_threshold,
            max_retries = config.max_retries,
            strategies = ?config.fallback_strategies,
            "Creating resilience engine"
        );
        Self {
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::from(config)),
            retry_policy: RetryPolicy::new(RetryConfig::from(config)),
            chain: build_chain(&config.fallback_strategies),
            dead_letters: DeadLetterQueue::new(config.max_dead_letters_per_source),
            snapshots: SnapshotCache::new(config.snapshot_ttl(), config.snapshot_max_stale()),
            retries: RetryTracker::default(),
            partial_handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_partial_recovery(&self, source: &str, handler: Arc<dyn PartialRecovery>) {
        self.partial_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.to_string(), handler);
    }

    /// Runs `operation` for `source` under breaker protection and recovery.
    ///
    /// Never returns an error: every outcome is described by the result.
    pub async fn execute(
        &self,
        source: &str,
        operation_name: &str,
        operation: Operation,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> RecoveryResult {
        let started = Instant::now();

        let result = match self.breakers.admit(source) {
            Admission::Rejected { retry_in } => {
                debug!(
                    source = %source,
                    operation = %operation_name,
                    retry_in_ms = %retry_in.as_millis(),
                    "Short-circuiting call"
                );
                RecoveryResult::failure("circuit open", 0, started)
            }
            Admission::Probe => self.probe(source, operation_name, &operation, started).await,
            Admission::Allowed => match operation().await {
                Ok(records) => {
                    self.breakers.record_success(source);
                    self.snapshots.store(source, &records);
                    RecoveryResult::success(StrategyUsed::Direct, records, 1, started)
                }
                Err(err) => {
                    warn!(
                        source = %source,
                        operation = %operation_name,
                        error = %err,
                        "Operation failed, starting recovery"
                    );
                    self.breakers.record_failure(source);
                    let context = ErrorContext::new(source, operation_name, err, metadata);
                    self.recover(context, operation, started).await
                }
            },
        };

        counter!(
            "resilience.calls", 1,
            "source" => source.to_string(),
            "strategy" => result.strategy_used.to_string()
        );
        histogram!("resilience.call_duration_ms", result.elapsed_ms as f64, "source" => source.to_string());
        result
    }

    async fn probe(
        &self,
        source: &str,
        operation_name: &str,
        operation: &Operation,
        started: Instant,
    ) -> RecoveryResult {
        match operation().await {
            Ok(records) => {
                self.breakers.close(source);
                self.snapshots.store(source, &records);
                RecoveryResult::success(StrategyUsed::CircuitReset, records, 1, started)
            }
            Err(err) => {
                self.breakers.record_failure(source);
                warn!(
                    source = %source,
                    operation = %operation_name,
                    error = %err,
                    "Half-open probe failed"
                );
                RecoveryResult::failure(err.message, 1, started)
            }
        }
    }

    async fn recover(&self, context: ErrorContext, operation: Operation, started: Instant) -> RecoveryResult {
        let partial_handler = self
            .partial_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&context.source_name)
            .cloned();

        let mut session = RecoverySession {
            context,
            operation: &operation,
            breakers: &self.breakers,
            retry_policy: &self.retry_policy,
            snapshots: &self.snapshots,
            retries: &self.retries,
            partial_handler,
        };

        for strategy in &self.chain {
            let kind = strategy.kind();
            match strategy.recover(&mut session).await {
                Ok(records) => {
                    info!(
                        source = %session.context.source_name,
                        strategy = %kind,
                        records = records.len(),
                        attempts = session.context.attempt_count,
                        "Recovered"
                    );
                    return RecoveryResult::success(
                        kind.into(),
                        records,
                        session.context.attempt_count,
                        started,
                    );
                }
                Err(err) => {
                    debug!(
                        source = %session.context.source_name,
                        strategy = %kind,
                        error = %err,
                        "Recovery strategy failed"
                    );
                }
            }
        }

        let context = session.context;
        let attempts = context.attempt_count;
        let reason = context.error.message.clone();
        error!(
            source = %context.source_name,
            operation = %context.operation_name,
            attempts,
            error = %context.error,
            "All recovery strategies failed, dead-lettering"
        );
        self.dead_letters.push(context, operation.clone()).await;

        RecoveryResult::failure(reason, attempts, started)
    }

    /// Re-invokes every dead letter of `source` with its captured operation.
    pub async fn process_dead_letter_queue(&self, source: &str) -> ReprocessReport {
        self.reprocess(source, |letter_op, _context| letter_op()).await
    }

    /// Re-attempts every dead letter of `source` through `reprocess`.
    pub async fn process_dead_letter_queue_with<F, Fut>(&self, source: &str, reprocess: F) -> ReprocessReport
    where
        F: Fn(ErrorContext) -> Fut,
        Fut: Future<Output = Result<Vec<RawRecord>>>,
    {
        self.reprocess(source, |_, context| reprocess(context)).await
    }

    async fn reprocess<F, Fut>(&self, source: &str, attempt: F) -> ReprocessReport
    where
        F: Fn(&Operation, ErrorContext) -> Fut,
        Fut: Future<Output = Result<Vec<RawRecord>>>,
    {
        let mut report = ReprocessReport {
            source_name: source.to_string(),
            ..ReprocessReport::default()
        };

        if self.breakers.is_open(source) {
            info!(source = %source, "Breaker open, deferring dead letter reprocessing");
            report.deferred = true;
            return report;
        }

        let letters = self.dead_letters.drain(source).await;
        if letters.is_empty() {
            return report;
        }
        info!(source = %source, entries = letters.len(), "Reprocessing dead letters");

        for letter in letters {
            report.attempted += 1;
            match attempt(&letter.operation, letter.context.clone()).await {
                Ok(records) => {
                    report.succeeded += 1;
                    self.breakers.record_success(source);
                    self.snapshots.store(source, &records);
                    report.recovered_records.extend(records);
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        source = %source,
                        enqueued_at = %letter.enqueued_at,
                        error = %err,
                        "Dead letter failed again, dropping"
                    );
                    let mut context = letter.context;
                    context.record_attempt(err);
                    report.dropped.push(context);
                }
            }
        }

        counter!("dead_letter.reprocessed", report.succeeded as u64, "source" => source.to_string());
        counter!("dead_letter.dropped", report.failed as u64, "source" => source.to_string());
        report
    }

    pub async fn statistics(&self) -> ResilienceStatistics {
        ResilienceStatistics {
            circuit_breakers: self.breakers.snapshot(),
            dead_letter_sizes: self.dead_letters.sizes().await,
            retry_queue_sizes: self.retries.snapshot(),
            snapshot_cache: self.snapshots.all_stats(),
        }
    }

    pub fn reset_circuit(&self, source: &str) -> bool {
        self.breakers.reset(source)
    }

    pub fn circuit_state(&self, source: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(source)
    }

    pub async fn dead_letter_len(&self, source: &str) -> usize {
        self.dead_letters.len(source).await
    }

    pub async fn dead_letters(&self, source: &str) -> Vec<ErrorContext> {
        self.dead_letters.contexts(source).await
    }

    pub fn retries_in_flight(&self, source: &str) -> usize {
        self.retries.active(source)
    }

    pub fn snapshot_stats(&self, source: &str) -> SnapshotStats {
        self.snapshots.stats(source)
    }
}
