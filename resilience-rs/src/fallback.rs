//! # Fallback Strategies
//!
//! The recovery chain the engine walks after a guarded call fails. Each
//! configured [`RecoveryStrategy`] is turned into a [`FallbackStrategy`]
//! object; the engine only iterates the resulting list.
//!
//! - retry: re-invoke the source with backoff
//! - skip: give up on this source for the run, yield no records
//! - partial: let a source-specific handler salvage what it can
//! - cached: serve the last known-good snapshot

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ingest_types_rs::{RawRecord, RecoveryStrategy};
use metrics::gauge;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::context::{ErrorContext, Operation};
use crate::retry::RetryPolicy;
use crate::types::{Error, ErrorKind, Result, Severity};

/// Source-specific salvage of a failed collection.
#[async_trait]
pub trait PartialRecovery: Send + Sync {
    async fn salvage(&self, context: &ErrorContext) -> Result<Vec<RawRecord>>;
}

/// Everything a strategy may use while recovering one failed call.
pub struct RecoverySession<'a> {
    pub context: ErrorContext,
    pub operation: &'a Operation,
    pub breakers: &'a CircuitBreakerRegistry,
    pub retry_policy: &'a RetryPolicy,
    pub snapshots: &'a SnapshotCache,
    pub retries: &'a RetryTracker,
    pub partial_handler: Option<Arc<dyn PartialRecovery>>,
}

impl RecoverySession<'_> {
    pub fn source_name(&self) -> &str {
        &self.context.source_name
    }
}

/// One step of the recovery chain.
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    fn kind(&self) -> RecoveryStrategy;

    async fn recover(&self, session: &mut RecoverySession<'_>) -> Result<Vec<RawRecord>>;
}

/// Instantiates the configured chain, preserving order.
pub fn build_chain(strategies: &[RecoveryStrategy]) -> Vec<Box<dyn FallbackStrategy>> {
    strategies
        .iter()
        .map(|strategy| -> Box<dyn FallbackStrategy> {
            match strategy {
                RecoveryStrategy::Retry => Box::new(RetryFallback),
                RecoveryStrategy::Skip => Box::new(SkipFallback),
                RecoveryStrategy::Partial => Box::new(PartialFallback),
                RecoveryStrategy::Cached => Box::new(CachedFallback),
            }
        })
        .collect()
}

pub struct RetryFallback;

#[async_trait]
impl FallbackStrategy for RetryFallback {
    fn kind(&self) -> RecoveryStrategy {
        RecoveryStrategy::Retry
    }

    async fn recover(&self, session: &mut RecoverySession<'_>) -> Result<Vec<RawRecord>> {
        let source = session.source_name().to_string();
        let _in_flight = session.retries.enter(&source);
        let started = Instant::now();
        let max_retries = session.retry_policy.max_retries();

        for attempt in 0..max_retries {
            if !session.context.error.is_transient() {
                debug!(
                    source = %source,
                    kind = %session.context.error.kind,
                    "Error is not transient, not retrying"
                );
                break;
            }
            if session.breakers.is_open(&source) {
                debug!(source = %source, attempt, "Breaker opened during retry, stopping");
                break;
            }

            let delay = session.retry_policy.calculate_delay(attempt);
            debug!(
                source = %source,
                attempt = attempt + 1,
                max_retries,
                backoff_ms = %delay.as_millis(),
                "Retrying after error"
            );
            sleep(delay).await;

            match (session.operation)().await {
                Ok(records) => {
                    session.breakers.record_success(&source);
                    session.snapshots.store(&source, &records);
                    session.context.attempt_count += 1;
                    session.retry_policy.record_outcome(
                        &source,
                        session.context.attempt_count,
                        true,
                        started.elapsed(),
                    );
                    info!(
                        source = %source,
                        attempts = session.context.attempt_count,
                        records = records.len(),
                        "Operation succeeded after retries"
                    );
                    return Ok(records);
                }
                Err(error) => {
                    session.breakers.record_failure(&source);
                    debug!(source = %source, error = %error, "Retry attempt failed");
                    session.context.record_attempt(error);
                }
            }
        }

        session.retry_policy.record_outcome(
            &source,
            session.context.attempt_count,
            false,
            started.elapsed(),
        );
        Err(session.context.error.clone())
    }
}

pub struct SkipFallback;

#[async_trait]
impl FallbackStrategy for SkipFallback {
    fn kind(&self) -> RecoveryStrategy {
        RecoveryStrategy::Skip
    }

    async fn recover(&self, session: &mut RecoverySession<'_>) -> Result<Vec<RawRecord>> {
        info!(source = %session.source_name(), "Skipping source for this run");
        Ok(Vec::new())
    }
}

pub struct PartialFallback;

#[async_trait]
impl FallbackStrategy for PartialFallback {
    fn kind(&self) -> RecoveryStrategy {
        RecoveryStrategy::Partial
    }

    async fn recover(&self, session: &mut RecoverySession<'_>) -> Result<Vec<RawRecord>> {
        let Some(handler) = session.partial_handler.clone() else {
            return Err(Error::new(ErrorKind::Internal, "no partial recovery handler registered")
                .source_name(session.source_name())
                .severity(Severity::Info));
        };

        let records = handler.salvage(&session.context).await?;
        info!(
            source = %session.source_name(),
            records = records.len(),
            "Partial recovery salvaged records"
        );
        Ok(records)
    }
}

pub struct CachedFallback;

#[async_trait]
impl FallbackStrategy for CachedFallback {
    fn kind(&self) -> RecoveryStrategy {
        RecoveryStrategy::Cached
    }

    async fn recover(&self, session: &mut RecoverySession<'_>) -> Result<Vec<RawRecord>> {
        let source = session.source_name();
        match session.snapshots.get(source) {
            Some(records) => {
                info!(source = %source, records = records.len(), "Serving cached snapshot");
                Ok(records)
            }
            None => Err(Error::new(ErrorKind::Internal, "no cached snapshot available")
                .source_name(source)
                .severity(Severity::Info)),
        }
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    records: Vec<RawRecord>,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct SnapshotSlot {
    snapshot: Option<Snapshot>,
    hits: u64,
    misses: u64,
}

/// Per-source cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SnapshotStats {
    pub hits: u64,
    pub misses: u64,
    pub records: usize,
}

impl SnapshotStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Last known-good record set per source, with TTL and bounded staleness.
#[derive(Debug)]
pub struct SnapshotCache {
    ttl: Duration,
    max_stale: Duration,
    slots: Mutex<HashMap<String, SnapshotSlot>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, max_stale: Duration) -> Self {
        Self {
            ttl,
            max_stale,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, source: &str, records: &[RawRecord]) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(source.to_string()).or_default();
        slot.snapshot = Some(Snapshot {
            records: records.to_vec(),
            stored_at: Instant::now(),
        });
        gauge!("resilience.snapshot.records", records.len() as f64, "source" => source.to_string());
    }

    /// Returns the snapshot if it is fresh or within the stale allowance.
    pub fn get(&self, source: &str) -> Option<Vec<RawRecord>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(source.to_string()).or_default();

        let usable = slot
            .snapshot
            .as_ref()
            .filter(|s| s.stored_at.elapsed() <= self.ttl + self.max_stale)
            .map(|s| {
                if s.stored_at.elapsed() > self.ttl {
                    warn!(
                        source = %source,
                        age_secs = s.stored_at.elapsed().as_secs(),
                        "Using stale snapshot"
                    );
                }
                s.records.clone()
            });

        match usable {
            Some(records) => {
                slot.hits += 1;
                Some(records)
            }
            None => {
                slot.misses += 1;
                None
            }
        }
    }

    pub fn stats(&self, source: &str) -> SnapshotStats {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(source)
            .map(|slot| SnapshotStats {
                hits: slot.hits,
                misses: slot.misses,
                records: slot.snapshot.as_ref().map_or(0, |s| s.records.len()),
            })
            .unwrap_or_default()
    }

    pub fn all_stats(&self) -> HashMap<String, SnapshotStats> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .map(|(source, slot)| {
                let stats = SnapshotStats {
                    hits: slot.hits,
                    misses: slot.misses,
                    records: slot.snapshot.as_ref().map_or(0, |s| s.records.len()),
                };
                (source.clone(), stats)
            })
            .collect()
    }
}

/// Counts retry sessions currently running per source.
#[derive(Debug, Default)]
pub struct RetryTracker {
    active: Mutex<HashMap<String, usize>>,
}

impl RetryTracker {
    pub fn enter(&self, source: &str) -> RetryGuard<'_> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active.entry(source.to_string()).or_insert(0) += 1;
        RetryGuard {
            tracker: self,
            source: source.to_string(),
        }
    }

    pub fn active(&self, source: &str) -> usize {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.get(source).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, usize> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Leaves the retry session when dropped, including on cancellation.
pub struct RetryGuard<'a> {
    tracker: &'a RetryTracker,
    source: String,
}

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        let mut active = self
            .tracker
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = active.get_mut(&self.source) {
            *count = count.saturating_sub(1);
        }
    }
}
