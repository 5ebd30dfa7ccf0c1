//! # Circuit Breaker
//!
//! Per-source circuit breakers keyed by source name.
//!
//! A breaker counts consecutive failures. Reaching the threshold opens it;
//! while open every call is rejected until `reopen_eligible_at`, after which
//! exactly one half-open probe is admitted. A successful probe closes the
//! breaker, a failed one re-opens it with a fresh cooldown. Successes while
//! closed decrement the failure count without going below zero.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ingest_types_rs::ResilienceConfig;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Cooldown elapsed, next request is a probe
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Breaker bookkeeping for a single source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub is_open: bool,
    pub consecutive_failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub reopen_eligible_at: Option<DateTime<Utc>>,
    /// A half-open probe has been admitted and has not reported back
    pub probe_in_flight: bool,
    /// Number of times this breaker has tripped
    pub opened_count: u64,
}

impl CircuitBreakerState {
    pub fn state_at(&self, now: DateTime<Utc>) -> CircuitState {
        match (self.is_open, self.reopen_eligible_at) {
            (false, _) => CircuitState::Closed,
            (true, Some(eligible)) if now >= eligible => CircuitState::HalfOpen,
            (true, _) => CircuitState::Open,
        }
    }
}

/// Decision taken for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, call normally
    Allowed,
    /// Cooldown elapsed, this call is the half-open probe
    Probe,
    /// Breaker open, do not call
    Rejected { retry_in: Duration },
}

/// Configuration for the breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before a probe is allowed
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ResilienceConfig> for CircuitBreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold.max(1),
            open_timeout: config.circuit_breaker_timeout(),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Registry of breakers, one per source
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.circuits.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.circuits.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides whether a call to `source` may proceed.
    pub fn admit(&self, source: &str) -> Admission {
        let now = Utc::now();
        let mut circuits = self.write();

        let Some(stats) = circuits.get_mut(source) else {
            return Admission::Allowed;
        };
        if !stats.is_open {
            return Admission::Allowed;
        }

        let eligible = stats.reopen_eligible_at.unwrap_or(now);
        if now < eligible {
            let retry_in = (eligible - now).to_std().unwrap_or_default();
            debug!(
                circuit = %source,
                remaining_ms = %retry_in.as_millis(),
                "Circuit open, request rejected"
            );
            counter!("circuit_breaker.rejected", 1, "source" => source.to_string());
            return Admission::Rejected { retry_in };
        }

        // A probe that never reported back (cancelled caller) is abandoned
        // after one more cooldown.
        let probe_stale = now >= eligible + to_chrono(self.config.open_timeout);
        if stats.probe_in_flight && !probe_stale {
            return Admission::Rejected {
                retry_in: Duration::ZERO,
            };
        }

        stats.probe_in_flight = true;
        info!(circuit = %source, "Circuit HALF-OPEN: admitting probe");
        Admission::Probe
    }

    pub fn is_open(&self, source: &str) -> bool {
        self.read().get(source).map_or(false, |s| s.is_open)
    }

    /// Records a failed call and returns the resulting state.
    pub fn record_failure(&self, source: &str) -> CircuitState {
        let now = Utc::now();
        let mut circuits = self.write();
        let stats = circuits.entry(source.to_string()).or_default();

        stats.consecutive_failure_count = stats.consecutive_failure_count.saturating_add(1);
        stats.last_failure_at = Some(now);

        if stats.is_open {
            stats.probe_in_flight = false;
            stats.reopen_eligible_at = Some(now + to_chrono(self.config.open_timeout));
            warn!(
                circuit = %source,
                failures = stats.consecutive_failure_count,
                cooldown_ms = %self.config.open_timeout.as_millis(),
                "Circuit REOPENED: probe failed"
            );
        } else if stats.consecutive_failure_count >= self.config.failure_threshold {
            stats.is_open = true;
            stats.opened_count += 1;
            stats.reopen_eligible_at = Some(now + to_chrono(self.config.open_timeout));
            warn!(
                circuit = %source,
                failures = stats.consecutive_failure_count,
                threshold = self.config.failure_threshold,
                "Circuit OPEN: failure threshold reached"
            );
            counter!("circuit_breaker.trips", 1, "source" => source.to_string());
            gauge!("circuit_breaker.open", 1.0, "source" => source.to_string());
        }

        stats.state_at(now)
    }

    /// Records a successful call on a closed breaker.
    pub fn record_success(&self, source: &str) {
        let mut circuits = self.write();
        if let Some(stats) = circuits.get_mut(source) {
            if !stats.is_open {
                stats.consecutive_failure_count = stats.consecutive_failure_count.saturating_sub(1);
            }
        }
    }

    /// Closes the breaker after a successful half-open probe.
    pub fn close(&self, source: &str) {
        let mut circuits = self.write();
        if let Some(stats) = circuits.get_mut(source) {
            let was_open = stats.is_open;
            stats.is_open = false;
            stats.consecutive_failure_count = 0;
            stats.reopen_eligible_at = None;
            stats.probe_in_flight = false;
            if was_open {
                info!(circuit = %source, "Circuit CLOSED: source recovered");
                gauge!("circuit_breaker.open", 0.0, "source" => source.to_string());
            }
        }
    }

    /// Forgets everything known about `source`.
    pub fn reset(&self, source: &str) -> bool {
        let removed = self.write().remove(source).is_some();
        if removed {
            info!(circuit = %source, "Circuit breaker reset");
            gauge!("circuit_breaker.open", 0.0, "source" => source.to_string());
        }
        removed
    }

    pub fn get(&self, source: &str) -> Option<CircuitBreakerState> {
        self.read().get(source).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, CircuitBreakerState> {
        self.read().clone()
    }
}
