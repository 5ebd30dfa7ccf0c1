//! # Resilience
//!
//! Keeps source collection alive in the face of unreliable upstreams.
//!
//! - `circuit_breaker`: per-source breakers with half-open probing
//! - `retry`: backoff schedule for the retry strategy
//! - `fallback`: the recovery chain, snapshot cache and partial recovery hook
//! - `dead_letter`: per-source queue of unrecoverable collections
//! - `engine`: [`ResilienceEngine`], tying all of the above together
//! - `types`, `logging`: the shared error type and tracing bootstrap

pub mod circuit_breaker;
pub mod context;
pub mod dead_letter;
pub mod engine;
pub mod fallback;
pub mod logging;
pub mod retry;
pub mod types;

pub use circuit_breaker::{Admission, CircuitBreakerRegistry, CircuitBreakerState, CircuitState};
pub use context::{operation, ErrorContext, Operation};
pub use engine::{RecoveryResult, ReprocessReport, ResilienceEngine, ResilienceStatistics};
pub use fallback::{PartialRecovery, SnapshotStats};
pub use logging::init_logging;
pub use types::{Error, ErrorKind, Result, Severity};
