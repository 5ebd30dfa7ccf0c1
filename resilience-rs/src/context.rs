//! # Error Context
//!
//! What the engine remembers about a failed guarded call while it tries to
//! recover, and the type-erased operation it re-invokes.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use ingest_types_rs::RawRecord;
use serde::Serialize;

use crate::types::{Error, Result};

/// A re-invocable source operation.
///
/// Kept behind an `Arc` so the same operation can be retried within a
/// recovery session and captured by the dead-letter queue.
pub type Operation = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<RawRecord>>> + Send + Sync>;

/// Wraps an async closure into an [`Operation`].
pub fn operation<F, Fut>(f: F) -> Operation
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<RawRecord>>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub source_name: String,
    pub operation_name: String,
    pub occurred_at: DateTime<Utc>,
    /// Most recent error raised by the source
    pub error: Error,
    /// Invocations made so far, the first call included
    pub attempt_count: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new(
        source_name: &str,
        operation_name: &str,
        error: Error,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            operation_name: operation_name.to_string(),
            occurred_at: Utc::now(),
            error,
            attempt_count: 1,
            metadata,
        }
    }

    /// Records one more failed invocation.
    pub fn record_attempt(&mut self, error: Error) {
        self.attempt_count += 1;
        self.error = error;
    }
}
