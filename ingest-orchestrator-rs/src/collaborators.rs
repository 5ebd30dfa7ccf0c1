//! Contracts the orchestrator drives during a run.

use async_trait::async_trait;
use ingest_types_rs::{RawRecord, SourceKind, SourceQuery};
use resilience_rs::Result;
use serde::{Deserialize, Serialize};

/// A configured upstream (SIEM, SOAR, EDR...) that can be queried for records.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Unique source name, used as the key for breakers, queues and metrics.
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>>;

    /// Lightweight connectivity check used by health checks.
    async fn test_connection(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub accepted: Vec<RawRecord>,
    pub accepted_count: usize,
    pub rejected_count: usize,
    /// Record-level problems; they reject records but do not fail the run.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupOutcome {
    pub unique_records: Vec<RawRecord>,
    pub duplicate_count: usize,
    pub unique_count: usize,
    /// Identities of `unique_records`, remembered only once they are stored.
    #[serde(default)]
    pub fingerprints: Vec<u64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, records: &[RawRecord], source_name: &str) -> Result<ValidationOutcome>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Separates records already seen from new ones without remembering
    /// the new ones yet.
    async fn deduplicate(&self, records: &[RawRecord], source_name: &str) -> Result<DedupOutcome>;

    /// Remembers fingerprints of records that reached storage.
    async fn commit(&self, fingerprints: &[u64]) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store(&self, records: &[RawRecord]) -> Result<()>;
}
