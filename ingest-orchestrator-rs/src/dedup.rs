//! Fingerprint based deduplication that remembers recent runs.
//!
//! Incremental windows overlap at their edges, so fingerprints are kept
//! across calls in a bounded FIFO window rather than per batch only.
//! A fingerprint enters the window only through `commit`, after its record
//! was stored.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ingest_types_rs::RawRecord;
use resilience_rs::Result;
use tracing::debug;

use crate::collaborators::{DedupOutcome, Deduplicator};

#[derive(Debug, Default)]
struct Seen {
    set: HashSet<u64>,
    order: VecDeque<u64>,
}

#[derive(Debug)]
pub struct FingerprintDeduplicator {
    capacity: usize,
    key_field: Option<String>,
    seen: Mutex<Seen>,
}

impl FingerprintDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            key_field: None,
            seen: Mutex::new(Seen::default()),
        }
    }

    /// Identify records by one field (e.g. an upstream event id) instead of
    /// their full content. Records lacking the field fall back to content.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    fn fingerprint(&self, record: &RawRecord, source_name: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        source_name.hash(&mut hasher);
        match self.key_field.as_deref().and_then(|f| record.get(f)) {
            Some(key) => key.to_string().hash(&mut hasher),
            // serde_json objects serialize with sorted keys, so this is canonical
            None => record.to_string().hash(&mut hasher),
        }
        hasher.finish()
    }

    pub fn remembered(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).set.len()
    }
}

#[async_trait]
impl Deduplicator for FingerprintDeduplicator {
    async fn deduplicate(&self, records: &[RawRecord], source_name: &str) -> Result<DedupOutcome> {
        let mut outcome = DedupOutcome::default();
        let mut batch = HashSet::with_capacity(records.len());
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        for record in records {
            let fp = self.fingerprint(record, source_name);
            if seen.set.contains(&fp) || !batch.insert(fp) {
                outcome.duplicate_count += 1;
                continue;
            }
            outcome.fingerprints.push(fp);
            outcome.unique_records.push(record.clone());
        }
        outcome.unique_count = outcome.unique_records.len();

        debug!(
            source = %source_name,
            unique = outcome.unique_count,
            duplicates = outcome.duplicate_count,
            "Deduplicated records"
        );
        Ok(outcome)
    }

    async fn commit(&self, fingerprints: &[u64]) -> Result<()> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        for &fp in fingerprints {
            if !seen.set.insert(fp) {
                continue;
            }
            seen.order.push_back(fp);
            if seen.order.len() > self.capacity {
                if let Some(oldest) = seen.order.pop_front() {
                    seen.set.remove(&oldest);
                }
            }
        }
        Ok(())
    }
}
