//! Per-source resume points for incremental collection.
//!
//! A source moves forward only once its window was answered live and the run
//! stored everything it collected. Sources that were short-circuited, served
//! from a degraded fallback, or lost to a failing stage keep their old mark
//! and are asked for the missed window on the next run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ingest_types_rs::IngestionResult;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Watermarks {
    initial: DateTime<Utc>,
    marks: HashMap<String, DateTime<Utc>>,
}

impl Watermarks {
    /// Sources never collected resume from `initial`.
    pub fn new(initial: DateTime<Utc>) -> Self {
        Self {
            initial,
            marks: HashMap::new(),
        }
    }

    pub fn resume_from(&self, source_name: &str) -> DateTime<Utc> {
        self.marks.get(source_name).copied().unwrap_or(self.initial)
    }

    pub fn set(&mut self, source_name: impl Into<String>, mark: DateTime<Utc>) {
        self.marks.insert(source_name.into(), mark);
    }

    /// Moves every source that covered its window up to that window's end.
    /// Returns how many sources advanced.
    pub fn advance(&mut self, result: &IngestionResult) -> usize {
        if !result.success {
            return 0;
        }
        let mut advanced = 0;
        for source in result.per_source_results.iter().filter(|s| s.covered_window()) {
            let mark = self
                .marks
                .entry(source.source_name.clone())
                .or_insert(self.initial);
            if source.window.latest > *mark {
                *mark = source.window.latest;
                advanced += 1;
            }
        }
        debug!(advanced, sources = result.per_source_results.len(), "Advanced watermarks");
        advanced
    }
}
