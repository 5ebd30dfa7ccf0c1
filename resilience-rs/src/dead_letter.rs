//! Dead letter queue for collections that exhausted every recovery strategy.
//!
//! Entries are kept per source together with the operation that failed, so
//! they can be reprocessed later without the caller rebuilding it.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::context::{ErrorContext, Operation};

/// A failed collection waiting for reprocessing.
pub struct DeadLetter {
    pub context: ErrorContext,
    pub enqueued_at: DateTime<Utc>,
    pub(crate) operation: Operation,
}

impl DeadLetter {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

impl fmt::Debug for DeadLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetter")
            .field("context", &self.context)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// Per-source bounded queues of dead letters.
pub struct DeadLetterQueue {
    max_per_source: usize,
    queues: Mutex<HashMap<String, VecDeque<DeadLetter>>>,
}

impl DeadLetterQueue {
    pub fn new(max_per_source: usize) -> Self {
        Self {
            max_per_source: max_per_source.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a dead letter, evicting the oldest entry when the source's
    /// queue is full. Returns the queue length afterwards.
    pub async fn push(&self, context: ErrorContext, operation: Operation) -> usize {
        let source = context.source_name.clone();
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(source.clone()).or_default();

        if queue.len() >= self.max_per_source {
            if let Some(evicted) = queue.pop_front() {
                warn!(
                    source = %source,
                    enqueued_at = %evicted.enqueued_at,
                    error = %evicted.context.error,
                    "Dead letter queue full, evicting oldest entry"
                );
                counter!("dead_letter.evicted", 1, "source" => source.clone());
            }
        }

        debug!(
            source = %source,
            operation = %context.operation_name,
            attempts = context.attempt_count,
            "Recording dead letter"
        );
        queue.push_back(DeadLetter {
            context,
            enqueued_at: Utc::now(),
            operation,
        });

        let len = queue.len();
        counter!("dead_letter.enqueued", 1, "source" => source.clone());
        gauge!("dead_letter.size", len as f64, "source" => source);
        len
    }

    pub async fn len(&self, source: &str) -> usize {
        self.queues.lock().await.get(source).map_or(0, VecDeque::len)
    }

    pub async fn sizes(&self) -> HashMap<String, usize> {
        self.queues
            .lock()
            .await
            .iter()
            .map(|(source, queue)| (source.clone(), queue.len()))
            .collect()
    }

    /// Copies of the queued contexts, oldest first.
    pub async fn contexts(&self, source: &str) -> Vec<ErrorContext> {
        self.queues
            .lock()
            .await
            .get(source)
            .map(|queue| queue.iter().map(|d| d.context.clone()).collect())
            .unwrap_or_default()
    }

    /// Removes and returns every entry for `source`.
    pub async fn drain(&self, source: &str) -> Vec<DeadLetter> {
        let drained: Vec<_> = self
            .queues
            .lock()
            .await
            .remove(source)
            .map(Vec::from)
            .unwrap_or_default();
        gauge!("dead_letter.size", 0.0, "source" => source.to_string());
        drained
    }
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("max_per_source", &self.max_per_source)
            .finish_non_exhaustive()
    }
}
