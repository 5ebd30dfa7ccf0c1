use std::sync::Arc;

use async_trait::async_trait;
use monitoring_rs::SourceProbe;
use resilience_rs::ResilienceEngine;

/// Reports a source's resilience backlog to the monitoring poll.
pub struct EngineProbe {
    engine: Arc<ResilienceEngine>,
    source: String,
}

impl EngineProbe {
    pub fn new(engine: Arc<ResilienceEngine>, source: impl Into<String>) -> Self {
        Self {
            engine,
            source: source.into(),
        }
    }
}

#[async_trait]
impl SourceProbe for EngineProbe {
    /// Dead letters waiting plus retry sessions in progress.
    async fn queue_size(&self) -> u64 {
        let dead = self.engine.dead_letter_len(&self.source).await;
        (dead + self.engine.retries_in_flight(&self.source)) as u64
    }

    async fn cache_hit_rate(&self) -> f64 {
        self.engine.snapshot_stats(&self.source).hit_rate()
    }
}
