// ingest-orchestrator-rs/src/main.rs
// Entry point for the ingestion daemon: one full run, then incremental runs
// on the collection interval until interrupted.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use ingest_orchestrator_rs::{
    FingerprintDeduplicator, HttpJsonConnector, JsonlSink, PipelineOrchestrator,
    RequiredFieldsValidator, Watermarks,
};
use ingest_types_rs::{lookback_window, IngestConfig, IngestionResult};
use monitoring_rs::{AlertNotifier, LogNotifier, MonitoringService, WebhookNotifier};
use resilience_rs::{init_logging, ResilienceEngine};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = IngestConfig::load().context("failed to load configuration")?;
    let _log_guard = init_logging(&config.logging).context("failed to initialize logging")?;

    info!(
        sources = config.sources.len(),
        interval_secs = config.pipeline.collection_interval_secs,
        "Starting ingestion daemon"
    );

    let engine = Arc::new(ResilienceEngine::new(&config.resilience));

    let mut notifiers: Vec<Arc<dyn AlertNotifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.monitoring.alert_webhook_url {
        let webhook = WebhookNotifier::new(url.clone()).context("failed to build webhook notifier")?;
        notifiers.push(Arc::new(webhook));
    }
    let monitoring = Arc::new(MonitoringService::new(config.monitoring.clone(), notifiers));

    let mut deduplicator = FingerprintDeduplicator::new(config.pipeline.dedup_window);
    if let Some(field) = &config.pipeline.dedup_key_field {
        deduplicator = deduplicator.with_key_field(field.clone());
    }

    let mut orchestrator = PipelineOrchestrator::new(
        config.pipeline.clone(),
        Arc::clone(&engine),
        Arc::clone(&monitoring),
        Arc::new(RequiredFieldsValidator::new(config.pipeline.required_fields.clone())),
        Arc::new(deduplicator),
        Arc::new(JsonlSink::new(&config.storage)),
    );
    for source in config.enabled_sources() {
        let connector = HttpJsonConnector::new(source.clone(), config.pipeline.connector_timeout())
            .with_context(|| format!("failed to build connector for {}", source.name))?;
        orchestrator = orchestrator.with_connector(Arc::new(connector));
    }

    orchestrator.register_probes().await;
    monitoring.start();

    let health = orchestrator.health_check().await;
    if !health.healthy {
        warn!(status = ?health.status, issues = ?health.issues, "Starting with unreachable sources");
    }

    // Until a source covers the full window, incremental runs ask it for all of it.
    let initial = lookback_window(&config.pipeline.default_lookback, Utc::now())
        .context("invalid default_lookback")?
        .earliest;
    let mut watermarks = Watermarks::new(initial);

    let result = orchestrator.run_full().await;
    after_run(&orchestrator, &result).await;
    watermarks.advance(&result);

    let mut ticker = tokio::time::interval(config.pipeline.collection_interval());
    // The first tick completes immediately and the full run just happened.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = orchestrator.run_incremental_from(&watermarks).await;
                after_run(&orchestrator, &result).await;
                watermarks.advance(&result);
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    monitoring.shutdown();
    let summary = monitoring.get_monitoring_summary().await;
    info!(
        samples = summary.total_samples,
        unresolved_alerts = summary.unresolved_alerts,
        "Ingestion daemon stopped"
    );
    Ok(())
}

async fn after_run(orchestrator: &PipelineOrchestrator, result: &IngestionResult) {
    match serde_json::to_string(result) {
        Ok(json) => info!(result = %json, "Run result"),
        Err(e) => warn!(error = %e, "Failed to serialize run result"),
    }

    if result.success {
        for report in orchestrator.reprocess_dead_letters().await {
            info!(
                source = %report.source_name,
                attempted = report.attempted,
                succeeded = report.succeeded,
                dropped = report.dropped.len(),
                deferred = report.deferred,
                "Dead letters reprocessed"
            );
        }
    }
}
