//! # Monitoring Service
//!
//! Keeps a bounded-age metrics time series per source, derives health from
//! the most recent samples and raises threshold alerts as samples arrive.
//!
//! Two background timers feed it once [`MonitoringService::start`] is called:
//! a metrics poll (host usage plus registered source probes) and a health
//! check. Pipeline runs write samples directly through
//! [`MonitoringService::record_metrics`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use ingest_types_rs::{
    Alert, AlertKind, AlertSeverity, AlertThresholds, HealthIssue, HealthState, HealthStatus,
    IngestionMetrics, MetricsUpdate, MonitoringConfig, SampleKind,
};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notifier::AlertNotifier;
use crate::probe::{HostProbe, SourceProbe, SystemProbe};

/// A source whose newest sample is older than this many metric intervals is
/// considered silent.
const STALE_AFTER_INTERVALS: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source_name: String,
    pub sample_count: usize,
    pub latest: Option<IngestionMetrics>,
    pub health: Option<HealthState>,
    pub unresolved_alerts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSummary {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceSummary>,
    pub total_samples: usize,
    pub total_alerts: usize,
    pub unresolved_alerts: usize,
    pub healthy_sources: usize,
    pub degraded_sources: usize,
    pub unhealthy_sources: usize,
}

pub struct MonitoringService {
    config: MonitoringConfig,
    series: RwLock<HashMap<String, VecDeque<IngestionMetrics>>>,
    alerts: RwLock<HashMap<String, Vec<Alert>>>,
    health: RwLock<HashMap<String, HealthStatus>>,
    probes: RwLock<HashMap<String, Arc<dyn SourceProbe>>>,
    host: Arc<dyn HostProbe>,
    notifiers: Vec<Arc<dyn AlertNotifier>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitoringService {
    pub fn new(config: MonitoringConfig, notifiers: Vec<Arc<dyn AlertNotifier>>) -> Self {
        Self {
            config,
            series: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            probes: RwLock::new(HashMap::new()),
            host: Arc::new(SystemProbe::new()),
            notifiers,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_host_probe(mut self, host: Arc<dyn HostProbe>) -> Self {
        self.host = host;
        self
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Registers the probe polled for `source`'s queue depth and cache hit rate.
    pub async fn register_probe(&self, source: &str, probe: Arc<dyn SourceProbe>) {
        self.probes.write().await.insert(source.to_string(), probe);
    }

    /// Starts the metrics poll and health check timers. Calling it again
    /// while they run does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        info!(
            metrics_interval_ms = self.config.metrics_interval_ms,
            health_check_interval_ms = self.config.health_check_interval_ms,
            "Starting monitoring timers"
        );

        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(run_every(
            self.config.metrics_interval(),
            weak.clone(),
            |service| async move {
                service.collect_once().await;
            },
        )));
        tasks.push(tokio::spawn(run_every(
            self.config.health_check_interval(),
            weak,
            |service| async move {
                service.check_health().await;
            },
        )));
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Monitoring timers stopped");
    }

    /// Appends a sample for `source`, pruning expired samples first, and
    /// raises any threshold alerts it breaches.
    pub async fn record_metrics(&self, source: &str, update: MetricsUpdate) -> IngestionMetrics {
        let sample = update.into_sample(source);
        let cutoff = Utc::now() - self.config.retention();

        {
            let mut series = self.series.write().await;
            let samples = series.entry(source.to_string()).or_default();
            let before = samples.len();
            samples.retain(|m| m.timestamp >= cutoff);
            let pruned = before - samples.len();
            if pruned > 0 {
                debug!(source = %source, pruned, "Pruned expired metrics");
            }
            samples.push_back(sample.clone());
        }
        mirror_gauges(&sample);

        let raised = evaluate_thresholds(&self.config.alert_thresholds, &sample);
        if !raised.is_empty() {
            self.alerts
                .write()
                .await
                .entry(source.to_string())
                .or_default()
                .extend(raised.iter().cloned());
            for alert in &raised {
                counter!(
                    "monitoring.alerts_raised", 1,
                    "source" => alert.source_name.clone(),
                    "severity" => alert.severity.to_string()
                );
                self.dispatch(alert, false).await;
            }
        }

        sample
    }

    /// One metrics poll: host usage plus every registered probe, recorded as
    /// `system` samples for every known source.
    pub async fn collect_once(&self) {
        let usage = self.host.sample();
        let probes: HashMap<String, Arc<dyn SourceProbe>> = self.probes.read().await.clone();
        let mut sources: BTreeSet<String> = probes.keys().cloned().collect();
        sources.extend(self.series.read().await.keys().cloned());

        for source in sources {
            let (queue_size, cache_hit_rate) = match probes.get(&source) {
                Some(probe) => (Some(probe.queue_size().await), Some(probe.cache_hit_rate().await)),
                None => (None, None),
            };
            self.record_metrics(
                &source,
                MetricsUpdate {
                    sample_kind: SampleKind::System,
                    queue_size,
                    cache_hit_rate,
                    memory_usage_percent: Some(usage.memory_usage_percent),
                    cpu_usage_percent: Some(usage.cpu_usage_percent),
                    ..MetricsUpdate::default()
                },
            )
            .await;
        }
        debug!(
            memory = usage.memory_usage_percent,
            cpu = usage.cpu_usage_percent,
            "System metrics collected"
        );
    }

    /// One health check over every known source. Transitions into
    /// `unhealthy` raise a system alert; leaving it resolves them.
    pub async fn check_health(&self) -> HashMap<String, HealthStatus> {
        let now = Utc::now();
        let stale_after = self.config.metrics_interval() * STALE_AFTER_INTERVALS;

        let probed: Vec<String> = self.probes.read().await.keys().cloned().collect();
        let computed: Vec<HealthStatus> = {
            let series = self.series.read().await;
            let mut sources: BTreeSet<String> = series.keys().cloned().collect();
            sources.extend(probed);
            sources
                .into_iter()
                .map(|source| {
                    let samples: Vec<IngestionMetrics> = series
                        .get(&source)
                        .map(|s| s.iter().cloned().collect())
                        .unwrap_or_default();
                    let issues = evaluate_health(
                        &self.config.alert_thresholds,
                        &samples,
                        self.config.health_window_samples,
                        now,
                        stale_after,
                    );
                    HealthStatus::from_issues(&source, issues)
                })
                .collect()
        };

        let mut opened = Vec::new();
        let mut recovered = Vec::new();
        {
            let mut health = self.health.write().await;
            for status in &computed {
                let previous = health.get(&status.source_name).map(|h| h.status);
                let was_unhealthy = previous == Some(HealthState::Unhealthy);
                let is_unhealthy = status.status == HealthState::Unhealthy;
                if is_unhealthy && !was_unhealthy {
                    opened.push(status.clone());
                } else if was_unhealthy && !is_unhealthy {
                    recovered.push(status.source_name.clone());
                }
                if previous != Some(status.status) {
                    info!(
                        source = %status.source_name,
                        from = ?previous,
                        to = %status.status,
                        issues = status.issues.len(),
                        "Health changed"
                    );
                }
                gauge!(
                    "monitoring.health",
                    health_gauge(status.status),
                    "source" => status.source_name.clone()
                );
                health.insert(status.source_name.clone(), status.clone());
            }
        }

        for status in opened {
            self.raise_system_alert(&status).await;
        }
        for source in recovered {
            self.resolve_system_alerts(&source).await;
        }
        self.prune_resolved_alerts().await;

        computed
            .into_iter()
            .map(|status| (status.source_name.clone(), status))
            .collect()
    }

    async fn raise_system_alert(&self, status: &HealthStatus) {
        let worst = status
            .issues
            .iter()
            .map(|i| i.severity)
            .max()
            .unwrap_or(AlertSeverity::High);
        let message = status
            .issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        let mut alert = Alert::threshold(&status.source_name, worst, "health", 0.0, 0.0, message);
        alert.kind = AlertKind::System;
        error!(source = %status.source_name, alert_id = %alert.id, "Source became unhealthy");

        self.alerts
            .write()
            .await
            .entry(status.source_name.clone())
            .or_default()
            .push(alert.clone());
        self.dispatch(&alert, false).await;
    }

    async fn resolve_system_alerts(&self, source: &str) {
        let resolved: Vec<Alert> = {
            let mut alerts = self.alerts.write().await;
            alerts
                .get_mut(source)
                .map(|list| {
                    list.iter_mut()
                        .filter(|a| a.kind == AlertKind::System && !a.resolved)
                        .map(|a| {
                            a.resolve();
                            a.clone()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        for alert in &resolved {
            info!(source = %source, alert_id = %alert.id, "Source recovered");
            self.dispatch(alert, true).await;
        }
    }

    async fn prune_resolved_alerts(&self) {
        let cutoff = Utc::now() - self.config.retention();
        let mut alerts = self.alerts.write().await;
        for list in alerts.values_mut() {
            list.retain(|a| !a.resolved || a.resolved_at.map_or(true, |at| at >= cutoff));
        }
    }

    /// Marks an alert resolved. Returns false when no unresolved alert with
    /// that id exists for `source`.
    pub async fn resolve_alert(&self, id: Uuid, source: &str) -> bool {
        let resolved = {
            let mut alerts = self.alerts.write().await;
            alerts
                .get_mut(source)
                .and_then(|list| list.iter_mut().find(|a| a.id == id && !a.resolved))
                .map(|alert| {
                    alert.resolve();
                    alert.clone()
                })
        };

        match resolved {
            Some(alert) => {
                info!(source = %source, alert_id = %id, "Alert resolved");
                self.dispatch(&alert, true).await;
                true
            }
            None => {
                debug!(source = %source, alert_id = %id, "No open alert to resolve");
                false
            }
        }
    }

    async fn dispatch(&self, alert: &Alert, resolution: bool) {
        let deliveries = self.notifiers.iter().map(|notifier| async move {
            if resolution {
                notifier.resolved(alert).await
            } else {
                notifier.notify(alert).await
            }
        });

        for outcome in join_all(deliveries).await {
            if let Err(err) = outcome {
                warn!(
                    alert_id = %alert.id,
                    source = %alert.source_name,
                    error = %err,
                    "Alert delivery failed"
                );
                counter!("monitoring.notification_failures", 1, "source" => alert.source_name.clone());
            }
        }
    }

    /// Samples for `source`, oldest first, optionally only those at or after `since`.
    pub async fn get_metrics(&self, source: &str, since: Option<DateTime<Utc>>) -> Vec<IngestionMetrics> {
        self.series
            .read()
            .await
            .get(source)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|m| since.map_or(true, |t| m.timestamp >= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_health_status(&self, source: &str) -> Option<HealthStatus> {
        self.health.read().await.get(source).cloned()
    }

    pub async fn get_all_health(&self) -> HashMap<String, HealthStatus> {
        self.health.read().await.clone()
    }

    /// Alerts for one source or all sources, oldest first. Resolved alerts
    /// are only included when asked for.
    pub async fn get_alerts(&self, source: Option<&str>, include_resolved: bool) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        let mut selected: Vec<Alert> = alerts
            .iter()
            .filter(|(name, _)| source.map_or(true, |s| s == name.as_str()))
            .flat_map(|(_, list)| list.iter())
            .filter(|a| include_resolved || !a.resolved)
            .cloned()
            .collect();
        selected.sort_by_key(|a| a.raised_at);
        selected
    }

    pub async fn get_monitoring_summary(&self) -> MonitoringSummary {
        let series = self.series.read().await;
        let alerts = self.alerts.read().await;
        let health = self.health.read().await;

        let mut names: BTreeSet<&String> = series.keys().collect();
        names.extend(alerts.keys());
        names.extend(health.keys());

        let sources: Vec<SourceSummary> = names
            .into_iter()
            .map(|name| SourceSummary {
                source_name: name.clone(),
                sample_count: series.get(name).map_or(0, VecDeque::len),
                latest: series.get(name).and_then(|s| s.back().cloned()),
                health: health.get(name).map(|h| h.status),
                unresolved_alerts: alerts
                    .get(name)
                    .map_or(0, |list| list.iter().filter(|a| !a.resolved).count()),
            })
            .collect();

        let count_state = |state: HealthState| health.values().filter(|h| h.status == state).count();

        MonitoringSummary {
            generated_at: Utc::now(),
            total_samples: series.values().map(VecDeque::len).sum(),
            total_alerts: alerts.values().map(Vec::len).sum(),
            unresolved_alerts: sources.iter().map(|s| s.unresolved_alerts).sum(),
            healthy_sources: count_state(HealthState::Healthy),
            degraded_sources: count_state(HealthState::Degraded),
            unhealthy_sources: count_state(HealthState::Unhealthy),
            sources,
        }
    }
}

impl Drop for MonitoringService {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_every<F, Fut>(period: Duration, service: Weak<MonitoringService>, tick: F)
where
    F: Fn(Arc<MonitoringService>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        tick(service).await;
    }
}

fn mirror_gauges(sample: &IngestionMetrics) {
    let source = sample.source_name.clone();
    gauge!("monitoring.queue_size", sample.queue_size as f64, "source" => source.clone());
    gauge!("monitoring.cache_hit_rate", sample.cache_hit_rate, "source" => source.clone());
    gauge!("monitoring.memory_usage_percent", sample.memory_usage_percent, "source" => source.clone());
    if sample.sample_kind == SampleKind::Collection {
        gauge!("monitoring.error_rate", sample.error_rate, "source" => source.clone());
        gauge!("monitoring.throughput_per_second", sample.throughput_per_second, "source" => source.clone());
        gauge!("monitoring.latency_p95_ms", sample.latency_p95_ms, "source" => source);
    }
}

fn health_gauge(state: HealthState) -> f64 {
    match state {
        HealthState::Healthy => 0.0,
        HealthState::Degraded => 1.0,
        HealthState::Unhealthy => 2.0,
    }
}

/// At most one alert per breached dimension.
pub fn evaluate_thresholds(thresholds: &AlertThresholds, sample: &IngestionMetrics) -> Vec<Alert> {
    let source = sample.source_name.as_str();
    let mut alerts = Vec::new();

    if sample.error_rate > thresholds.error_rate {
        alerts.push(Alert::threshold(
            source,
            AlertSeverity::High,
            "error_rate",
            sample.error_rate,
            thresholds.error_rate,
            format!(
                "error rate {:.2}% above {:.2}%",
                sample.error_rate * 100.0,
                thresholds.error_rate * 100.0
            ),
        ));
    }

    if sample.sample_kind == SampleKind::Collection {
        if sample.latency_p95_ms > thresholds.latency_ms {
            alerts.push(Alert::threshold(
                source,
                AlertSeverity::Medium,
                "latency_p95_ms",
                sample.latency_p95_ms,
                thresholds.latency_ms,
                format!(
                    "p95 latency {:.0}ms above {:.0}ms",
                    sample.latency_p95_ms, thresholds.latency_ms
                ),
            ));
        }
        if sample.throughput_per_second < thresholds.throughput_min {
            alerts.push(Alert::threshold(
                source,
                AlertSeverity::Medium,
                "throughput_per_second",
                sample.throughput_per_second,
                thresholds.throughput_min,
                format!(
                    "throughput {:.2}/s below {:.2}/s",
                    sample.throughput_per_second, thresholds.throughput_min
                ),
            ));
        }
    }

    if sample.queue_size > thresholds.queue_size {
        alerts.push(Alert::threshold(
            source,
            AlertSeverity::High,
            "queue_size",
            sample.queue_size as f64,
            thresholds.queue_size as f64,
            format!("queue size {} above {}", sample.queue_size, thresholds.queue_size),
        ));
    }

    if sample.memory_usage_percent > thresholds.memory_usage_percent {
        alerts.push(Alert::threshold(
            source,
            AlertSeverity::Critical,
            "memory_usage_percent",
            sample.memory_usage_percent,
            thresholds.memory_usage_percent,
            format!(
                "memory usage {:.1}% above {:.1}%",
                sample.memory_usage_percent, thresholds.memory_usage_percent
            ),
        ));
    }

    alerts
}

/// Health issues for one source from its series (oldest first).
///
/// Error rate, latency and throughput are averaged over the last `window`
/// collection samples; queue size and memory come from the newest sample.
pub fn evaluate_health(
    thresholds: &AlertThresholds,
    samples: &[IngestionMetrics],
    window: usize,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    let Some(latest) = samples.last() else {
        issues.push(HealthIssue {
            severity: AlertSeverity::High,
            message: "no recent metrics".to_string(),
        });
        return issues;
    };

    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(1));
    if now - latest.timestamp > stale_after {
        issues.push(HealthIssue {
            severity: AlertSeverity::High,
            message: format!(
                "no metrics for {}s",
                (now - latest.timestamp).num_seconds()
            ),
        });
    }

    let recent: Vec<&IngestionMetrics> = samples
        .iter()
        .rev()
        .filter(|m| m.sample_kind == SampleKind::Collection)
        .take(window.max(1))
        .collect();

    if !recent.is_empty() {
        let n = recent.len() as f64;
        let error_rate = recent.iter().map(|m| m.error_rate).sum::<f64>() / n;
        let latency = recent.iter().map(|m| m.latency_p95_ms).sum::<f64>() / n;
        let throughput = recent.iter().map(|m| m.throughput_per_second).sum::<f64>() / n;

        if error_rate > thresholds.error_rate {
            issues.push(HealthIssue {
                severity: AlertSeverity::High,
                message: format!("error rate {:.2}% over threshold", error_rate * 100.0),
            });
        }
        if throughput < thresholds.throughput_min {
            issues.push(HealthIssue {
                severity: AlertSeverity::Medium,
                message: format!("low throughput {:.2}/s", throughput),
            });
        }
        if latency > thresholds.latency_ms {
            issues.push(HealthIssue {
                severity: AlertSeverity::Medium,
                message: format!("elevated p95 latency {:.0}ms", latency),
            });
        }
    }

    if latest.queue_size > thresholds.queue_size {
        issues.push(HealthIssue {
            severity: AlertSeverity::High,
            message: format!("queue size {} over threshold", latest.queue_size),
        });
    }
    if latest.memory_usage_percent > thresholds.memory_usage_percent {
        issues.push(HealthIssue {
            severity: AlertSeverity::Critical,
            message: format!("memory usage {:.1}% over threshold", latest.memory_usage_percent),
        });
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MockAlertNotifier;
    use crate::probe::{HostUsage, StaticHostProbe};

    fn service(notifiers: Vec<Arc<dyn AlertNotifier>>) -> MonitoringService {
        MonitoringService::new(MonitoringConfig::default(), notifiers)
            .with_host_probe(Arc::new(StaticHostProbe(HostUsage::default())))
    }

    fn healthy_update() -> MetricsUpdate {
        MetricsUpdate {
            total_records: Some(100),
            processed_records: Some(100),
            throughput_per_second: Some(50.0),
            latency_p95_ms: Some(120.0),
            ..MetricsUpdate::default()
        }
    }

    fn sample(kind: SampleKind, update: MetricsUpdate) -> IngestionMetrics {
        MetricsUpdate {
            sample_kind: kind,
            ..update
        }
        .into_sample("siem")
    }

    #[test]
    fn test_thresholds_one_alert_per_dimension() {
        let thresholds = AlertThresholds::default();
        let breached = sample(
            SampleKind::Collection,
            MetricsUpdate {
                error_rate: Some(0.5),
                latency_p95_ms: Some(9_000.0),
                throughput_per_second: Some(0.1),
                queue_size: Some(5_000),
                memory_usage_percent: Some(95.0),
                ..MetricsUpdate::default()
            },
        );

        let alerts = evaluate_thresholds(&thresholds, &breached);
        let dims: Vec<(&str, AlertSeverity)> =
            alerts.iter().map(|a| (a.metric.as_str(), a.severity)).collect();
        assert_eq!(
            dims,
            vec![
                ("error_rate", AlertSeverity::High),
                ("latency_p95_ms", AlertSeverity::Medium),
                ("throughput_per_second", AlertSeverity::Medium),
                ("queue_size", AlertSeverity::High),
                ("memory_usage_percent", AlertSeverity::Critical),
            ]
        );
        assert!(alerts.iter().all(|a| a.kind == AlertKind::Threshold && !a.resolved));
    }

    #[test]
    fn test_system_samples_skip_throughput_and_latency() {
        let thresholds = AlertThresholds::default();
        let poll = sample(SampleKind::System, MetricsUpdate::default());
        assert!(evaluate_thresholds(&thresholds, &poll).is_empty());
    }

    #[test]
    fn test_health_without_samples_is_unhealthy() {
        let issues = evaluate_health(
            &AlertThresholds::default(),
            &[],
            5,
            Utc::now(),
            Duration::from_secs(60),
        );
        assert_eq!(
            HealthStatus::from_issues("siem", issues).status,
            HealthState::Unhealthy
        );
    }

    #[test]
    fn test_health_degraded_on_low_throughput() {
        let samples = vec![sample(
            SampleKind::Collection,
            MetricsUpdate {
                throughput_per_second: Some(0.2),
                ..MetricsUpdate::default()
            },
        )];
        let issues = evaluate_health(
            &AlertThresholds::default(),
            &samples,
            5,
            Utc::now(),
            Duration::from_secs(60),
        );
        assert_eq!(
            HealthStatus::from_issues("siem", issues).status,
            HealthState::Degraded
        );
    }

    #[test]
    fn test_health_stale_series_is_unhealthy() {
        let samples = vec![sample(
            SampleKind::Collection,
            MetricsUpdate {
                timestamp: Some(Utc::now() - chrono::Duration::minutes(10)),
                ..healthy_update()
            },
        )];
        let issues = evaluate_health(
            &AlertThresholds::default(),
            &samples,
            5,
            Utc::now(),
            Duration::from_secs(60),
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, AlertSeverity::High);
    }

    #[tokio::test]
    async fn test_record_metrics_notifies_raised_alerts() {
        let mut notifier = MockAlertNotifier::new();
        notifier.expect_notify().times(1).returning(|_| Ok(()));
        let notifier: Arc<dyn AlertNotifier> = Arc::new(notifier);
        let service = service(vec![notifier]);

        service
            .record_metrics(
                "siem",
                MetricsUpdate {
                    error_rate: Some(0.9),
                    ..healthy_update()
                },
            )
            .await;

        let alerts = service.get_alerts(Some("siem"), false).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, "error_rate");
    }

    #[tokio::test]
    async fn test_failing_notifier_does_not_block_recording() {
        let mut notifier = MockAlertNotifier::new();
        notifier.expect_notify().returning(|_| {
            Err(resilience_rs::Error::new(
                resilience_rs::ErrorKind::Notification,
                "unreachable",
            ))
        });
        let notifier: Arc<dyn AlertNotifier> = Arc::new(notifier);
        let service = service(vec![notifier]);

        service
            .record_metrics(
                "siem",
                MetricsUpdate {
                    error_rate: Some(0.9),
                    ..healthy_update()
                },
            )
            .await;
        assert_eq!(service.get_metrics("siem", None).await.len(), 1);
        assert_eq!(service.get_alerts(None, false).await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_alert_notifies_resolution() {
        let mut notifier = MockAlertNotifier::new();
        notifier.expect_notify().returning(|_| Ok(()));
        notifier.expect_resolved().times(1).returning(|_| Ok(()));
        let notifier: Arc<dyn AlertNotifier> = Arc::new(notifier);
        let service = service(vec![notifier]);

        service
            .record_metrics(
                "siem",
                MetricsUpdate {
                    queue_size: Some(10_000),
                    ..healthy_update()
                },
            )
            .await;
        let id = service.get_alerts(Some("siem"), false).await[0].id;

        assert!(!service.resolve_alert(id, "edr").await);
        assert!(service.resolve_alert(id, "siem").await);
        assert!(!service.resolve_alert(id, "siem").await);

        assert!(service.get_alerts(Some("siem"), false).await.is_empty());
        let all = service.get_alerts(Some("siem"), true).await;
        assert_eq!(all.len(), 1);
        assert!(all[0].resolved);
        assert!(all[0].resolved_at.is_some());
    }
}
