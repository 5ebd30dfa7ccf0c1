//! Alert delivery.
//!
//! Notifiers are best effort: the service logs a failed delivery and moves on.

use std::time::Duration;

use async_trait::async_trait;
use ingest_types_rs::{Alert, AlertSeverity};
use resilience_rs::{Error, ErrorKind, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Delivers a newly raised alert.
    async fn notify(&self, alert: &Alert) -> Result<()>;

    /// Delivers the resolution of a previously raised alert.
    async fn resolved(&self, _alert: &Alert) -> Result<()> {
        Ok(())
    }
}

/// Writes alerts to the log at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => error!(
                alert_id = %alert.id,
                source = %alert.source_name,
                severity = %alert.severity,
                metric = %alert.metric,
                observed = alert.observed,
                threshold = alert.threshold,
                "ALERT: {}", alert.message
            ),
            _ => warn!(
                alert_id = %alert.id,
                source = %alert.source_name,
                severity = %alert.severity,
                metric = %alert.metric,
                observed = alert.observed,
                threshold = alert.threshold,
                "ALERT: {}", alert.message
            ),
        }
        Ok(())
    }

    async fn resolved(&self, alert: &Alert) -> Result<()> {
        info!(
            alert_id = %alert.id,
            source = %alert.source_name,
            metric = %alert.metric,
            "Alert resolved"
        );
        Ok(())
    }
}

/// Posts alerts as MessageCard payloads to an incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, card: Value, alert: &Alert) -> Result<()> {
        let response = self.client.post(&self.url).json(&card).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::new(
                ErrorKind::Notification,
                format!("webhook returned status {}", status.as_u16()),
            )
            .source_name(&alert.source_name)
            .context("alert_id", alert.id.to_string()));
        }
        Ok(())
    }
}

fn theme_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical | AlertSeverity::High => "FF0000",
        AlertSeverity::Medium | AlertSeverity::Low => "FFA500",
    }
}

pub(crate) fn raised_card(alert: &Alert) -> Value {
    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "themeColor": theme_color(alert.severity),
        "summary": format!("{} alert for {}", alert.severity, alert.source_name),
        "sections": [{
            "activityTitle": format!("{} alert: {}", alert.severity, alert.source_name),
            "activitySubtitle": alert.raised_at.to_rfc3339(),
            "facts": [
                {"name": "Source", "value": alert.source_name},
                {"name": "Severity", "value": alert.severity.to_string()},
                {"name": "Metric", "value": alert.metric},
                {"name": "Observed", "value": format!("{:.3}", alert.observed)},
                {"name": "Threshold", "value": format!("{:.3}", alert.threshold)},
                {"name": "Message", "value": alert.message},
                {"name": "Time", "value": alert.raised_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()},
            ]
        }]
    })
}

pub(crate) fn resolved_card(alert: &Alert) -> Value {
    let resolved_at = alert.resolved_at.unwrap_or(alert.raised_at);
    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "themeColor": "00FF00",
        "summary": format!("{} recovered", alert.source_name),
        "sections": [{
            "activityTitle": format!("Recovered: {}", alert.source_name),
            "activitySubtitle": resolved_at.to_rfc3339(),
            "facts": [
                {"name": "Source", "value": alert.source_name},
                {"name": "Metric", "value": alert.metric},
                {"name": "Status", "value": "RESOLVED"},
                {"name": "Recovery Time", "value": resolved_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()},
            ]
        }]
    })
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.post(raised_card(alert), alert).await
    }

    async fn resolved(&self, alert: &Alert) -> Result<()> {
        self.post(resolved_card(alert), alert).await
    }
}
