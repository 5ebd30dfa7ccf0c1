//! # Monitoring
//!
//! Per-source ingestion metrics, health derivation and threshold alerting.

pub mod notifier;
pub mod probe;
pub mod service;

pub use notifier::{AlertNotifier, LogNotifier, WebhookNotifier};
pub use probe::{HostProbe, HostUsage, SourceProbe, StaticHostProbe, SystemProbe};
pub use service::{
    evaluate_health, evaluate_thresholds, MonitoringService, MonitoringSummary, SourceSummary,
};
