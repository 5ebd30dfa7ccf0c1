//! Shared types for the telemetry ingestion pipeline.
//!
//! `model` holds the values that flow between the resilience engine, the
//! monitoring service and the orchestrator. `config` holds the configuration
//! surface and its loader.

pub mod config;
pub mod model;

pub use config::{
    AlertThresholds, ConfigError, IngestConfig, LoggingSettings, MonitoringConfig, PipelineConfig,
    ResilienceConfig, SourceConfig, StorageConfig, PIPELINE_SOURCE,
};
pub use model::*;
