//! # Ingestion Orchestrator
//!
//! Runs collection from every configured security source through the
//! resilience engine, then validates, deduplicates and stores the records and
//! reports run metrics to the monitoring service.

pub mod collaborators;
pub mod connector;
pub mod dedup;
pub mod orchestrator;
pub mod probe;
pub mod sink;
pub mod validation;
pub mod watermark;

pub use collaborators::{
    DedupOutcome, Deduplicator, SourceConnector, StorageSink, ValidationOutcome, Validator,
};
pub use connector::HttpJsonConnector;
pub use dedup::FingerprintDeduplicator;
pub use orchestrator::{ConnectorCheck, OverallHealth, PipelineHealth, PipelineOrchestrator};
pub use probe::EngineProbe;
pub use sink::JsonlSink;
pub use validation::RequiredFieldsValidator;
pub use watermark::Watermarks;
