//! # Error Types
//!
//! The structured error shared by the resilience engine, the monitoring
//! service and every pipeline collaborator.

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How far the damage of an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Severity {
    /// Informational, nothing failed
    Info,
    /// Affects a single record or call
    Minor,
    /// Affects a source or a stage
    #[default]
    Major,
    /// Affects the whole run
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Minor => write!(f, "MINOR"),
            Severity::Major => write!(f, "MAJOR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid or missing configuration
    Configuration,
    /// A source connector call failed
    Connector,
    /// An operation exceeded its time budget
    Timeout,
    /// The source's circuit breaker rejected the call
    CircuitOpen,
    /// Record validation failed as a whole
    Validation,
    /// Deduplication failed as a whole
    Deduplication,
    /// Persisting records failed
    Storage,
    /// Delivering an alert failed
    Notification,
    /// Input/output error
    Io,
    /// Encoding or decoding failed
    Serialization,
    /// Internal invariant violated
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Connector => write!(f, "Connector Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::CircuitOpen => write!(f, "Circuit Open"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::Deduplication => write!(f, "Deduplication Error"),
            ErrorKind::Storage => write!(f, "Storage Error"),
            ErrorKind::Notification => write!(f, "Notification Error"),
            ErrorKind::Io => write!(f, "I/O Error"),
            ErrorKind::Serialization => write!(f, "Serialization Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Core error type of the ingestion pipeline
///
/// `Clone` is implemented by hand: clones keep the structured metadata but
/// drop the opaque `cause` and `backtrace`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    /// The data source the error is attributed to
    pub source_name: Option<String>,
    /// Structured details, e.g. `status` for HTTP failures
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
    #[serde(skip)]
    pub backtrace: Option<Backtrace>,
    /// Whether the operation might succeed if attempted again
    pub transient: bool,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind.clone(),
            message: self.message.clone(),
            timestamp: self.timestamp,
            severity: self.severity,
            source_name: self.source_name.clone(),
            context: self.context.clone(),
            cause: None,
            backtrace: None,
            transient: self.transient,
        }
    }
}

impl Error {
    /// New error of `kind`. Severity defaults to `Major`.
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            severity: Severity::default(),
            source_name: None,
            context: serde_json::Map::new(),
            cause: None,
            backtrace: Some(Backtrace::capture()),
            transient: false,
        }
    }

    pub fn connector<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Connector, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Timeout, message).transient()
    }

    pub fn circuit_open<S: Into<String>>(source_name: S) -> Self {
        Self::new(ErrorKind::CircuitOpen, "circuit open")
            .source_name(source_name)
            .severity(Severity::Minor)
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Storage, message).severity(Severity::Critical)
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn source_name<S: Into<String>>(mut self, source_name: S) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    /// Values that fail to serialize are ignored.
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Marks the error as worth retrying.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)?;

        if let Some(source_name) = &self.source_name {
            write!(f, " [Source: {}]", source_name)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string()).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, format!("JSON error: {}", err)).cause(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Connector
        };

        let transient = err.is_timeout()
            || err.is_connect()
            || err.status().map_or(false, |s| s.is_server_error());

        let mut error = Self::new(kind, format!("HTTP request error: {}", err));
        if let Some(status) = err.status() {
            error = error.context("status", status.as_u16());
        }
        error = error.cause(err);
        if transient {
            error = error.transient();
        }
        error
    }
}

impl From<ingest_types_rs::ConfigError> for Error {
    fn from(err: ingest_types_rs::ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, err.to_string())
            .severity(Severity::Critical)
            .cause(err)
    }
}
