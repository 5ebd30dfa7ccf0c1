//! Generic HTTP/JSON source connector.
//!
//! Issues `GET {endpoint}?earliest=..&latest=..&limit=..&types=..` and reads
//! the record array from the response body (optionally at a JSON pointer).
//! Records whose timestamp field falls outside the query window are dropped;
//! records without a parseable timestamp are kept.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_types_rs::{RawRecord, SourceConfig, SourceKind, SourceQuery};
use resilience_rs::{Error, ErrorKind, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::collaborators::SourceConnector;

#[derive(Debug, Clone)]
pub struct HttpJsonConnector {
    config: SourceConfig,
    client: reqwest::Client,
}

impl HttpJsonConnector {
    pub fn new(config: SourceConfig, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::new(ErrorKind::Configuration, format!("invalid header name '{}': {}", name, e))
                    .source_name(&config.name)
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                Error::new(ErrorKind::Configuration, format!("invalid header value: {}", e))
                    .source_name(&config.name)
            })?;
            headers.insert(name, value);
        }

        if let Some(var) = &config.api_token_env {
            let token = std::env::var(var).map_err(|_| {
                Error::new(
                    ErrorKind::Configuration,
                    format!("environment variable {} is not set", var),
                )
                .source_name(&config.name)
            })?;
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
                Error::new(ErrorKind::Configuration, format!("invalid api token: {}", e))
                    .source_name(&config.name)
            })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { config, client })
    }

    fn extract(&self, body: serde_json::Value) -> Result<Vec<RawRecord>> {
        let located = match &self.config.records_pointer {
            Some(pointer) => body.pointer(pointer).cloned().ok_or_else(|| {
                Error::new(
                    ErrorKind::Serialization,
                    format!("response has no value at {}", pointer),
                )
                .source_name(&self.config.name)
            })?,
            None => body,
        };

        match located {
            serde_json::Value::Array(records) => Ok(records),
            other => Err(Error::new(
                ErrorKind::Serialization,
                format!("expected a record array, got {}", json_type(&other)),
            )
            .source_name(&self.config.name)),
        }
    }

    fn in_window(&self, record: &RawRecord, query: &SourceQuery) -> bool {
        record
            .get(&self.config.timestamp_field)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or(true, |at| query.window.contains(at.with_timezone(&Utc)))
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[async_trait]
impl SourceConnector for HttpJsonConnector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> SourceKind {
        self.config.kind
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>> {
        let mut params = vec![
            ("earliest", query.window.earliest.to_rfc3339()),
            ("latest", query.window.latest.to_rfc3339()),
            ("limit", query.result_limit.to_string()),
        ];
        if !query.record_types.is_empty() {
            params.push(("types", query.record_types.join(",")));
        }
        for filter in &query.source_filters {
            params.push(("filter", filter.clone()));
        }

        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::from(e).source_name(&self.config.name))?
            .error_for_status()
            .map_err(|e| Error::from(e).source_name(&self.config.name))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::from(e).source_name(&self.config.name))?;

        let mut records: Vec<RawRecord> = self
            .extract(body)?
            .into_iter()
            .filter(|r| self.in_window(r, query))
            .collect();
        records.truncate(query.result_limit);

        debug!(source = %self.config.name, records = records.len(), "Fetched records");
        Ok(records)
    }

    async fn test_connection(&self) -> Result<bool> {
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[("limit", "1")])
            .send()
            .await
            .map_err(|e| Error::from(e).source_name(&self.config.name))?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(endpoint: String) -> SourceConfig {
        SourceConfig {
            name: "siem".to_string(),
            kind: SourceKind::Siem,
            endpoint,
            enabled: true,
            records_pointer: Some("/results".to_string()),
            timestamp_field: "timestamp".to_string(),
            api_token_env: None,
            headers: [("X-Tenant".to_string(), "blue".to_string())].into_iter().collect(),
        }
    }

    fn query() -> SourceQuery {
        SourceQuery::lookback("1h", vec!["alert".to_string()], 10).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_reads_pointer_and_filters_window() {
        let server = MockServer::start().await;
        let inside = Utc::now() - chrono::Duration::minutes(5);
        let outside = Utc::now() - chrono::Duration::hours(3);

        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("types", "alert"))
            .and(query_param("limit", "10"))
            .and(header("X-Tenant", "blue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"id": 1, "timestamp": inside.to_rfc3339()},
                    {"id": 2, "timestamp": outside.to_rfc3339()},
                    {"id": 3}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let connector =
            HttpJsonConnector::new(source(format!("{}/search", server.uri())), Duration::from_secs(5)).unwrap();
        let records = connector.fetch(&query()).await.unwrap();

        let ids: Vec<_> = records.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let connector = HttpJsonConnector::new(source(server.uri()), Duration::from_secs(5)).unwrap();
        let err = connector.fetch(&query()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.source_name.as_deref(), Some("siem"));

        assert!(!connector.test_connection().await.unwrap());
    }

    #[tokio::test]
    async fn test_non_array_payload_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": {"id": 1}})))
            .mount(&server)
            .await;

        let connector = HttpJsonConnector::new(source(server.uri()), Duration::from_secs(5)).unwrap();
        let err = connector.fetch(&query()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[test]
    fn test_missing_token_variable_is_a_configuration_error() {
        let mut config = source("http://localhost".to_string());
        config.api_token_env = Some("INGEST_TEST_TOKEN_THAT_IS_NOT_SET".to_string());
        let err = HttpJsonConnector::new(config, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
