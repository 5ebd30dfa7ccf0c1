//! Append-only JSON Lines storage, one file per day.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use ingest_types_rs::{RawRecord, StorageConfig};
use resilience_rs::{Error, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::collaborators::StorageSink;

#[derive(Debug, Clone)]
pub struct JsonlSink {
    output_dir: PathBuf,
    file_prefix: String,
}

impl JsonlSink {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            file_prefix: config.file_prefix.clone(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// File the next batch will be appended to.
    pub fn current_file(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}.jsonl",
            self.file_prefix,
            Utc::now().format("%Y%m%d")
        ))
    }
}

#[async_trait]
impl StorageSink for JsonlSink {
    async fn store(&self, records: &[RawRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.output_dir).await.map_err(|e| {
            Error::storage(format!(
                "failed to create output directory {}",
                self.output_dir.display()
            ))
            .cause(e)
        })?;

        let path = self.current_file();
        let mut buffer = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::storage(format!("failed to open {}", path.display())).cause(e))?;
        file.write_all(&buffer)
            .await
            .map_err(|e| Error::storage(format!("failed to write {}", path.display())).cause(e))?;
        file.flush()
            .await
            .map_err(|e| Error::storage(format!("failed to flush {}", path.display())).cause(e))?;

        debug!(path = %path.display(), records = records.len(), "Stored batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(&StorageConfig {
            output_dir: dir.path().join("nested"),
            file_prefix: "alerts".to_string(),
        });

        sink.store(&[json!({"id": 1}), json!({"id": 2})]).await.unwrap();
        sink.store(&[json!({"id": 3})]).await.unwrap();
        sink.store(&[]).await.unwrap();

        let content = tokio::fs::read_to_string(sink.current_file()).await.unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
        assert!(sink
            .current_file()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("alerts_"));
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let sink = JsonlSink::new(&StorageConfig {
            output_dir: blocker.join("sub"),
            file_prefix: "records".to_string(),
        });
        let err = sink.store(&[json!({"id": 1})]).await.unwrap_err();
        assert_eq!(err.kind, resilience_rs::ErrorKind::Storage);
    }
}
