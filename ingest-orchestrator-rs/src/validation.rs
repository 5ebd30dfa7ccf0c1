//! Structural record validation.

use async_trait::async_trait;
use ingest_types_rs::RawRecord;
use resilience_rs::Result;
use tracing::debug;

use crate::collaborators::{ValidationOutcome, Validator};

/// Individual rejection messages kept per call; the rest are only counted.
const MAX_REPORTED_ERRORS: usize = 20;

/// Accepts JSON objects carrying every required field with a non-null value.
#[derive(Debug, Clone, Default)]
pub struct RequiredFieldsValidator {
    required: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }

    fn check(&self, record: &RawRecord) -> std::result::Result<(), String> {
        let Some(object) = record.as_object() else {
            return Err("not a JSON object".to_string());
        };
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, |v| v.is_null()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing field(s) {}", missing.join(", ")))
        }
    }
}

#[async_trait]
impl Validator for RequiredFieldsValidator {
    async fn validate(&self, records: &[RawRecord], source_name: &str) -> Result<ValidationOutcome> {
        let mut outcome = ValidationOutcome::default();

        for (index, record) in records.iter().enumerate() {
            match self.check(record) {
                Ok(()) => outcome.accepted.push(record.clone()),
                Err(reason) => {
                    outcome.rejected_count += 1;
                    if outcome.errors.len() < MAX_REPORTED_ERRORS {
                        outcome.errors.push(format!("record {}: {}", index, reason));
                    }
                }
            }
        }
        outcome.accepted_count = outcome.accepted.len();

        if outcome.rejected_count > outcome.errors.len() {
            outcome.warnings.push(format!(
                "{} further rejected records not itemized",
                outcome.rejected_count - outcome.errors.len()
            ));
        }

        debug!(
            source = %source_name,
            accepted = outcome.accepted_count,
            rejected = outcome.rejected_count,
            "Validated records"
        );
        Ok(outcome)
    }
}
