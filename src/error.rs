use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Conditions that stop processing of one service date.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No {input} input for service date {service_date}")]
    InputAbsent {
        service_date: NaiveDate,
        input: &'static str,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl PipelineError {
    /// Short machine-readable kind, recorded in the runs log.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InputAbsent { .. } => "input_absent",
            PipelineError::InvalidConfig(_) => "invalid_config",
            PipelineError::Io(_) => "io_error",
            PipelineError::Csv(_) => "csv_error",
            PipelineError::Json(_) => "json_error",
            PipelineError::Decode(_) => "decode_error",
        }
    }
}

/// Non-fatal findings attached to a service date's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    RowCountMismatch {
        expected: usize,
        actual: usize,
    },
    ValidationFailure {
        stage: String,
        rejected: usize,
        causes: BTreeMap<String, usize>,
    },
}
