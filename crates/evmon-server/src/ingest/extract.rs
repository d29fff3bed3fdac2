//! Fetch and extraction steps

use async_trait::async_trait;
use evmon_common::types::{EventLogFile, RawEventRecord};
use std::sync::Arc;

use super::steps::{PipelineStep, StepData, StepError};
use crate::sfdc::EventLogApi;

/// Downloads the raw log file. Always the first step of a pipeline.
pub struct FetchStep {
    api: Arc<dyn EventLogApi>,
}

impl FetchStep {
    pub const NAME: &'static str = "fetch";

    pub fn new(api: Arc<dyn EventLogApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PipelineStep for FetchStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, file: &EventLogFile, _input: StepData) -> Result<StepData, StepError> {
        let content = self.api.fetch_log_file(file).await?;
        Ok(StepData::Raw(content))
    }
}

/// Parses CSV content with a header row into one record per line
pub struct CsvExtractor;

impl CsvExtractor {
    pub const NAME: &'static str = "toJson";
}

/// Parse CSV text with a header row
pub fn parse_csv(content: &str) -> Result<Vec<RawEventRecord>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();

    reader
        .records()
        .map(|row| {
            let row = row?;
            Ok(headers
                .iter()
                .zip(row.iter())
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect())
        })
        .collect()
}

#[async_trait]
impl PipelineStep for CsvExtractor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, file: &EventLogFile, input: StepData) -> Result<StepData, StepError> {
        let content = match input {
            StepData::Raw(content) => content,
            other => return Err(StepError::unexpected_input(Self::NAME, "raw", &other)),
        };

        let rows = parse_csv(&content)?;
        tracing::debug!(id = %file.id, rows = rows.len(), "Extracted log rows");

        Ok(StepData::Rows(rows))
    }
}
