//! Recurring log file polling
//!
//! One job per event type. Each run queries the remote system for log files
//! of that type and interval, then hands them to the shared pipeline.

use async_trait::async_trait;
use evmon_common::types::EventLogFile;
use evmon_common::CommonError;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use super::pipeline::{BatchReport, LogPipeline, PipelineError};
use crate::scheduler::{Job, JobContext};
use crate::sfdc::{EventLogApi, SfdcError};

pub const JOB_NAME_PREFIX: &str = "Polling";

/// Descriptor fields selected from `EventLogFile`
pub const QUERY_FIELDS: &[&str] = &[
    "Id",
    "CreatedDate",
    "EventType",
    "LogDate",
    "LogFile",
    "LogFileLength",
    "LogFileContentType",
    "LogFileFieldNames",
    "LogFileFieldTypes",
];

/// Transport-only member of every query record
const ENVELOPE_FIELD: &str = "attributes";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Authentication failed: {0}")]
    Auth(#[source] SfdcError),

    #[error("Log file query failed: {0}")]
    Query(#[source] SfdcError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub fn job_name(event_type: &str) -> String {
    format!("{} - {}", JOB_NAME_PREFIX, event_type)
}

pub fn query_fields() -> String {
    QUERY_FIELDS.join(",")
}

pub fn where_condition(event_type: &str, interval: &str) -> String {
    format!("EventType = '{}' AND Interval = '{}'", event_type, interval)
}

pub fn query_string(event_type: &str, interval: &str) -> String {
    format!(
        "select {} from EventLogFile where {}",
        query_fields(),
        where_condition(event_type, interval)
    )
}

/// Decode a query record into a descriptor, dropping its `attributes` envelope
pub fn decode_record(mut record: Map<String, Value>) -> Result<EventLogFile, CommonError> {
    record.remove(ENVELOPE_FIELD);
    EventLogFile::from_record(record)
}

pub struct PollingJob {
    name: String,
    event_type: String,
    interval: String,
    api: Arc<dyn EventLogApi>,
    pipeline: Arc<LogPipeline>,
}

impl PollingJob {
    pub fn new(
        event_type: impl Into<String>,
        interval: impl Into<String>,
        api: Arc<dyn EventLogApi>,
        pipeline: Arc<LogPipeline>,
    ) -> Self {
        let event_type = event_type.into();
        Self {
            name: job_name(&event_type),
            event_type,
            interval: interval.into(),
            api,
            pipeline,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// One polling pass. Malformed records are reported on `ctx` and skipped;
    /// the rest of the batch is still ingested.
    pub async fn poll(&self, ctx: &JobContext) -> Result<BatchReport, JobError> {
        self.api.ensure_authenticated().await.map_err(JobError::Auth)?;

        let soql = query_string(&self.event_type, &self.interval);
        let records = self.api.query(&soql).await.map_err(JobError::Query)?;

        let mut files = Vec::with_capacity(records.len());
        for record in records {
            let id = record.get("Id").and_then(Value::as_str).unwrap_or("<unknown>").to_string();
            match decode_record(record) {
                Ok(file) => files.push(file),
                Err(e) => {
                    tracing::warn!(
                        event_type = %self.event_type,
                        id = %id,
                        error = %e,
                        "Skipping malformed log file record"
                    );
                    ctx.fail(&format!("Malformed log file record {}: {}", id, e));
                }
            }
        }

        tracing::info!(
            event_type = %self.event_type,
            files = files.len(),
            "Polled event log files"
        );
        ctx.touch();

        let report = self.pipeline.handle_logs(files).await?;
        ctx.touch();

        Ok(report)
    }
}

#[async_trait]
impl Job for PollingJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        let report = self.poll(&ctx).await?;

        tracing::info!(
            event_type = %self.event_type,
            received = report.received,
            already_ingested = report.already_ingested,
            acked = report.acked.len(),
            "Polling run complete"
        );

        Ok(())
    }
}
