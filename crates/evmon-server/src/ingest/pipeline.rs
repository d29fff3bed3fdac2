//! Log file ingestion pipeline
//!
//! Each log file is folded through `fetch → extractors → transformers →
//! loaders`. A batch is first filtered against the ingestion ledger, then
//! the remaining files run concurrently, at most `max_concurrent_files` at a
//! time. Once all of them settle, exactly the successful ones are
//! acknowledged.

use evmon_common::types::EventLogFile;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;

use super::ledger::IngestionLedger;
use super::steps::{PipelineStep, StepCategory, StepData, StepError, StepRegistry};
use crate::config::{PollingConfig, DEFAULT_MAX_CONCURRENT_FILES};
use crate::db::DbError;

/// One log file that did not make it through the pipeline
#[derive(Error, Debug)]
#[error("Log file {} failed at step '{step}': {source}", .file.id)]
pub struct DescriptorFailure {
    pub file: EventLogFile,
    pub step: String,
    pub source: StepError,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Ingestion ledger unavailable: {0}")]
    Ledger(#[from] DbError),

    #[error("{} of {total} log files failed{}", .failures.len(), ack_note(.ack_error))]
    Failed {
        total: usize,
        /// Files that succeeded and were acknowledged anyway
        acked: Vec<EventLogFile>,
        failures: Vec<DescriptorFailure>,
        /// Set when acknowledging the successful files failed as well
        ack_error: Option<DbError>,
    },
}

fn ack_note(ack_error: &Option<DbError>) -> String {
    match ack_error {
        Some(e) => format!("; acknowledging the rest failed: {}", e),
        None => String::new(),
    }
}

/// Outcome of a fully successful batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub received: usize,
    pub already_ingested: usize,
    pub acked: Vec<EventLogFile>,
}

pub struct LogPipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    ledger: Arc<IngestionLedger>,
    max_concurrent_files: usize,
}

impl LogPipeline {
    pub fn new(steps: Vec<Arc<dyn PipelineStep>>, ledger: Arc<IngestionLedger>) -> Self {
        Self {
            steps,
            ledger,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
        }
    }

    /// Bound the number of log files processed at once; zero is treated as one
    pub fn with_max_concurrent_files(mut self, limit: usize) -> Self {
        self.max_concurrent_files = limit.max(1);
        self
    }

    /// Assemble `fetch` followed by the configured steps of each category
    pub fn from_config(
        fetch: Arc<dyn PipelineStep>,
        registry: &StepRegistry,
        config: &PollingConfig,
        ledger: Arc<IngestionLedger>,
    ) -> Self {
        let mut steps = vec![fetch];
        for category in StepCategory::ORDER {
            let names = match category {
                StepCategory::Extractor => &config.extractors,
                StepCategory::Transformer => &config.transformers,
                StepCategory::Loader => &config.loaders,
            };
            steps.extend(registry.resolve(category, names));
        }

        let pipeline = Self::new(steps, ledger).with_max_concurrent_files(config.max_concurrent_files);
        tracing::info!(
            steps = ?pipeline.step_names(),
            max_concurrent_files = pipeline.max_concurrent_files,
            "Log pipeline assembled"
        );
        pipeline
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Run every step for one log file, stopping at the first failure
    #[tracing::instrument(skip_all, fields(id = %file.id, event_type = %file.event_type))]
    pub async fn handle_log(&self, file: EventLogFile) -> Result<EventLogFile, DescriptorFailure> {
        let mut data = StepData::Descriptor;

        for step in &self.steps {
            match step.run(&file, data).await {
                Ok(next) => data = next,
                Err(source) => {
                    return Err(DescriptorFailure {
                        step: step.name().to_string(),
                        file,
                        source,
                    })
                }
            }
        }

        Ok(file)
    }

    /// Ingest a batch, acknowledging the files that succeeded
    pub async fn handle_logs(&self, files: Vec<EventLogFile>) -> Result<BatchReport, PipelineError> {
        if files.is_empty() {
            return Ok(BatchReport::default());
        }

        let received = files.len();
        let fresh = self.ledger.filter(files).await?;
        let already_ingested = received - fresh.len();

        if fresh.is_empty() {
            tracing::debug!(received, "Every log file was already ingested");
            return Ok(BatchReport {
                received,
                already_ingested,
                acked: Vec::new(),
            });
        }

        let results: Vec<_> = stream::iter(fresh)
            .map(|file| self.handle_log(file))
            .buffer_unordered(self.max_concurrent_files)
            .collect()
            .await;

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(file) => succeeded.push(file),
                Err(failure) => {
                    tracing::warn!(error = %failure, "Log file ingestion failed");
                    failures.push(failure);
                }
            }
        }

        let total = succeeded.len() + failures.len();
        let acked = match self.ledger.ack(succeeded).await {
            Ok(acked) => acked,
            Err(e) if failures.is_empty() => return Err(PipelineError::Ledger(e)),
            Err(e) => {
                tracing::error!(error = %e, "Acknowledging log files failed");
                return Err(PipelineError::Failed {
                    total,
                    acked: Vec::new(),
                    failures,
                    ack_error: Some(e),
                });
            }
        };

        if !failures.is_empty() {
            return Err(PipelineError::Failed {
                total,
                acked,
                failures,
                ack_error: None,
            });
        }

        Ok(BatchReport {
            received,
            already_ingested,
            acked,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::MemoryDocumentStore;
    use crate::ingest::default_registry;
    use crate::ingest::extract::FetchStep;
    use crate::ingest::test_support::{descriptor, FakeApi};
    use crate::sfdc::EventLogApi;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const LOG: &str = "\"EventIdentifier\",\"RUN_TIME\"\n\"e1\",\"12\"\n\"e2\",\"7\"\n";

    struct Harness {
        store: Arc<MemoryDocumentStore>,
        api: Arc<FakeApi>,
        pipeline: LogPipeline,
    }

    fn harness(api: FakeApi) -> Harness {
        let store = Arc::new(MemoryDocumentStore::new());
        let api = Arc::new(api);
        let config = PollingConfig::default();
        let ledger = Arc::new(IngestionLedger::new(store.clone(), "event_log_files"));
        let registry = default_registry(api.clone(), store.clone(), config.flat_file.clone());
        let fetch: Arc<dyn PipelineStep> = Arc::new(FetchStep::new(api.clone() as Arc<dyn EventLogApi>));

        Harness {
            pipeline: LogPipeline::from_config(fetch, &registry, &config, ledger),
            store,
            api,
        }
    }

    fn good(id: &str) -> EventLogFile {
        descriptor(id, "API", "EventIdentifier,RUN_TIME", "Id,Number")
    }

    #[test]
    fn test_from_config_orders_steps() {
        let mut config = PollingConfig::default();
        config.loaders = vec!["unknown".into(), "mongodb".into(), "flatFile".into()];

        let store = Arc::new(MemoryDocumentStore::new());
        let api = Arc::new(FakeApi::default());
        let registry = default_registry(api.clone(), store.clone(), config.flat_file.clone());
        let pipeline = LogPipeline::from_config(
            Arc::new(FetchStep::new(api)),
            &registry,
            &config,
            Arc::new(IngestionLedger::new(store, "event_log_files")),
        );

        assert_eq!(
            pipeline.step_names(),
            vec!["fetch", "toJson", "typeMap", "documentStore", "flatFile"]
        );
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let h = harness(FakeApi::default());

        let report = h.pipeline.handle_logs(Vec::new()).await.unwrap();

        assert_eq!(report.received, 0);
        assert!(report.acked.is_empty());
        assert_eq!(h.store.operations(), 0);
    }

    #[tokio::test]
    async fn test_all_success_acks_every_file() {
        let files = vec![good("1"), good("2"), good("3")];
        let api = FakeApi::default();
        for file in &files {
            api.add_log(file, LOG);
        }
        let h = harness(api);

        let report = h.pipeline.handle_logs(files).await.unwrap();

        assert_eq!(report.acked.len(), 3);
        assert_eq!(h.store.documents("event_log_files").len(), 3);

        let loaded = h.store.get("API", "e1").unwrap();
        assert_eq!(loaded.body["RUN_TIME"], 12.0);
    }

    #[tokio::test]
    async fn test_mixed_batch_acks_only_successes() {
        let ok = good("ok");
        let missing = good("missing");
        let forced = descriptor("forced", "API", "EventIdentifier,RUN_TIME", "Id,Error");

        let api = FakeApi::default();
        api.add_log(&ok, LOG);
        api.add_log(&forced, LOG);
        let h = harness(api);

        let err = h
            .pipeline
            .handle_logs(vec![ok, missing, forced])
            .await
            .unwrap_err();

        match err {
            PipelineError::Failed { acked, failures, .. } => {
                assert_eq!(acked.len(), 1);
                assert_eq!(acked[0].id, "ok");

                let mut failed: Vec<_> = failures
                    .iter()
                    .map(|f| (f.file.id.as_str(), f.step.as_str()))
                    .collect();
                failed.sort();
                assert_eq!(failed, vec![("forced", "typeMap"), ("missing", "fetch")]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let ledger: Vec<_> = h
            .store
            .documents("event_log_files")
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ledger, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_failures_only_acks_nothing() {
        let h = harness(FakeApi::default());

        let err = h.pipeline.handle_logs(vec![good("gone")]).await.unwrap_err();

        assert!(matches!(err, PipelineError::Failed { ref acked, .. } if acked.is_empty()));
        assert_eq!(err.to_string(), "1 of 1 log files failed");
        assert!(h.store.documents("event_log_files").is_empty());
    }

    #[tokio::test]
    async fn test_already_ingested_files_are_skipped() {
        let first = good("1");
        let second = good("2");
        let api = FakeApi::default();
        api.add_log(&first, LOG);
        api.add_log(&second, LOG);
        let h = harness(api);

        h.pipeline.handle_logs(vec![first.clone()]).await.unwrap();
        let report = h.pipeline.handle_logs(vec![first, second]).await.unwrap();

        assert_eq!(report.already_ingested, 1);
        assert_eq!(report.acked.len(), 1);
        assert_eq!(report.acked[0].id, "2");
        assert_eq!(h.api.fetches(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_fails_load_step() {
        let api = FakeApi::default();
        let file = good("1");
        api.add_log(&file, LOG);
        let h = harness(api);
        h.store.fail_writes(true);

        let err = h.pipeline.handle_logs(vec![file]).await.unwrap_err();

        assert!(matches!(err, PipelineError::Failed { ref failures, .. } if failures[0].step == "documentStore"));
    }

    #[tokio::test]
    async fn test_ledger_read_failure_propagates() {
        let api = FakeApi::default();
        let file = good("1");
        api.add_log(&file, LOG);
        let h = harness(api);
        h.store.fail_reads(true);

        let err = h.pipeline.handle_logs(vec![file]).await.unwrap_err();

        assert!(matches!(err, PipelineError::Ledger(DbError::Unavailable(_))));
        assert_eq!(h.api.fetches(), 0);
        assert!(h.store.documents("API").is_empty());
    }

    #[tokio::test]
    async fn test_ack_failure_keeps_descriptor_failures() {
        let ok = good("ok");
        let missing = good("missing");
        let api = FakeApi::default();
        api.add_log(&ok, LOG);
        let h = harness(api);
        h.store.fail_writes_to("event_log_files");

        let err = h.pipeline.handle_logs(vec![ok, missing]).await.unwrap_err();

        assert!(err.to_string().starts_with("1 of 2 log files failed; acknowledging the rest failed"));
        match err {
            PipelineError::Failed { acked, failures, ack_error, .. } => {
                assert!(acked.is_empty());
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].file.id, "missing");
                assert_eq!(failures[0].step, "fetch");
                assert!(matches!(ack_error, Some(DbError::Unavailable(_))));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.store.documents("event_log_files").is_empty());
        assert!(h.store.get("API", "e1").is_some());
    }

    #[tokio::test]
    async fn test_ack_failure_alone_is_a_ledger_error() {
        let file = good("1");
        let api = FakeApi::default();
        api.add_log(&file, LOG);
        let h = harness(api);
        h.store.fail_writes_to("event_log_files");

        let err = h.pipeline.handle_logs(vec![file]).await.unwrap_err();

        assert!(matches!(err, PipelineError::Ledger(DbError::Unavailable(_))));
    }

    /// Records the highest number of files inside `run` at once
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl PipelineStep for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn run(&self, _file: &EventLogFile, input: StepData) -> Result<StepData, StepError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(input)
        }
    }

    #[tokio::test]
    async fn test_batch_concurrency_is_bounded() {
        let store = Arc::new(MemoryDocumentStore::new());
        let gauge = Arc::new(Gauge::default());
        let pipeline = LogPipeline::new(
            vec![gauge.clone() as Arc<dyn PipelineStep>],
            Arc::new(IngestionLedger::new(store.clone(), "event_log_files")),
        )
        .with_max_concurrent_files(2);

        let files: Vec<_> = (0..6).map(|i| good(&i.to_string())).collect();
        let report = pipeline.handle_logs(files).await.unwrap();

        assert_eq!(report.acked.len(), 6);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(store.documents("event_log_files").len(), 6);
    }

    #[test]
    fn test_zero_concurrency_limit_is_raised_to_one() {
        let store = Arc::new(MemoryDocumentStore::new());
        let pipeline = LogPipeline::new(Vec::new(), Arc::new(IngestionLedger::new(store, "event_log_files")))
            .with_max_concurrent_files(0);

        assert_eq!(pipeline.max_concurrent_files, 1);
    }
}
