//! Loader steps
//!
//! Loaders hand their input through unchanged so several can run in a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evmon_common::types::{EventLogFile, EventRecord, FieldValue};
use evmon_common::CommonError;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use super::steps::{PipelineStep, StepData, StepError};
use crate::config::FlatFileConfig;
use crate::db::{Document, DocumentStore};
use crate::sfdc::EventLogApi;

/// Record field used as document identity
pub const IDENTITY_FIELD: &str = "EventIdentifier";

/// Placeholder replaced by the event type in flat file templates
pub const TYPE_PLACEHOLDER: &str = "{type}";

/// Inserts records into a collection named after the event type
pub struct DocumentStoreLoader {
    store: Arc<dyn DocumentStore>,
}

impl DocumentStoreLoader {
    pub const NAME: &'static str = "documentStore";

    /// Accepted for configurations written against the old store
    pub const ALIAS: &'static str = "mongodb";

    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn to_document(record: &EventRecord) -> Result<Document, StepError> {
        let identity = record
            .get(IDENTITY_FIELD)
            .and_then(FieldValue::as_text)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let body = serde_json::to_value(record).map_err(crate::db::DbError::from)?;

        Ok(Document::with_identity(identity, body))
    }
}

#[async_trait]
impl PipelineStep for DocumentStoreLoader {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, file: &EventLogFile, input: StepData) -> Result<StepData, StepError> {
        let records = match input {
            StepData::Records(records) => records,
            StepData::Rows(rows) => rows
                .into_iter()
                .map(|row| row.into_iter().map(|(k, v)| (k, FieldValue::Text(v))).collect())
                .collect(),
            other => return Err(StepError::unexpected_input(Self::NAME, "records", &other)),
        };

        let documents = records
            .iter()
            .map(Self::to_document)
            .collect::<Result<Vec<_>, _>>()?;
        let requested = documents.len();

        let inserted = self.store.insert_many(&file.event_type, documents).await?;

        tracing::info!(
            id = %file.id,
            collection = %file.event_type,
            requested,
            inserted,
            "Loaded log records"
        );

        Ok(StepData::Records(records))
    }
}

/// Writes the raw log file to a date based path on disk
pub struct FlatFileLoader {
    api: Arc<dyn EventLogApi>,
    config: FlatFileConfig,
}

impl FlatFileLoader {
    pub const NAME: &'static str = "flatFile";

    pub fn new(api: Arc<dyn EventLogApi>, config: FlatFileConfig) -> Self {
        Self { api, config }
    }

    /// `<root>/<directory>/<file>.<extension>` for this log file
    pub fn path_for(&self, file: &EventLogFile) -> Result<PathBuf, StepError> {
        let ts = file.log_timestamp().ok_or_else(|| {
            CommonError::invalid_descriptor(&file.id, "LogDate is missing or not a timestamp")
        })?;

        let directory = render_template(&self.config.directory, ts, &file.event_type)?;
        let name = render_template(&self.config.file, ts, &file.event_type)?;

        Ok(self
            .config
            .root
            .join(directory)
            .join(format!("{}.{}", name, self.config.extension)))
    }
}

fn render_template(template: &str, ts: DateTime<Utc>, event_type: &str) -> Result<String, StepError> {
    let mut rendered = String::new();
    write!(rendered, "{}", ts.format(template))
        .map_err(|_| StepError::Template(template.to_string()))?;
    Ok(rendered.replace(TYPE_PLACEHOLDER, event_type))
}

#[async_trait]
impl PipelineStep for FlatFileLoader {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, file: &EventLogFile, input: StepData) -> Result<StepData, StepError> {
        let path = self.path_for(file)?;
        let content = self.api.fetch_log_file(file).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content.as_bytes()).await?;

        tracing::info!(id = %file.id, path = %path.display(), bytes = content.len(), "Wrote log file");

        Ok(input)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::MemoryDocumentStore;
    use crate::sfdc::{Result as SfdcResult, SfdcError};
    use serde_json::{json, Map, Value};

    struct StaticLog(&'static str);

    #[async_trait]
    impl EventLogApi for StaticLog {
        async fn ensure_authenticated(&self) -> SfdcResult<()> {
            Ok(())
        }

        async fn query(&self, _soql: &str) -> SfdcResult<Vec<Map<String, Value>>> {
            Err(SfdcError::MalformedResponse("not used".into()))
        }

        async fn fetch_log_file(&self, _file: &EventLogFile) -> SfdcResult<String> {
            Ok(self.0.to_string())
        }
    }

    fn descriptor(log_date: Option<&str>) -> EventLogFile {
        let mut record = json!({
            "Id": "0AT1",
            "EventType": "Login",
            "LogFile": "/LogFile",
            "LogFileFieldNames": "EventIdentifier,USER_ID",
            "LogFileFieldTypes": "Id,Id"
        });
        if let Some(date) = log_date {
            record["LogDate"] = json!(date);
        }
        EventLogFile::from_record(record.as_object().unwrap().clone()).unwrap()
    }

    fn record(pairs: &[(&str, &str)]) -> EventRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Text(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_document_store_loader_uses_event_identifier() {
        let store = Arc::new(MemoryDocumentStore::new());
        let loader = DocumentStoreLoader::new(store.clone());

        let records = vec![
            record(&[("EventIdentifier", "evt-1"), ("USER_ID", "005A")]),
            record(&[("USER_ID", "005B")]),
        ];
        let output = loader
            .run(&descriptor(None), StepData::Records(records))
            .await
            .unwrap();

        assert!(matches!(output, StepData::Records(ref r) if r.len() == 2));

        let docs = store.documents("Login");
        assert_eq!(docs.len(), 2);
        let stored = store.get("Login", "evt-1").unwrap();
        assert_eq!(stored.body["USER_ID"], "005A");
    }

    #[tokio::test]
    async fn test_document_store_loader_rejects_raw_input() {
        let loader = DocumentStoreLoader::new(Arc::new(MemoryDocumentStore::new()));
        let err = loader
            .run(&descriptor(None), StepData::Raw("a,b".into()))
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::UnexpectedInput { .. }));
    }

    #[test]
    fn test_flat_file_path() {
        let loader = FlatFileLoader::new(
            Arc::new(StaticLog("")),
            FlatFileConfig {
                root: PathBuf::from("/var/evmon"),
                directory: "{type}/%Y/%m/%d/%H".into(),
                file: "{type}-%Y%m%d".into(),
                extension: "csv".into(),
            },
        );

        let path = loader
            .path_for(&descriptor(Some("2019-11-13T05:00:00.000+0000")))
            .unwrap();
        assert_eq!(path, PathBuf::from("/var/evmon/Login/2019/11/13/05/Login-20191113.csv"));
    }

    #[test]
    fn test_flat_file_path_requires_log_date() {
        let loader = FlatFileLoader::new(Arc::new(StaticLog("")), FlatFileConfig::default());
        let err = loader.path_for(&descriptor(None)).unwrap_err();

        assert!(matches!(err, StepError::Descriptor(_)));
    }

    #[tokio::test]
    async fn test_flat_file_loader_writes_raw_content() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FlatFileLoader::new(
            Arc::new(StaticLog("\"USER_ID\"\n\"005A\"\n")),
            FlatFileConfig {
                root: dir.path().to_path_buf(),
                ..Default::default()
            },
        );

        let file = descriptor(Some("2019-11-13T05:00:00.000+0000"));
        let output = loader.run(&file, StepData::Records(Vec::new())).await.unwrap();
        assert!(matches!(output, StepData::Records(_)));

        let written = dir.path().join("2019/11/13/05/Login.csv");
        assert_eq!(std::fs::read_to_string(written).unwrap(), "\"USER_ID\"\n\"005A\"\n");
    }
}
