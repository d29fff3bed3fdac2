//! Record of already ingested log files
//!
//! A log file is acknowledged only after every pipeline step succeeded for
//! it. Acknowledgements are keyed by the descriptor id, so acknowledging the
//! same file twice leaves a single record.

use evmon_common::types::EventLogFile;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::db::{DbResult, Document, DocumentStore};

#[derive(Serialize)]
struct IngestionRecord<'a> {
    #[serde(rename = "recordId")]
    record_id: &'a str,
    #[serde(flatten)]
    file: &'a EventLogFile,
}

pub struct IngestionLedger {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl IngestionLedger {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Stored records for the given descriptors
    pub async fn fetch(&self, files: &[EventLogFile]) -> DbResult<Vec<Document>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = files.iter().map(|f| f.id.clone()).collect();
        self.store.find_by_ids(&self.collection, &ids).await
    }

    /// Descriptors that have not been acknowledged yet, in input order
    pub async fn filter(&self, files: Vec<EventLogFile>) -> DbResult<Vec<EventLogFile>> {
        if files.is_empty() {
            return Ok(files);
        }

        let seen: HashSet<String> = self.fetch(&files).await?.into_iter().map(|d| d.id).collect();
        let total = files.len();
        let fresh: Vec<_> = files.into_iter().filter(|f| !seen.contains(&f.id)).collect();

        tracing::debug!(
            collection = %self.collection,
            total,
            already_ingested = total - fresh.len(),
            "Filtered log files"
        );

        Ok(fresh)
    }

    /// Mark descriptors as ingested and hand them back
    pub async fn ack(&self, files: Vec<EventLogFile>) -> DbResult<Vec<EventLogFile>> {
        if files.is_empty() {
            return Ok(files);
        }

        let documents = files
            .iter()
            .map(|file| {
                Document::from_serializable(
                    file.id.clone(),
                    &IngestionRecord {
                        record_id: &file.id,
                        file,
                    },
                )
            })
            .collect::<DbResult<Vec<_>>>()?;

        let inserted = self.store.insert_many(&self.collection, documents).await?;

        tracing::info!(
            collection = %self.collection,
            acked = files.len(),
            inserted,
            "Acknowledged log files"
        );

        Ok(files)
    }
}
