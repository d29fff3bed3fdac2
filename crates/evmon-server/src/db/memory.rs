//! In-process [`DocumentStore`]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{DbError, DbResult, Document, DocumentStore};

/// Keeps documents in a map per collection.
///
/// Counts every call so tests can assert that a code path never reached the
/// store. Reads, writes, or writes to single collections can be switched into
/// a failing mode.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    operations: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    failing_collections: Mutex<HashSet<String>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`DbError::Unavailable`]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write to `collection` fail
    pub fn fail_writes_to(&self, collection: &str) {
        self.failing_collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(collection.to_string());
    }

    /// Make every subsequent read fail with [`DbError::Unavailable`]
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of store calls made so far
    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// All documents in `collection`, ordered by identity
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.lock().get(collection).and_then(|docs| docs.get(id).cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Document>>> {
        // A poisoned map is still consistent: every mutation is a single insert.
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self, collection: &str) -> DbResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::unavailable("writes disabled"));
        }
        let failing = self
            .failing_collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(collection);
        if failing {
            return Err(DbError::unavailable(format!("writes to {} disabled", collection)));
        }
        Ok(())
    }

    fn check_readable(&self) -> DbResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DbError::unavailable("reads disabled"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_one(&self, collection: &str, document: Document) -> DbResult<bool> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.check_writable(collection)?;

        let mut collections = self.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&document.id) {
            return Ok(false);
        }
        docs.insert(document.id.clone(), document);
        Ok(true)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> DbResult<u64> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.check_writable(collection)?;

        let mut collections = self.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let mut inserted = 0;
        for document in documents {
            if !docs.contains_key(&document.id) {
                docs.insert(document.id.clone(), document);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> DbResult<Vec<Document>> {
        self.operations.fetch_add(1, Ordering::SeqCst);

        self.check_readable()?;

        let collections = self.lock();
        Ok(collections
            .get(collection)
            .map(|docs| ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_identity_is_ignored() {
        let store = MemoryDocumentStore::new();

        assert!(store.insert_one("c", Document::new("1", json!({"v": 1}))).await.unwrap());
        assert!(!store.insert_one("c", Document::new("1", json!({"v": 2}))).await.unwrap());

        assert_eq!(store.get("c", "1").unwrap().body["v"], 1);
    }

    #[tokio::test]
    async fn test_insert_many_counts_new_documents() {
        let store = MemoryDocumentStore::new();
        store.insert_one("c", Document::new("a", json!({}))).await.unwrap();

        let inserted = store
            .insert_many(
                "c",
                vec![Document::new("a", json!({})), Document::new("b", json!({}))],
            )
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(store.documents("c").len(), 2);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = MemoryDocumentStore::new();
        store.insert_one("Login", Document::new("x", json!({}))).await.unwrap();

        let found = store.find_by_ids("API", &["x".to_string()]).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(store.operations(), 2);
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryDocumentStore::new();
        store.fail_writes(true);

        let err = store.insert_one("c", Document::new("1", json!({}))).await.unwrap_err();
        assert!(matches!(err, DbError::Unavailable(_)));
        assert!(store.find_by_ids("c", &["1".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_reads() {
        let store = MemoryDocumentStore::new();
        store.insert_one("c", Document::new("1", json!({}))).await.unwrap();
        store.fail_reads(true);

        let err = store.find_by_ids("c", &["1".to_string()]).await.unwrap_err();
        assert!(matches!(err, DbError::Unavailable(_)));

        store.fail_reads(false);
        assert_eq!(store.find_by_ids("c", &["1".to_string()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_writes_to_one_collection() {
        let store = MemoryDocumentStore::new();
        store.fail_writes_to("event_log_files");

        let err = store
            .insert_many("event_log_files", vec![Document::new("1", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Unavailable(_)));
        assert!(store.insert_one("Login", Document::new("1", json!({}))).await.unwrap());
    }
}
