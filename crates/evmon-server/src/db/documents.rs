//! Collection/identity keyed JSON documents
//!
//! Every document lives under a namespace `<database>.<collection>` and an
//! identity unique within it. Inserting an identity that already exists is a
//! no-op, never an error, so repeated writes of the same record are safe.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;

use super::{DbError, DbResult};

/// Field under which a document's identity is mirrored inside its body
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Use `id` when present, otherwise assign a random UUID; the identity is
    /// mirrored into the body
    pub fn with_identity(id: Option<String>, body: Value) -> Self {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::mirrored(id, body)
    }

    /// Encode `value` and mirror the identity into the body
    pub fn from_serializable<T: Serialize>(id: impl Into<String>, value: &T) -> DbResult<Self> {
        Ok(Self::mirrored(id.into(), serde_json::to_value(value)?))
    }

    fn mirrored(id: String, mut body: Value) -> Self {
        if let Value::Object(ref mut map) = body {
            map.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        }
        Self { id, body }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert one document; `false` when the identity was already present
    async fn insert_one(&self, collection: &str, document: Document) -> DbResult<bool>;

    /// Insert documents atomically, skipping present identities; returns the
    /// number actually inserted
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> DbResult<u64>;

    /// Documents of `collection` whose identity is in `ids`
    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> DbResult<Vec<Document>>;
}

/// PostgreSQL backed [`DocumentStore`]
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    database: String,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, database: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
        }
    }

    pub fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.database, collection)
    }
}

const INSERT_DOCUMENT: &str = r#"
    INSERT INTO documents (namespace, doc_id, body)
    VALUES ($1, $2, $3)
    ON CONFLICT (namespace, doc_id) DO NOTHING
"#;

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert_one(&self, collection: &str, document: Document) -> DbResult<bool> {
        let result = sqlx::query(INSERT_DOCUMENT)
            .bind(self.namespace(collection))
            .bind(&document.id)
            .bind(&document.body)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> DbResult<u64> {
        if documents.is_empty() {
            return Ok(0);
        }

        let namespace = self.namespace(collection);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for document in &documents {
            let result = sqlx::query(INSERT_DOCUMENT)
                .bind(&namespace)
                .bind(&document.id)
                .bind(&document.body)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        tracing::debug!(
            namespace = %namespace,
            requested = documents.len(),
            inserted,
            "Inserted documents"
        );

        Ok(inserted)
    }

    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> DbResult<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT doc_id, body
            FROM documents
            WHERE namespace = $1 AND doc_id = ANY($2)
            ORDER BY doc_id
            "#,
        )
        .bind(self.namespace(collection))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .map(|(id, body)| Document { id, body })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_serializable_mirrors_identity() {
        let doc = Document::from_serializable("0AT1", &json!({ "EventType": "API" })).unwrap();

        assert_eq!(doc.id, "0AT1");
        assert_eq!(doc.body["_id"], "0AT1");
        assert_eq!(doc.body["EventType"], "API");
    }

    #[test]
    fn test_with_identity_generates_uuid() {
        let doc = Document::with_identity(None, json!({}));
        assert!(uuid::Uuid::parse_str(&doc.id).is_ok());

        assert_eq!(doc.body["_id"], doc.id.as_str());

        let doc = Document::with_identity(Some("abc123".into()), json!({ "Score": 1 }));
        assert_eq!(doc.id, "abc123");
        assert_eq!(doc.body, json!({ "Score": 1, "_id": "abc123" }));
    }

    #[tokio::test]
    async fn test_namespace() {
        let pool = PgPool::connect_lazy("postgresql://localhost/evmon").unwrap();
        let store = PgDocumentStore::new(pool, "monitoring");

        assert_eq!(store.namespace("Login"), "monitoring.Login");
    }
}
