//! SQLite-backed vector collection.
//!
//! Each collection is a row in `collections`; its chunks live in
//! `embeddings` with the text, a JSON metadata object, and the vector as a
//! little-endian `f32` BLOB. Search is brute force: the query is embedded,
//! every vector in the collection is scored, and the best `k` are returned.
//!
//! With `metric = "cosine"` scores are similarities (higher is better);
//! with `metric = "l2"` they are Euclidean distances (lower is better).

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::{IndexHit, IndexProvider, VectorIndex};
use crate::config::StoreConfig;
use crate::db;
use crate::embedding::{
    blob_to_vec, cosine_similarity, embed_query, l2_distance, vec_to_blob, EmbeddingProvider,
};
use crate::migrate;
use crate::models::Metadata;

/// Scoring function applied between the query vector and stored vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    L2,
}

impl Metric {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "cosine" => Ok(Metric::Cosine),
            "l2" => Ok(Metric::L2),
            other => bail!("Unknown store metric: {}", other),
        }
    }

    fn score(self, query: &[f32], stored: &[f32]) -> f64 {
        match self {
            Metric::Cosine => cosine_similarity(query, stored) as f64,
            Metric::L2 => l2_distance(query, stored) as f64,
        }
    }

    /// Orders `a` before `b` when `a` is the better score.
    fn compare(self, a: f64, b: f64) -> std::cmp::Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
        match self {
            Metric::Cosine => ord.reverse(),
            Metric::L2 => ord,
        }
    }
}

/// A chunk ready to be written into a collection.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub text: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
}

/// Opens [`SqliteCollection`] handles on one named collection.
pub struct SqliteCollectionProvider {
    path: PathBuf,
    collection: String,
    metric: Metric,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SqliteCollectionProvider {
    pub fn new(config: &StoreConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        Ok(Self {
            path: config.path.clone(),
            collection: config.collection.clone(),
            metric: Metric::parse(&config.metric)?,
            embedder,
        })
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Connect, migrate, and get-or-create the collection.
    pub async fn open_collection(&self) -> Result<SqliteCollection> {
        let pool = db::connect(&self.path).await?;
        migrate::run_migrations(&pool).await?;

        sqlx::query(
            "INSERT OR IGNORE INTO collections (id, name, created_at) VALUES (?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&self.collection)
        .bind(chrono::Utc::now().timestamp())
        .execute(&pool)
        .await?;

        let collection_id: String = sqlx::query_scalar("SELECT id FROM collections WHERE name = ?")
            .bind(&self.collection)
            .fetch_one(&pool)
            .await?;

        Ok(SqliteCollection {
            pool,
            collection_id,
            name: self.collection.clone(),
            metric: self.metric,
            embedder: self.embedder.clone(),
        })
    }
}

#[async_trait]
impl IndexProvider for SqliteCollectionProvider {
    async fn open(&self) -> Result<Arc<dyn VectorIndex>> {
        let collection = self.open_collection().await?;
        Ok(Arc::new(collection))
    }
}

/// Live handle on one collection.
pub struct SqliteCollection {
    pool: SqlitePool,
    collection_id: String,
    name: String,
    metric: Metric,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SqliteCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    /// Insert chunks in a single transaction. Returns the number written.
    pub async fn insert(&self, items: &[NewEmbedding]) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for item in items {
            let metadata_json = serde_json::to_string(&item.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO embeddings (id, collection_id, text, metadata_json, vector, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&self.collection_id)
            .bind(&item.text)
            .bind(metadata_json)
            .bind(vec_to_blob(&item.vector))
            .bind(item.vector.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(items.len())
    }

    /// Delete every chunk whose `file_name` or `source_file` metadata equals
    /// `file_name`. Returns the number of chunks removed.
    pub async fn delete_by_file_name(&self, file_name: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM embeddings
            WHERE collection_id = ?
              AND (json_extract(metadata_json, '$.file_name') = ?
                   OR json_extract(metadata_json, '$.source_file') = ?)
            "#,
        )
        .bind(&self.collection_id)
        .bind(file_name)
        .bind(file_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove every chunk in the collection, keeping the collection itself.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embeddings WHERE collection_id = ?")
            .bind(&self.collection_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE collection_id = ?")
            .bind(&self.collection_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl VectorIndex for SqliteCollection {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<IndexHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT text, metadata_json, vector FROM embeddings WHERE collection_id = ?",
        )
        .bind(&self.collection_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = embed_query(self.embedder.as_ref(), query).await?;

        let mut scored: Vec<(f64, String, String)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let score = self.metric.score(&query_vec, &blob_to_vec(&blob));
                let text: String = row.get("text");
                let metadata_json: String = row.get("metadata_json");
                (score, text, metadata_json)
            })
            .collect();

        scored.sort_by(|a, b| self.metric.compare(a.0, b.0));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, text, metadata_json)| IndexHit::decode(text, &metadata_json, Some(score)))
            .collect())
    }
}
