//! SQLite-backed [`DocumentStore`] and [`VectorIndex`].
//!
//! One [`SqliteStore`] serves both roles over the schema created by
//! [`migrate`](crate::migrate). Multi-statement writes run in a single
//! transaction, so a failed ingest never leaves half a version behind and
//! [`replace_document`](VectorIndex::replace_document) is all or nothing.
//! Vector search is brute-force cosine similarity over `chunk_vectors`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;

use lexrag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use lexrag_core::models::{Chunk, Document, QueryVector};
use lexrag_core::search::rank_hits;
use lexrag_core::store::{
    batch_identity, DocumentStore, IndexEntry, IndexHit, IndexStats, ModelIdentity, StoreCounts,
    VectorIndex,
};
use lexrag_core::{RagError, Result};

use crate::{db, migrate};

/// SQLite variable limit headroom for `IN (...)` lists.
const MAX_IN_PARAMS: usize = 500;

pub struct SqliteStore {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> RagError {
    RagError::storage(e)
}

fn ts_to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn millis_to_ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `db_path` and apply migrations.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect_path(db_path).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Model identity of the vectors that survive the write about to happen.
    async fn identity_excluding(
        tx: &mut Transaction<'_, Sqlite>,
        replaced: Replaced<'_>,
    ) -> Result<Option<ModelIdentity>> {
        let (sql, key) = match replaced {
            Replaced::Document(doc) => (
                "SELECT model_name, model_version, dims FROM chunk_vectors WHERE document_id != ? LIMIT 1",
                Some(doc),
            ),
            Replaced::Chunk(chunk_id) => (
                "SELECT model_name, model_version, dims FROM chunk_vectors WHERE chunk_id != ? LIMIT 1",
                Some(chunk_id),
            ),
            Replaced::Nothing => ("SELECT model_name, model_version, dims FROM chunk_vectors LIMIT 1", None),
        };
        let mut query = sqlx::query(sql);
        if let Some(key) = key {
            query = query.bind(key);
        }
        let row = query.fetch_optional(&mut **tx).await.map_err(db_err)?;
        Ok(row.map(|r| identity_from_row(&r)))
    }

    async fn identity(&self) -> Result<Option<ModelIdentity>> {
        let row = sqlx::query("SELECT model_name, model_version, dims FROM chunk_vectors LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| identity_from_row(&r)))
    }
}

/// Vectors a write replaces, which therefore do not pin the model identity.
enum Replaced<'a> {
    Document(&'a str),
    Chunk(&'a str),
    Nothing,
}

fn identity_from_row(row: &SqliteRow) -> ModelIdentity {
    let dims: i64 = row.get("dims");
    ModelIdentity {
        model_name: row.get("model_name"),
        model_version: row.get("model_version"),
        dims: dims as usize,
    }
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        source_url: row.get("source_url"),
        title: row.get("title"),
        raw_text: row.get("raw_text"),
        normalized_text: row.get("normalized_text"),
        scrape_timestamp: millis_to_ts(row.get("scrape_timestamp")),
        content_hash: row.get("content_hash"),
        version: row.get("version"),
        ingested_at: millis_to_ts(row.get("ingested_at")),
    }
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let char_start: i64 = row.get("char_start");
    let char_end: i64 = row.get("char_end");
    let token_count: i64 = row.get("token_count");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        sequence_index: row.get("sequence_index"),
        text: row.get("text"),
        char_start: char_start as usize,
        char_end: char_end as usize,
        token_count: token_count as usize,
    }
}

async fn insert_vector(tx: &mut Transaction<'_, Sqlite>, entry: &IndexEntry) -> Result<()> {
    let e = &entry.embedding;
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, sequence_index, model_name, model_version, dims, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            sequence_index = excluded.sequence_index,
            model_name = excluded.model_name,
            model_version = excluded.model_version,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&e.chunk_id)
    .bind(&entry.document_id)
    .bind(entry.sequence_index)
    .bind(&e.model_name)
    .bind(&e.model_version)
    .bind(e.vector.len() as i64)
    .bind(vec_to_blob(&e.vector))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

const DOCUMENT_COLUMNS: &str = "id, source_url, title, raw_text, normalized_text, scrape_timestamp, \
     content_hash, version, ingested_at";

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn current_version(&self, source_url: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE source_url = ? AND superseded_by IS NULL \
             ORDER BY version DESC LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.as_ref().map(document_from_row))
    }

    async fn insert_version(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(c) = chunks.iter().find(|c| c.document_id != document.id) {
            return Err(RagError::storage(format!(
                "chunk {} belongs to {}, not {}",
                c.id, c.document_id, document.id
            )));
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_url, title, raw_text, normalized_text,
                                   scrape_timestamp, content_hash, version, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.source_url)
        .bind(&document.title)
        .bind(&document.raw_text)
        .bind(&document.normalized_text)
        .bind(ts_to_millis(&document.scrape_timestamp))
        .bind(&document.content_hash)
        .bind(document.version)
        .bind(ts_to_millis(&document.ingested_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, sequence_index, text, char_start, char_end, token_count)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.sequence_index)
            .bind(&chunk.text)
            .bind(chunk.char_start as i64)
            .bind(chunk.char_end as i64)
            .bind(chunk.token_count as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn discard_version(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn supersede(&self, document_id: &str, by_document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let updated = sqlx::query("UPDATE documents SET superseded_by = ? WHERE id = ?")
            .bind(by_document_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        if updated == 0 {
            return Err(RagError::storage(format!(
                "cannot supersede unknown document {}",
                document_id
            )));
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS))
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(document_from_row))
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(chunk_ids.len());
        for batch in chunk_ids.chunks(MAX_IN_PARAMS) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT id, document_id, sequence_index, text, char_start, char_end, token_count \
                 FROM chunks WHERE id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
            chunks.extend(rows.iter().map(chunk_from_row));
        }
        Ok(chunks)
    }

    async fn active_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.sequence_index, c.text, c.char_start, c.char_end, c.token_count
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.superseded_by IS NULL
            ORDER BY c.document_id, c.sequence_index
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN superseded_by IS NULL THEN 1 ELSE 0 END), 0) AS active,
                COALESCE(SUM(CASE WHEN superseded_by IS NULL THEN 0 ELSE 1 END), 0) AS superseded
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let active: i64 = row.get("active");
        let superseded: i64 = row.get("superseded");
        Ok(StoreCounts {
            documents: active as usize,
            superseded: superseded as usize,
            chunks: chunks as usize,
        })
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        let identity = ModelIdentity::of_embedding(&entry.embedding);
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let replaced = Replaced::Chunk(&entry.embedding.chunk_id);
        if let Some(current) = Self::identity_excluding(&mut tx, replaced).await? {
            current.ensure_matches(&identity)?;
        }
        insert_vector(&mut tx, &entry).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn replace_document(
        &self,
        stale_document_id: Option<&str>,
        entries: Vec<IndexEntry>,
    ) -> Result<()> {
        let identity = batch_identity(&entries)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(identity) = &identity {
            let replaced = stale_document_id.map_or(Replaced::Nothing, Replaced::Document);
            if let Some(current) = Self::identity_excluding(&mut tx, replaced).await? {
                current.ensure_matches(identity)?;
            }
        }
        if let Some(stale) = stale_document_id {
            sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
                .bind(stale)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        for entry in &entries {
            insert_vector(&mut tx, entry).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let removed = sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(removed as usize)
    }

    async fn search(
        &self,
        query: &QueryVector,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<IndexHit>> {
        if let Some(current) = self.identity().await? {
            current.ensure_matches(&ModelIdentity::of_query(query))?;
        }

        let rows = sqlx::query("SELECT chunk_id, document_id, sequence_index, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let hits: Vec<IndexHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                IndexHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    sequence_index: row.get("sequence_index"),
                    score: cosine_similarity(&query.vector, &vector),
                    rank: 0,
                }
            })
            .collect();

        Ok(rank_hits(hits, top_k, score_threshold))
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(IndexStats {
            vectors: vectors as usize,
            model: self.identity().await?,
        })
    }

    async fn chunk_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT chunk_id FROM chunk_vectors ORDER BY chunk_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}
