//! Persistence layer. The `Store` is the only component that touches the
//! database: schema, migrations, document/content/vector CRUD, and the
//! FTS and vector search primitives all live here.
//!
//! # Schema
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌───────────────┐
//! │   content    │     │  documents    │     │   vectors     │
//! │              │     │               │     │               │
//! │ hash (PK)    │──┐  │ id (PK)       │  ┌──│ hash, seq(PK) │
//! │ body         │  ├──│ collection    │  │  │ pos           │
//! │ created_at   │  │  │ path          │  │  │ embedding     │
//! └──────────────┘  │  │ title         │  │  │ model         │
//!                   └──│ hash ─────────│──┘  │ created_at    │
//! ┌──────────────┐     │ created_at    │     └───────────────┘
//! │documents_fts │     │ modified_at   │
//! │ (FTS5)       │─────│ active        │     ┌───────────────┐
//! │ body,title,  │     └───────────────┘     │ vector_meta   │
//! │ path         │                           │ dims, model   │
//! └──────────────┘     ┌───────────────┐     └───────────────┘
//!                      │  llm_cache    │
//!                      │ key,value,ts  │
//!                      └───────────────┘
//! ```
//!
//! `documents_fts` is keyed by document rowid and maintained inside the
//! same transaction as every document mutation. At most one `active`
//! document exists per `(collection, path)`, enforced by a partial unique
//! index. Vectors are keyed by `(content hash, chunk seq)` and carry the
//! byte offset of the chunk start.
//!
//! Concurrency: one process writes at a time; the pool hands out
//! short-lived read connections. Multi-statement mutations always run in
//! a single transaction.

mod content;
mod documents;
mod fts;
mod vectors;

pub use documents::{DocumentRow, Reconciled};
pub use fts::{build_match_query, normalize_bm25, FtsHit};
pub use vectors::{blob_to_vec, cosine_similarity, vec_to_blob, VecHit};

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Index health summary for `status` and the MCP status tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexHealth {
    /// Active content hashes with no vector rows.
    pub needs_embedding: i64,
    pub total_docs: i64,
    /// Days since the most recent active document modification.
    pub days_stale: i64,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the index database at `path` and run
    /// migrations. WAL journal mode, pool of five read connections.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Idempotent schema creation. Safe to run on every open.
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content (
                hash TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                path TEXT NOT NULL,
                title TEXT NOT NULL,
                hash TEXT NOT NULL REFERENCES content(hash),
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_active_path
             ON documents(collection, path) WHERE active = 1",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(hash)")
            .execute(&self.pool)
            .await?;

        // FTS5 virtual tables are not idempotent natively, probe first.
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
        )
        .fetch_one(&self.pool)
        .await?;
        if !fts_exists {
            sqlx::query("CREATE VIRTUAL TABLE documents_fts USING fts5(body, title, path)")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                hash TEXT NOT NULL,
                seq INTEGER NOT NULL,
                pos INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                model TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (hash, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                dims INTEGER NOT NULL,
                model TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn index_health(&self) -> Result<IndexHealth> {
        let total_docs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;

        let needs_embedding: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT d.hash)
            FROM documents d
            LEFT JOIN vectors v ON v.hash = d.hash
            WHERE d.active = 1 AND v.hash IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let last_modified: Option<i64> =
            sqlx::query_scalar("SELECT MAX(modified_at) FROM documents WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;

        let days_stale = match last_modified {
            Some(ts) if ts > 0 => {
                let now = chrono::Utc::now().timestamp();
                ((now - ts).max(0)) / 86_400
            }
            _ => 0,
        };

        Ok(IndexHealth {
            needs_embedding,
            total_docs,
            days_stale,
        })
    }

    pub async fn count_content(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM content")
            .fetch_one(&self.pool)
            .await?)
    }

    // ---- LLM response cache ----

    pub async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM llm_cache WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn cache_put(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO llm_cache (key, value, created_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, created_at = excluded.created_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_llm_cache(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM llm_cache")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
