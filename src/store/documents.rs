//! Document rows: a logical file within a collection at a point in time.
//!
//! At most one active row exists per `(collection, path)`; deactivation is
//! soft and history is pruned by `cleanup`. Every mutation keeps
//! `documents_fts` in step inside the same transaction.

use std::collections::HashSet;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::Store;
use crate::error::{QmdError, Result};

#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: i64,
    pub collection: String,
    pub path: String,
    pub title: String,
    pub hash: String,
    pub created_at: i64,
    pub modified_at: i64,
    pub active: bool,
}

/// Outcome of a per-file reconciliation during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    TitleUpdated,
    Updated,
    Added,
}

fn row_to_doc(row: &SqliteRow) -> DocumentRow {
    DocumentRow {
        id: row.get("id"),
        collection: row.get("collection"),
        path: row.get("path"),
        title: row.get("title"),
        hash: row.get("hash"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
        active: row.get::<i64, _>("active") != 0,
    }
}

const DOC_COLUMNS: &str = "id, collection, path, title, hash, created_at, modified_at, active";

async fn fts_delete(tx: &mut Transaction<'_, Sqlite>, doc_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM documents_fts WHERE rowid = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn fts_insert(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: i64,
    body: &str,
    title: &str,
    path: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO documents_fts (rowid, body, title, path) VALUES (?, ?, ?, ?)")
        .bind(doc_id)
        .bind(body)
        .bind(title)
        .bind(path)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

impl Store {
    /// Insert a new active document. Fails with `Conflict` when an active
    /// row already exists for `(collection, path)`; the content blob must
    /// already be present.
    pub async fn insert_document(
        &self,
        collection: &str,
        path: &str,
        title: &str,
        hash: &str,
        created_at: i64,
        modified_at: i64,
    ) -> Result<i64> {
        let mut tx = self.pool().begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE collection = ? AND path = ? AND active = 1",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(QmdError::Conflict {
                collection: collection.to_string(),
                path: path.to_string(),
            });
        }

        let body: Option<String> = sqlx::query_scalar("SELECT body FROM content WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&mut *tx)
            .await?;
        let body = body.ok_or(QmdError::NotFound {
            kind: "content",
            name: hash.to_string(),
        })?;

        let res = sqlx::query(
            r#"
            INSERT INTO documents (collection, path, title, hash, created_at, modified_at, active)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(collection)
        .bind(path)
        .bind(title)
        .bind(hash)
        .bind(created_at)
        .bind(modified_at)
        .execute(&mut *tx)
        .await?;
        let doc_id = res.last_insert_rowid();

        fts_insert(&mut tx, doc_id, &body, title, path).await?;
        tx.commit().await?;
        Ok(doc_id)
    }

    pub async fn find_active_document(
        &self,
        collection: &str,
        path: &str,
    ) -> Result<Option<DocumentRow>> {
        let sql = format!(
            "SELECT {DOC_COLUMNS} FROM documents WHERE collection = ? AND path = ? AND active = 1"
        );
        let row = sqlx::query(&sql)
            .bind(collection)
            .bind(path)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(row_to_doc))
    }

    /// Point a document at new content, refreshing title and FTS.
    pub async fn update_document(
        &self,
        id: i64,
        title: &str,
        hash: &str,
        modified_at: i64,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let body: Option<String> = sqlx::query_scalar("SELECT body FROM content WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&mut *tx)
            .await?;
        let body = body.ok_or(QmdError::NotFound {
            kind: "content",
            name: hash.to_string(),
        })?;

        let path: Option<String> = sqlx::query_scalar("SELECT path FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let path = path.ok_or(QmdError::NotFound {
            kind: "document",
            name: id.to_string(),
        })?;

        sqlx::query("UPDATE documents SET title = ?, hash = ?, modified_at = ? WHERE id = ?")
            .bind(title)
            .bind(hash)
            .bind(modified_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        fts_delete(&mut tx, id).await?;
        fts_insert(&mut tx, id, &body, title, &path).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Refresh only the derived title (content hash unchanged).
    pub async fn update_document_title(
        &self,
        id: i64,
        title: &str,
        modified_at: i64,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query("SELECT d.path, c.body FROM documents d JOIN content c ON c.hash = d.hash WHERE d.id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let row = row.ok_or(QmdError::NotFound {
            kind: "document",
            name: id.to_string(),
        })?;
        let path: String = row.get("path");
        let body: String = row.get("body");

        sqlx::query("UPDATE documents SET title = ?, modified_at = ? WHERE id = ?")
            .bind(title)
            .bind(modified_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        fts_delete(&mut tx, id).await?;
        fts_insert(&mut tx, id, &body, title, &path).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Soft-delete the active document at `(collection, path)`. Returns
    /// whether a row changed.
    pub async fn deactivate_document(&self, collection: &str, path: &str) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE collection = ? AND path = ? AND active = 1",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            return Ok(false);
        };

        sqlx::query("UPDATE documents SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        fts_delete(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Deactivate every active document in the collection whose path was
    /// not seen by the scan. Returns the number deactivated.
    pub async fn deactivate_missing(
        &self,
        collection: &str,
        seen: &HashSet<String>,
    ) -> Result<u64> {
        let paths: Vec<String> = sqlx::query_scalar(
            "SELECT path FROM documents WHERE collection = ? AND active = 1",
        )
        .bind(collection)
        .fetch_all(self.pool())
        .await?;

        let mut removed = 0u64;
        for path in paths {
            if !seen.contains(&path) && self.deactivate_document(collection, &path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Prune soft-deleted history rows. Their content blobs become
    /// orphans and are collected separately.
    pub async fn delete_inactive_documents(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM documents WHERE active = 0")
            .execute(self.pool())
            .await?;
        Ok(res.rows_affected())
    }

    /// Reconcile one scanned file in a single transaction. This is the
    /// ingestion fast path composing `insert_content` + `insert_document`
    /// / `update_document` / `update_document_title`.
    #[allow(clippy::too_many_arguments)]
    pub async fn reconcile_document(
        &self,
        collection: &str,
        path: &str,
        title: &str,
        hash: &str,
        body: &str,
        created_at: i64,
        modified_at: i64,
    ) -> Result<Reconciled> {
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query(
            "SELECT id, title, hash FROM documents WHERE collection = ? AND path = ? AND active = 1",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(row) => {
                let id: i64 = row.get("id");
                let old_title: String = row.get("title");
                let old_hash: String = row.get("hash");

                if old_hash == hash && old_title == title {
                    Reconciled::Unchanged
                } else if old_hash == hash {
                    sqlx::query("UPDATE documents SET title = ?, modified_at = ? WHERE id = ?")
                        .bind(title)
                        .bind(modified_at)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    fts_delete(&mut tx, id).await?;
                    fts_insert(&mut tx, id, body, title, path).await?;
                    Reconciled::TitleUpdated
                } else {
                    sqlx::query(
                        "INSERT OR IGNORE INTO content (hash, body, created_at) VALUES (?, ?, ?)",
                    )
                    .bind(hash)
                    .bind(body)
                    .bind(modified_at)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        "UPDATE documents SET title = ?, hash = ?, modified_at = ? WHERE id = ?",
                    )
                    .bind(title)
                    .bind(hash)
                    .bind(modified_at)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    fts_delete(&mut tx, id).await?;
                    fts_insert(&mut tx, id, body, title, path).await?;
                    Reconciled::Updated
                }
            }
            None => {
                sqlx::query(
                    "INSERT OR IGNORE INTO content (hash, body, created_at) VALUES (?, ?, ?)",
                )
                .bind(hash)
                .bind(body)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;
                let res = sqlx::query(
                    r#"
                    INSERT INTO documents (collection, path, title, hash, created_at, modified_at, active)
                    VALUES (?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .bind(collection)
                .bind(path)
                .bind(title)
                .bind(hash)
                .bind(created_at)
                .bind(modified_at)
                .execute(&mut *tx)
                .await?;
                fts_insert(&mut tx, res.last_insert_rowid(), body, title, path).await?;
                Reconciled::Added
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Active documents, optionally restricted to a collection and a path
    /// prefix. Sorted by `(collection, path)` for stable listings.
    pub async fn list_active(
        &self,
        collection: Option<&str>,
        path_prefix: Option<&str>,
    ) -> Result<Vec<DocumentRow>> {
        let mut sql = format!("SELECT {DOC_COLUMNS} FROM documents WHERE active = 1");
        if collection.is_some() {
            sql.push_str(" AND collection = ?");
        }
        if path_prefix.is_some() {
            sql.push_str(" AND path LIKE ? ESCAPE '\\'");
        }
        sql.push_str(" ORDER BY collection, path");

        let mut query = sqlx::query(&sql);
        if let Some(c) = collection {
            query = query.bind(c.to_string());
        }
        if let Some(p) = path_prefix {
            query = query.bind(format!("{}%", escape_like(p)));
        }

        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.iter().map(row_to_doc).collect())
    }

    /// Resolve a docid (content-hash prefix) to active documents, most
    /// recently modified first. Ambiguity is the caller's concern.
    pub async fn find_by_docid_prefix(&self, prefix: &str) -> Result<Vec<DocumentRow>> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {DOC_COLUMNS} FROM documents
             WHERE active = 1 AND hash LIKE ?
             ORDER BY modified_at DESC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(format!("{prefix}%"))
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(row_to_doc).collect())
    }

    /// Collection names present in the active document set.
    pub async fn active_collections(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT collection FROM documents WHERE active = 1 ORDER BY collection",
        )
        .fetch_all(self.pool())
        .await?)
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::hash_content;

    async fn add_doc(store: &Store, collection: &str, path: &str, body: &str) -> i64 {
        let hash = hash_content(body);
        store.insert_content(&hash, body, 1).await.unwrap();
        store
            .insert_document(collection, path, "title", &hash, 1, 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_then_find() {
        let store = Store::open_in_memory().await.unwrap();
        let id = add_doc(&store, "notes", "a.md", "alpha body").await;

        let doc = store
            .find_active_document("notes", "a.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.id, id);
        assert!(doc.active);
        assert_eq!(doc.hash, hash_content("alpha body"));
    }

    #[tokio::test]
    async fn duplicate_active_insert_conflicts() {
        let store = Store::open_in_memory().await.unwrap();
        add_doc(&store, "notes", "a.md", "alpha body").await;

        let hash = hash_content("other");
        store.insert_content(&hash, "other", 1).await.unwrap();
        let err = store
            .insert_document("notes", "a.md", "t", &hash, 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QmdError::Conflict { .. }));
    }

    #[tokio::test]
    async fn deactivate_frees_the_slot() {
        let store = Store::open_in_memory().await.unwrap();
        add_doc(&store, "notes", "a.md", "alpha body").await;

        assert!(store.deactivate_document("notes", "a.md").await.unwrap());
        assert!(!store.deactivate_document("notes", "a.md").await.unwrap());
        assert!(store
            .find_active_document("notes", "a.md")
            .await
            .unwrap()
            .is_none());

        // The slot can be reused.
        add_doc(&store, "notes", "a.md", "new body").await;
        assert!(store
            .find_active_document("notes", "a.md")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn reconcile_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();

        let body1 = "# One\ntext";
        let h1 = hash_content(body1);
        let r = store
            .reconcile_document("notes", "a.md", "One", &h1, body1, 10, 10)
            .await
            .unwrap();
        assert_eq!(r, Reconciled::Added);

        let r = store
            .reconcile_document("notes", "a.md", "One", &h1, body1, 10, 10)
            .await
            .unwrap();
        assert_eq!(r, Reconciled::Unchanged);

        let r = store
            .reconcile_document("notes", "a.md", "One Renamed", &h1, body1, 10, 20)
            .await
            .unwrap();
        assert_eq!(r, Reconciled::TitleUpdated);

        let body2 = "# Two\nnew text";
        let h2 = hash_content(body2);
        let r = store
            .reconcile_document("notes", "a.md", "Two", &h2, body2, 10, 30)
            .await
            .unwrap();
        assert_eq!(r, Reconciled::Updated);

        let doc = store
            .find_active_document("notes", "a.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.hash, h2);
        assert_eq!(doc.title, "Two");
    }

    #[tokio::test]
    async fn deactivate_missing_only_touches_unseen() {
        let store = Store::open_in_memory().await.unwrap();
        add_doc(&store, "notes", "keep.md", "keep").await;
        add_doc(&store, "notes", "drop.md", "drop").await;
        add_doc(&store, "other", "drop.md", "other collection").await;

        let mut seen = HashSet::new();
        seen.insert("keep.md".to_string());
        let removed = store.deactivate_missing("notes", &seen).await.unwrap();
        assert_eq!(removed, 1);

        assert!(store
            .find_active_document("notes", "keep.md")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_active_document("notes", "drop.md")
            .await
            .unwrap()
            .is_none());
        // Other collections are untouched.
        assert!(store
            .find_active_document("other", "drop.md")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn docid_prefix_resolution() {
        let store = Store::open_in_memory().await.unwrap();
        add_doc(&store, "notes", "a.md", "alpha body").await;
        let hash = hash_content("alpha body");

        let hits = store.find_by_docid_prefix(&hash[..6]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.md");

        assert!(store.find_by_docid_prefix("zz").await.unwrap().is_empty());
        assert!(store.find_by_docid_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_active_filters_by_prefix() {
        let store = Store::open_in_memory().await.unwrap();
        add_doc(&store, "notes", "recipes/pasta.md", "pasta").await;
        add_doc(&store, "notes", "recipes/soup.md", "soup").await;
        add_doc(&store, "notes", "journal/day.md", "day").await;

        let all = store.list_active(Some("notes"), None).await.unwrap();
        assert_eq!(all.len(), 3);

        let recipes = store
            .list_active(Some("notes"), Some("recipes/"))
            .await
            .unwrap();
        assert_eq!(recipes.len(), 2);
        assert!(recipes.iter().all(|d| d.path.starts_with("recipes/")));
    }
}
