//! Content blobs: the canonical, immutable body of a file at a point in
//! time, keyed by its SHA-256 hash.

use super::Store;
use crate::error::Result;

impl Store {
    /// Insert a content blob. Idempotent on `hash`: a blob that already
    /// exists is left untouched.
    pub async fn insert_content(&self, hash: &str, body: &str, now: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO content (hash, body, created_at) VALUES (?, ?, ?)")
            .bind(hash)
            .bind(body)
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_content(&self, hash: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT body FROM content WHERE hash = ?")
                .bind(hash)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Delete content blobs no document row references at all. Inactive
    /// documents keep their blobs alive until `delete_inactive_documents`
    /// prunes the history.
    pub async fn cleanup_orphaned_content(&self) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM content WHERE hash NOT IN (SELECT DISTINCT hash FROM documents)",
        )
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::hash_content;

    #[tokio::test]
    async fn insert_content_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let hash = hash_content("body");
        store.insert_content(&hash, "body", 100).await.unwrap();
        store.insert_content(&hash, "body", 200).await.unwrap();

        assert_eq!(
            store.get_content(&hash).await.unwrap().as_deref(),
            Some("body")
        );
        // The original created_at survives the second insert.
        let created: i64 =
            sqlx::query_scalar("SELECT created_at FROM content WHERE hash = ?")
                .bind(&hash)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(created, 100);
    }

    #[tokio::test]
    async fn orphaned_content_is_collected() {
        let store = Store::open_in_memory().await.unwrap();
        let orphan = hash_content("orphan");
        let kept = hash_content("kept");
        store.insert_content(&orphan, "orphan", 1).await.unwrap();
        store.insert_content(&kept, "kept", 1).await.unwrap();
        store
            .insert_document("notes", "kept.md", "kept", &kept, 1, 1)
            .await
            .unwrap();

        assert_eq!(store.cleanup_orphaned_content().await.unwrap(), 1);
        assert!(store.get_content(&orphan).await.unwrap().is_none());
        assert!(store.get_content(&kept).await.unwrap().is_some());
    }
}
