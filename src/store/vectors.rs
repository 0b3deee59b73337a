//! Chunk embedding vectors.
//!
//! Vectors are stored as little-endian f32 BLOBs keyed by
//! `(content hash, chunk seq)` and scored with in-process cosine
//! similarity against candidates referenced by active documents. The
//! locked dimension lives in `vector_meta`; its absence means the vector
//! subsystem has never been built and every vector path reports
//! `VectorUnavailable`.

use sqlx::Row;

use super::Store;
use crate::error::{QmdError, Result};

/// A chunk-level vector hit. One row per matching chunk; callers rely on
/// seeing multiple chunks per file.
#[derive(Debug, Clone)]
pub struct VecHit {
    pub doc_id: i64,
    pub collection: String,
    pub path: String,
    pub title: String,
    pub hash: String,
    pub seq: i64,
    /// Byte offset of the chunk start within the body.
    pub pos: i64,
    /// Cosine similarity mapped to `[0, 1]`.
    pub score: f64,
    pub snippet: String,
}

/// Encode a float vector as little-endian f32 bytes (sqlite-vec layout).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; zero for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

impl Store {
    /// Lock the vector table to a dimension and model. Fails with
    /// `DimensionMismatch` when vectors of a different dimension already
    /// exist; changing the model requires a rebuild.
    pub async fn ensure_vec_table(&self, dims: usize, model: &str) -> Result<()> {
        let existing = self.vector_dims().await?;
        match existing {
            Some((have, _)) if have != dims => Err(QmdError::DimensionMismatch {
                existing: have,
                requested: dims,
            }),
            Some(_) => Ok(()),
            None => {
                sqlx::query("INSERT INTO vector_meta (id, dims, model) VALUES (1, ?, ?)")
                    .bind(dims as i64)
                    .bind(model)
                    .execute(self.pool())
                    .await?;
                Ok(())
            }
        }
    }

    /// The locked dimension and model, or `None` when the vector
    /// subsystem has never been built.
    pub async fn vector_dims(&self) -> Result<Option<(usize, String)>> {
        let row = sqlx::query("SELECT dims, model FROM vector_meta WHERE id = 1")
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| (r.get::<i64, _>("dims") as usize, r.get("model"))))
    }

    /// Drop every vector and the dimension lock. Used by `embed -f`.
    pub async fn clear_all_embeddings(&self) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM vectors").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM vector_meta")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_embedding(
        &self,
        hash: &str,
        seq: i64,
        pos: i64,
        vector: &[f32],
        model: &str,
        now: i64,
    ) -> Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO vectors (hash, seq, pos, embedding, model, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash, seq) DO UPDATE SET
                pos = excluded.pos,
                embedding = excluded.embedding,
                model = excluded.model,
                created_at = excluded.created_at
            "#,
        )
        .bind(hash)
        .bind(seq)
        .bind(pos)
        .bind(&blob)
        .bind(model)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Content hashes referenced by active documents that have no vector
    /// rows for the given model.
    pub async fn hashes_needing_embedding(&self, model: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT DISTINCT d.hash
            FROM documents d
            LEFT JOIN vectors v ON v.hash = d.hash AND v.model = ?
            WHERE d.active = 1 AND v.hash IS NULL
            ORDER BY d.hash
            "#,
        )
        .bind(model)
        .fetch_all(self.pool())
        .await?)
    }

    /// Nearest-neighbor search over chunks of active documents. Returns
    /// chunk-level rows; a file with two matching chunks contributes two
    /// rows. Scores are `(1 + cosine) / 2`.
    pub async fn search_vec(
        &self,
        embedding: &[f32],
        model: &str,
        limit: usize,
        collections: Option<&[String]>,
    ) -> Result<Vec<VecHit>> {
        let Some((dims, _)) = self.vector_dims().await? else {
            return Err(QmdError::VectorUnavailable);
        };
        if embedding.len() != dims {
            return Err(QmdError::DimensionMismatch {
                existing: dims,
                requested: embedding.len(),
            });
        }
        if let Some(names) = collections {
            if names.is_empty() {
                return Ok(Vec::new());
            }
        }

        let mut sql = String::from(
            r#"
            SELECT v.hash, v.seq, v.pos, v.embedding,
                   d.id, d.collection, d.path, d.title
            FROM vectors v
            JOIN documents d ON d.hash = v.hash
            WHERE d.active = 1 AND v.model = ?
            "#,
        );
        if let Some(names) = collections {
            let placeholders = vec!["?"; names.len()].join(", ");
            sql.push_str(&format!(" AND d.collection IN ({placeholders})"));
        }

        let mut q = sqlx::query(&sql).bind(model);
        if let Some(names) = collections {
            for name in names {
                q = q.bind(name);
            }
        }
        let rows = q.fetch_all(self.pool()).await?;

        let mut hits: Vec<VecHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let cos = cosine_similarity(embedding, &vec) as f64;
                VecHit {
                    doc_id: row.get("id"),
                    collection: row.get("collection"),
                    path: row.get("path"),
                    title: row.get("title"),
                    hash: row.get("hash"),
                    seq: row.get("seq"),
                    pos: row.get("pos"),
                    score: (1.0 + cos) / 2.0,
                    snippet: String::new(),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.hash.cmp(&b.hash))
                .then(a.seq.cmp(&b.seq))
        });
        hits.truncate(limit);

        self.fill_vec_snippets(&mut hits).await?;
        Ok(hits)
    }

    /// Cut a short snippet out of each hit's body at the chunk offset.
    async fn fill_vec_snippets(&self, hits: &mut [VecHit]) -> Result<()> {
        for hit in hits.iter_mut() {
            let Some(body) = self.get_content(&hit.hash).await? else {
                continue;
            };
            let start = (hit.pos as usize).min(body.len());
            let start = floor_char_boundary(&body, start);
            let end = floor_char_boundary(&body, (start + 240).min(body.len()));
            hit.snippet = body[start..end].replace('\n', " ").trim().to_string();
        }
        Ok(())
    }

    pub async fn count_vectors(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
            .fetch_one(self.pool())
            .await?)
    }

    /// Delete vectors whose content hash no document references.
    pub async fn cleanup_orphaned_vectors(&self) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM vectors WHERE hash NOT IN (SELECT DISTINCT hash FROM documents)",
        )
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
