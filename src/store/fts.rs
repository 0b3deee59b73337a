//! Full-text search over `documents_fts`.
//!
//! Queries are compiled into a three-tier FTS5 match expression so exact
//! phrases outrank proximity matches, which outrank any-term matches.
//! Raw BM25 scores from SQLite are negative (more negative = better);
//! they are folded through a logistic transform into a stable `[0, 1]`.

use sqlx::Row;

use super::documents::DocumentRow;
use super::Store;
use crate::error::Result;

/// A per-document full-text hit with its best snippet.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub doc: DocumentRow,
    pub score: f64,
    pub snippet: String,
}

/// Compile a user query into an FTS5 match expression:
/// `(phrase) OR NEAR(terms, 10) OR (term1 OR term2 OR …)`.
///
/// Input is sanitized to alphanumerics and apostrophes; terms shorter than
/// two characters are dropped. Returns `None` when nothing searchable
/// remains.
pub fn build_match_query(query: &str) -> Option<String> {
    let sanitized: String = query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let terms: Vec<String> = sanitized
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .map(|t| format!("\"{t}\""))
        .collect();

    match terms.len() {
        0 => None,
        1 => Some(terms[0].clone()),
        _ => {
            let phrase = format!(
                "\"{}\"",
                sanitized
                    .split_whitespace()
                    .filter(|t| t.chars().count() >= 2)
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            let near = format!("NEAR({}, 10)", terms.join(" "));
            let any = terms.join(" OR ");
            Some(format!("({phrase}) OR {near} OR ({any})"))
        }
    }
}

/// Fold a raw SQLite BM25 score (negative) into `[0, 1]`.
pub fn normalize_bm25(raw: f64) -> f64 {
    let s = raw.abs();
    1.0 / (1.0 + (-(s - 5.0) / 3.0).exp())
}

impl Store {
    /// BM25 search, one row per document with its best snippet. A supplied
    /// collection list restricts results to their union; an empty list
    /// (every name was unknown) yields no rows.
    pub async fn search_fts(
        &self,
        query: &str,
        limit: usize,
        collections: Option<&[String]>,
    ) -> Result<Vec<FtsHit>> {
        let Some(match_expr) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        if let Some(names) = collections {
            if names.is_empty() {
                return Ok(Vec::new());
            }
        }

        let mut sql = String::from(
            r#"
            SELECT d.id, d.collection, d.path, d.title, d.hash,
                   d.created_at, d.modified_at, d.active,
                   bm25(documents_fts) AS raw_rank,
                   snippet(documents_fts, 0, '', '', '…', 32) AS snip
            FROM documents_fts
            JOIN documents d ON d.id = documents_fts.rowid
            WHERE documents_fts MATCH ? AND d.active = 1
            "#,
        );
        if let Some(names) = collections {
            let placeholders = vec!["?"; names.len()].join(", ");
            sql.push_str(&format!(" AND d.collection IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY bm25(documents_fts) LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&match_expr);
        if let Some(names) = collections {
            for name in names {
                q = q.bind(name);
            }
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let raw: f64 = row.get("raw_rank");
                FtsHit {
                    doc: DocumentRow {
                        id: row.get("id"),
                        collection: row.get("collection"),
                        path: row.get("path"),
                        title: row.get("title"),
                        hash: row.get("hash"),
                        created_at: row.get("created_at"),
                        modified_at: row.get("modified_at"),
                        active: row.get::<i64, _>("active") != 0,
                    },
                    score: normalize_bm25(raw),
                    snippet: row.get("snip"),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::hash_content;

    #[test]
    fn match_query_shape() {
        let q = build_match_query("pasta water sauce").unwrap();
        assert_eq!(
            q,
            r#"("pasta water sauce") OR NEAR("pasta" "water" "sauce", 10) OR ("pasta" OR "water" OR "sauce")"#
        );
    }

    #[test]
    fn match_query_sanitizes_punctuation() {
        let q = build_match_query("what's \"this\"? (parens)").unwrap();
        assert!(q.contains("\"what's\""));
        assert!(q.contains("\"this\""));
        assert!(q.contains("\"parens\""));
        // Input punctuation never leaks into the terms themselves.
        assert!(!q.contains("(parens"));
        assert!(!q.contains('?'));
    }

    #[test]
    fn match_query_single_and_empty() {
        assert_eq!(build_match_query("pasta"), Some("\"pasta\"".to_string()));
        // Single-char terms are dropped entirely.
        assert_eq!(build_match_query("a b c"), None);
        assert_eq!(build_match_query("!!!"), None);
        assert_eq!(build_match_query(""), None);
    }

    #[test]
    fn bm25_normalization_is_monotone_and_bounded() {
        let scores: Vec<f64> = [-0.5, -2.0, -5.0, -8.0, -15.0, -30.0]
            .iter()
            .map(|&raw| normalize_bm25(raw))
            .collect();
        for pair in scores.windows(2) {
            assert!(pair[1] > pair[0], "larger |bm25| must score higher");
        }
        for s in &scores {
            assert!(*s > 0.0 && *s < 1.0);
        }
        // Anchors of the logistic transform.
        assert!((normalize_bm25(-5.0) - 0.5).abs() < 1e-9);
    }

    async fn seed(store: &Store) {
        for (collection, path, body) in [
            ("food", "pasta.md", "# Pasta\npasta water binds the sauce"),
            ("dev", "git.md", "# Git\ngit feature branch workflow"),
            ("travel", "japan.md", "# Japan\nJapan trains are fast"),
        ] {
            let hash = hash_content(body);
            store.insert_content(&hash, body, 1).await.unwrap();
            store
                .insert_document(collection, path, path, &hash, 1, 1)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fts_finds_documents() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;

        let hits = store.search_fts("pasta", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc.path, "pasta.md");
        assert!(hits[0].score > 0.0);

        let hits = store.search_fts("japan", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc.path, "japan.md");
    }

    #[tokio::test]
    async fn fts_collection_filter_is_a_union() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;

        let filter = vec!["food".to_string(), "travel".to_string()];
        let hits = store
            .search_fts("pasta OR japan trains sauce", 10, Some(&filter))
            .await
            .unwrap();
        let collections: Vec<&str> =
            hits.iter().map(|h| h.doc.collection.as_str()).collect();
        assert!(collections.contains(&"food") || collections.contains(&"travel"));
        assert!(!collections.contains(&"dev"));

        // Union over zero collections is empty, not an error.
        let empty: Vec<String> = Vec::new();
        let hits = store.search_fts("pasta", 10, Some(&empty)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn fts_limit_is_monotone() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..10 {
            let body = format!("# Doc {i}\ncommon keyword appears here {i}");
            let hash = hash_content(&body);
            store.insert_content(&hash, &body, 1).await.unwrap();
            store
                .insert_document("notes", &format!("d{i}.md"), "t", &hash, 1, 1)
                .await
                .unwrap();
        }

        let small = store.search_fts("common keyword", 3, None).await.unwrap();
        let large = store.search_fts("common keyword", 10, None).await.unwrap();
        assert_eq!(small.len(), 3);
        assert!(large.len() >= small.len());
        for (a, b) in small.iter().zip(large.iter()) {
            assert_eq!(a.doc.id, b.doc.id, "prefix must be stable as limit grows");
        }
    }

    #[tokio::test]
    async fn fts_ignores_inactive_documents() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;

        store.deactivate_document("travel", "japan.md").await.unwrap();
        let hits = store.search_fts("japan", 10, None).await.unwrap();
        assert!(hits.is_empty());
    }
}
