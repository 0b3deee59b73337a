//! The retrieval pipeline: BM25 probe, strong-signal shortcut, query
//! expansion, parallel lexical + vector fan-out, reciprocal-rank fusion,
//! per-document chunk selection, LLM rerank, score blending, and
//! deduplication.
//!
//! Degradation rules: a failed sub-search contributes an empty list, a
//! failed expansion falls back to the deterministic queryables, and a
//! failed rerank leaves the blended RRF ordering. The pipeline errors
//! only when no ranked list could be produced at all.

use std::collections::HashMap;
use std::time::Instant;

use futures::future::join_all;

use crate::engine::Engine;
use crate::error::Result;
use crate::fusion::{bigram_jaccard, reciprocal_rank_fusion, RankedList};
use crate::llm::{QueryType, Queryable, RerankDoc};
use crate::store::{FtsHit, VecHit};
use crate::text::{chunk_document, docid_from_hash, query_terms};

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub limit: usize,
    pub min_score: f64,
    pub all: bool,
    pub collections: Vec<String>,
    pub context: Option<String>,
    pub profile: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.0,
            all: false,
            collections: Vec::new(),
            context: None,
            profile: false,
        }
    }
}

/// One emitted result. Serialized as the `{docid, score, file, title,
/// context?, alsoIn?, body, snippet}` JSON item.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docid: Option<String>,
    pub score: f64,
    /// Virtual path: `qmd://collection/path`.
    pub file: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(rename = "alsoIn", skip_serializing_if = "Vec::is_empty")]
    pub also_in: Vec<String>,
    pub body: String,
    pub snippet: String,
}

/// Candidate bookkeeping keyed by `collection/path`.
#[derive(Debug, Clone)]
struct Candidate {
    collection: String,
    path: String,
    title: String,
    hash: String,
    fts_snippet: Option<String>,
}

fn virtual_path(collection: &str, path: &str) -> String {
    format!("qmd://{collection}/{path}")
}

fn candidate_from_fts(hit: &FtsHit) -> (String, Candidate) {
    let key = format!("{}/{}", hit.doc.collection, hit.doc.path);
    (
        key,
        Candidate {
            collection: hit.doc.collection.clone(),
            path: hit.doc.path.clone(),
            title: hit.doc.title.clone(),
            hash: hit.doc.hash.clone(),
            fts_snippet: Some(hit.snippet.clone()),
        },
    )
}

fn candidate_from_vec(hit: &VecHit) -> (String, Candidate) {
    let key = format!("{}/{}", hit.collection, hit.path);
    (
        key,
        Candidate {
            collection: hit.collection.clone(),
            path: hit.path.clone(),
            title: hit.title.clone(),
            hash: hit.hash.clone(),
            fts_snippet: None,
        },
    )
}

/// BM25-only search (`qmd search`).
pub async fn run_search(
    engine: &Engine,
    query: &str,
    limit: usize,
    collections: &[String],
) -> Result<Vec<SearchResult>> {
    let filter = engine.registry.validate_filter(collections);
    let hits = engine
        .store
        .search_fts(query, limit, filter.as_deref())
        .await?;
    Ok(hits
        .iter()
        .map(|hit| SearchResult {
            docid: Some(docid_from_hash(&hit.doc.hash).to_string()),
            score: hit.score,
            file: virtual_path(&hit.doc.collection, &hit.doc.path),
            title: hit.doc.title.clone(),
            context: engine
                .registry
                .resolve_context(&hit.doc.collection, &hit.doc.path)
                .map(str::to_string),
            also_in: Vec::new(),
            body: hit.snippet.clone(),
            snippet: hit.snippet.clone(),
        })
        .collect())
}

/// Vector-only search (`qmd vsearch`), chunk granularity preserved.
pub async fn run_vsearch(
    engine: &Engine,
    query: &str,
    limit: usize,
    min_score: f64,
    collections: &[String],
) -> Result<Vec<SearchResult>> {
    let filter = engine.registry.validate_filter(collections);
    let (_, model) = match engine.store.vector_dims().await? {
        Some(meta) => meta,
        None => return Err(crate::error::QmdError::VectorUnavailable),
    };
    let embedding = engine.gateway.embed_one(query).await?;
    let hits = engine
        .store
        .search_vec(&embedding, &model, limit, filter.as_deref())
        .await?;
    Ok(hits
        .iter()
        .filter(|h| h.score >= min_score)
        .map(|hit| SearchResult {
            docid: Some(docid_from_hash(&hit.hash).to_string()),
            score: hit.score,
            file: virtual_path(&hit.collection, &hit.path),
            title: hit.title.clone(),
            context: engine
                .registry
                .resolve_context(&hit.collection, &hit.path)
                .map(str::to_string),
            also_in: Vec::new(),
            body: hit.snippet.clone(),
            snippet: hit.snippet.clone(),
        })
        .collect())
}

/// The full hybrid pipeline (`qmd query`).
pub async fn run_query(
    engine: &Engine,
    query: &str,
    opts: &QueryOptions,
) -> Result<Vec<SearchResult>> {
    let tuning = &engine.tuning;
    let filter = engine.registry.validate_filter(&opts.collections);
    let fanout_limit = if opts.all { 200 } else { tuning.fanout_limit };

    // Stage 1: unconditional BM25 probe.
    let stage = Instant::now();
    let probe = engine
        .store
        .search_fts(query, fanout_limit.max(20), filter.as_deref())
        .await?;
    profile(opts, "bm25-probe", stage);

    // Stage 2: expansion, skipped on a strong lexical signal.
    let stage = Instant::now();
    let strong = match probe.first() {
        Some(top) => tuning.is_strong_signal(top.score, probe.get(1).map(|h| h.score)),
        None => false,
    };
    let queryables: Vec<Queryable> = if strong {
        tracing::debug!("strong BM25 signal, skipping query expansion");
        Vec::new()
    } else {
        engine
            .gateway
            .expand_query(query, true, opts.context.as_deref())
            .await
    };
    profile(opts, "expansion", stage);

    // Stage 3: parallel fan-out. The original BM25 and original vector
    // lists carry the heavier fusion weight.
    let stage = Instant::now();
    let vector_ready = engine.store.vector_dims().await?.map(|(_, model)| model);

    let mut candidates: HashMap<String, Candidate> = HashMap::new();
    let mut lists: Vec<RankedList> = Vec::new();

    let ingest_fts = |hits: &[FtsHit],
                          weight: f64,
                          candidates: &mut HashMap<String, Candidate>,
                          lists: &mut Vec<RankedList>| {
        let mut keys = Vec::with_capacity(hits.len());
        for hit in hits {
            let (key, cand) = candidate_from_fts(hit);
            candidates.entry(key.clone()).or_insert(cand);
            keys.push(key);
        }
        lists.push(RankedList { weight, keys });
    };

    let ingest_vec = |hits: &[VecHit],
                      weight: f64,
                      candidates: &mut HashMap<String, Candidate>,
                      lists: &mut Vec<RankedList>| {
        // Chunk rows collapse to per-document keys for fusion, keeping
        // the best-chunk order.
        let mut keys: Vec<String> = Vec::new();
        for hit in hits {
            let (key, cand) = candidate_from_vec(hit);
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
            candidates.entry(key).or_insert(cand);
        }
        lists.push(RankedList { weight, keys });
    };

    ingest_fts(&probe, tuning.original_list_weight, &mut candidates, &mut lists);

    if let Some(model) = &vector_ready {
        if engine.gateway.has_embed_provider() {
            // Original vector search plus one per vec/hyde queryable.
            let mut vec_queries: Vec<(&str, f64)> =
                vec![(query, tuning.original_list_weight)];
            for q in &queryables {
                if matches!(q.qtype, QueryType::Vec | QueryType::Hyde) {
                    vec_queries.push((&q.text, tuning.expanded_list_weight));
                }
            }

            let searches = vec_queries.iter().map(|(text, weight)| {
                let model = model.clone();
                let filter = filter.clone();
                async move {
                    let embedding = match engine.gateway.embed_one(text).await {
                        Ok(e) => e,
                        Err(e) => {
                            tracing::debug!(error = %e, "vector query embedding failed");
                            return None;
                        }
                    };
                    match engine
                        .store
                        .search_vec(&embedding, &model, fanout_limit, filter.as_deref())
                        .await
                    {
                        Ok(hits) => Some((*weight, hits)),
                        Err(e) => {
                            tracing::debug!(error = %e, "vector sub-search failed");
                            None
                        }
                    }
                }
            });
            for result in join_all(searches).await.into_iter().flatten() {
                ingest_vec(&result.1, result.0, &mut candidates, &mut lists);
            }
        }
    }

    // Expanded lexical queries after the originals.
    let lex_texts: Vec<&str> = queryables
        .iter()
        .filter(|q| q.qtype == QueryType::Lex && q.text != query)
        .map(|q| q.text.as_str())
        .collect();
    let lex_searches = lex_texts.iter().map(|text| {
        let filter = filter.clone();
        async move {
            match engine
                .store
                .search_fts(text, fanout_limit, filter.as_deref())
                .await
            {
                Ok(hits) => Some(hits),
                Err(e) => {
                    tracing::debug!(error = %e, "lexical sub-search failed");
                    None
                }
            }
        }
    });
    for hits in join_all(lex_searches).await.into_iter().flatten() {
        ingest_fts(&hits, tuning.expanded_list_weight, &mut candidates, &mut lists);
    }
    profile(opts, "fan-out", stage);

    if lists.iter().all(|l| l.keys.is_empty()) {
        return Ok(Vec::new());
    }

    // Stage 4: fusion and candidate cap.
    let stage = Instant::now();
    let mut fused = reciprocal_rank_fusion(&lists, tuning);
    fused.truncate(tuning.rerank_doc_limit);
    profile(opts, "rrf", stage);

    // Stage 5: per-document chunk selection.
    let stage = Instant::now();
    let terms = query_terms(query);
    let mut rerank_docs: Vec<RerankDoc> = Vec::new();
    let mut chunk_bodies: HashMap<String, String> = HashMap::new();
    let mut best_chunk: HashMap<String, String> = HashMap::new();
    for doc in &fused {
        let Some(cand) = candidates.get(&doc.key) else {
            continue;
        };
        let Some(body) = engine.store.get_content(&cand.hash).await? else {
            continue;
        };
        let chunks = chunk_document(&body);
        let mut scored: Vec<(usize, f64)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, term_match_score(&c.text, &terms)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        for (selected, (idx, _)) in scored
            .into_iter()
            .take(tuning.rerank_chunks_per_doc)
            .enumerate()
        {
            let key = format!("{}::{idx}", doc.key);
            if selected == 0 {
                best_chunk.insert(doc.key.clone(), chunks[idx].text.clone());
            }
            chunk_bodies.insert(key.clone(), chunks[idx].text.clone());
            rerank_docs.push(RerankDoc {
                key,
                text: chunks[idx].text.clone(),
            });
        }
    }
    profile(opts, "chunk-select", stage);

    // Stage 6: rerank; a failure leaves the RRF ordering in place.
    let stage = Instant::now();
    let rerank_outcome = if rerank_docs.is_empty() {
        None
    } else {
        match engine.gateway.rerank(query, &rerank_docs).await {
            Ok(outcomes) => Some(outcomes),
            Err(e) => {
                tracing::warn!(error = %e, "rerank failed, falling back to fused ranking");
                None
            }
        }
    };
    profile(opts, "rerank", stage);

    // Stage 7: blend, filter, dedup, limit.
    let stage = Instant::now();
    let rrf_rank_by_key: HashMap<&str, usize> =
        fused.iter().map(|d| (d.key.as_str(), d.rrf_rank)).collect();

    let mut results: Vec<SearchResult> = Vec::new();
    match rerank_outcome {
        Some(outcomes) if outcomes.iter().any(|o| o.extract.is_some()) => {
            // Extract mode: trust the model's ordering, surface the
            // extract as the body. First (best) outcome per document wins.
            for outcome in &outcomes {
                let Some((doc_key, _)) = outcome.key.rsplit_once("::") else {
                    continue;
                };
                if results.iter().any(|r| r.file == virtual_file_for(&candidates, doc_key)) {
                    continue;
                }
                let Some(cand) = candidates.get(doc_key) else {
                    continue;
                };
                let body = outcome
                    .extract
                    .clone()
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| chunk_bodies.get(&outcome.key).cloned().unwrap_or_default());
                results.push(make_result(engine, cand, outcome.score, body));
            }
        }
        Some(outcomes) => {
            // Score mode: best chunk score per document blended with the
            // document's RRF position.
            let mut best_per_doc: HashMap<String, f64> = HashMap::new();
            for outcome in &outcomes {
                let Some((doc_key, _)) = outcome.key.rsplit_once("::") else {
                    continue;
                };
                let entry = best_per_doc.entry(doc_key.to_string()).or_insert(f64::MIN);
                if outcome.score > *entry {
                    *entry = outcome.score;
                }
            }
            let mut blended: Vec<(String, f64)> = best_per_doc
                .into_iter()
                .filter_map(|(doc_key, score)| {
                    let rank = *rrf_rank_by_key.get(doc_key.as_str())?;
                    Some((doc_key, tuning.blend_score(rank, score)))
                })
                .collect();
            blended.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| rrf_rank_by_key[a.0.as_str()].cmp(&rrf_rank_by_key[b.0.as_str()]))
            });
            for (doc_key, score) in blended {
                if let Some(cand) = candidates.get(&doc_key) {
                    let body = best_chunk.get(&doc_key).cloned().unwrap_or_default();
                    results.push(make_result(engine, cand, score, body));
                }
            }
        }
        None => {
            // Degraded: blended RRF score alone, in fused order.
            for doc in &fused {
                if let Some(cand) = candidates.get(&doc.key) {
                    let body = best_chunk.get(&doc.key).cloned().unwrap_or_default();
                    results.push(make_result(
                        engine,
                        cand,
                        tuning.blend_score(doc.rrf_rank, 0.0),
                        body,
                    ));
                }
            }
        }
    }

    results.retain(|r| r.score >= opts.min_score);
    let results = dedup_results(results, tuning.dedup_similarity);
    let limit = if opts.all { usize::MAX } else { opts.limit };
    let mut results = results;
    results.truncate(limit);
    profile(opts, "blend-dedup", stage);

    Ok(results)
}

fn virtual_file_for(candidates: &HashMap<String, Candidate>, doc_key: &str) -> String {
    candidates
        .get(doc_key)
        .map(|c| virtual_path(&c.collection, &c.path))
        .unwrap_or_default()
}

fn make_result(engine: &Engine, cand: &Candidate, score: f64, body: String) -> SearchResult {
    let snippet = cand.fts_snippet.clone().unwrap_or_else(|| {
        let line = body.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let mut end = line.len().min(160);
        while end > 0 && !line.is_char_boundary(end) {
            end -= 1;
        }
        line[..end].to_string()
    });
    SearchResult {
        docid: Some(docid_from_hash(&cand.hash).to_string()),
        score,
        file: virtual_path(&cand.collection, &cand.path),
        title: cand.title.clone(),
        context: engine
            .registry
            .resolve_context(&cand.collection, &cand.path)
            .map(str::to_string),
        also_in: Vec::new(),
        body,
        snippet,
    }
}

/// Fast term-match score for chunk selection: occurrences of each term,
/// with the whole-query phrase weighted heavier.
fn term_match_score(chunk: &str, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = chunk.to_lowercase();
    let mut score = 0.0;
    let phrase = terms.last().expect("phrase term is always present");
    for term in terms {
        let occurrences = lower.matches(term.as_str()).count() as f64;
        if term == phrase {
            score += occurrences * 3.0;
        } else {
            score += occurrences;
        }
    }
    score
}

/// Deduplicate by exact docid, then merge near-identical bodies (bigram
/// Jaccard at or above the threshold), keeping the higher score and
/// recording merged paths under `alsoIn`.
fn dedup_results(results: Vec<SearchResult>, similarity_threshold: f64) -> Vec<SearchResult> {
    let mut out: Vec<SearchResult> = Vec::new();
    for result in results {
        let mut merged = false;
        for kept in out.iter_mut() {
            let same_docid = kept.docid.is_some() && kept.docid == result.docid;
            if same_docid || bigram_jaccard(&kept.body, &result.body) >= similarity_threshold {
                if result.score > kept.score {
                    let mut also = kept.also_in.clone();
                    also.push(kept.file.clone());
                    let mut replacement = result.clone();
                    replacement.also_in = also;
                    *kept = replacement;
                } else if !kept.also_in.contains(&result.file) && kept.file != result.file {
                    kept.also_in.push(result.file.clone());
                }
                merged = true;
                break;
            }
        }
        if !merged {
            out.push(result);
        }
    }
    out
}

fn profile(opts: &QueryOptions, stage: &str, started: Instant) {
    if opts.profile {
        tracing::info!(stage, elapsed_ms = started.elapsed().as_millis() as u64, "pipeline stage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(docid: &str, file: &str, score: f64, body: &str) -> SearchResult {
        SearchResult {
            docid: Some(docid.to_string()),
            score,
            file: file.to_string(),
            title: "t".to_string(),
            context: None,
            also_in: Vec::new(),
            body: body.to_string(),
            snippet: String::new(),
        }
    }

    #[test]
    fn dedup_by_docid_keeps_higher_score() {
        let results = vec![
            result("abc123", "qmd://a/x.md", 0.9, "shared body"),
            result("abc123", "qmd://b/copy.md", 0.5, "shared body"),
        ];
        let out = dedup_results(results, 0.9);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].file, "qmd://a/x.md");
        assert_eq!(out[0].also_in, vec!["qmd://b/copy.md".to_string()]);
    }

    #[test]
    fn dedup_promotes_higher_scoring_duplicate() {
        let results = vec![
            result("abc123", "qmd://a/x.md", 0.5, "shared body"),
            result("abc123", "qmd://b/copy.md", 0.9, "shared body"),
        ];
        let out = dedup_results(results, 0.9);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].file, "qmd://b/copy.md");
        assert_eq!(out[0].score, 0.9);
        assert_eq!(out[0].also_in, vec!["qmd://a/x.md".to_string()]);
    }

    #[test]
    fn dedup_by_near_identical_body() {
        let body_a = "The pasta water binds the sauce to the noodles when emulsified.";
        let body_b = "The pasta water binds the sauce to the noodles when emulsified!";
        let results = vec![
            result("aaa111", "qmd://a/x.md", 0.9, body_a),
            result("bbb222", "qmd://b/y.md", 0.6, body_b),
            result("ccc333", "qmd://c/z.md", 0.5, "entirely different content about git"),
        ];
        let out = dedup_results(results, 0.9);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].also_in, vec!["qmd://b/y.md".to_string()]);
    }

    #[test]
    fn term_match_prefers_phrase_hits() {
        let terms = query_terms("pasta water");
        let with_phrase = term_match_score("add pasta water to the sauce", &terms);
        let words_only = term_match_score("pasta is boiled in salted water", &terms);
        assert!(with_phrase > words_only);
        assert_eq!(term_match_score("nothing relevant", &[]), 0.0);
    }
}
