//! Embedding engine: keep the vector index in sync with active content.
//!
//! Selects content hashes lacking vectors for the current model, chunks
//! them by tokens, probes the provider once for the embedding dimension,
//! and writes one vector per `(hash, seq, pos)` in provider batches.
//! Batch failures fall back to per-item requests; items that still fail
//! are counted and skipped. Progress is reported by bytes processed.

use crate::error::{QmdError, Result};
use crate::llm::LlmGateway;
use crate::progress::ProgressSink;
use crate::store::Store;
use crate::text::{chunk_document_by_tokens, CHUNK_OVERLAP_TOKENS, CHUNK_SIZE_TOKENS};

#[derive(Debug, Default)]
pub struct EmbedSummary {
    pub hashes: u64,
    pub chunks: u64,
    pub embedded: u64,
    pub failed: u64,
    pub bytes: u64,
    pub dims: usize,
}

struct PendingChunk {
    hash: String,
    seq: i64,
    pos: i64,
    text: String,
    /// Bytes of source body attributed to this chunk for progress.
    weight: u64,
}

/// Build or update the vector index. `force` clears all vectors first,
/// unlocking the dimension for a model switch.
pub async fn run_embed(
    store: &Store,
    gateway: &LlmGateway,
    force: bool,
    progress: &dyn ProgressSink,
) -> Result<EmbedSummary> {
    let model = gateway
        .embed_model()
        .ok_or_else(|| {
            QmdError::Config(
                "no embedding provider configured; set SILICONFLOW_API_KEY or OPENAI_API_KEY"
                    .to_string(),
            )
        })?
        .to_string();

    if force {
        store.clear_all_embeddings().await?;
        tracing::info!("cleared existing embeddings");
    }

    let pending_hashes = store.hashes_needing_embedding(&model).await?;
    let mut summary = EmbedSummary {
        hashes: pending_hashes.len() as u64,
        ..Default::default()
    };
    if pending_hashes.is_empty() {
        tracing::info!("vector index is up to date");
        return Ok(summary);
    }

    // One probe locks the dimension before any real work.
    let dims = gateway.probe_dimension().await?;
    store.ensure_vec_table(dims, &model).await?;
    summary.dims = dims;

    let mut work: Vec<PendingChunk> = Vec::new();
    let mut total_bytes = 0u64;
    for hash in &pending_hashes {
        let Some(body) = store.get_content(hash).await? else {
            continue;
        };
        let body_bytes = body.len() as u64;
        total_bytes += body_bytes;
        let chunks = chunk_document_by_tokens(&body, CHUNK_SIZE_TOKENS, CHUNK_OVERLAP_TOKENS);
        let n = chunks.len().max(1) as u64;
        for (seq, chunk) in chunks.into_iter().enumerate() {
            if chunk.text.trim().is_empty() {
                continue;
            }
            work.push(PendingChunk {
                hash: hash.clone(),
                seq: seq as i64,
                pos: chunk.pos as i64,
                text: chunk.text,
                weight: body_bytes / n,
            });
        }
    }
    summary.chunks = work.len() as u64;
    summary.bytes = total_bytes;

    progress.begin("embedding", total_bytes);
    let batch_size = gateway.embed_batch_size();
    let now = chrono::Utc::now().timestamp();

    for batch in work.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        match gateway.embed_batch(&texts).await {
            Ok(slots) => {
                for (item, slot) in batch.iter().zip(slots.into_iter()) {
                    match slot {
                        Some(vector) => {
                            insert_checked(store, item, &vector, dims, &model, now, &mut summary)
                                .await?;
                        }
                        None => {
                            // The provider skipped this input; retry alone.
                            retry_single(store, gateway, item, dims, &model, now, &mut summary)
                                .await?;
                        }
                    }
                    progress.advance(item.weight);
                }
            }
            Err(e @ QmdError::CoolingDown { .. }) => {
                progress.finish();
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding batch failed, retrying per item");
                for item in batch {
                    retry_single(store, gateway, item, dims, &model, now, &mut summary).await?;
                    progress.advance(item.weight);
                }
            }
        }
    }

    progress.finish();
    tracing::info!(
        embedded = summary.embedded,
        failed = summary.failed,
        chunks = summary.chunks,
        "embedding complete"
    );
    Ok(summary)
}

async fn insert_checked(
    store: &Store,
    item: &PendingChunk,
    vector: &[f32],
    dims: usize,
    model: &str,
    now: i64,
    summary: &mut EmbedSummary,
) -> Result<()> {
    if vector.len() != dims {
        // A shape the index cannot hold is fatal: it means the provider
        // changed dimension mid-run.
        return Err(QmdError::DimensionMismatch {
            existing: dims,
            requested: vector.len(),
        });
    }
    store
        .insert_embedding(&item.hash, item.seq, item.pos, vector, model, now)
        .await?;
    summary.embedded += 1;
    Ok(())
}

async fn retry_single(
    store: &Store,
    gateway: &LlmGateway,
    item: &PendingChunk,
    dims: usize,
    model: &str,
    now: i64,
    summary: &mut EmbedSummary,
) -> Result<()> {
    match gateway.embed_one(&item.text).await {
        Ok(vector) => insert_checked(store, item, &vector, dims, model, now, summary).await,
        Err(e @ QmdError::CoolingDown { .. }) => Err(e),
        Err(e) => {
            tracing::warn!(hash = %item.hash, seq = item.seq, error = %e, "chunk embedding failed");
            summary.failed += 1;
            Ok(())
        }
    }
}
