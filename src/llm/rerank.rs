//! Reranking: dedicated endpoints and the LLM-as-reranker adapter.
//!
//! Dedicated mode posts `{query, documents, top_n}` and re-keys the
//! returned `{index, score}` pairs. LLM mode sends a numbered candidate
//! list and parses `[i] extracted content` lines, assigning descending
//! synthetic scores that preserve the model's ordering. Rerank is a
//! required operation: an open circuit fails fast instead of degrading.

use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;

use super::cache::cache_key;
use super::providers::{
    DashScopeRerankInput, DashScopeRerankParams, DashScopeRerankRequest, DashScopeRerankResponse,
    LlmOp, ProviderConfig, ProviderKind, RerankRequest, RerankResponse,
};
use super::LlmGateway;
use crate::config::RerankMode;
use crate::error::{QmdError, Result};

/// A candidate passage keyed by the caller (here: `"{file}::{chunk_idx}"`).
#[derive(Debug, Clone)]
pub struct RerankDoc {
    pub key: String,
    pub text: String,
}

/// One reranked candidate. `extract` is present in LLM mode only and
/// carries the model's extracted passage.
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub key: String,
    pub score: f64,
    pub extract: Option<String>,
}

/// Built-in reranker prompt; a user template at
/// `<config_dir>/rerank-prompt.txt` replaces it verbatim.
pub const DEFAULT_RERANK_PROMPT: &str = "\
You are a search result reranker. Given a query and numbered candidate \
passages, select the passages that help answer the query, best first.\n\
For each relevant passage output one line of the form:\n\
[i] <the sentence or two from passage i that answers the query>\n\
Output nothing else. If no passage is relevant output exactly: NONE\n\n\
Query: {{query}}\n\nPassages:\n{{documents}}";

/// Substitute `{{query}}` and `{{documents}}` literally.
pub fn render_rerank_prompt(template: &str, query: &str, documents: &str) -> String {
    template
        .replace("{{query}}", query)
        .replace("{{documents}}", documents)
}

fn rerank_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[(\d+)\]\s*(.*)$").expect("rerank line regex"))
}

/// Parse `[i] extract` lines from an LLM reranker reply, dropping
/// out-of-range indices and duplicates while preserving order.
pub fn parse_llm_rerank(raw: &str, candidate_count: usize) -> Vec<(usize, String)> {
    let mut out: Vec<(usize, String)> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        let Some(caps) = rerank_line_re().captures(line) else {
            continue;
        };
        let Ok(index) = caps[1].parse::<usize>() else {
            continue;
        };
        if index >= candidate_count || out.iter().any(|(i, _)| *i == index) {
            continue;
        }
        out.push((index, caps[2].trim().to_string()));
    }
    out
}

/// Synthetic score preserving the model's ordering: `1.0 − rank × 0.05`.
pub fn synthetic_score(rank: usize) -> f64 {
    (1.0 - rank as f64 * 0.05).max(0.0)
}

impl LlmGateway {
    /// Rerank candidates against a query. Fails fast with
    /// `ProviderCoolingDown` when the circuit is open, and with
    /// `Provider` when no rerank provider is configured.
    pub async fn rerank(&self, query: &str, docs: &[RerankDoc]) -> Result<Vec<RerankOutcome>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let Some(provider) = self.rerank.clone() else {
            return Err(QmdError::Provider {
                provider: "none",
                op: LlmOp::Rerank.name(),
                status: None,
                message: "no rerank provider configured".to_string(),
                url: String::new(),
            });
        };
        if let Err(until) = self.breaker.check(provider.kind.name()) {
            return Err(QmdError::CoolingDown {
                provider: provider.kind.name(),
                until,
            });
        }

        let result = match self.rerank_mode {
            RerankMode::Dedicated => self.rerank_dedicated(&provider, query, docs).await,
            RerankMode::Llm => self.rerank_via_llm(&provider, query, docs).await,
        };
        match &result {
            Ok(_) => self.breaker.record_success(provider.kind.name()),
            Err(_) => self.breaker.record_failure(provider.kind.name()),
        }
        result
    }

    async fn rerank_dedicated(
        &self,
        provider: &ProviderConfig,
        query: &str,
        docs: &[RerankDoc],
    ) -> Result<Vec<RerankOutcome>> {
        let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
        let url = provider.rerank_url();
        let headers = provider.auth_headers();

        let entries = match provider.kind {
            ProviderKind::DashScope => {
                let body = DashScopeRerankRequest {
                    model: &provider.rerank_model,
                    input: DashScopeRerankInput {
                        query,
                        documents: &texts,
                    },
                    parameters: DashScopeRerankParams {
                        top_n: texts.len(),
                        return_documents: false,
                    },
                };
                let resp: DashScopeRerankResponse = self
                    .transport
                    .post_json(provider.kind.name(), LlmOp::Rerank, &url, &headers, &body)
                    .await?;
                resp.output.results
            }
            _ => {
                let body = RerankRequest {
                    model: &provider.rerank_model,
                    query,
                    documents: &texts,
                    top_n: texts.len(),
                };
                let resp: RerankResponse = self
                    .transport
                    .post_json(provider.kind.name(), LlmOp::Rerank, &url, &headers, &body)
                    .await?;
                resp.results
            }
        };

        Ok(entries
            .into_iter()
            .filter(|e| e.index < docs.len())
            .map(|e| RerankOutcome {
                key: docs[e.index].key.clone(),
                score: e.relevance_score,
                extract: None,
            })
            .collect())
    }

    async fn rerank_via_llm(
        &self,
        provider: &ProviderConfig,
        query: &str,
        docs: &[RerankDoc],
    ) -> Result<Vec<RerankOutcome>> {
        let documents = docs
            .iter()
            .enumerate()
            .map(|(i, d)| format!("[{i}] {}", d.text.replace('\n', " ")))
            .collect::<Vec<_>>()
            .join("\n");

        let template = self
            .prompt_override
            .as_deref()
            .unwrap_or(DEFAULT_RERANK_PROMPT);
        let prompt = render_rerank_prompt(template, query, &documents);

        let key = cache_key(
            LlmOp::Rerank.name(),
            provider.kind.name(),
            &provider.chat_model,
            &json!({ "prompt": prompt }),
        );
        let raw = if let Some(cached) = match &self.cache {
            Some(cache) => cache.get(&key).await,
            None => None,
        } {
            cached
        } else {
            let raw = self
                .chat(provider, LlmOp::Rerank, None, &prompt)
                .await?;
            if let Some(cache) = &self.cache {
                cache.put(&key, &raw).await;
            }
            raw
        };

        Ok(parse_llm_rerank(&raw, docs.len())
            .into_iter()
            .enumerate()
            .map(|(rank, (index, extract))| RerankOutcome {
                key: docs[index].key.clone(),
                score: synthetic_score(rank),
                extract: Some(extract),
            })
            .collect())
    }
}
