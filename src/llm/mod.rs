//! Remote LLM gateway: provider-agnostic embedding, query expansion, and
//! reranking over HTTP.
//!
//! One provider is resolved per operation at construction time: forced
//! via `QMD_*_PROVIDER` variables or auto-routed through the capability
//! matrix in priority order. The gateway owns the HTTP client, the
//! per-provider circuit breaker, and the optional response cache; it
//! holds no reference to the retrieval engine and mutates no shared
//! configuration.

mod breaker;
mod cache;
mod expand;
mod providers;
mod rerank;
mod transport;

pub use breaker::{CircuitBreaker, FAILURE_THRESHOLD};
pub use cache::{cache_key, canonical_json, LlmCache};
pub use expand::{fallback_expansion, parse_expansion, QueryType, Queryable};
pub use providers::{LlmOp, ProviderConfig, ProviderKind, ROUTING_ORDER};
pub use rerank::{
    parse_llm_rerank, render_rerank_prompt, synthetic_score, RerankDoc, RerankOutcome,
    DEFAULT_RERANK_PROMPT,
};
pub use transport::{backoff_delay, is_retryable_status, op_timeout, MAX_ATTEMPTS};

use std::sync::Arc;

use providers::{ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use providers::{GeminiContent, GeminiPart, GeminiRequest, GeminiResponse};
use transport::Transport;

use crate::config::{Config, RerankMode};
use crate::error::{QmdError, Result};
use crate::store::Store;

pub struct LlmGateway {
    transport: Transport,
    breaker: CircuitBreaker,
    embed: Option<ProviderConfig>,
    expand: Option<ProviderConfig>,
    rerank: Option<ProviderConfig>,
    rerank_mode: RerankMode,
    cache: Option<LlmCache>,
    prompt_override: Option<String>,
    embed_batch_size: usize,
}

impl LlmGateway {
    /// Resolve providers from the environment. The optional `cache_store`
    /// backs the LLM response cache when `QMD_LLM_CACHE` is set.
    pub fn from_env(config: &Config, cache_store: Option<Arc<Store>>) -> Self {
        let rerank_mode = config.rerank_mode;
        let prompt_override = std::fs::read_to_string(config.rerank_prompt_path())
            .ok()
            .filter(|s| !s.trim().is_empty());
        if prompt_override.is_some() {
            tracing::debug!("using rerank prompt override from config dir");
        }

        Self {
            transport: Transport::new(config.timeout_override),
            breaker: CircuitBreaker::new(config.breaker_cooldown),
            embed: resolve_provider(LlmOp::Embed, "QMD_EMBED_PROVIDER", rerank_mode),
            expand: resolve_provider(LlmOp::Expand, "QMD_QUERY_EXPANSION_PROVIDER", rerank_mode),
            rerank: resolve_provider(LlmOp::Rerank, "QMD_RERANK_PROVIDER", rerank_mode),
            rerank_mode,
            cache: cache_store
                .filter(|_| config.llm_cache)
                .map(LlmCache::new),
            prompt_override,
            embed_batch_size: config.embed_batch_size,
        }
    }

    /// Assemble a gateway from explicit provider configurations instead
    /// of the environment. Tests point this at stub servers; embedders
    /// use it to avoid environment coupling.
    pub fn with_providers(
        config: &Config,
        embed: Option<ProviderConfig>,
        expand: Option<ProviderConfig>,
        rerank: Option<ProviderConfig>,
    ) -> Self {
        Self {
            transport: Transport::new(config.timeout_override),
            breaker: CircuitBreaker::new(config.breaker_cooldown),
            embed,
            expand,
            rerank,
            rerank_mode: config.rerank_mode,
            cache: None,
            prompt_override: None,
            embed_batch_size: config.embed_batch_size,
        }
    }

    /// A gateway with no providers at all; every best-effort operation
    /// degrades and every required operation fails. Used by tests and by
    /// commands that must work offline.
    pub fn disabled(config: &Config) -> Self {
        Self::with_providers(config, None, None, None)
    }

    pub fn has_embed_provider(&self) -> bool {
        self.embed.is_some()
    }

    pub fn has_rerank_provider(&self) -> bool {
        self.rerank.is_some()
    }

    pub fn embed_model(&self) -> Option<&str> {
        self.embed.as_ref().map(|p| p.embed_model.as_str())
    }

    pub fn embed_batch_size(&self) -> usize {
        self.embed_batch_size
    }

    /// Provider names per operation, for `status`.
    pub fn provider_summary(&self) -> Vec<(&'static str, Option<&'static str>)> {
        vec![
            ("embed", self.embed.as_ref().map(|p| p.kind.name())),
            ("expand", self.expand.as_ref().map(|p| p.kind.name())),
            ("rerank", self.rerank.as_ref().map(|p| p.kind.name())),
        ]
    }

    /// Embed a batch, preserving input order. Inputs the provider did not
    /// return a vector for come back as `None` rather than failing the
    /// whole batch. Embedding is a required operation: an open circuit
    /// fails fast.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let provider = self.embed.clone().ok_or_else(|| QmdError::Provider {
            provider: "none",
            op: LlmOp::Embed.name(),
            status: None,
            message: "no embedding provider configured (set SILICONFLOW_API_KEY or OPENAI_API_KEY)"
                .to_string(),
            url: String::new(),
        })?;
        if let Err(until) = self.breaker.check(provider.kind.name()) {
            return Err(QmdError::CoolingDown {
                provider: provider.kind.name(),
                until,
            });
        }

        let body = EmbeddingRequest {
            model: &provider.embed_model,
            input: texts,
        };
        let result: Result<EmbeddingResponse> = self
            .transport
            .post_json(
                provider.kind.name(),
                LlmOp::Embed,
                &provider.embed_url(),
                &provider.auth_headers(),
                &body,
            )
            .await;

        let resp = match result {
            Ok(r) => {
                self.breaker.record_success(provider.kind.name());
                r
            }
            Err(e) => {
                self.breaker.record_failure(provider.kind.name());
                return Err(e);
            }
        };

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for datum in resp.data {
            if let Some(slot) = slots.get_mut(datum.index) {
                *slot = Some(datum.embedding);
            }
        }
        Ok(slots)
    }

    /// Embed a single text, failing when the provider returned no vector.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut slots = self.embed_batch(&[text.to_string()]).await?;
        slots
            .pop()
            .flatten()
            .ok_or_else(|| QmdError::Provider {
                provider: self
                    .embed
                    .as_ref()
                    .map(|p| p.kind.name())
                    .unwrap_or("none"),
                op: LlmOp::Embed.name(),
                status: None,
                message: "provider returned no vector".to_string(),
                url: String::new(),
            })
    }

    /// One probe call to learn the embedding dimension.
    pub async fn probe_dimension(&self) -> Result<usize> {
        let v = self.embed_one("dimension probe").await?;
        if v.is_empty() {
            return Err(QmdError::Provider {
                provider: self
                    .embed
                    .as_ref()
                    .map(|p| p.kind.name())
                    .unwrap_or("none"),
                op: LlmOp::Embed.name(),
                status: None,
                message: "provider returned an empty vector".to_string(),
                url: String::new(),
            });
        }
        Ok(v.len())
    }

    /// Chat/generate across provider dialects, returning the first
    /// message text.
    pub(crate) async fn chat(
        &self,
        provider: &ProviderConfig,
        op: LlmOp,
        system: Option<&str>,
        user: &str,
    ) -> Result<String> {
        let url = provider.chat_url();
        let headers = provider.auth_headers();

        match provider.kind {
            ProviderKind::Gemini => {
                let text = match system {
                    Some(sys) => format!("{sys}\n\n{user}"),
                    None => user.to_string(),
                };
                let body = GeminiRequest {
                    contents: vec![GeminiContent {
                        parts: vec![GeminiPart { text }],
                    }],
                };
                let resp: GeminiResponse = self
                    .transport
                    .post_json(provider.kind.name(), op, &url, &headers, &body)
                    .await?;
                resp.first_text()
                    .map(str::to_string)
                    .ok_or_else(|| QmdError::Provider {
                        provider: provider.kind.name(),
                        op: op.name(),
                        status: None,
                        message: "empty candidates in generate response".to_string(),
                        url,
                    })
            }
            _ => {
                let mut messages = Vec::with_capacity(2);
                if let Some(sys) = system {
                    messages.push(ChatMessage {
                        role: "system".to_string(),
                        content: sys.to_string(),
                    });
                }
                messages.push(ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                });
                let body = ChatRequest {
                    model: &provider.chat_model,
                    messages,
                    temperature: 0.0,
                };
                let resp: ChatResponse = self
                    .transport
                    .post_json(provider.kind.name(), op, &url, &headers, &body)
                    .await?;
                resp.first_content()
                    .map(str::to_string)
                    .ok_or_else(|| QmdError::Provider {
                        provider: provider.kind.name(),
                        op: op.name(),
                        status: None,
                        message: "empty choices in chat response".to_string(),
                        url,
                    })
            }
        }
    }
}

/// Pick the provider for an operation: the forced one when its
/// environment variable names a usable provider, otherwise the first
/// enabled provider in routing order that supports the operation.
fn resolve_provider(
    op: LlmOp,
    force_env: &str,
    rerank_mode: RerankMode,
) -> Option<ProviderConfig> {
    if let Ok(forced) = std::env::var(force_env) {
        match ProviderKind::from_name(&forced) {
            Some(kind) if kind.supports(op, rerank_mode) => {
                match ProviderConfig::from_env(kind) {
                    Some(cfg) => return Some(cfg),
                    None => {
                        tracing::warn!(
                            provider = kind.name(),
                            op = op.name(),
                            "forced provider has no API key, falling back to auto-routing"
                        );
                    }
                }
            }
            Some(kind) => {
                tracing::warn!(
                    provider = kind.name(),
                    op = op.name(),
                    "forced provider does not support this operation, auto-routing"
                );
            }
            None => {
                tracing::warn!(value = %forced, "unrecognized provider name, auto-routing");
            }
        }
    }

    ROUTING_ORDER
        .into_iter()
        .filter(|kind| kind.supports(op, rerank_mode))
        .find_map(ProviderConfig::from_env)
}
