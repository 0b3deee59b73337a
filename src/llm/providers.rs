//! Provider kinds, capability routing, and typed wire structs.
//!
//! Each provider configuration is a tagged value resolved once from the
//! environment; response shapes are strongly typed per provider so shape
//! errors surface as `ProviderError` instead of silent `null` plucking.

use serde::{Deserialize, Serialize};

use crate::config::RerankMode;

/// Gateway operations with per-operation timeouts and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmOp {
    Embed,
    /// Query expansion rides the chat/generate endpoint.
    Expand,
    Rerank,
}

impl LlmOp {
    pub fn name(self) -> &'static str {
        match self {
            LlmOp::Embed => "embed",
            LlmOp::Expand => "expand",
            LlmOp::Rerank => "rerank",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    SiliconFlow,
    OpenAiCompat,
    Gemini,
    DashScope,
}

/// Auto-routing order when no provider is forced for an operation.
pub const ROUTING_ORDER: [ProviderKind; 4] = [
    ProviderKind::SiliconFlow,
    ProviderKind::OpenAiCompat,
    ProviderKind::Gemini,
    ProviderKind::DashScope,
];

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::SiliconFlow => "siliconflow",
            ProviderKind::OpenAiCompat => "openai-compat",
            ProviderKind::Gemini => "gemini",
            ProviderKind::DashScope => "dashscope",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "siliconflow" => Some(ProviderKind::SiliconFlow),
            "openai-compat" | "openai" => Some(ProviderKind::OpenAiCompat),
            "gemini" => Some(ProviderKind::Gemini),
            "dashscope" => Some(ProviderKind::DashScope),
            _ => None,
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            ProviderKind::SiliconFlow => "SILICONFLOW_API_KEY",
            ProviderKind::OpenAiCompat => "OPENAI_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::DashScope => "DASHSCOPE_API_KEY",
        }
    }

    /// The capability matrix. Rerank support depends on the configured
    /// mode: dedicated endpoints exist on siliconflow and dashscope,
    /// chat-based reranking anywhere a chat endpoint exists.
    pub fn supports(self, op: LlmOp, rerank_mode: RerankMode) -> bool {
        match op {
            LlmOp::Embed => matches!(self, ProviderKind::SiliconFlow | ProviderKind::OpenAiCompat),
            LlmOp::Expand => matches!(
                self,
                ProviderKind::SiliconFlow | ProviderKind::OpenAiCompat | ProviderKind::Gemini
            ),
            LlmOp::Rerank => match rerank_mode {
                RerankMode::Dedicated => {
                    matches!(self, ProviderKind::SiliconFlow | ProviderKind::DashScope)
                }
                RerankMode::Llm => matches!(
                    self,
                    ProviderKind::SiliconFlow | ProviderKind::OpenAiCompat | ProviderKind::Gemini
                ),
            },
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::SiliconFlow => "https://api.siliconflow.cn/v1",
            ProviderKind::OpenAiCompat => "https://api.openai.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::DashScope => "https://dashscope.aliyuncs.com/api/v1",
        }
    }

    fn default_embed_model(self) -> &'static str {
        match self {
            ProviderKind::SiliconFlow => "BAAI/bge-m3",
            _ => "text-embedding-3-small",
        }
    }

    fn default_chat_model(self) -> &'static str {
        match self {
            ProviderKind::SiliconFlow => "Qwen/Qwen2.5-7B-Instruct",
            ProviderKind::Gemini => "gemini-2.0-flash",
            _ => "gpt-4o-mini",
        }
    }

    fn default_rerank_model(self) -> &'static str {
        match self {
            ProviderKind::DashScope => "gte-rerank-v2",
            _ => "BAAI/bge-reranker-v2-m3",
        }
    }
}

/// A resolved provider: credentials, endpoint, and per-operation models.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub embed_model: String,
    pub chat_model: String,
    pub rerank_model: String,
}

impl ProviderConfig {
    /// Build from the environment; `None` when the provider's API key is
    /// absent (the provider is simply not enabled).
    pub fn from_env(kind: ProviderKind) -> Option<Self> {
        let api_key = std::env::var(kind.api_key_env()).ok().filter(|k| !k.is_empty())?;
        let base_url = match kind {
            ProviderKind::OpenAiCompat => std::env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| kind.default_base_url().to_string()),
            _ => kind.default_base_url().to_string(),
        };
        Some(Self {
            kind,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model: std::env::var("QMD_EMBED_MODEL")
                .unwrap_or_else(|_| kind.default_embed_model().to_string()),
            chat_model: std::env::var("QMD_CHAT_MODEL")
                .unwrap_or_else(|_| kind.default_chat_model().to_string()),
            rerank_model: std::env::var("QMD_RERANK_MODEL")
                .unwrap_or_else(|_| kind.default_rerank_model().to_string()),
        })
    }

    pub fn embed_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    pub fn chat_url(&self) -> String {
        match self.kind {
            ProviderKind::Gemini => format!(
                "{}/models/{}:generateContent",
                self.base_url, self.chat_model
            ),
            _ => format!("{}/chat/completions", self.base_url),
        }
    }

    pub fn rerank_url(&self) -> String {
        match self.kind {
            ProviderKind::DashScope => format!(
                "{}/services/rerank/text-rerank/text-rerank",
                self.base_url
            ),
            _ => format!("{}/rerank", self.base_url),
        }
    }

    /// Auth headers for this provider. Gemini keys ride a dedicated
    /// header, everything else is a bearer token.
    pub fn auth_headers(&self) -> Vec<(&'static str, String)> {
        match self.kind {
            ProviderKind::Gemini => vec![("x-goog-api-key", self.api_key.clone())],
            _ => vec![("Authorization", format!("Bearer {}", self.api_key))],
        }
    }
}

// ---- OpenAI-style wire shapes (siliconflow, openai-compat) ----

#[derive(Debug, Serialize)]
pub struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: &'a [String],
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingDatum {
    pub index: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessageBody,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageBody {
    pub content: String,
}

impl ChatResponse {
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct RerankRequest<'a> {
    pub model: &'a str,
    pub query: &'a str,
    pub documents: &'a [String],
    /// Always the number of candidates, never a constant.
    pub top_n: usize,
}

#[derive(Debug, Deserialize)]
pub struct RerankResponse {
    pub results: Vec<RerankEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RerankEntry {
    pub index: usize,
    pub relevance_score: f64,
}

// ---- DashScope rerank shapes ----

#[derive(Debug, Serialize)]
pub struct DashScopeRerankRequest<'a> {
    pub model: &'a str,
    pub input: DashScopeRerankInput<'a>,
    pub parameters: DashScopeRerankParams,
}

#[derive(Debug, Serialize)]
pub struct DashScopeRerankInput<'a> {
    pub query: &'a str,
    pub documents: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct DashScopeRerankParams {
    pub top_n: usize,
    pub return_documents: bool,
}

#[derive(Debug, Deserialize)]
pub struct DashScopeRerankResponse {
    pub output: DashScopeRerankOutput,
}

#[derive(Debug, Deserialize)]
pub struct DashScopeRerankOutput {
    pub results: Vec<RerankEntry>,
}

// ---- Gemini generate shapes ----

#[derive(Debug, Serialize)]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiContent {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiPart {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct GeminiResponse {
    pub candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiCandidate {
    pub content: GeminiContent,
}

impl GeminiResponse {
    pub fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_matrix_matches_contract() {
        use LlmOp::*;
        use ProviderKind::*;

        assert!(SiliconFlow.supports(Embed, RerankMode::Llm));
        assert!(OpenAiCompat.supports(Embed, RerankMode::Llm));
        assert!(!Gemini.supports(Embed, RerankMode::Llm));
        assert!(!DashScope.supports(Embed, RerankMode::Llm));

        assert!(SiliconFlow.supports(Expand, RerankMode::Llm));
        assert!(OpenAiCompat.supports(Expand, RerankMode::Llm));
        assert!(Gemini.supports(Expand, RerankMode::Llm));
        assert!(!DashScope.supports(Expand, RerankMode::Llm));

        assert!(SiliconFlow.supports(Rerank, RerankMode::Dedicated));
        assert!(DashScope.supports(Rerank, RerankMode::Dedicated));
        assert!(!OpenAiCompat.supports(Rerank, RerankMode::Dedicated));
        assert!(!Gemini.supports(Rerank, RerankMode::Dedicated));

        assert!(SiliconFlow.supports(Rerank, RerankMode::Llm));
        assert!(OpenAiCompat.supports(Rerank, RerankMode::Llm));
        assert!(Gemini.supports(Rerank, RerankMode::Llm));
        assert!(!DashScope.supports(Rerank, RerankMode::Llm));
    }

    #[test]
    fn provider_names_round_trip() {
        for kind in ROUTING_ORDER {
            assert_eq!(ProviderKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ProviderKind::from_name("openai"), Some(ProviderKind::OpenAiCompat));
        assert_eq!(ProviderKind::from_name("nope"), None);
    }

    #[test]
    fn typed_responses_parse() {
        let raw = r#"{"data":[{"index":1,"embedding":[0.5,0.25]},{"index":0,"embedding":[1.0]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].index, 1);

        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.first_content(), Some("hi"));

        let raw = r#"{"output":{"results":[{"index":2,"relevance_score":0.9}]}}"#;
        let parsed: DashScopeRerankResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.output.results[0].index, 2);

        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"out"}]}}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.first_text(), Some("out"));
    }
}
