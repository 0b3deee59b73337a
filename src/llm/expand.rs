//! Query expansion: one lexical, one vector, one HyDE rewrite per query.
//!
//! The model is prompted for exactly three labeled lines; parsing is
//! tolerant (case-insensitive prefixes, unknown lines ignored) and any
//! failure (parse, provider, or open circuit) degrades to a
//! deterministic fallback. Expansion never returns an error.

use serde_json::json;

use super::cache::cache_key;
use super::providers::LlmOp;
use super::LlmGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Keyword query for the BM25 index.
    Lex,
    /// Semantic query for the vector index.
    Vec,
    /// Hypothetical document passage, embedded as-is.
    Hyde,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Queryable {
    pub qtype: QueryType,
    pub text: String,
}

pub(super) const EXPANSION_SYSTEM: &str = "\
You rewrite search queries for a hybrid retrieval system over personal \
Markdown notes. Reply with exactly three lines and no other prose:\n\
lex: <keyword query for a full-text index>\n\
vec: <natural-language query for semantic search>\n\
hyde: <one-sentence hypothetical passage that would answer the query>";

pub(super) fn expansion_user_prompt(query: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("Context: {ctx}\nQuery: {query}")
        }
        _ => format!("Query: {query}"),
    }
}

/// Parse the model's reply. Lines with an unknown prefix are ignored;
/// duplicate labels keep the first occurrence.
pub fn parse_expansion(raw: &str) -> Vec<Queryable> {
    let mut out: Vec<Queryable> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        let qtype = match label.trim().to_ascii_lowercase().as_str() {
            "lex" => QueryType::Lex,
            "vec" => QueryType::Vec,
            "hyde" => QueryType::Hyde,
            _ => continue,
        };
        let text = rest.trim();
        if text.is_empty() || out.iter().any(|q| q.qtype == qtype) {
            continue;
        }
        out.push(Queryable {
            qtype,
            text: text.to_string(),
        });
    }
    out
}

/// Deterministic expansion used whenever the model cannot be asked or
/// cannot be understood.
pub fn fallback_expansion(query: &str, include_lexical: bool) -> Vec<Queryable> {
    let mut out = Vec::with_capacity(3);
    if include_lexical {
        out.push(Queryable {
            qtype: QueryType::Lex,
            text: query.to_string(),
        });
    }
    out.push(Queryable {
        qtype: QueryType::Vec,
        text: query.to_string(),
    });
    out.push(Queryable {
        qtype: QueryType::Hyde,
        text: format!("Information about {query}"),
    });
    out
}

impl LlmGateway {
    /// Expand a query into retrieval variants. Best-effort: provider
    /// failures and open circuits degrade to [`fallback_expansion`].
    pub async fn expand_query(
        &self,
        query: &str,
        include_lexical: bool,
        context: Option<&str>,
    ) -> Vec<Queryable> {
        let Some(provider) = self.expand.clone() else {
            return fallback_expansion(query, include_lexical);
        };
        if self.breaker.check(provider.kind.name()).is_err() {
            tracing::debug!(provider = provider.kind.name(), "circuit open, fallback expansion");
            return fallback_expansion(query, include_lexical);
        }

        let user = expansion_user_prompt(query, context);
        let key = cache_key(
            LlmOp::Expand.name(),
            provider.kind.name(),
            &provider.chat_model,
            &json!({ "system": EXPANSION_SYSTEM, "user": user }),
        );
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key).await {
                let parsed = parse_expansion(&hit);
                if !parsed.is_empty() {
                    return parsed;
                }
            }
        }

        let raw = match self.chat(&provider, LlmOp::Expand, Some(EXPANSION_SYSTEM), &user).await {
            Ok(raw) => {
                self.breaker.record_success(provider.kind.name());
                raw
            }
            Err(e) => {
                self.breaker.record_failure(provider.kind.name());
                tracing::warn!(error = %e, "query expansion failed, using fallback");
                return fallback_expansion(query, include_lexical);
            }
        };

        let parsed = parse_expansion(&raw);
        if parsed.is_empty() {
            tracing::warn!("query expansion reply had no usable lines, using fallback");
            return fallback_expansion(query, include_lexical);
        }
        if let Some(cache) = &self.cache {
            cache.put(&key, &raw).await;
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_labeled_lines() {
        let out = parse_expansion("lex: pasta water ratio\nvec: how much water for pasta\nhyde: Use one liter of water per 100g of pasta.");
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].qtype, QueryType::Lex);
        assert_eq!(out[1].qtype, QueryType::Vec);
        assert_eq!(out[2].qtype, QueryType::Hyde);
        assert_eq!(out[0].text, "pasta water ratio");
    }

    #[test]
    fn parsing_is_tolerant() {
        let out = parse_expansion(
            "Sure! Here are your queries:\nLEX: alpha\nnonsense line\nVec: beta\nHYDE: gamma\nhyde: duplicate ignored",
        );
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text, "alpha");
        assert_eq!(out[2].text, "gamma");
    }

    #[test]
    fn empty_reply_parses_to_nothing() {
        assert!(parse_expansion("").is_empty());
        assert!(parse_expansion("no labels here").is_empty());
        assert!(parse_expansion("lex:   ").is_empty());
    }

    #[test]
    fn fallback_shape() {
        let out = fallback_expansion("pasta", true);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].qtype, QueryType::Lex);
        assert_eq!(out[0].text, "pasta");
        assert_eq!(out[1].qtype, QueryType::Vec);
        assert_eq!(out[2].text, "Information about pasta");

        let out = fallback_expansion("pasta", false);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].qtype, QueryType::Vec);
    }

    #[test]
    fn user_prompt_carries_context() {
        assert_eq!(expansion_user_prompt("q", None), "Query: q");
        assert_eq!(
            expansion_user_prompt("q", Some("recipe notes")),
            "Context: recipe notes\nQuery: q"
        );
        assert_eq!(expansion_user_prompt("q", Some("  ")), "Query: q");
    }
}
