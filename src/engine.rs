//! The top-level engine: owns the store, the LLM gateway, the collection
//! registry snapshot, and the pipeline tuning. Everything else borrows
//! from it; no globals, no lazy singletons. Tests construct their own
//! engine around an in-memory store and a disabled gateway.

use std::sync::Arc;

use crate::collections::CollectionRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::fusion::SearchTuning;
use crate::llm::LlmGateway;
use crate::store::Store;

pub struct Engine {
    pub config: Config,
    pub registry: CollectionRegistry,
    pub store: Arc<Store>,
    pub gateway: LlmGateway,
    pub tuning: SearchTuning,
}

impl Engine {
    /// Open the engine for the configured index: load the collections
    /// snapshot, open the database, and resolve providers from the
    /// environment.
    pub async fn open(config: Config) -> Result<Self> {
        let registry = CollectionRegistry::load(&config.collections_path())?;
        let store = Arc::new(Store::open(&config.db_path()).await?);
        let gateway = LlmGateway::from_env(&config, Some(store.clone()));
        let tuning = SearchTuning {
            rerank_doc_limit: config.rerank_doc_limit,
            rerank_chunks_per_doc: config.rerank_chunks_per_doc,
            ..SearchTuning::default()
        };
        Ok(Self {
            config,
            registry,
            store,
            gateway,
            tuning,
        })
    }

    /// Assemble an engine from parts. Used by tests to inject an
    /// in-memory store or a disabled gateway.
    pub fn from_parts(
        config: Config,
        registry: CollectionRegistry,
        store: Arc<Store>,
        gateway: LlmGateway,
    ) -> Self {
        let tuning = SearchTuning {
            rerank_doc_limit: config.rerank_doc_limit,
            rerank_chunks_per_doc: config.rerank_chunks_per_doc,
            ..SearchTuning::default()
        };
        Self {
            config,
            registry,
            store,
            gateway,
            tuning,
        }
    }
}
