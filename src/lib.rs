//! # qmd: Query Markdown Documents
//!
//! A hybrid search engine over local Markdown corpora: an embedded
//! SQLite index (FTS5 + chunk vectors) fronted by a multi-stage
//! retrieval pipeline and a remote LLM backplane, meant to serve AI
//! agents as a long-term memory backend via a CLI and an MCP-style tool
//! surface.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Collections │──▶│   Ingestion  │──▶│   SQLite    │
//! │ (index.yml) │   │ walk+filter  │   │ FTS5 + vec  │
//! └─────────────┘   │ hash+chunk   │   └──────┬──────┘
//!                   └──────────────┘          │
//!            ┌────────────────────────────────┤
//!            ▼                                ▼
//!      ┌──────────┐                    ┌─────────────┐
//!      │ Retrieval│◀──────────────────▶│ LLM gateway │
//!      │ pipeline │  expand/embed/     │ (remote)    │
//!      └────┬─────┘  rerank            └─────────────┘
//!           │
//!     ┌─────┴─────┐
//!     ▼           ▼
//! ┌───────┐   ┌───────┐
//! │  CLI  │   │  MCP  │
//! └───────┘   └───────┘
//! ```
//!
//! ## Retrieval pipeline
//!
//! 1. Unconditional BM25 probe; a strong, well-separated top hit skips
//!    query expansion entirely.
//! 2. LLM query expansion into `lex:` / `vec:` / `hyde:` variants, with
//!    a deterministic fallback on any failure.
//! 3. Parallel fan-out: one FTS search per lexical query, one vector
//!    search per semantic query (when the vector index exists).
//! 4. Reciprocal-rank fusion (`k = 60`, original lists weighted 2.0).
//! 5. Per-document chunk selection by fast term matching.
//! 6. LLM rerank (dedicated endpoint or chat-based extraction).
//! 7. Score blending, near-duplicate merging, limit.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`cli`] | clap command surface |
//! | [`collections`] | `index.yml` collections and context annotations |
//! | [`config`] | directories, `.env` overlay, environment knobs |
//! | [`engine`] | top-level owner of store, gateway, registry |
//! | [`store`] | SQLite persistence: documents, content, FTS, vectors |
//! | [`text`] | hashing, chunking, titles, query terms |
//! | [`ingest`] | filesystem reconciliation |
//! | [`embedder`] | vector index maintenance |
//! | [`llm`] | provider gateway: embed, expand, rerank |
//! | [`fusion`] | RRF, score blending, near-dup detection |
//! | [`search`] | the retrieval pipeline |
//! | [`get`] | file references, multi-get, listings |
//! | [`formatter`] | text/JSON/CSV/MD/XML/files output |
//! | [`progress`] | stderr progress reporting |
//! | [`mcp`] | HTTP tool surface |
//! | [`error`] | error taxonomy |

pub mod cli;
pub mod collections;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod formatter;
pub mod fusion;
pub mod get;
pub mod ingest;
pub mod llm;
pub mod mcp;
pub mod progress;
pub mod search;
pub mod store;
pub mod text;

pub use engine::Engine;
pub use error::{QmdError, Result};
pub use store::Store;
