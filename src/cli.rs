//! The `qmd` command surface.
//!
//! Global flags select the index, the output format, and result shaping;
//! subcommands cover collection and context management, ingestion,
//! embedding, the three search modes, maintenance, and the MCP server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Hybrid search over local Markdown corpora: BM25 + vectors + LLM
/// reranking, with collections, contexts, and an MCP tool surface.
#[derive(Parser)]
#[command(
    name = "qmd",
    version,
    about = "Query Markdown documents: hybrid BM25 + vector search with LLM reranking"
)]
pub struct Cli {
    /// Named index file to operate on (default: "index").
    #[arg(long, global = true)]
    pub index: Option<String>,

    /// Emit JSON on stdout; diagnostics move to stderr.
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit CSV on stdout.
    #[arg(long, global = true)]
    pub csv: bool,

    /// Emit Markdown on stdout.
    #[arg(long, global = true)]
    pub md: bool,

    /// Emit XML on stdout.
    #[arg(long, global = true)]
    pub xml: bool,

    /// Emit matching file paths only.
    #[arg(long, global = true)]
    pub files: bool,

    /// Maximum number of results.
    #[arg(short = 'n', long = "num", global = true)]
    pub limit: Option<usize>,

    /// Return every result (ignores -n).
    #[arg(long, global = true)]
    pub all: bool,

    /// Drop results scoring below this.
    #[arg(long, global = true)]
    pub min_score: Option<f64>,

    /// Print full bodies instead of snippets.
    #[arg(long, global = true)]
    pub full: bool,

    /// Prefix output lines with line numbers (get).
    #[arg(long, global = true)]
    pub line_numbers: bool,

    /// Restrict to a collection (repeatable).
    #[arg(short = 'c', long = "collection", global = true)]
    pub collections: Vec<String>,

    /// Extra context passed to query expansion.
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Per-operation timeout in milliseconds for outbound requests.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Keep stderr quiet (warnings and errors only).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage collections (named filesystem subtrees).
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Manage context annotations shown alongside results.
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// List collections, or files under `collection[/prefix]`.
    Ls {
        /// `collection` or `collection/prefix`; omit for all collections.
        target: Option<String>,
    },

    /// Print a document by reference: path, `qmd://collection/path`,
    /// `collection/path`, or `#docid`. A `:<line>` suffix starts there.
    Get {
        reference: String,

        /// First line to print (1-based).
        #[arg(long)]
        from: Option<usize>,

        /// Number of lines to print.
        #[arg(short = 'l', long = "lines")]
        lines: Option<usize>,
    },

    /// Print several documents: a glob over `collection/path` or a
    /// comma-separated list of references.
    MultiGet {
        pattern: String,

        /// Lines per document.
        #[arg(short = 'l', long = "lines")]
        lines: Option<usize>,

        /// Total body byte budget; bodies past it are omitted.
        #[arg(long)]
        max_bytes: Option<u64>,
    },

    /// Re-index every collection.
    Update {
        /// Run collections' declared update commands first.
        #[arg(long)]
        allow_run: bool,
    },

    /// Build or update the vector index.
    Embed {
        /// Drop all vectors first (required to switch models).
        #[arg(short, long)]
        force: bool,
    },

    /// Drop the LLM cache, prune inactive documents and orphans, compact.
    Cleanup,

    /// BM25 full-text search.
    Search { query: String },

    /// Vector-only semantic search.
    Vsearch { query: String },

    /// Full hybrid pipeline: expansion, fan-out, fusion, rerank.
    Query {
        query: String,

        /// Log per-stage timings.
        #[arg(long)]
        profile: bool,

        /// Verbose pipeline logging.
        #[arg(long)]
        verbose: bool,
    },

    /// Index health and provider readiness.
    Status,

    /// Serve the MCP-style HTTP tool surface.
    Mcp {
        /// Bind address.
        #[arg(long, default_value = "127.0.0.1:8765")]
        bind: String,
    },
}

#[derive(Subcommand)]
pub enum CollectionAction {
    /// Register a directory as a collection.
    Add {
        path: PathBuf,

        /// Collection name (default: derived from the directory name).
        #[arg(long)]
        name: Option<String>,

        /// Glob mask for files to index.
        #[arg(long, default_value = "**/*.md")]
        mask: String,
    },
    /// List registered collections.
    List,
    /// Remove a collection from the registry.
    Remove { name: String },
    /// Rename a collection (documents re-home on the next update).
    Rename { from: String, to: String },
}

#[derive(Subcommand)]
pub enum ContextAction {
    /// Attach a context note to a virtual path (`/` for global).
    Add {
        /// `[path] "text"`; with one argument the path defaults to `/`.
        #[arg(num_args = 1..=2, required = true)]
        args: Vec<String>,
    },
    /// List context annotations.
    List,
    /// Check annotations against the registry and the index.
    Check,
    /// Remove the annotation at a path.
    Rm { path: String },
}
