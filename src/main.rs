use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use qmd::cli::{Cli, Command, CollectionAction, ContextAction};
use qmd::collections::{derive_name, CollectionRegistry, CollectionSpec};
use qmd::config::Config;
use qmd::engine::Engine;
use qmd::error::QmdError;
use qmd::formatter::{format_documents, format_ls, format_results, OutputFormat};
use qmd::get::{resolve_fileref, run_ls, run_multi_get, similar_paths, slice_lines, GetOptions};
use qmd::ingest::{ingest_collection, run_update_command};
use qmd::progress::{NoProgress, ProgressSink, StderrProgress};
use qmd::search::{run_query, run_search, run_vsearch, QueryOptions};

fn init_tracing(quiet: bool, machine_output: bool, verbose: bool) {
    let filter = if let Ok(env) = std::env::var("QMD_LOG") {
        EnvFilter::new(env)
    } else if quiet || machine_output {
        // Machine formats keep stdout clean; diagnostics stay on stderr
        // and only warnings get through.
        EnvFilter::new("warn")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = OutputFormat::from_flags(cli.json, cli.csv, cli.md, cli.xml, cli.files);
    let verbose = matches!(&cli.command, Command::Query { verbose: true, .. });
    init_tracing(cli.quiet, format.is_machine(), verbose);

    if let Err(e) = run(cli, format).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load(cli.index.as_deref(), cli.timeout)?;

    // Global result-shaping flags, copied out before the command is
    // moved into the match.
    let limit_flag = cli.limit;
    let all = cli.all;
    let min_score = cli.min_score;
    let full = cli.full;
    let line_numbers = cli.line_numbers;
    let collections = cli.collections.clone();
    let context = cli.context.clone();
    let quiet = cli.quiet;

    match cli.command {
        Command::Collection { action } => {
            let mut registry = CollectionRegistry::load(&config.collections_path())?;
            match action {
                CollectionAction::Add { path, name, mask } => {
                    let root = path.canonicalize().map_err(|e| {
                        QmdError::Config(format!("cannot resolve {}: {e}", path.display()))
                    })?;
                    if !root.is_dir() {
                        return Err(QmdError::Config(format!(
                            "not a directory: {}",
                            root.display()
                        ))
                        .into());
                    }
                    let name = name.unwrap_or_else(|| derive_name(&root));
                    registry.add(CollectionSpec {
                        name: name.clone(),
                        root_path: root.clone(),
                        glob_pattern: mask,
                        update_command: None,
                    })?;
                    println!("Added collection '{name}' -> {}", root.display());
                    println!("Run `qmd update` to index it.");
                }
                CollectionAction::List => {
                    let collections = registry.collections();
                    if collections.is_empty() {
                        println!("No collections registered.");
                    }
                    for spec in collections {
                        println!(
                            "{}\t{}\t{}",
                            spec.name,
                            spec.root_path.display(),
                            spec.glob_pattern
                        );
                    }
                }
                CollectionAction::Remove { name } => {
                    registry.remove(&name)?;
                    println!("Removed collection '{name}'.");
                    println!("Run `qmd update && qmd cleanup` to drop its documents.");
                }
                CollectionAction::Rename { from, to } => {
                    registry.rename(&from, &to)?;
                    println!("Renamed collection '{from}' -> '{to}'.");
                    println!("Run `qmd update` to re-home its documents.");
                }
            }
        }

        Command::Context { action } => {
            let mut registry = CollectionRegistry::load(&config.collections_path())?;
            match action {
                ContextAction::Add { args } => {
                    let (path, text) = match args.as_slice() {
                        [text] => ("/".to_string(), text.clone()),
                        [path, text] => (path.clone(), text.clone()),
                        _ => unreachable!("clap bounds num_args"),
                    };
                    registry.set_context(&path, &text)?;
                    println!("Added context for '{path}'.");
                }
                ContextAction::List => {
                    let contexts = registry.contexts();
                    if contexts.is_empty() {
                        println!("No contexts defined.");
                    }
                    for ctx in contexts {
                        println!("{}\t{}", ctx.path, ctx.text);
                    }
                }
                ContextAction::Check => {
                    let engine = Engine::open(config).await?;
                    let mut problems = 0usize;
                    for ctx in engine.registry.contexts() {
                        if ctx.path == "/" {
                            continue;
                        }
                        let (collection, prefix) = match ctx.path.split_once('/') {
                            Some((c, p)) => (c, Some(p)),
                            None => (ctx.path.as_str(), None),
                        };
                        if engine.registry.get(collection).is_none() {
                            println!("'{}': unknown collection '{collection}'", ctx.path);
                            problems += 1;
                            continue;
                        }
                        let docs = engine.store.list_active(Some(collection), prefix).await?;
                        if docs.is_empty() {
                            println!("'{}': no documents under this prefix", ctx.path);
                            problems += 1;
                        }
                    }
                    if problems == 0 {
                        println!("All contexts resolve.");
                    }
                }
                ContextAction::Rm { path } => {
                    registry.remove_context(&path)?;
                    println!("Removed context for '{path}'.");
                }
            }
        }

        Command::Ls { target } => {
            let engine = Engine::open(config).await?;
            let listing = run_ls(&engine, target.as_deref()).await?;
            print!("{}", format_ls(&listing, format));
        }

        Command::Get { reference, from, lines } => {
            let engine = Engine::open(config).await?;
            let (reference, line_start) = split_line_suffix(&reference);
            let file = match resolve_fileref(&engine, reference).await {
                Ok(f) => f,
                Err(e @ QmdError::NotFound { .. }) => {
                    let suggestions = similar_paths(&engine, reference, 3).await;
                    if !suggestions.is_empty() {
                        eprintln!("Did you mean:");
                        for s in suggestions {
                            eprintln!("  qmd://{s}");
                        }
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            let opts = GetOptions {
                from_line: from.or(line_start),
                line_count: lines,
                line_numbers,
            };
            if format == OutputFormat::Json {
                let content = slice_lines(&file.body, &opts);
                println!(
                    "{}",
                    serde_json::json!({
                        "file": format!("qmd://{}/{}", file.collection, file.path),
                        "title": file.title,
                        "docid": file.docid,
                        "content": content,
                    })
                );
            } else {
                print!("{}", slice_lines(&file.body, &opts));
            }
        }

        Command::MultiGet { pattern, lines, max_bytes } => {
            let engine = Engine::open(config).await?;
            let mut files = run_multi_get(&engine, &pattern, max_bytes).await?;
            if let Some(n) = lines {
                let opts = GetOptions {
                    from_line: None,
                    line_count: Some(n),
                    line_numbers,
                };
                for file in files.iter_mut() {
                    file.body = slice_lines(&file.body, &opts);
                }
            }
            if files.is_empty() {
                eprintln!("No documents match '{pattern}'");
            }
            print!("{}", format_documents(&files, format, full));
        }

        Command::Update { allow_run } => {
            let engine = Engine::open(config).await?;
            if engine.registry.collections().is_empty() {
                eprintln!("No collections registered. Use `qmd collection add <path>`.");
                return Ok(());
            }
            for spec in engine.registry.collections() {
                if allow_run {
                    if let Err(e) = run_update_command(spec).await {
                        tracing::warn!(collection = %spec.name, error = %e, "update command failed");
                    }
                } else if spec.update_command.is_some() {
                    tracing::info!(
                        collection = %spec.name,
                        "collection declares an update command; pass --allow-run to execute it"
                    );
                }
                match ingest_collection(
                    &engine.store,
                    spec,
                    engine.config.max_index_file_bytes,
                )
                .await
                {
                    Ok(summary) => {
                        println!(
                            "{}: {} scanned, {} added, {} updated, {} unchanged, {} deactivated",
                            spec.name,
                            summary.scanned,
                            summary.added,
                            summary.updated + summary.title_updated,
                            summary.unchanged,
                            summary.deactivated
                        );
                        let skips = summary.skipped;
                        if skips.total() > 0 {
                            println!(
                                "  skipped: {} symlink escapes, {} too large, {} binary, {} unreadable",
                                skips.symlink_escape, skips.too_large, skips.binary, skips.unreadable
                            );
                        }
                    }
                    Err(e) => {
                        eprintln!("Warning: collection '{}' failed: {e}", spec.name);
                    }
                }
            }
            let health = engine.store.index_health().await?;
            if health.needs_embedding > 0 {
                println!(
                    "{} document(s) need embedding; run `qmd embed`.",
                    health.needs_embedding
                );
            }
        }

        Command::Embed { force } => {
            let engine = Engine::open(config).await?;
            let progress: Box<dyn ProgressSink> = if format.is_machine() || quiet {
                Box::new(NoProgress)
            } else {
                Box::new(StderrProgress::new())
            };
            let summary =
                qmd::embedder::run_embed(&engine.store, &engine.gateway, force, progress.as_ref())
                    .await?;
            println!(
                "embedded {} chunk(s) across {} document(s) ({} failed)",
                summary.embedded, summary.hashes, summary.failed
            );
        }

        Command::Cleanup => {
            let engine = Engine::open(config).await?;
            let cache = engine.store.clear_llm_cache().await?;
            let inactive = engine.store.delete_inactive_documents().await?;
            let content = engine.store.cleanup_orphaned_content().await?;
            let vectors = engine.store.cleanup_orphaned_vectors().await?;
            engine.store.vacuum().await?;
            println!(
                "cleanup: {cache} cached responses, {inactive} inactive documents, {content} orphaned blobs, {vectors} orphaned vectors"
            );
        }

        Command::Search { query } => {
            let engine = Engine::open(config).await?;
            let limit = effective_limit(limit_flag, all, 10);
            let mut results = run_search(&engine, &query, limit, &collections).await?;
            if let Some(min) = min_score {
                results.retain(|r| r.score >= min);
            }
            print!("{}", format_results(&results, format, full));
        }

        Command::Vsearch { query } => {
            let engine = Engine::open(config).await?;
            let limit = effective_limit(limit_flag, all, 10);
            match run_vsearch(
                &engine,
                &query,
                limit,
                min_score.unwrap_or(0.3),
                &collections,
            )
            .await
            {
                Ok(results) => print!("{}", format_results(&results, format, full)),
                Err(QmdError::VectorUnavailable) => {
                    eprintln!("{}", QmdError::VectorUnavailable);
                    print!("{}", format_results(&[], format, full));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Command::Query { query, profile, .. } => {
            let engine = Engine::open(config).await?;
            let opts = QueryOptions {
                limit: effective_limit(limit_flag, all, 10),
                min_score: min_score.unwrap_or(0.0),
                all,
                collections: collections.clone(),
                context: context.clone(),
                profile,
            };
            let results = run_query(&engine, &query, &opts).await?;
            print!("{}", format_results(&results, format, full));
        }

        Command::Status => {
            let engine = Engine::open(config).await?;
            let health = engine.store.index_health().await?;
            let vectors = engine.store.count_vectors().await?;
            let content = engine.store.count_content().await?;

            if format == OutputFormat::Json {
                let providers: serde_json::Map<String, serde_json::Value> = engine
                    .gateway
                    .provider_summary()
                    .into_iter()
                    .map(|(op, p)| {
                        (
                            op.to_string(),
                            p.map(|v| serde_json::Value::String(v.to_string()))
                                .unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "index": engine.config.db_path(),
                        "collections": engine.registry.collections().len(),
                        "documents": health.total_docs,
                        "content_blobs": content,
                        "vectors": vectors,
                        "needs_embedding": health.needs_embedding,
                        "days_stale": health.days_stale,
                        "providers": providers,
                    })
                );
            } else {
                println!("Index: {}", engine.config.db_path().display());
                println!("Collections: {}", engine.registry.collections().len());
                for spec in engine.registry.collections() {
                    println!("  {}: {}", spec.name, spec.root_path.display());
                }
                println!("Documents: {}", health.total_docs);
                println!("Content blobs: {content}");
                println!("Vectors: {vectors}");
                println!("Needs embedding: {}", health.needs_embedding);
                println!("Days stale: {}", health.days_stale);
                println!("Providers:");
                for (op, provider) in engine.gateway.provider_summary() {
                    println!("  {op}: {}", provider.unwrap_or("none"));
                }
            }
        }

        Command::Mcp { bind } => {
            let engine = Arc::new(Engine::open(config).await?);
            qmd::mcp::run_server(engine, &bind).await?;
        }
    }

    Ok(())
}

fn effective_limit(limit_flag: Option<usize>, all: bool, default: usize) -> usize {
    if all {
        usize::MAX
    } else {
        limit_flag.unwrap_or(default)
    }
}

/// Split a trailing `:<line>` off a get reference.
fn split_line_suffix(reference: &str) -> (&str, Option<usize>) {
    if let Some((head, tail)) = reference.rsplit_once(':') {
        if !head.is_empty() && !head.ends_with('/') && tail.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(line) = tail.parse::<usize>() {
                return (head, Some(line));
            }
        }
    }
    (reference, None)
}
