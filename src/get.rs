//! Document retrieval by reference: `qmd://collection/path`,
//! `collection/path`, a bare path, or `#docid` (6-char content-hash
//! prefix). Misses come back as `NotFound`; the CLI offers fuzzy path
//! suggestions on top.

use globset::Glob;

use crate::engine::Engine;
use crate::error::{QmdError, Result};
use crate::fusion::bigram_jaccard;
use crate::store::DocumentRow;

/// A resolved document with its body loaded.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolvedFile {
    pub collection: String,
    pub path: String,
    pub title: String,
    pub docid: String,
    pub body: String,
}

/// Line-window options for `get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// 1-based first line to print.
    pub from_line: Option<usize>,
    /// Number of lines to print.
    pub line_count: Option<usize>,
    pub line_numbers: bool,
}

async fn load(engine: &Engine, doc: &DocumentRow) -> Result<ResolvedFile> {
    let body = engine
        .store
        .get_content(&doc.hash)
        .await?
        .ok_or(QmdError::NotFound {
            kind: "content",
            name: doc.hash.clone(),
        })?;
    Ok(ResolvedFile {
        collection: doc.collection.clone(),
        path: doc.path.clone(),
        title: doc.title.clone(),
        docid: crate::text::docid_from_hash(&doc.hash).to_string(),
        body,
    })
}

/// Resolve a file reference to an active document.
pub async fn resolve_fileref(engine: &Engine, reference: &str) -> Result<ResolvedFile> {
    let reference = reference.trim();

    if let Some(prefix) = reference.strip_prefix('#') {
        let matches = engine.store.find_by_docid_prefix(prefix).await?;
        if matches.len() > 1 {
            tracing::warn!(
                docid = %prefix,
                matches = matches.len(),
                "ambiguous docid, returning most recently modified"
            );
        }
        return match matches.first() {
            Some(doc) => load(engine, doc).await,
            None => Err(QmdError::NotFound {
                kind: "document",
                name: format!("#{prefix}"),
            }),
        };
    }

    let spec = reference.strip_prefix("qmd://").unwrap_or(reference);

    // collection/path form first.
    if let Some((collection, path)) = spec.split_once('/') {
        if let Some(doc) = engine.store.find_active_document(collection, path).await? {
            return load(engine, &doc).await;
        }
    }

    // Bare path, unique across collections.
    let all = engine.store.list_active(None, None).await?;
    let matches: Vec<&DocumentRow> = all
        .iter()
        .filter(|d| d.path == spec || d.path.ends_with(&format!("/{spec}")))
        .collect();
    match matches.as_slice() {
        [doc] => load(engine, doc).await,
        [] => Err(QmdError::NotFound {
            kind: "document",
            name: reference.to_string(),
        }),
        many => {
            tracing::warn!(
                reference = %reference,
                matches = many.len(),
                "ambiguous path, returning first by collection order"
            );
            load(engine, many[0]).await
        }
    }
}

/// Closest active paths to a missed reference, for "did you mean".
pub async fn similar_paths(engine: &Engine, reference: &str, limit: usize) -> Vec<String> {
    let needle = reference.trim_start_matches("qmd://").to_lowercase();
    let Ok(all) = engine.store.list_active(None, None).await else {
        return Vec::new();
    };
    let mut scored: Vec<(f64, String)> = all
        .iter()
        .map(|d| {
            let full = format!("{}/{}", d.collection, d.path);
            (bigram_jaccard(&needle, &full.to_lowercase()), full)
        })
        .filter(|(score, _)| *score > 0.2)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(limit).map(|(_, p)| p).collect()
}

/// Apply a line window to a body.
pub fn slice_lines(body: &str, opts: &GetOptions) -> String {
    let from = opts.from_line.unwrap_or(1).max(1);
    let lines: Vec<&str> = body.lines().collect();
    let start = (from - 1).min(lines.len());
    let end = match opts.line_count {
        Some(n) => (start + n).min(lines.len()),
        None => lines.len(),
    };
    let mut out = String::new();
    for (offset, line) in lines[start..end].iter().enumerate() {
        if opts.line_numbers {
            out.push_str(&format!("{:>6}\t{line}\n", start + offset + 1));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Resolve a multi-get pattern: a glob over `collection/path`, or a
/// comma-separated list of references. `max_bytes` bounds the total body
/// payload; documents past the budget are returned without bodies.
pub async fn run_multi_get(
    engine: &Engine,
    pattern: &str,
    max_bytes: Option<u64>,
) -> Result<Vec<ResolvedFile>> {
    let mut out: Vec<ResolvedFile> = Vec::new();

    if pattern.contains(',') {
        for part in pattern.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match resolve_fileref(engine, part).await {
                Ok(file) => out.push(file),
                Err(QmdError::NotFound { .. }) => {
                    tracing::warn!(reference = %part, "multi-get reference not found");
                }
                Err(e) => return Err(e),
            }
        }
    } else {
        let matcher = Glob::new(pattern.trim_start_matches("qmd://"))?.compile_matcher();
        let all = engine.store.list_active(None, None).await?;
        for doc in &all {
            let full = format!("{}/{}", doc.collection, doc.path);
            if matcher.is_match(&full) || matcher.is_match(&doc.path) {
                out.push(load(engine, doc).await?);
            }
        }
    }

    if let Some(budget) = max_bytes {
        let mut used = 0u64;
        for file in out.iter_mut() {
            let size = file.body.len() as u64;
            if used + size > budget {
                file.body = String::new();
            } else {
                used += size;
            }
        }
    }
    Ok(out)
}

/// A row in the `ls` listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LsEntry {
    pub name: String,
    pub documents: i64,
}

/// List collections, or files under `collection[/prefix]`.
pub enum LsOutput {
    Collections(Vec<LsEntry>),
    Files(Vec<ResolvedFileStub>),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolvedFileStub {
    pub file: String,
    pub title: String,
    pub docid: String,
}

pub async fn run_ls(engine: &Engine, target: Option<&str>) -> Result<LsOutput> {
    match target {
        None => {
            let mut entries = Vec::new();
            for spec in engine.registry.collections() {
                let docs = engine
                    .store
                    .list_active(Some(&spec.name), None)
                    .await?
                    .len() as i64;
                entries.push(LsEntry {
                    name: spec.name.clone(),
                    documents: docs,
                });
            }
            // Collections present in the index but missing from the YAML
            // still show up (e.g. after a config edit).
            for name in engine.store.active_collections().await? {
                if !entries.iter().any(|e| e.name == name) {
                    let docs = engine.store.list_active(Some(&name), None).await?.len() as i64;
                    entries.push(LsEntry {
                        name,
                        documents: docs,
                    });
                }
            }
            Ok(LsOutput::Collections(entries))
        }
        Some(target) => {
            let target = target.trim_start_matches("qmd://");
            let (collection, prefix) = match target.split_once('/') {
                Some((c, p)) => (c, Some(p)),
                None => (target, None),
            };
            let docs = engine.store.list_active(Some(collection), prefix).await?;
            Ok(LsOutput::Files(
                docs.iter()
                    .map(|d| ResolvedFileStub {
                        file: format!("qmd://{}/{}", d.collection, d.path),
                        title: d.title.clone(),
                        docid: crate::text::docid_from_hash(&d.hash).to_string(),
                    })
                    .collect(),
            ))
        }
    }
}
