//! Ingestion: reconcile a collection's filesystem state with the store.
//!
//! The scan walks the collection root with its glob, applies safety
//! filters (symlink escape, size cap, binary sniff, strict UTF-8),
//! normalizes relative paths with deterministic collision handling, and
//! reconciles each file in a single transaction. Documents whose path was
//! not seen are deactivated afterwards, then orphaned content is
//! collected. Individual files never abort the run; each skip is counted
//! by reason.

use std::collections::HashSet;
use std::path::Path;

use globset::{Glob, GlobMatcher};
use walkdir::WalkDir;

use crate::collections::CollectionSpec;
use crate::error::{QmdError, Result};
use crate::store::{Reconciled, Store};
use crate::text::{extract_title, hash_content};

/// Directory components never descended into.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", ".cache", "vendor", "dist", "build"];

#[derive(Debug, Default, Clone, Copy)]
pub struct SkipCounts {
    pub symlink_escape: u64,
    pub too_large: u64,
    pub binary: u64,
    pub unreadable: u64,
}

impl SkipCounts {
    pub fn total(&self) -> u64 {
        self.symlink_escape + self.too_large + self.binary + self.unreadable
    }
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub scanned: u64,
    pub added: u64,
    pub updated: u64,
    pub title_updated: u64,
    pub unchanged: u64,
    pub deactivated: u64,
    pub content_removed: u64,
    pub skipped: SkipCounts,
}

/// Reconcile one collection. Returns the per-run summary; fails only on
/// store-level errors or an unusable root/glob.
pub async fn ingest_collection(
    store: &Store,
    spec: &CollectionSpec,
    max_bytes: u64,
) -> Result<IngestSummary> {
    let root = spec.root_path.canonicalize().map_err(|e| {
        QmdError::Config(format!(
            "collection '{}' root {} is not accessible: {e}",
            spec.name,
            spec.root_path.display()
        ))
    })?;
    let root_folded = fold_case(&root.to_string_lossy());
    let matcher: GlobMatcher = Glob::new(&spec.glob_pattern)?.compile_matcher();

    let mut summary = IngestSummary::default();
    let mut seen: HashSet<String> = HashSet::new();

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // Prune excluded directories and dotfiles at the tree level.
            let name = entry.file_name().to_string_lossy();
            if entry.depth() == 0 {
                return true;
            }
            !(name.starts_with('.') || EXCLUDED_DIRS.contains(&name.as_ref()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "walk error, skipping entry");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        let raw_relative = entry
            .path()
            .strip_prefix(&root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if !matcher.is_match(&raw_relative) {
            continue;
        }
        summary.scanned += 1;

        // Symlinks must resolve to the root or below. Case-insensitive
        // filesystems get a folded comparison.
        if entry.path_is_symlink() {
            let resolved = match entry.path().canonicalize() {
                Ok(p) => p,
                Err(_) => {
                    summary.skipped.unreadable += 1;
                    continue;
                }
            };
            let resolved_folded = fold_case(&resolved.to_string_lossy());
            if !is_within(&resolved_folded, &root_folded) {
                tracing::debug!(path = %raw_relative, "symlink escapes collection root");
                summary.skipped.symlink_escape += 1;
                continue;
            }
        }

        let metadata = match std::fs::metadata(entry.path()) {
            Ok(m) => m,
            Err(_) => {
                summary.skipped.unreadable += 1;
                continue;
            }
        };
        if metadata.len() > max_bytes {
            tracing::debug!(path = %raw_relative, size = metadata.len(), "file exceeds size cap");
            summary.skipped.too_large += 1;
            continue;
        }

        let bytes = match std::fs::read(entry.path()) {
            Ok(b) => b,
            Err(_) => {
                summary.skipped.unreadable += 1;
                continue;
            }
        };
        if bytes.contains(&0) {
            summary.skipped.binary += 1;
            continue;
        }
        let body = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => {
                summary.skipped.unreadable += 1;
                continue;
            }
        };
        if body.trim().is_empty() {
            continue;
        }

        let path = disambiguate_path(&normalize_relative_path(&raw_relative), &raw_relative, &seen);
        seen.insert(path.clone());

        let hash = hash_content(&body);
        let title = extract_title(&body, &raw_relative);
        let (created_at, modified_at) = file_times(&metadata);

        match store
            .reconcile_document(&spec.name, &path, &title, &hash, &body, created_at, modified_at)
            .await?
        {
            Reconciled::Added => summary.added += 1,
            Reconciled::Updated => summary.updated += 1,
            Reconciled::TitleUpdated => summary.title_updated += 1,
            Reconciled::Unchanged => summary.unchanged += 1,
        }
    }

    summary.deactivated = store.deactivate_missing(&spec.name, &seen).await?;
    summary.content_removed = store.cleanup_orphaned_content().await?;

    tracing::info!(
        collection = %spec.name,
        scanned = summary.scanned,
        added = summary.added,
        updated = summary.updated,
        deactivated = summary.deactivated,
        skipped = summary.skipped.total(),
        "ingest complete"
    );
    Ok(summary)
}

/// Run a collection's declared update command with the collection root as
/// working directory. Only invoked when the caller passed `--allow-run`.
pub async fn run_update_command(spec: &CollectionSpec) -> Result<()> {
    let Some(command) = &spec.update_command else {
        return Ok(());
    };
    tracing::info!(collection = %spec.name, command = %command, "running update command");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&spec.root_path)
        .status()
        .await?;
    if !status.success() {
        return Err(QmdError::Config(format!(
            "update command for '{}' exited with {status}",
            spec.name
        )));
    }
    Ok(())
}

/// Stable path normalization: forward slashes, no repeated separators, no
/// leading `./`.
pub fn normalize_relative_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for c in raw.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }
        out.push(c);
    }
    let out = out.trim_start_matches("./").trim_start_matches('/');
    out.to_string()
}

/// Deterministic collision handling: normalized path, then the raw
/// relative path, then `~N` suffixes.
fn disambiguate_path(normalized: &str, raw: &str, seen: &HashSet<String>) -> String {
    if !seen.contains(normalized) {
        return normalized.to_string();
    }
    if raw != normalized && !seen.contains(raw) {
        return raw.to_string();
    }
    let mut n = 1usize;
    loop {
        let candidate = format!("{normalized}~{n}");
        if !seen.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn file_times(metadata: &std::fs::Metadata) -> (i64, i64) {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    let created = metadata
        .created()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(modified);
    (created, modified)
}

fn fold_case(s: &str) -> String {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

fn is_within(path: &str, root: &str) -> bool {
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}
