//! Collections and context annotations, backed by `<config_dir>/index.yml`.
//!
//! A collection is a named filesystem subtree plus a glob; a context is a
//! short human-written note attached to a virtual path prefix, resolved
//! most-specific-first at query time. The registry is loaded once per
//! process and treated as a read-only snapshot by retrieval.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{QmdError, Result};

/// A named view over a filesystem subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub root_path: PathBuf,
    #[serde(default = "default_glob")]
    pub glob_pattern: String,
    /// Optional shell command run by `update --allow-run` before re-indexing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_command: Option<String>,
}

fn default_glob() -> String {
    "**/*.md".to_string()
}

/// A context annotation. `path` is `/` for the global scope, a collection
/// name for a collection root, or `collection/prefix` for a subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSpec {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    collections: Vec<CollectionSpec>,
    #[serde(default)]
    contexts: Vec<ContextSpec>,
}

/// In-memory snapshot of `index.yml` with mutation helpers that write the
/// file back atomically (write temp, rename).
#[derive(Debug)]
pub struct CollectionRegistry {
    file: IndexFile,
    path: PathBuf,
}

impl CollectionRegistry {
    /// Load the registry, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self> {
        let file = match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn save(&self) -> Result<()> {
        let raw = serde_yaml::to_string(&self.file)?;
        let tmp = self.path.with_extension("yml.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn collections(&self) -> &[CollectionSpec] {
        &self.file.collections
    }

    pub fn get(&self, name: &str) -> Option<&CollectionSpec> {
        self.file.collections.iter().find(|c| c.name == name)
    }

    /// Register a collection. `(root_path, glob_pattern)` uniquely identifies
    /// a collection, so re-adding the same pair is rejected, as is a
    /// duplicate name.
    pub fn add(&mut self, spec: CollectionSpec) -> Result<()> {
        if self.get(&spec.name).is_some() {
            return Err(QmdError::Config(format!(
                "collection '{}' already exists",
                spec.name
            )));
        }
        if self
            .file
            .collections
            .iter()
            .any(|c| c.root_path == spec.root_path && c.glob_pattern == spec.glob_pattern)
        {
            return Err(QmdError::Config(format!(
                "a collection for {} with mask '{}' already exists",
                spec.root_path.display(),
                spec.glob_pattern
            )));
        }
        self.file.collections.push(spec);
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let before = self.file.collections.len();
        self.file.collections.retain(|c| c.name != name);
        if self.file.collections.len() == before {
            return Err(QmdError::NotFound {
                kind: "collection",
                name: name.to_string(),
            });
        }
        // Contexts scoped under the collection go with it.
        self.file
            .contexts
            .retain(|c| c.path != name && !c.path.starts_with(&format!("{name}/")));
        self.save()
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if self.get(to).is_some() {
            return Err(QmdError::Config(format!("collection '{to}' already exists")));
        }
        let Some(spec) = self.file.collections.iter_mut().find(|c| c.name == from) else {
            return Err(QmdError::NotFound {
                kind: "collection",
                name: from.to_string(),
            });
        };
        spec.name = to.to_string();
        for ctx in &mut self.file.contexts {
            if ctx.path == from {
                ctx.path = to.to_string();
            } else if let Some(rest) = ctx.path.strip_prefix(&format!("{from}/")) {
                ctx.path = format!("{to}/{rest}");
            }
        }
        self.save()
    }

    pub fn contexts(&self) -> &[ContextSpec] {
        &self.file.contexts
    }

    pub fn set_context(&mut self, path: &str, text: &str) -> Result<()> {
        let path = normalize_context_path(path);
        if let Some(existing) = self.file.contexts.iter_mut().find(|c| c.path == path) {
            existing.text = text.to_string();
        } else {
            self.file.contexts.push(ContextSpec {
                path,
                text: text.to_string(),
            });
        }
        self.save()
    }

    pub fn remove_context(&mut self, path: &str) -> Result<()> {
        let path = normalize_context_path(path);
        let before = self.file.contexts.len();
        self.file.contexts.retain(|c| c.path != path);
        if self.file.contexts.len() == before {
            return Err(QmdError::NotFound {
                kind: "context",
                name: path,
            });
        }
        self.save()
    }

    /// Resolve the context for a document, most-specific-first: exact
    /// virtual path, then each ancestor prefix, then the collection root,
    /// then the global `/`.
    pub fn resolve_context(&self, collection: &str, doc_path: &str) -> Option<&str> {
        let full = format!("{collection}/{doc_path}");
        if let Some(c) = self.context_for(&full) {
            return Some(c);
        }
        let mut prefix = full.as_str();
        while let Some(idx) = prefix.rfind('/') {
            prefix = &prefix[..idx];
            if let Some(c) = self.context_for(prefix) {
                return Some(c);
            }
        }
        self.context_for("/")
    }

    fn context_for(&self, path: &str) -> Option<&str> {
        self.file
            .contexts
            .iter()
            .find(|c| c.path == path)
            .map(|c| c.text.as_str())
    }

    /// Validate a caller-supplied collection filter against the registry.
    /// Unknown names are dropped with a warning; the query itself never
    /// fails. Returns `None` when no filter was supplied.
    pub fn validate_filter(&self, names: &[String]) -> Option<Vec<String>> {
        if names.is_empty() {
            return None;
        }
        let mut known = Vec::new();
        for name in names {
            if self.get(name).is_some() {
                known.push(name.clone());
            } else {
                tracing::warn!(collection = %name, "unknown collection in filter, dropping");
            }
        }
        Some(known)
    }
}

fn normalize_context_path(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }
    path.trim_matches('/').to_string()
}

/// Derive a collection name from its root directory (last path component,
/// lowercased, non-alphanumerics collapsed to `-`).
pub fn derive_name(root: &Path) -> String {
    let stem = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "collection".to_string());
    let mut out = String::with_capacity(stem.len());
    let mut last_dash = false;
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "collection".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(contexts: Vec<ContextSpec>) -> CollectionRegistry {
        CollectionRegistry {
            file: IndexFile {
                collections: vec![CollectionSpec {
                    name: "notes".to_string(),
                    root_path: PathBuf::from("/tmp/notes"),
                    glob_pattern: "**/*.md".to_string(),
                    update_command: None,
                }],
                contexts,
            },
            path: PathBuf::from("/nonexistent/index.yml"),
        }
    }

    #[test]
    fn context_resolution_most_specific_first() {
        let reg = registry_with(vec![
            ContextSpec {
                path: "/".to_string(),
                text: "global".to_string(),
            },
            ContextSpec {
                path: "notes".to_string(),
                text: "collection".to_string(),
            },
            ContextSpec {
                path: "notes/recipes".to_string(),
                text: "prefix".to_string(),
            },
            ContextSpec {
                path: "notes/recipes/pasta.md".to_string(),
                text: "exact".to_string(),
            },
        ]);

        assert_eq!(
            reg.resolve_context("notes", "recipes/pasta.md"),
            Some("exact")
        );
        assert_eq!(
            reg.resolve_context("notes", "recipes/soup.md"),
            Some("prefix")
        );
        assert_eq!(reg.resolve_context("notes", "journal/2024.md"), Some("collection"));
        assert_eq!(reg.resolve_context("work", "anything.md"), Some("global"));
    }

    #[test]
    fn context_resolution_without_global() {
        let reg = registry_with(vec![]);
        assert_eq!(reg.resolve_context("notes", "a.md"), None);
    }

    #[test]
    fn filter_drops_unknown_names() {
        let reg = registry_with(vec![]);
        let filter = reg
            .validate_filter(&["notes".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(filter, vec!["notes".to_string()]);
        assert!(reg.validate_filter(&[]).is_none());
    }

    #[test]
    fn derive_name_sanitizes() {
        assert_eq!(derive_name(Path::new("/home/u/My Notes")), "my-notes");
        assert_eq!(derive_name(Path::new("/x/docs_2024")), "docs-2024");
        assert_eq!(derive_name(Path::new("/")), "collection");
    }
}
