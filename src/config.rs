//! Runtime configuration: directory resolution, `.env` overlay, and the
//! environment knobs that tune the pipeline.
//!
//! Nothing here touches the database or the network. The collections file
//! itself is handled by [`crate::collections`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{QmdError, Result};

/// Default cap on indexable file size (64 MiB).
pub const DEFAULT_MAX_INDEX_FILE_BYTES: u64 = 64 * 1024 * 1024;

/// Default embedding batch size.
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;

/// How the rerank stage talks to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankMode {
    /// Chat-completions adapter: the model extracts relevant passages
    /// and its line order becomes the ranking. Default.
    Llm,
    /// Dedicated rerank endpoint returning `{index, score}` pairs.
    Dedicated,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    /// Name of the index database file, without extension.
    pub index_name: String,
    /// Caller-visible timeout applied to every outbound request, when set.
    pub timeout_override: Option<Duration>,
    pub embed_batch_size: usize,
    pub rerank_doc_limit: usize,
    pub rerank_chunks_per_doc: usize,
    pub max_index_file_bytes: u64,
    pub breaker_cooldown: Duration,
    pub rerank_mode: RerankMode,
    pub llm_cache: bool,
}

impl Config {
    /// Resolve configuration from the environment. `index` and `timeout_ms`
    /// come from the CLI and win over their environment counterparts.
    ///
    /// The `.env` overlay at `<config_dir>/.env` is applied first so its
    /// `QMD_`-prefixed keys are visible to every lookup below.
    pub fn load(index: Option<&str>, timeout_ms: Option<u64>) -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        apply_env_file(&config_dir.join(".env"));
        let data_dir = resolve_data_dir()?;

        let index_name = index
            .map(str::to_string)
            .or_else(|| std::env::var("QMD_INDEX").ok())
            .unwrap_or_else(|| "index".to_string());

        let timeout_override = timeout_ms
            .or_else(|| env_u64("QMD_TIMEOUT_MS"))
            .map(Duration::from_millis);

        let rerank_mode = match std::env::var("QMD_RERANK_MODE").as_deref() {
            Ok("rerank") => RerankMode::Dedicated,
            _ => RerankMode::Llm,
        };

        Ok(Self {
            data_dir,
            config_dir,
            index_name,
            timeout_override,
            embed_batch_size: env_usize("QMD_EMBED_BATCH_SIZE")
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_EMBED_BATCH_SIZE),
            rerank_doc_limit: env_usize("QMD_RERANK_DOC_LIMIT")
                .filter(|&n| n > 0)
                .unwrap_or(40),
            rerank_chunks_per_doc: env_usize("QMD_RERANK_CHUNKS_PER_DOC")
                .filter(|&n| n > 0)
                .unwrap_or(3),
            max_index_file_bytes: max_index_file_bytes_from_env(),
            breaker_cooldown: env_u64("QMD_BREAKER_COOLDOWN_MS")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(300)),
            rerank_mode,
            llm_cache: matches!(
                std::env::var("QMD_LLM_CACHE").as_deref(),
                Ok("1") | Ok("true")
            ),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", self.index_name))
    }

    pub fn collections_path(&self) -> PathBuf {
        self.config_dir.join("index.yml")
    }

    pub fn rerank_prompt_path(&self) -> PathBuf {
        self.config_dir.join("rerank-prompt.txt")
    }
}

/// `QMD_MAX_INDEX_FILE_BYTES`, parsed as a float so scientific notation
/// works; NaN and non-positive values fall back to the default.
fn max_index_file_bytes_from_env() -> u64 {
    match std::env::var("QMD_MAX_INDEX_FILE_BYTES") {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v > 0.0 => v as u64,
            _ => DEFAULT_MAX_INDEX_FILE_BYTES,
        },
        Err(_) => DEFAULT_MAX_INDEX_FILE_BYTES,
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn resolve_data_dir() -> Result<PathBuf> {
    let dir = if let Ok(dir) = std::env::var("QMD_DATA_DIR") {
        PathBuf::from(dir)
    } else if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join("qmd")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/qmd")
    } else {
        return Err(QmdError::Config(
            "cannot resolve data directory: none of QMD_DATA_DIR, XDG_DATA_HOME, HOME are set"
                .to_string(),
        ));
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn resolve_config_dir() -> Result<PathBuf> {
    let dir = if let Ok(dir) = std::env::var("QMD_CONFIG_DIR") {
        PathBuf::from(dir)
    } else if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("qmd")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config/qmd")
    } else {
        return Err(QmdError::Config(
            "cannot resolve config directory: none of QMD_CONFIG_DIR, XDG_CONFIG_HOME, HOME are set"
                .to_string(),
        ));
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Apply `<config_dir>/.env`: `QMD_`-prefixed keys always override the
/// inherited environment, any other key is only set when absent.
fn apply_env_file(path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if key.is_empty() {
            continue;
        }
        if key.starts_with("QMD_") || std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_bytes_rejects_nan_and_nonpositive() {
        std::env::set_var("QMD_MAX_INDEX_FILE_BYTES", "NaN");
        assert_eq!(max_index_file_bytes_from_env(), DEFAULT_MAX_INDEX_FILE_BYTES);

        std::env::set_var("QMD_MAX_INDEX_FILE_BYTES", "-1");
        assert_eq!(max_index_file_bytes_from_env(), DEFAULT_MAX_INDEX_FILE_BYTES);

        std::env::set_var("QMD_MAX_INDEX_FILE_BYTES", "0");
        assert_eq!(max_index_file_bytes_from_env(), DEFAULT_MAX_INDEX_FILE_BYTES);

        std::env::set_var("QMD_MAX_INDEX_FILE_BYTES", "1048576");
        assert_eq!(max_index_file_bytes_from_env(), 1_048_576);

        std::env::remove_var("QMD_MAX_INDEX_FILE_BYTES");
        assert_eq!(max_index_file_bytes_from_env(), DEFAULT_MAX_INDEX_FILE_BYTES);
    }

    #[test]
    fn env_file_overlay_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let env_path = tmp.path().join(".env");
        std::fs::write(
            &env_path,
            "# comment\nQMD_TEST_OVERRIDE=from_file\nPLAIN_TEST_KEY=file_value\n",
        )
        .unwrap();

        std::env::set_var("QMD_TEST_OVERRIDE", "from_env");
        std::env::set_var("PLAIN_TEST_KEY", "env_value");
        apply_env_file(&env_path);

        // QMD_ keys win over the inherited environment.
        assert_eq!(std::env::var("QMD_TEST_OVERRIDE").unwrap(), "from_file");
        // Other keys are only set when absent.
        assert_eq!(std::env::var("PLAIN_TEST_KEY").unwrap(), "env_value");

        std::env::remove_var("PLAIN_TEST_KEY");
        apply_env_file(&env_path);
        assert_eq!(std::env::var("PLAIN_TEST_KEY").unwrap(), "file_value");

        std::env::remove_var("QMD_TEST_OVERRIDE");
        std::env::remove_var("PLAIN_TEST_KEY");
    }
}
