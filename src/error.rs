use chrono::{DateTime, Utc};

pub type Result<T> = std::result::Result<T, QmdError>;

/// Error taxonomy for the whole crate.
///
/// Retrieval paths degrade on sub-search failures and only surface an
/// error when no ranked list could be produced at all; ingestion records
/// per-file skips and fails only on store-level errors. Everything
/// user-visible at the CLI edge exits with code 1.
#[derive(Debug, thiserror::Error)]
pub enum QmdError {
    #[error("{0}")]
    Usage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("active document already exists at {collection}/{path}")]
    Conflict { collection: String, path: String },

    #[error("vector index is not built; run `qmd embed` first")]
    VectorUnavailable,

    #[error(
        "embedding dimension mismatch: index holds {existing}-dim vectors, the model produces {requested}; run `qmd embed -f` to rebuild"
    )]
    DimensionMismatch { existing: usize, requested: usize },

    #[error("{provider} {op} failed: {message}")]
    Provider {
        provider: &'static str,
        op: &'static str,
        status: Option<u16>,
        message: String,
        url: String,
    },

    #[error("{provider} is cooling down until {until}")]
    CoolingDown {
        provider: &'static str,
        until: DateTime<Utc>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("collections file error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl QmdError {
    /// Whether the retrieval pipeline may swallow this failure and
    /// continue with degraded inputs. Store and schema errors never
    /// degrade.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            QmdError::Provider { .. }
                | QmdError::CoolingDown { .. }
                | QmdError::VectorUnavailable
                | QmdError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degradable_classification() {
        assert!(QmdError::VectorUnavailable.is_degradable());
        assert!(QmdError::Cancelled.is_degradable());
        assert!(QmdError::Provider {
            provider: "siliconflow",
            op: "rerank",
            status: Some(500),
            message: "boom".into(),
            url: "http://x".into(),
        }
        .is_degradable());
        assert!(!QmdError::Config("bad".into()).is_degradable());
        assert!(!QmdError::Conflict {
            collection: "a".into(),
            path: "b".into()
        }
        .is_degradable());
    }

    #[test]
    fn dimension_mismatch_mentions_rebuild() {
        let err = QmdError::DimensionMismatch {
            existing: 1024,
            requested: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("1024"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("embed -f"));
    }
}
