//! Classified error taxonomy for the sync engine.
//!
//! Every per-series failure surfaced in a `RunReport` carries exactly one of
//! these classifications, so no failure disappears into a generic string.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote fetch or instrument listing failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A persisted record could not be decoded, or duplicate timestamps were
    /// found where the timestamp is supposed to be the natural key.
    #[error("corrupt data: {0}")]
    Corruption(String),

    /// Primary and mirror diverged in a way that cannot be repaired by
    /// appending the missing tail.
    #[error("mirror consistency error: {0}")]
    Consistency(String),

    /// Filesystem operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed filename, unparseable partition key, or a granularity that
    /// does not support the requested time arithmetic.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short stable tag used in run reports and log lines.
    pub fn classification(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Corruption(_) => "corruption",
            Self::Consistency(_) => "consistency",
            Self::Io { .. } => "io",
            Self::Configuration(_) => "configuration",
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
