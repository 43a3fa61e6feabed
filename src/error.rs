use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the scan engine.
///
/// Only [`Error::InvalidRange`] and [`Error::Config`] are meant to stop the
/// process; everything else is logged where it is detected.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid port range {spec:?}: {reason}")]
    InvalidRange { spec: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid inventory entry {entry:?}: {reason}")]
    InvalidTarget { entry: String, reason: String },

    #[error("failed to load cache from {}: {source}", path.display())]
    CacheLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to save cache to {}: {source}", path.display())]
    CacheSave {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_range(spec: &str, reason: impl Into<String>) -> Self {
        Error::InvalidRange {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_target(entry: &str, reason: impl Into<String>) -> Self {
        Error::InvalidTarget {
            entry: entry.to_string(),
            reason: reason.into(),
        }
    }
}
