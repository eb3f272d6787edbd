//! Error types for the clustering pipeline.

use thiserror::Error;

/// Failures of the persisted key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

#[derive(Error, Debug)]
pub enum ClusterError {
    /// Missing or invalid clustering parameters. Raised before any clustering.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Listing/cluster bookkeeping disagrees after a phase, usually because a
    /// cache references a stale listing snapshot.
    #[error("Consistency error after {phase}: {message}. Clear the identity cache and rerun")]
    Consistency { phase: String, message: String },

    /// A host ran out of local cluster numbers.
    #[error("Host index {host_index} has no free cluster ids left (cap {cap})")]
    IdentityRangeExhausted { host_index: u32, cap: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn config(message: impl Into<String>) -> Self {
        ClusterError::Config { message: message.into() }
    }

    pub fn consistency(phase: impl Into<String>, message: impl Into<String>) -> Self {
        ClusterError::Consistency {
            phase: phase.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
