//! Error types for tor-ingress-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ServiceKey;

/// All errors that can arise from service registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two live keys derived the same service directory.
    #[error("service directory {path} is already owned by {owner}")]
    ServiceDirInUse { path: PathBuf, owner: ServiceKey },
}

/// Errors raised while loading the controller configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced by the resource, secret and status collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist (yet). Retryable.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// Optimistic-concurrency failure: the caller held a stale version.
    #[error("conflict updating {key}: have version {expected}, store has {found}")]
    Conflict {
        key: String,
        expected: String,
        found: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Implementation-specific failure of a collaborator backend.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.into(),
        source,
    }
}
