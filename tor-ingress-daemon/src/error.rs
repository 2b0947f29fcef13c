use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use tor_ingress_core::{RegistryError, ServiceKey, StoreError};

/// Error surface for the daemon runtime and control socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("sync error: {0}")]
    Sync(#[from] tor_ingress_sync::SyncError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("controller is not running (socket missing: {socket})")]
    NotRunning { socket: PathBuf },
}

/// Failures managing the tor process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("failed waiting for tor to exit: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HostnameError {
    #[error("hostname file {path} not written within {waited:?}")]
    NotFound { path: PathBuf, waited: Duration },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status update for {key} still conflicting after {attempts} attempts")]
    ConflictExhausted { key: ServiceKey, attempts: u32 },

    #[error("ingress {key} disappeared while publishing status")]
    Gone { key: ServiceKey },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a single sync attempt failed. Every variant is retried by the queue
/// up to the configured cap.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("torrc persist error: {0}")]
    Persist(#[from] tor_ingress_sync::SyncError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("hostname error: {0}")]
    Hostname(#[from] HostnameError),

    #[error("status error: {0}")]
    Status(#[from] StatusError),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
