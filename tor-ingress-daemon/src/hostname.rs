//! Waits for tor to publish a hidden service's `hostname` file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use tor_ingress_core::registry::hostname_path;

use crate::error::HostnameError;

#[derive(Debug, Clone, Copy)]
pub struct HostnameResolver {
    poll: Duration,
    timeout: Duration,
}

impl HostnameResolver {
    pub fn new(poll: Duration, timeout: Duration) -> Self {
        Self { poll, timeout }
    }

    /// Poll `<service_dir>/hostname` until it holds a non-blank value or the
    /// timeout passes. The value is returned trimmed.
    pub async fn resolve(&self, service_dir: &Path) -> Result<String, HostnameError> {
        let path = hostname_path(service_dir);
        let started = Instant::now();
        loop {
            if let Some(hostname) = read_hostname(&path).await? {
                return Ok(hostname);
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(HostnameError::NotFound { path, waited });
            }
            tokio::time::sleep(self.poll.min(self.timeout - waited)).await;
        }
    }
}

/// `Ok(None)` while the file is missing or blank.
pub async fn read_hostname(path: &Path) -> Result<Option<String>, HostnameError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let trimmed = contents.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(HostnameError::Io {
            path: PathBuf::from(path),
            source,
        }),
    }
}
