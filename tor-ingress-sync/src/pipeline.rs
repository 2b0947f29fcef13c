//! Shared torrc persist entrypoint used by the CLI and the daemon.

use std::path::{Path, PathBuf};

use chrono::Utc;

use tor_ingress_core::{ControllerConfig, ServiceRegistry};
use tor_ingress_renderer::TorrcRenderer;

use crate::diff::{self, FileDiff};
use crate::error::SyncError;
use crate::hash_store::{self, HashStoreFile};
use crate::writer::{atomic_write, WriteResult};

/// Render `registry` and write it to `torrc_path` through the hash gate.
///
/// Does not save the hash store; see [`TorrcWriter::persist`] for that.
pub fn persist_torrc(
    renderer: &TorrcRenderer,
    registry: &ServiceRegistry,
    torrc_path: &Path,
    data_directory: Option<&Path>,
    store: &mut HashStoreFile,
    dry_run: bool,
) -> Result<WriteResult, SyncError> {
    let rendered = renderer.render(registry, data_directory)?;

    if !dry_run && tracing::log_enabled!(tracing::Level::Debug) {
        if let Some(FileDiff { unified_diff, .. }) =
            diff::diff_against_disk(torrc_path, &rendered)?
        {
            tracing::debug!("torrc changes:\n{}", unified_diff);
        }
    }

    atomic_write(torrc_path, &rendered, &mut store.files, dry_run)
}

/// Owns everything needed to turn a registry into the on-disk torrc: the
/// renderer, the target paths and the loaded hash store.
pub struct TorrcWriter {
    renderer: TorrcRenderer,
    torrc_path: PathBuf,
    data_directory: Option<PathBuf>,
    store_path: PathBuf,
    store: HashStoreFile,
}

impl TorrcWriter {
    pub fn new(
        renderer: TorrcRenderer,
        torrc_path: impl Into<PathBuf>,
        data_directory: Option<PathBuf>,
        store_path: impl Into<PathBuf>,
    ) -> Result<Self, SyncError> {
        let store_path = store_path.into();
        let store = hash_store::load_at(&store_path)?;
        Ok(Self {
            renderer,
            torrc_path: torrc_path.into(),
            data_directory,
            store_path,
            store,
        })
    }

    /// Build a writer from the controller configuration, loading the
    /// override template if one is configured.
    pub fn from_config(config: &ControllerConfig) -> Result<Self, SyncError> {
        let renderer = TorrcRenderer::with_template(config.torrc_template.as_deref())?;
        Self::new(
            renderer,
            &config.tor.torrc_path,
            config.tor.data_directory.clone(),
            config.hash_store_path(),
        )
    }

    pub fn torrc_path(&self) -> &Path {
        &self.torrc_path
    }

    pub fn render(&self, registry: &ServiceRegistry) -> Result<String, SyncError> {
        Ok(self
            .renderer
            .render(registry, self.data_directory.as_deref())?)
    }

    pub fn diff(&self, registry: &ServiceRegistry) -> Result<Option<FileDiff>, SyncError> {
        diff::diff_torrc(
            &self.renderer,
            registry,
            &self.torrc_path,
            self.data_directory.as_deref(),
        )
    }

    /// Persist the torrc for `registry`. The hash store is saved after every
    /// real write.
    pub fn persist(&mut self, registry: &ServiceRegistry) -> Result<WriteResult, SyncError> {
        let result = persist_torrc(
            &self.renderer,
            registry,
            &self.torrc_path,
            self.data_directory.as_deref(),
            &mut self.store,
            false,
        )?;
        if result.is_written() {
            self.store.synced_at = Utc::now();
            hash_store::save_at(&self.store_path, &self.store)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn dry_run_leaves_store_and_disk_alone() {
        let tmp = TempDir::new().expect("tmp");
        let renderer = TorrcRenderer::new().expect("renderer");
        let registry = ServiceRegistry::new(tmp.path());
        let torrc = tmp.path().join("torfile");
        let mut store = HashStoreFile::default();

        let result =
            persist_torrc(&renderer, &registry, &torrc, None, &mut store, true).expect("persist");
        assert!(matches!(result, WriteResult::WouldWrite { .. }));
        assert!(!torrc.exists());
        assert!(store.files.is_empty());
    }

    #[test]
    fn writer_saves_hash_store_after_write() {
        let tmp = TempDir::new().expect("tmp");
        let store_path = tmp.path().join("state").join("hashes.json");
        let torrc = tmp.path().join("torfile");
        let mut writer = TorrcWriter::new(
            TorrcRenderer::new().expect("renderer"),
            &torrc,
            None,
            &store_path,
        )
        .expect("writer");

        let registry = ServiceRegistry::new(tmp.path());
        assert!(writer.persist(&registry).expect("persist").is_written());

        let saved = hash_store::load_at(&store_path).expect("load");
        assert!(saved.files.contains_key(&torrc.to_string_lossy().to_string()));
    }
}
