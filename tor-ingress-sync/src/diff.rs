//! Unified diff of the torrc the registry would produce against the one on disk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use similar::TextDiff;

use tor_ingress_core::ServiceRegistry;
use tor_ingress_renderer::TorrcRenderer;

use crate::error::{io_err, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: PathBuf,
    pub unified_diff: String,
}

/// Render `registry` and compare it to the current content of `torrc_path`.
///
/// A missing file diffs against empty content. Returns `None` when they are
/// equal. No files are written.
pub fn diff_torrc(
    renderer: &TorrcRenderer,
    registry: &ServiceRegistry,
    torrc_path: &Path,
    data_directory: Option<&Path>,
) -> Result<Option<FileDiff>, SyncError> {
    let rendered = renderer.render(registry, data_directory)?;
    diff_against_disk(torrc_path, &rendered)
}

pub(crate) fn diff_against_disk(
    path: &Path,
    rendered: &str,
) -> Result<Option<FileDiff>, SyncError> {
    let rendered = normalize_line_endings(rendered);
    let existing = read_existing_or_empty(path)?;
    if existing == rendered {
        return Ok(None);
    }

    let old_header = format!("a/{}", path.display());
    let new_header = format!("b/{}", path.display());
    let unified = TextDiff::from_lines(&existing, &rendered)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string();

    Ok(Some(FileDiff {
        path: path.to_path_buf(),
        unified_diff: unified,
    }))
}

fn read_existing_or_empty(path: &Path) -> Result<String, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(normalize_line_endings(&content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(io_err(path, err)),
    }
}

fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n")
}
