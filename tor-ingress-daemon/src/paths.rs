use std::path::{Path, PathBuf};
use std::time::Duration;

/// Quiet period after the last watcher event for a file before it is rescanned.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const STATUS_FILE_EXTENSION: &str = "json";

/// `<status_dir>/<namespace>/<name>.json`
pub fn status_file_path(status_dir: &Path, namespace: &str, name: &str) -> PathBuf {
    status_dir
        .join(namespace)
        .join(format!("{name}.{STATUS_FILE_EXTENSION}"))
}

pub fn is_manifest_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}
