use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Whether any sibling of `except_path` was modified within `window`.
///
/// Partial-download files count: a growing `.crdownload` is exactly the
/// evidence of a batch still in flight. An unreadable directory or a
/// directory without siblings is "not busy".
pub fn directory_is_busy(except_path: &Path, window: Duration) -> bool {
    let Some(dir) = except_path.parent() else {
        return false;
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Cannot list directory for batch probe");
            return false;
        }
    };

    let now = SystemTime::now();
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path() != except_path)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .filter_map(|meta| meta.modified().ok())
        .any(|modified| match now.duration_since(modified) {
            Ok(age) => age <= window,
            // Modified "in the future": clock skew on the writer, treat as fresh
            Err(_) => true,
        })
}
