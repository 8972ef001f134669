//! Moving files and directories into their destination folder.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use crate::settings::RelocationSettings;

/// Counter limit for same-second collisions before falling back to a UUID
const MAX_COLLISION_COUNTER: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum RelocateError {
    /// Someone else moved or removed the source first
    #[error("source no longer exists: {0}")]
    Vanished(PathBuf),

    #[error("source has no file name: {0}")]
    InvalidSource(PathBuf),

    #[error("cannot create destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("gave up moving {path} after {attempts} attempts: {source}")]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

impl RelocateError {
    pub fn is_vanished(&self) -> bool {
        matches!(self, RelocateError::Vanished(_))
    }
}

/// Moves entries into destination directories with collision handling and
/// bounded retries past transient lock errors.
///
/// Destinations picked by in-flight moves are reserved, so concurrent moves
/// sharing one `Relocator` never race for the same target path.
#[derive(Debug, Default)]
pub struct Relocator {
    config: RelocationSettings,
    reserved: Mutex<HashSet<PathBuf>>,
}

/// Releases a reserved destination when the move is over.
struct Reservation<'a> {
    relocator: &'a Relocator,
    path: PathBuf,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.relocator.reserved_set().remove(&self.path);
    }
}

impl Relocator {
    pub fn new(config: RelocationSettings) -> Self {
        Self {
            config,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    fn reserved_set(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.reserved.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Relocator reservation mutex was poisoned, recovering...");
            poisoned.into_inner()
        })
    }

    /// Move `source` (file or directory) into `destination_dir`.
    ///
    /// Returns the final path. If the name is taken, a timestamp suffix is
    /// added before the extension (files) or at the end (directories).
    pub fn relocate(&self, source: &Path, destination_dir: &Path) -> Result<PathBuf, RelocateError> {
        let is_dir = match fs::symlink_metadata(source) {
            Ok(meta) => meta.is_dir(),
            Err(_) => {
                tracing::warn!(path = %source.display(), "Source not found (already moved?)");
                return Err(RelocateError::Vanished(source.to_path_buf()));
            }
        };

        let name = source
            .file_name()
            .ok_or_else(|| RelocateError::InvalidSource(source.to_path_buf()))?;

        fs::create_dir_all(destination_dir).map_err(|e| RelocateError::Destination {
            path: destination_dir.to_path_buf(),
            source: e,
        })?;

        let reservation = self.reserve(destination_dir, name, is_dir);
        let destination = &reservation.path;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            // Re-checked on every attempt: a concurrent processor may have
            // claimed the same source in the meantime.
            if fs::symlink_metadata(source).is_err() {
                tracing::warn!(path = %source.display(), "Source disappeared during move");
                return Err(RelocateError::Vanished(source.to_path_buf()));
            }

            match perform_move(source, destination, is_dir) {
                Ok(()) => {
                    tracing::info!(
                        from = %source.display(),
                        to = %destination.display(),
                        "Moved"
                    );
                    return Ok(destination.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound && fs::symlink_metadata(source).is_err() => {
                    tracing::warn!(path = %source.display(), "Source disappeared during move");
                    return Err(RelocateError::Vanished(source.to_path_buf()));
                }
                Err(e) => {
                    tracing::debug!(path = %source.display(), attempt, error = %e, "Move failed, retrying");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                thread::sleep(self.config.backoff());
            }
        }

        let source_err = last_error.unwrap_or_else(|| io::Error::other("move failed"));
        tracing::warn!(
            path = %source.display(),
            attempts,
            error = %source_err,
            "Failed to move after retries"
        );
        Err(RelocateError::Exhausted {
            path: source.to_path_buf(),
            attempts,
            source: source_err,
        })
    }

    /// Pick a free destination for `name` in `dir` and hold it.
    fn reserve(&self, dir: &Path, name: &OsStr, is_dir: bool) -> Reservation<'_> {
        let mut reserved = self.reserved_set();
        let path = free_path(dir, name, is_dir, |p| reserved.contains(p));
        reserved.insert(path.clone());
        Reservation { relocator: self, path }
    }
}

/// First unoccupied path for `name` in `dir`, applying the collision suffix
/// policy when the plain name is taken on disk or by `also_taken`.
pub(crate) fn free_path(dir: &Path, name: &OsStr, is_dir: bool, also_taken: impl Fn(&Path) -> bool) -> PathBuf {
    let taken = |p: &Path| p.exists() || also_taken(p);

    let plain = dir.join(name);
    if !taken(plain.as_path()) {
        return plain;
    }

    let stamp = chrono::Utc::now().timestamp().to_string();
    (0..MAX_COLLISION_COUNTER)
        .map(|n| collision_candidate(dir, name, is_dir, &stamp, n))
        .find(|candidate| !taken(candidate.as_path()))
        .unwrap_or_else(|| collision_candidate(dir, name, is_dir, &uuid::Uuid::new_v4().to_string(), 0))
}

/// `<stem>_<tag>[_n]<.ext>` for files, `<name>_<tag>[_n]` for directories.
fn collision_candidate(dir: &Path, name: &OsStr, is_dir: bool, tag: &str, n: u32) -> PathBuf {
    let suffix = if n == 0 {
        format!("_{}", tag)
    } else {
        format!("_{}_{}", tag, n)
    };

    let as_path = Path::new(name);
    let (stem, ext) = if is_dir {
        (name.to_string_lossy().to_string(), String::new())
    } else {
        (
            as_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            as_path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
        )
    };

    dir.join(format!("{}{}{}", stem, suffix, ext))
}

/// Rename, falling back to copy-then-delete across filesystems.
fn perform_move(source: &Path, destination: &Path, is_dir: bool) -> io::Result<()> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            tracing::debug!(from = %source.display(), "Cross-device move, copying instead");
            let copied = if is_dir {
                copy_dir_all(source, destination)
            } else {
                fs::copy(source, destination).map(|_| ())
            };
            if let Err(e) = copied {
                // Leave the source intact and don't keep a half copy around
                let _ = if is_dir {
                    fs::remove_dir_all(destination)
                } else {
                    fs::remove_file(destination)
                };
                return Err(e);
            }
            if is_dir {
                fs::remove_dir_all(source)
            } else {
                fs::remove_file(source)
            }
        }
        Err(e) => Err(e),
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
