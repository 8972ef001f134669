//! Crate-wide error type.
//!
//! Component outcomes that are expected in normal operation (a download that
//! vanished, a file still locked, a corrupt archive) are modelled as values by
//! their own modules. `OrganizerError` covers the failures a caller actually
//! has to act on.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrganizerError {
    #[error("failed to read settings from {path}: {source}")]
    SettingsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings from {path}: {source}")]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not determine {0} directory")]
    MissingDirectory(&'static str),

    #[error("cannot watch {path}: {reason}")]
    InvalidWatchPath { path: PathBuf, reason: String },

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("malformed context marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("extraction of {path} failed: {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrganizerError>;
