//! Persisted user settings.
//!
//! Layered as: built-in defaults, then `settings.json` in the platform config
//! directory, then `DOWNLOAD_ORGANIZER_*` environment variables (a `.env` file
//! is loaded into the environment first by the binary).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrganizerError, Result};

pub const ENV_WATCH_DIR: &str = "DOWNLOAD_ORGANIZER_WATCH_DIR";
pub const ENV_TARGET_DIR: &str = "DOWNLOAD_ORGANIZER_TARGET_DIR";
pub const ENV_AUTO_EXTRACT: &str = "DOWNLOAD_ORGANIZER_AUTO_EXTRACT";

/// Tuning for the readiness detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub poll_interval_ms: u64,
    /// Consecutive unchanged size observations required
    pub stable_polls: u32,
    /// How long a file may take to stabilize on its own
    pub max_wait_secs: u64,
    /// Absolute ceiling when sibling downloads keep extending the wait.
    /// Never below `max_wait_secs`.
    pub max_busy_wait_secs: u64,
    /// Polls a zero-byte file is held before size 0 may count as stable
    pub zero_byte_grace_polls: u32,
    pub lock_retries: u32,
    pub lock_retry_delay_ms: u64,
    /// Siblings modified this recently mean a batch is still downloading
    pub batch_window_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            stable_polls: 3,
            max_wait_secs: 60,
            max_busy_wait_secs: 90,
            zero_byte_grace_polls: 5,
            lock_retries: 10,
            lock_retry_delay_ms: 1000,
            batch_window_secs: 5,
        }
    }
}

/// Tuning for the relocator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationSettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RelocationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 1000,
        }
    }
}

impl RelocationSettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory to monitor; falls back to the platform download directory
    pub watch_folder: Option<PathBuf>,
    /// Base for destination folders; falls back to the watch folder
    pub target_folder: Option<PathBuf>,
    pub auto_extract: bool,
    /// Extensions (without dot) treated as archives
    pub archive_extensions: Vec<String>,
    /// Suffixes of in-progress download files
    pub ignored_extensions: Vec<String>,
    /// File-name prefix of dropped context marker files
    pub marker_prefix: String,
    /// External extraction utility tried before the built-in one
    pub external_extractor: Option<String>,
    pub max_concurrent_files: usize,
    pub readiness: ReadinessSettings,
    pub relocation: RelocationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_folder: None,
            target_folder: None,
            auto_extract: true,
            archive_extensions: vec!["zip".to_string()],
            ignored_extensions: [".crdownload", ".tmp", ".download", ".irx", ".partial", ".part"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            marker_prefix: "_plm_context".to_string(),
            external_extractor: Some("7z".to_string()),
            max_concurrent_files: num_cpus::get().max(1) * 2,
            readiness: ReadinessSettings::default(),
            relocation: RelocationSettings::default(),
        }
    }
}

impl Settings {
    /// Default location of the settings file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("download-organizer").join("settings.json"))
    }

    /// Load settings from the default file and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut settings = match Self::default_path() {
            Some(path) => Self::load_from(&path)?,
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Self::default()
            }
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path).map_err(|source| OrganizerError::SettingsIo {
            path: path.to_path_buf(),
            source,
        })?;

        let settings = serde_json::from_str(&json).map_err(|source| OrganizerError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Write settings to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let io_err = |source| OrganizerError::SettingsIo {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|source| OrganizerError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })?;

        fs::write(path, json).map_err(io_err)?;
        Ok(())
    }

    /// Write settings to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path().ok_or(OrganizerError::MissingDirectory("config"))?;
        self.save_to(&path)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var(ENV_WATCH_DIR).filter(|v| !v.trim().is_empty()) {
            self.watch_folder = Some(PathBuf::from(dir));
        }
        if let Some(dir) = var(ENV_TARGET_DIR).filter(|v| !v.trim().is_empty()) {
            self.target_folder = Some(PathBuf::from(dir));
        }
        if let Some(flag) = var(ENV_AUTO_EXTRACT) {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.auto_extract = true,
                "0" | "false" | "no" | "off" => self.auto_extract = false,
                other => tracing::warn!(value = other, "Ignoring invalid {}", ENV_AUTO_EXTRACT),
            }
        }
    }

    /// The configured watch folder if it exists, else the download directory.
    pub fn resolve_watch_folder(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.watch_folder {
            if dir.is_dir() {
                return Ok(dir.clone());
            }
            tracing::warn!(path = %dir.display(), "Configured watch folder missing, falling back to downloads");
        }
        dirs::download_dir().ok_or(OrganizerError::MissingDirectory("downloads"))
    }

    /// Where destination folders are created for files found in `watch_folder`.
    pub fn resolve_target_base(&self, watch_folder: &Path) -> PathBuf {
        self.target_folder
            .clone()
            .unwrap_or_else(|| watch_folder.to_path_buf())
    }

    pub fn is_archive(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy();
                self.archive_extensions
                    .iter()
                    .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(&ext))
            })
            .unwrap_or(false)
    }

    pub fn is_ignored_temp(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.ignored_extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_lowercase()))
    }

    pub fn is_marker(&self, file_name: &str) -> bool {
        file_name.starts_with(&self.marker_prefix) && file_name.to_lowercase().ends_with(".json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&temp_dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        fs::write(&path, r#"{"auto_extract": false, "readiness": {"stable_polls": 5}}"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert!(!settings.auto_extract);
        assert_eq!(settings.readiness.stable_polls, 5);
        assert_eq!(settings.readiness.lock_retries, 10);
        assert_eq!(settings.marker_prefix, "_plm_context");
    }

    #[test]
    fn test_default_readiness_wait_is_bounded() {
        let readiness = ReadinessSettings::default();
        assert!(readiness.max_wait_secs <= readiness.max_busy_wait_secs);
        assert!(readiness.max_busy_wait_secs <= 90);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            Settings::load_from(&path),
            Err(OrganizerError::SettingsParse { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("settings.json");
        let settings = Settings {
            target_folder: Some(temp_dir.path().join("out")),
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_WATCH_DIR, "/data/in"),
            (ENV_AUTO_EXTRACT, "off"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.watch_folder, Some(PathBuf::from("/data/in")));
        assert!(settings.target_folder.is_none());
        assert!(!settings.auto_extract);
    }

    #[test]
    fn test_classification_helpers() {
        let settings = Settings::default();
        assert!(settings.is_archive(Path::new("/x/report.ZIP")));
        assert!(!settings.is_archive(Path::new("/x/report.pdf")));
        assert!(settings.is_ignored_temp("movie.mkv.CRDOWNLOAD"));
        assert!(!settings.is_ignored_temp("movie.mkv"));
        assert!(settings.is_marker("_plm_context (1).json"));
        assert!(!settings.is_marker("_plm_context.txt"));
    }

    #[test]
    fn test_target_base_falls_back_to_watch_folder() {
        let settings = Settings::default();
        assert_eq!(settings.resolve_target_base(Path::new("/w")), PathBuf::from("/w"));
    }
}
