//! One unit of work per detected file: classify, wait, route.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::archive::{process_archive, ArchiveExtractor};
use super::relocate::Relocator;
use crate::context::{ContextPayload, ContextStore};
use crate::error::OrganizerError;
use crate::readiness::{Readiness, ReadinessDetector};
use crate::settings::Settings;

/// Browsers keep a freshly saved file open for a moment after the rename
const MARKER_SETTLE: Duration = Duration::from_millis(200);

/// Reported to the outer shell as files are handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OrganizerEvent {
    /// A download was routed; for archives `destination` is the moved archive
    FileProcessed { source: PathBuf, destination: PathBuf },
    /// A download was left in place
    Skipped { path: PathBuf, reason: String },
}

/// What a path in the watch folder turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Out-of-band context update dropped by the browser extension
    Marker,
    /// In-progress download, renamed to its final name later
    TempDownload,
    /// Directory, symlink, hidden file or already gone
    NotEligible,
    Candidate,
}

/// Routes downloads found in one watch folder.
///
/// Shared by all in-flight units; every method takes `&self`.
pub struct Organizer {
    settings: Settings,
    store: ContextStore,
    detector: ReadinessDetector,
    relocator: Arc<Relocator>,
    extractor: ArchiveExtractor,
    target_base: PathBuf,
    events: UnboundedSender<OrganizerEvent>,
}

impl Organizer {
    pub fn new(
        settings: Settings,
        store: ContextStore,
        watch_folder: &Path,
        events: UnboundedSender<OrganizerEvent>,
    ) -> Self {
        Self {
            detector: ReadinessDetector::new(settings.readiness.clone()),
            relocator: Arc::new(Relocator::new(settings.relocation.clone())),
            extractor: ArchiveExtractor::new(settings.external_extractor.clone()),
            target_base: settings.resolve_target_base(watch_folder),
            settings,
            store,
            events,
        }
    }

    /// Replace the readiness detector (custom batch probe, tuning)
    pub fn with_detector(mut self, detector: ReadinessDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn target_base(&self) -> &Path {
        &self.target_base
    }

    pub fn classify(&self, path: &Path) -> FileKind {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return FileKind::NotEligible;
        };

        // symlink_metadata so links are never followed out of the folder
        let is_regular = fs::symlink_metadata(path)
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(false);
        if !is_regular || file_name.starts_with('.') {
            return FileKind::NotEligible;
        }

        if self.settings.is_marker(&file_name) {
            FileKind::Marker
        } else if self.settings.is_ignored_temp(&file_name) {
            FileKind::TempDownload
        } else {
            FileKind::Candidate
        }
    }

    /// Handle one detected path to completion. Blocks; run off the async
    /// executor.
    pub fn process(&self, path: &Path) {
        match self.classify(path) {
            FileKind::Marker => self.consume_marker(path),
            FileKind::TempDownload => {
                tracing::debug!(path = %path.display(), "Ignoring in-progress download");
            }
            FileKind::NotEligible => {}
            FileKind::Candidate => self.route(path),
        }
    }

    fn consume_marker(&self, path: &Path) {
        thread::sleep(MARKER_SETTLE);

        let payload = match read_marker(path) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Leaving unreadable context marker in place");
                return;
            }
        };

        self.store.update(&payload);

        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete context marker");
        }
    }

    fn route(&self, path: &Path) {
        match self.detector.check(path) {
            Readiness::Ready => {}
            Readiness::Vanished => {
                tracing::debug!(path = %path.display(), "Download vanished before it settled");
                return;
            }
            verdict => {
                tracing::warn!(path = %path.display(), ?verdict, "Download never became ready");
                return;
            }
        }

        // Whatever context is live right now wins; it may have changed since
        // the file first appeared.
        let Some(context) = self.store.snapshot() else {
            tracing::warn!(path = %path.display(), "No active context, leaving file in place");
            self.emit(OrganizerEvent::Skipped {
                path: path.to_path_buf(),
                reason: "no active context".to_string(),
            });
            return;
        };

        let destination_dir = self.target_base.join(&context.folder_name);

        let moved = if self.settings.auto_extract && self.settings.is_archive(path) {
            process_archive(&self.extractor, &self.relocator, path, &destination_dir)
        } else {
            match self.relocator.relocate(path, &destination_dir) {
                Ok(moved) => Some(moved),
                Err(e) if e.is_vanished() => None,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to move download");
                    None
                }
            }
        };

        if let Some(destination) = moved {
            tracing::info!(
                file = %path.display(),
                id = %context.primary_id,
                destination = %destination.display(),
                "Download organized"
            );
            self.emit(OrganizerEvent::FileProcessed {
                source: path.to_path_buf(),
                destination,
            });
        }
    }

    fn emit(&self, event: OrganizerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("No listener for organizer events");
        }
    }
}

fn read_marker(path: &Path) -> crate::error::Result<ContextPayload> {
    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|source| OrganizerError::Marker {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ReadinessSettings, RelocationSettings};
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn fast_settings() -> Settings {
        Settings {
            external_extractor: None,
            readiness: ReadinessSettings {
                poll_interval_ms: 20,
                stable_polls: 2,
                max_wait_secs: 2,
                max_busy_wait_secs: 3,
                zero_byte_grace_polls: 3,
                lock_retries: 2,
                lock_retry_delay_ms: 10,
                batch_window_secs: 1,
            },
            relocation: RelocationSettings {
                max_attempts: 2,
                backoff_ms: 10,
            },
            ..Default::default()
        }
    }

    fn organizer(watch: &Path, store: &ContextStore) -> (Organizer, UnboundedReceiver<OrganizerEvent>) {
        let (tx, rx) = unbounded_channel();
        (Organizer::new(fast_settings(), store.clone(), watch, tx), rx)
    }

    fn crash_report_context() -> ContextStore {
        let store = ContextStore::new();
        store.update(&ContextPayload {
            defect_id: Some("DF100".into()),
            title: Some("[x] Crash Report".into()),
            url: Some("test".into()),
            ..Default::default()
        });
        store
    }

    fn write_zip(path: &Path) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("log.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"stack trace").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_archive_routed_with_extraction() {
        let temp_dir = TempDir::new().unwrap();
        let store = crash_report_context();
        let (organizer, mut rx) = organizer(temp_dir.path(), &store);

        let archive = temp_dir.path().join("report.zip");
        write_zip(&archive);
        organizer.process(&archive);

        let dest = temp_dir.path().join("[DF100]_Crash_Report");
        assert!(dest.join("report.zip").is_file());
        assert!(dest.join("report").join("log.txt").is_file());
        assert!(!archive.exists());

        assert_eq!(
            rx.try_recv().unwrap(),
            OrganizerEvent::FileProcessed {
                source: archive,
                destination: dest.join("report.zip"),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_plain_file_goes_to_target_folder() {
        let temp_dir = TempDir::new().unwrap();
        let watch = temp_dir.path().join("in");
        let target = temp_dir.path().join("out");
        fs::create_dir_all(&watch).unwrap();

        let store = crash_report_context();
        let (tx, mut rx) = unbounded_channel();
        let settings = Settings {
            target_folder: Some(target.clone()),
            ..fast_settings()
        };
        let organizer = Organizer::new(settings, store, &watch, tx);

        let file = watch.join("trace.log");
        fs::write(&file, b"trace").unwrap();
        organizer.process(&file);

        let expected = target.join("[DF100]_Crash_Report").join("trace.log");
        assert!(expected.is_file());
        assert!(matches!(
            rx.try_recv(),
            Ok(OrganizerEvent::FileProcessed { destination, .. }) if destination == expected
        ));
    }

    #[test]
    fn test_archive_moved_unextracted_when_auto_extract_off() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = unbounded_channel();
        let settings = Settings {
            auto_extract: false,
            ..fast_settings()
        };
        let organizer = Organizer::new(settings, crash_report_context(), temp_dir.path(), tx);

        let archive = temp_dir.path().join("report.zip");
        write_zip(&archive);
        organizer.process(&archive);

        let dest = temp_dir.path().join("[DF100]_Crash_Report");
        assert!(dest.join("report.zip").is_file());
        assert!(!dest.join("report").exists());
    }

    #[test]
    fn test_no_context_leaves_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContextStore::new();
        let (organizer, mut rx) = organizer(temp_dir.path(), &store);

        let file = temp_dir.path().join("orphan.pdf");
        fs::write(&file, b"pdf").unwrap();
        organizer.process(&file);

        assert!(file.is_file());
        assert!(matches!(rx.try_recv(), Ok(OrganizerEvent::Skipped { path, .. }) if path == file));
    }

    #[test]
    fn test_marker_updates_context_and_is_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContextStore::new();
        let (organizer, _rx) = organizer(temp_dir.path(), &store);

        let marker = temp_dir.path().join("_plm_context (1).json");
        fs::write(&marker, r#"{"plm_id": "P-7", "title": "Bracket  rev B", "url": "marker"}"#).unwrap();

        assert_eq!(organizer.classify(&marker), FileKind::Marker);
        organizer.process(&marker);

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.primary_id, "P-7");
        assert_eq!(snap.folder_name, "[P-7]_Bracket");
        assert!(!marker.exists());
    }

    #[test]
    fn test_malformed_marker_left_in_place() {
        let temp_dir = TempDir::new().unwrap();
        let store = crash_report_context();
        let (organizer, _rx) = organizer(temp_dir.path(), &store);

        let marker = temp_dir.path().join("_plm_context.json");
        fs::write(&marker, "{ not json").unwrap();
        organizer.process(&marker);

        assert!(marker.exists());
        assert_eq!(store.snapshot().unwrap().primary_id, "DF100");
    }

    #[test]
    fn test_classification() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContextStore::new();
        let (organizer, _rx) = organizer(temp_dir.path(), &store);

        let partial = temp_dir.path().join("movie.mkv.Crdownload");
        let hidden = temp_dir.path().join(".DS_Store");
        let sub = temp_dir.path().join("folder");
        let normal = temp_dir.path().join("notes.txt");
        fs::write(&partial, b"x").unwrap();
        fs::write(&hidden, b"x").unwrap();
        fs::create_dir_all(&sub).unwrap();
        fs::write(&normal, b"x").unwrap();

        assert_eq!(organizer.classify(&partial), FileKind::TempDownload);
        assert_eq!(organizer.classify(&hidden), FileKind::NotEligible);
        assert_eq!(organizer.classify(&sub), FileKind::NotEligible);
        assert_eq!(organizer.classify(&temp_dir.path().join("gone")), FileKind::NotEligible);
        assert_eq!(organizer.classify(&normal), FileKind::Candidate);
    }

    #[test]
    fn test_temp_download_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let store = crash_report_context();
        let (organizer, mut rx) = organizer(temp_dir.path(), &store);

        let partial = temp_dir.path().join("big.iso.part");
        fs::write(&partial, b"partial").unwrap();
        organizer.process(&partial);

        assert!(partial.exists());
        assert!(rx.try_recv().is_err());
    }
}
