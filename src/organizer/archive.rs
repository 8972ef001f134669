//! Extract-then-relocate workflow for downloaded archives.
//!
//! The archive is unpacked next to itself, then the archive and whatever was
//! extracted are both moved into the destination. Every step tolerates the
//! failure of the ones before it: the user always gets the archive, extracted
//! or not.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use filetime::{set_file_mtime, FileTime};

use super::relocate::{free_path, Relocator};
use crate::error::{OrganizerError, Result};

/// How an extraction attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// Unpacked by the external utility
    External,
    /// Unpacked by the built-in ZIP reader
    Builtin,
    /// The archive could not be read; nothing was extracted by us
    Corrupt,
    /// I/O or permission failure part-way through
    Failed(String),
}

impl ExtractionOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, ExtractionOutcome::External | ExtractionOutcome::Builtin)
    }
}

/// State of one archive being processed
#[derive(Debug)]
pub struct ArchiveJob {
    pub archive_path: PathBuf,
    pub extraction_dir: PathBuf,
    pub extraction_succeeded: bool,
}

impl ArchiveJob {
    /// Extraction goes to `<dir>/<stem>`, or a suffixed sibling if that name
    /// is already taken by something else.
    pub fn new(archive_path: &Path) -> Self {
        let dir = archive_path.parent().unwrap_or_else(|| Path::new("."));
        let stem = archive_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| OsString::from("extracted"));

        Self {
            archive_path: archive_path.to_path_buf(),
            extraction_dir: free_path(dir, &stem, true, |_| false),
            extraction_succeeded: false,
        }
    }
}

/// Unpacks archives, preferring an external utility when one is installed
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    /// Invoked as `<tool> x -y -o<dir> <archive>` (7-Zip syntax)
    external_tool: Option<String>,
}

impl ArchiveExtractor {
    pub fn new(external_tool: Option<String>) -> Self {
        Self { external_tool }
    }

    pub fn extract(&self, archive: &Path, dest: &Path) -> ExtractionOutcome {
        if let Some(tool) = &self.external_tool {
            match extract_external(tool, archive, dest) {
                Ok(true) => return ExtractionOutcome::External,
                Ok(false) => tracing::debug!(tool = %tool, "External extractor not installed"),
                Err(e) => tracing::warn!(error = %e, "External extraction failed, falling back"),
            }
        }

        if !is_valid_zip(archive) {
            tracing::warn!(path = %archive.display(), "Invalid or corrupt archive, skipping extraction");
            return ExtractionOutcome::Corrupt;
        }

        match extract_zip(archive, dest) {
            Ok(()) => ExtractionOutcome::Builtin,
            Err(e) => {
                tracing::warn!(error = %e, "Extraction failed");
                ExtractionOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Run the full workflow for one archive.
///
/// Returns the archive's new location when it was moved. That move, not the
/// extraction, decides whether the file counts as processed.
pub fn process_archive(
    extractor: &ArchiveExtractor,
    relocator: &Relocator,
    archive: &Path,
    destination_dir: &Path,
) -> Option<PathBuf> {
    let mut job = ArchiveJob::new(archive);

    if !job.archive_path.exists() {
        tracing::warn!(path = %archive.display(), "Archive missing before extraction");
    } else {
        tracing::info!(
            archive = %archive.display(),
            into = %job.extraction_dir.display(),
            "Extracting"
        );
        job.extraction_succeeded = extractor.extract(&job.archive_path, &job.extraction_dir).succeeded();
    }

    let moved_archive = match relocator.relocate(&job.archive_path, destination_dir) {
        Ok(path) => Some(path),
        Err(e) if e.is_vanished() => None,
        Err(e) => {
            tracing::error!(error = %e, "Failed to relocate archive");
            None
        }
    };

    // Partial output is moved too, so nothing is left behind in the watch folder
    if job.extraction_dir.exists() {
        if !job.extraction_succeeded {
            tracing::warn!(path = %job.extraction_dir.display(), "Moving partial extraction");
        }
        if let Err(e) = relocator.relocate(&job.extraction_dir, destination_dir) {
            tracing::warn!(error = %e, "Failed to relocate extracted folder");
        }
    }

    moved_archive
}

/// `Ok(false)` when the tool is not installed.
fn extract_external(tool: &str, archive: &Path, dest: &Path) -> Result<bool> {
    let mut out_arg = OsString::from("-o");
    out_arg.push(dest.as_os_str());
    let args = [
        OsString::from("x"),
        OsString::from("-y"),
        out_arg,
        archive.as_os_str().to_os_string(),
    ];

    let output = duct::cmd(tool, args)
        .stdout_null()
        .stderr_capture()
        .unchecked()
        .run();

    let output = match output {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if !output.status.success() {
        return Err(OrganizerError::Extraction {
            path: archive.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(true)
}

/// Well-formed means the central directory can be read.
fn is_valid_zip(path: &Path) -> bool {
    File::open(path)
        .map(|file| zip::ZipArchive::new(file).is_ok())
        .unwrap_or(false)
}

fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    let zip_err = |e: zip::result::ZipError| OrganizerError::Extraction {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_err)?;
    fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        // Absolute paths and `..` components never leave `dest`
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(entry = entry.name(), "Skipping unsafe archive entry");
            continue;
        };

        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out_file = File::create(&out_path)?;
        io::copy(&mut entry, &mut out_file)?;

        if let Some(mtime) = entry.last_modified().and_then(zip_time_to_unix) {
            let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
        }
    }

    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
        .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)
        .map(|t| t.and_utc().timestamp())
}
