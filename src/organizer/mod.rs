//! Routing of finished downloads into context folders.

pub mod archive;
mod pipeline;
pub mod relocate;

pub use archive::{process_archive, ArchiveExtractor, ExtractionOutcome};
pub use pipeline::{FileKind, Organizer, OrganizerEvent};
pub use relocate::{RelocateError, Relocator};
