//! Download completion detection.
//!
//! Browsers report partial writes and renames long before a download is
//! actually done. A file is only handed on once its size has stopped changing
//! and nobody else holds it open, with sibling activity in the same directory
//! stretching the patience for batch downloads.

mod batch;
mod detector;

pub use batch::directory_is_busy;
pub use detector::{BatchProbe, Readiness, ReadinessDetector};
