//! Progress reporting for scan jobs.

use std::path::Path;

/// Trait for observing scan progress.
///
/// Implementations can target a CLI progress bar, a log, or any other
/// channel. All methods have empty default bodies so implementers only
/// override what they display.
pub trait ProgressReporter: Send + Sync {
    /// A scan pass begins; `count` is the number of journaled events about
    /// to be consumed.
    fn on_start_scan(&self, _count: u64) {}

    /// A worker begins applying the event for `path`.
    fn on_start_handle_file(&self, _path: &Path) {}

    /// The event for `path` has been fully applied.
    fn on_complete_handle_file(&self, _path: &Path) {}

    /// A page of the PDF currently being split has been written.
    fn on_complete_handle_pdf_page(&self, _index: usize, _total: usize) {}

    /// A page of the PDF currently being indexed has been committed to
    /// both backends.
    fn on_complete_index_pdf_page(&self, _index: usize, _total: usize) {}
}

/// A no-op reporter that discards all events.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
