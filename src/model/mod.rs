//! Core data types for discovered extensions and scan results.
//!
//! - [`Extension`] - An installed editor extension
//! - [`Source`] - The editor it was found in
//! - [`ScanTask`] - One `(item_id, version)` to audit
//! - [`ScanOutcome`] - What happened to a task
//! - [`ScanStatistics`] - Per-run counters
//!
//! # Example
//!
//! ```
//! use extaudit::model::{Extension, ScanTask, Source};
//!
//! let ext = Extension::new("publisher.ext", "1.0.0", Source::Vscode);
//! let tasks = ScanTask::from_pairs([(ext.id.clone(), ext.version.clone())]);
//!
//! assert_eq!(tasks[0].original_index, 0);
//! ```

mod package;
mod scan;

pub use package::*;
pub use scan::*;
