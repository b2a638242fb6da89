//! Installed-extension discovery.
//!
//! This module provides the [`Scanner`] trait and an [`EditorScanner`] for each
//! VS Code-family editor.
//!
//! # Available Scanners
//!
//! | Source | Directory |
//! |--------|-----------|
//! | VSCode | `~/.vscode/extensions` |
//! | VSCode Insiders | `~/.vscode-insiders/extensions` |
//! | VSCodium | `~/.vscode-oss/extensions` |
//! | Cursor | `~/.cursor/extensions` |
//!
//! # Example
//!
//! ```no_run
//! use extaudit::scanner::{all_scanners, to_tasks, Scanner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut found = Vec::new();
//!     for scanner in all_scanners() {
//!         if scanner.is_supported() {
//!             found.extend(scanner.scan().await?);
//!         }
//!     }
//!     println!("{} scan tasks", to_tasks(&found).len());
//!     Ok(())
//! }
//! ```

mod editor;

pub use editor::{scan_extensions_dir, EditorScanner};

use crate::model::{Extension, Platform, ScanTask, Source};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

/// Trait for discovering installed extensions of one editor.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Returns the human-readable name of this scanner.
    fn name(&self) -> &'static str;

    /// Returns the source type this scanner handles.
    fn source(&self) -> Source;

    /// Returns the platforms this scanner supports.
    fn supported_platforms(&self) -> &[Platform];

    /// Returns true if this scanner is supported on the current platform.
    fn is_supported(&self) -> bool {
        let current = Platform::current();
        self.supported_platforms().contains(&current)
    }

    /// Scans for installed extensions and returns them.
    ///
    /// A missing editor is not an error; it yields an empty list.
    async fn scan(&self) -> Result<Vec<Extension>>;
}

/// Returns a scanner for every supported editor.
///
/// # Example
///
/// ```
/// use extaudit::scanner::all_scanners;
///
/// assert_eq!(all_scanners().len(), 4);
/// ```
pub fn all_scanners() -> Vec<Box<dyn Scanner>> {
    Source::ALL.iter().map(|&source| get_scanner(source)).collect()
}

/// Returns the scanner for a specific source.
pub fn get_scanner(source: Source) -> Box<dyn Scanner> {
    Box::new(EditorScanner::new(source))
}

/// Turns discovered extensions into scan tasks.
///
/// The same `(id, version)` installed in several editors is scanned once.
/// `original_index` follows discovery order.
pub fn to_tasks(extensions: &[Extension]) -> Vec<ScanTask> {
    let mut seen = HashSet::new();
    extensions
        .iter()
        .filter(|ext| seen.insert((ext.id.as_str(), ext.version.as_str())))
        .enumerate()
        .map(|(index, ext)| ScanTask::new(ext.id.clone(), ext.version.clone(), index))
        .collect()
}
