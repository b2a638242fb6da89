//! Cross-platform path resolution.
//!
//! Functions that look for something on disk return `Option<PathBuf>`:
//! `None` if the directory doesn't exist or can't be determined.

use crate::model::Source;
use std::path::PathBuf;

/// Returns the extensions directory of a VS Code-family editor.
///
/// Location: `~/<dot dir>/extensions/` on all platforms, where the dot
/// directory is `.vscode`, `.vscode-insiders`, `.vscode-oss` or `.cursor`.
///
/// Returns `None` if the directory doesn't exist.
pub fn editor_extensions_dir(source: Source) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let path = home.join(source.home_dir_name()).join("extensions");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

/// Returns the directory extaudit keeps its cache in.
///
/// Platform-specific locations:
/// - Linux: `~/.cache/extaudit/`
/// - macOS: `~/Library/Caches/extaudit/`
/// - Windows: `%LOCALAPPDATA%\extaudit\`
pub fn cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("extaudit"))
}

/// Default location of the cache database. Falls back to the working
/// directory when the platform has no cache directory.
pub fn default_cache_path() -> PathBuf {
    cache_dir()
        .unwrap_or_else(|| PathBuf::from(".extaudit"))
        .join("scans.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_path_file_name() {
        let path = default_cache_path();
        assert_eq!(path.file_name().unwrap(), "scans.db");
        assert!(path.parent().unwrap().ends_with("extaudit") || path.parent().unwrap().ends_with(".extaudit"));
    }
}
