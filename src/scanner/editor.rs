use crate::model::{Extension, ExtensionMetadata, Platform, Source};
use crate::platform::editor_extensions_dir;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Scanner for a VS Code-family editor's extensions directory.
pub struct EditorScanner {
    source: Source,
}

impl EditorScanner {
    pub fn new(source: Source) -> Self {
        Self { source }
    }
}

#[derive(Deserialize)]
struct ExtensionManifest {
    name: Option<String>,
    #[serde(alias = "displayName")]
    display_name: Option<String>,
    version: Option<String>,
    publisher: Option<String>,
    description: Option<String>,
    repository: Option<RepositoryField>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RepositoryField {
    String(String),
    Object { url: String },
}

impl RepositoryField {
    fn url(&self) -> &str {
        match self {
            RepositoryField::String(s) => s,
            RepositoryField::Object { url } => url,
        }
    }
}

#[async_trait]
impl super::Scanner for EditorScanner {
    fn name(&self) -> &'static str {
        match self.source {
            Source::Vscode => "VSCode Extensions",
            Source::VscodeInsiders => "VSCode Insiders Extensions",
            Source::Vscodium => "VSCodium Extensions",
            Source::Cursor => "Cursor Extensions",
        }
    }

    fn source(&self) -> Source {
        self.source
    }

    fn supported_platforms(&self) -> &[Platform] {
        &[Platform::Linux, Platform::MacOS, Platform::Windows]
    }

    async fn scan(&self) -> Result<Vec<Extension>> {
        let extensions_dir = match editor_extensions_dir(self.source) {
            Some(dir) => dir,
            None => return Ok(Vec::new()),
        };

        scan_extensions_dir(&extensions_dir, self.source)
    }
}

/// Reads every `<dir>/*/package.json` under an editor's extensions folder.
///
/// Folders the editor has marked for removal in `.obsolete` are skipped, as are
/// folders without a readable manifest.
pub fn scan_extensions_dir(extensions_dir: &Path, source: Source) -> Result<Vec<Extension>> {
    let obsolete = read_obsolete(extensions_dir);
    let mut extensions = Vec::new();

    let entries = fs::read_dir(extensions_dir).with_context(|| {
        format!(
            "Failed to read {} extensions directory: {:?}",
            source.display_name(),
            extensions_dir
        )
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let folder = entry.file_name().to_string_lossy().to_string();
        if obsolete.get(&folder).copied().unwrap_or(false) {
            debug!(folder = %folder, "skipping obsolete extension");
            continue;
        }

        let manifest: ExtensionManifest = match fs::read_to_string(path.join("package.json"))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
        {
            Some(m) => m,
            None => continue,
        };

        let id = match (&manifest.publisher, &manifest.name) {
            (Some(publisher), Some(name)) => format!("{}.{}", publisher, name),
            _ => folder,
        };
        let version = manifest.version.unwrap_or_else(|| "0.0.0".to_string());

        let metadata = ExtensionMetadata {
            display_name: manifest.display_name,
            description: manifest.description,
            repository: manifest.repository.map(|r| r.url().to_string()),
        };

        extensions.push(
            Extension::new(id, version, source)
                .with_path(path)
                .with_metadata(metadata),
        );
    }

    extensions.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.version.cmp(&b.version)));
    Ok(extensions)
}

fn read_obsolete(extensions_dir: &Path) -> HashMap<String, bool> {
    fs::read_to_string(extensions_dir.join(".obsolete"))
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn install(dir: &Path, folder: &str, manifest: &str) {
        let path = dir.join(folder);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("package.json"), manifest).unwrap();
    }

    #[test]
    fn test_reads_manifests() {
        let dir = TempDir::new().unwrap();
        install(
            dir.path(),
            "rust-lang.rust-analyzer-0.3.2000",
            r#"{
                "name": "rust-analyzer",
                "publisher": "rust-lang",
                "version": "0.3.2000",
                "displayName": "rust-analyzer",
                "repository": {"url": "https://github.com/rust-lang/rust-analyzer"}
            }"#,
        );
        install(
            dir.path(),
            "esbenp.prettier-vscode-10.1.0",
            r#"{"name":"prettier-vscode","publisher":"esbenp","version":"10.1.0"}"#,
        );
        fs::write(dir.path().join("extensions.json"), "[]").unwrap();

        let found = scan_extensions_dir(dir.path(), Source::Cursor).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "esbenp.prettier-vscode");
        assert_eq!(found[1].id, "rust-lang.rust-analyzer");
        assert_eq!(found[1].version, "0.3.2000");
        assert_eq!(found[1].source, Source::Cursor);
        assert_eq!(
            found[1].metadata.repository.as_deref(),
            Some("https://github.com/rust-lang/rust-analyzer")
        );
    }

    #[test]
    fn test_skips_obsolete_and_broken_folders() {
        let dir = TempDir::new().unwrap();
        install(
            dir.path(),
            "old.ext-1.0.0",
            r#"{"name":"ext","publisher":"old","version":"1.0.0"}"#,
        );
        install(
            dir.path(),
            "old.ext-2.0.0",
            r#"{"name":"ext","publisher":"old","version":"2.0.0"}"#,
        );
        install(dir.path(), "broken-1.0.0", "{ not json");
        fs::write(dir.path().join(".obsolete"), r#"{"old.ext-1.0.0": true}"#).unwrap();

        let found = scan_extensions_dir(dir.path(), Source::Vscode).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "2.0.0");
    }

    #[test]
    fn test_missing_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(scan_extensions_dir(&dir.path().join("nope"), Source::Vscode).is_err());
    }
}
