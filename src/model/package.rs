use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Editor whose extensions directory an [`Extension`] was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Vscode,
    VscodeInsiders,
    Vscodium,
    Cursor,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Vscode,
        Source::VscodeInsiders,
        Source::Vscodium,
        Source::Cursor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Vscode => "vscode",
            Source::VscodeInsiders => "vscode-insiders",
            Source::Vscodium => "vscodium",
            Source::Cursor => "cursor",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Source::Vscode => "VSCode",
            Source::VscodeInsiders => "VSCode Insiders",
            Source::Vscodium => "VSCodium",
            Source::Cursor => "Cursor",
        }
    }

    /// Name of the per-user dot directory holding the `extensions/` folder.
    pub fn home_dir_name(&self) -> &'static str {
        match self {
            Source::Vscode => ".vscode",
            Source::VscodeInsiders => ".vscode-insiders",
            Source::Vscodium => ".vscode-oss",
            Source::Cursor => ".cursor",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vscode" | "code" => Ok(Source::Vscode),
            "vscode-insiders" | "insiders" => Ok(Source::VscodeInsiders),
            "vscodium" | "codium" => Ok(Source::Vscodium),
            "cursor" => Ok(Source::Cursor),
            _ => Err(format!(
                "Unknown source: {}. Use: vscode, vscode-insiders, vscodium, cursor",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOS,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        #[cfg(target_os = "linux")]
        return Platform::Linux;
        #[cfg(target_os = "macos")]
        return Platform::MacOS;
        #[cfg(target_os = "windows")]
        return Platform::Windows;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// An installed extension found by a [`Scanner`](crate::scanner::Scanner).
///
/// `id` is the marketplace identifier, `publisher.name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub id: String,
    pub version: String,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,
    #[serde(flatten)]
    pub metadata: ExtensionMetadata,
}

impl Extension {
    pub fn new(id: impl Into<String>, version: impl Into<String>, source: Source) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            source,
            install_path: None,
            metadata: ExtensionMetadata::default(),
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.install_path = Some(path);
        self
    }

    pub fn with_metadata(mut self, metadata: ExtensionMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_from_str_aliases() {
        assert_eq!("code".parse::<Source>(), Ok(Source::Vscode));
        assert_eq!("Insiders".parse::<Source>(), Ok(Source::VscodeInsiders));
        assert_eq!("codium".parse::<Source>(), Ok(Source::Vscodium));
        assert!("sublime".parse::<Source>().is_err());
    }

    #[test]
    fn test_source_serde_is_kebab_case() {
        let json = serde_json::to_string(&Source::VscodeInsiders).unwrap();
        assert_eq!(json, "\"vscode-insiders\"");
    }
}
