//! Configuration file handling.
//!
//! This module loads and saves the extaudit configuration file and turns it
//! into the validated [`ScanSettings`] a scan runs with.
//!
//! # Configuration Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/extaudit/config.toml`
//! - macOS: `~/Library/Application Support/extaudit/config.toml`
//! - Windows: `%APPDATA%\extaudit\config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! service_url = "https://scan.example.com"
//! worker_count = 3
//! inter_request_delay_ms = 500
//! max_retries = 3
//! cache_max_age_hours = 24
//! default_sources = ["vscode", "cursor"]
//!
//! [ignore]
//! extensions = ["ms-python.*", "*.theme-*"]
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::PollSettings;
use crate::model::Source;
use crate::platform;
use crate::retry::RetryPolicy;

/// Upper bound on concurrent workers.
pub const MAX_WORKERS: usize = 5;

/// Application configuration, as written in `config.toml`.
///
/// Every field has a default, so an empty or missing file is valid.
///
/// # Example
///
/// ```no_run
/// use extaudit::Config;
///
/// let config = Config::load().unwrap();
/// let settings = config.settings().unwrap();
///
/// println!("Workers: {}", settings.worker_count);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Concurrent scan workers, 1 to 5.
    ///
    /// Default: 3
    pub worker_count: usize,

    /// Minimum spacing between any two requests to the scan service.
    ///
    /// Default: 500 ms
    pub inter_request_delay_ms: u64,

    /// Retries after the first attempt for transient or rate-limited failures.
    ///
    /// Default: 3
    pub max_retries: u32,

    /// First retry delay; doubles on each further retry.
    ///
    /// Default: 1000 ms
    pub retry_base_delay_ms: u64,

    /// Largest retry delay before jitter.
    ///
    /// Default: 30000 ms
    pub backoff_ceiling_ms: u64,

    /// Smallest retry delay after jitter.
    ///
    /// Default: 100 ms
    pub backoff_floor_ms: u64,

    /// Cached results older than this are re-scanned.
    ///
    /// Default: 24 hours
    pub cache_max_age_hours: u64,

    /// Cache database location. Defaults to the platform cache directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,

    /// Base URL of the scan service.
    pub service_url: String,

    /// Bearer token sent to the scan service, if it needs one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request HTTP timeout.
    ///
    /// Default: 30 seconds
    pub request_timeout_secs: u64,

    /// Wait between polls of a queued scan job.
    ///
    /// Default: 2000 ms
    pub poll_interval_ms: u64,

    /// Polls before a queued job counts as timed out.
    ///
    /// Default: 60
    pub max_polls: u32,

    /// How long in-flight requests may finish after cancellation.
    ///
    /// Default: 5 seconds
    pub shutdown_grace_secs: u64,

    /// Results committed to the cache per transaction.
    ///
    /// Default: 25
    pub batch_size: usize,

    /// `cache prune` compacts the file when it is at least this large.
    ///
    /// Default: 50 MiB
    pub vacuum_size_threshold_bytes: u64,

    /// `cache prune` compacts the file when at least this many rows went away.
    ///
    /// Default: 500
    pub vacuum_row_threshold: u64,

    /// Which editors to scan when no `--source` flag is provided.
    ///
    /// Default: all sources
    pub default_sources: Vec<Source>,

    /// Ignore list configuration.
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

/// Extensions left out of every scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Extension IDs to skip. Supports `*` wildcards (e.g. `"ms-python.*"`).
    pub extensions: Vec<String>,
}

impl IgnoreConfig {
    /// Check if an extension should be skipped.
    pub fn should_ignore(&self, extension_id: &str) -> bool {
        self.extensions.iter().any(|pattern| {
            if pattern.contains('*') {
                glob_match(pattern, extension_id)
            } else {
                pattern == extension_id
            }
        })
    }
}

/// Simple glob matching (supports * as wildcard).
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == text;
    }

    let mut remaining = text;

    if !parts[0].is_empty() {
        if !remaining.starts_with(parts[0]) {
            return false;
        }
        remaining = &remaining[parts[0].len()..];
    }

    let last_part = parts[parts.len() - 1];
    if !last_part.is_empty() {
        if !remaining.ends_with(last_part) {
            return false;
        }
        remaining = &remaining[..remaining.len() - last_part.len()];
    }

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        if let Some(pos) = remaining.find(part) {
            remaining = &remaining[pos + part.len()..];
        } else {
            return false;
        }
    }

    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 3,
            inter_request_delay_ms: 500,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            backoff_ceiling_ms: 30_000,
            backoff_floor_ms: 100,
            cache_max_age_hours: 24,
            cache_path: None,
            service_url: "http://localhost:8080".to_string(),
            api_key: None,
            request_timeout_secs: 30,
            poll_interval_ms: 2_000,
            max_polls: 60,
            shutdown_grace_secs: 5,
            batch_size: 25,
            vacuum_size_threshold_bytes: crate::cache::DEFAULT_VACUUM_SIZE_THRESHOLD,
            vacuum_row_threshold: crate::cache::DEFAULT_VACUUM_ROW_THRESHOLD,
            default_sources: Source::ALL.to_vec(),
            ignore: IgnoreConfig::default(),
        }
    }
}

/// Validated, immutable parameters for one scan run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub worker_count: usize,
    pub inter_request_delay: Duration,
    pub retry: RetryPolicy,
    pub cache_max_age: Duration,
    pub cache_path: PathBuf,
    pub service_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub poll: PollSettings,
    pub grace_period: Duration,
    pub batch_size: usize,
    pub vacuum_size_threshold: u64,
    pub vacuum_row_threshold: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            worker_count: config.worker_count,
            inter_request_delay: Duration::from_millis(config.inter_request_delay_ms),
            retry: RetryPolicy::default(),
            cache_max_age: Duration::from_secs(config.cache_max_age_hours * 3600),
            cache_path: platform::default_cache_path(),
            service_url: config.service_url,
            api_key: None,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            poll: PollSettings::default(),
            grace_period: Duration::from_secs(config.shutdown_grace_secs),
            batch_size: config.batch_size,
            vacuum_size_threshold: config.vacuum_size_threshold_bytes,
            vacuum_row_threshold: config.vacuum_row_threshold,
        }
    }
}

impl Config {
    /// Loads configuration from the config file.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Saves the configuration to the config file.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Returns the path to the configuration file.
    ///
    /// # Example
    ///
    /// ```
    /// use extaudit::Config;
    ///
    /// let path = Config::config_path();
    /// assert!(path.ends_with("extaudit/config.toml"));
    /// ```
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("extaudit")
            .join("config.toml")
    }

    /// Generates a string containing the default configuration.
    pub fn generate_default_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Checks every field and converts the file into [`ScanSettings`].
    ///
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range field.
    pub fn settings(&self) -> Result<ScanSettings> {
        if !(1..=MAX_WORKERS).contains(&self.worker_count) {
            bail!(
                "worker_count must be between 1 and {}, got {}",
                MAX_WORKERS,
                self.worker_count
            );
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_polls == 0 {
            bail!("max_polls must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if self.backoff_ceiling_ms < self.retry_base_delay_ms {
            bail!(
                "backoff_ceiling_ms ({}) must not be below retry_base_delay_ms ({})",
                self.backoff_ceiling_ms,
                self.retry_base_delay_ms
            );
        }
        let service_url = self.service_url.trim();
        if !(service_url.starts_with("http://") || service_url.starts_with("https://")) {
            bail!("service_url must be an http(s) URL, got {:?}", self.service_url);
        }

        Ok(ScanSettings {
            worker_count: self.worker_count,
            inter_request_delay: Duration::from_millis(self.inter_request_delay_ms),
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.backoff_ceiling_ms),
                Duration::from_millis(self.backoff_floor_ms),
            ),
            cache_max_age: Duration::from_secs(self.cache_max_age_hours.saturating_mul(3600)),
            cache_path: self
                .cache_path
                .clone()
                .unwrap_or_else(platform::default_cache_path),
            service_url: service_url.to_string(),
            api_key: self.api_key.clone().filter(|key| !key.is_empty()),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            poll: PollSettings {
                interval: Duration::from_millis(self.poll_interval_ms),
                max_polls: self.max_polls,
            },
            grace_period: Duration::from_secs(self.shutdown_grace_secs),
            batch_size: self.batch_size,
            vacuum_size_threshold: self.vacuum_size_threshold_bytes,
            vacuum_row_threshold: self.vacuum_row_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_glob_match_exact() {
        assert!(glob_match("ms-python.python", "ms-python.python"));
        assert!(!glob_match("ms-python.python", "ms-python.vscode-pylance"));
    }

    #[test]
    fn test_glob_match_prefix() {
        assert!(glob_match("ms-python.*", "ms-python.python"));
        assert!(glob_match("ms-python.*", "ms-python.vscode-pylance"));
        assert!(!glob_match("ms-python.*", "rust-lang.rust-analyzer"));
    }

    #[test]
    fn test_glob_match_suffix_and_middle() {
        assert!(glob_match("*.theme-dracula", "dracula-theme.theme-dracula"));
        assert!(glob_match("*theme*", "github.github-vscode-theme"));
        assert!(!glob_match("*theme*", "esbenp.prettier-vscode"));
    }

    #[test]
    fn test_ignore_config() {
        let config = IgnoreConfig {
            extensions: vec!["esbenp.prettier-vscode".to_string(), "ms-python.*".to_string()],
        };

        assert!(config.should_ignore("esbenp.prettier-vscode"));
        assert!(config.should_ignore("ms-python.python"));
        assert!(!config.should_ignore("rust-lang.rust-analyzer"));
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.worker_count, 3);
        assert_eq!(config.inter_request_delay_ms, 500);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.default_sources.len(), Source::ALL.len());
        assert!(config.ignore.extensions.is_empty());
    }

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Config::default().settings().unwrap();

        assert_eq!(settings.worker_count, 3);
        assert_eq!(settings.inter_request_delay, Duration::from_millis(500));
        assert_eq!(settings.retry.max_attempts(), 4);
        assert_eq!(settings.cache_max_age, Duration::from_secs(24 * 3600));
        assert_eq!(settings.poll.max_polls, 60);
    }

    #[test]
    fn test_settings_rejects_out_of_range() {
        let too_many = Config {
            worker_count: 6,
            ..Config::default()
        };
        assert!(too_many.settings().is_err());

        let none = Config {
            worker_count: 0,
            ..Config::default()
        };
        assert!(none.settings().is_err());

        let bad_url = Config {
            service_url: "scan.example".to_string(),
            ..Config::default()
        };
        assert!(bad_url.settings().is_err());

        let inverted = Config {
            retry_base_delay_ms: 5_000,
            backoff_ceiling_ms: 1_000,
            ..Config::default()
        };
        assert!(inverted.settings().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
worker_count = 5
service_url = "https://scan.example/"
default_sources = ["cursor"]

[ignore]
extensions = ["ms-python.*"]
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.default_sources, vec![Source::Cursor]);
        assert_eq!(config.max_retries, 3);
        assert!(config.ignore.should_ignore("ms-python.python"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.batch_size, 25);
    }

    #[test]
    fn test_default_config_round_trips() {
        let text = Config::generate_default_config();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.worker_count, Config::default().worker_count);
    }
}
