use crate::cache::CacheEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overall risk verdict reported by the scan service.
///
/// Variants are declared from least to most severe so the derived ordering can
/// be used for threshold checks. `Unknown` sorts below everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Unknown,
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "critical",
            RiskLevel::High => "high",
            RiskLevel::Medium => "medium",
            RiskLevel::Low => "low",
            RiskLevel::None => "none",
            RiskLevel::Unknown => "unknown",
        }
    }

    /// Parses a service label. Unrecognised labels map to `Unknown`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "critical" => RiskLevel::Critical,
            "high" => RiskLevel::High,
            "medium" | "moderate" => RiskLevel::Medium,
            "low" => RiskLevel::Low,
            "none" | "safe" => RiskLevel::None,
            _ => RiskLevel::Unknown,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item to audit. `original_index` is the position in the caller's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTask {
    pub item_id: String,
    pub version: String,
    pub original_index: usize,
}

impl ScanTask {
    pub fn new(item_id: impl Into<String>, version: impl Into<String>, original_index: usize) -> Self {
        Self {
            item_id: item_id.into(),
            version: version.into(),
            original_index,
        }
    }

    /// Builds tasks from `(item_id, version)` pairs, numbering them in input order.
    pub fn from_pairs<I, A, B>(pairs: I) -> Vec<ScanTask>
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        pairs
            .into_iter()
            .enumerate()
            .map(|(index, (id, version))| ScanTask::new(id, version, index))
            .collect()
    }
}

impl std::fmt::Display for ScanTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.item_id, self.version)
    }
}

/// Coarse failure category, used for outcomes and retry accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Transient,
    Permanent,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Served from the cache without any network call.
    Cached { entry: CacheEntry },
    /// Scanned remotely during this run.
    Fresh { entry: CacheEntry },
    /// Terminal failure. `fallback` holds the stale cache entry, if there was one.
    Failed {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback: Option<CacheEntry>,
    },
}

impl ScanOutcome {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            ScanOutcome::Cached { entry } | ScanOutcome::Fresh { entry } => Some(entry),
            ScanOutcome::Failed { fallback, .. } => fallback.as_ref(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ScanOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task: ScanTask,
    #[serde(flatten)]
    pub outcome: ScanOutcome,
}

/// Counters for a single coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStatistics {
    pub cached_count: u64,
    pub fresh_count: u64,
    pub failed_count: u64,
    pub retry_count_by_kind: BTreeMap<ErrorKind, u64>,
}

impl ScanStatistics {
    pub fn record(&mut self, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Cached { .. } => self.cached_count += 1,
            ScanOutcome::Fresh { .. } => self.fresh_count += 1,
            ScanOutcome::Failed { .. } => self.failed_count += 1,
        }
    }

    pub fn record_retry(&mut self, kind: ErrorKind) {
        *self.retry_count_by_kind.entry(kind).or_default() += 1;
    }

    pub fn total(&self) -> u64 {
        self.cached_count + self.fresh_count + self.failed_count
    }

    pub fn total_retries(&self) -> u64 {
        self.retry_count_by_kind.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Low > RiskLevel::None);
        assert!(RiskLevel::None > RiskLevel::Unknown);
    }

    #[test]
    fn test_risk_level_parse() {
        assert_eq!(RiskLevel::parse("HIGH"), RiskLevel::High);
        assert_eq!(RiskLevel::parse(" moderate "), RiskLevel::Medium);
        assert_eq!(RiskLevel::parse("spicy"), RiskLevel::Unknown);
    }

    #[test]
    fn test_tasks_keep_input_order() {
        let tasks = ScanTask::from_pairs([("a.one", "1.0"), ("b.two", "2.0")]);
        assert_eq!(tasks[0].original_index, 0);
        assert_eq!(tasks[1].item_id, "b.two");
        assert_eq!(tasks[1].original_index, 1);
    }

    #[test]
    fn test_statistics_totals() {
        let mut stats = ScanStatistics::default();
        stats.record(&ScanOutcome::Failed {
            kind: ErrorKind::Permanent,
            message: "gone".to_string(),
            fallback: None,
        });
        stats.record_retry(ErrorKind::Transient);
        stats.record_retry(ErrorKind::Transient);
        stats.record_retry(ErrorKind::RateLimited);

        assert_eq!(stats.total(), 1);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.retry_count_by_kind[&ErrorKind::Transient], 2);
        assert_eq!(stats.total_retries(), 3);
    }
}
