mod json;

pub use json::{format_json, print_json};

use crate::coordinator::{RunStatus, ScanRun};
use crate::model::RiskLevel;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Document written by `scan`: the run plus a few derived fields.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub generated_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_risk: Option<RiskLevel>,
    #[serde(flatten)]
    pub run: &'a ScanRun,
}

impl<'a> RunReport<'a> {
    pub fn new(run: &'a ScanRun) -> Self {
        Self {
            generated_at: Utc::now(),
            status: run.status(),
            max_risk: run.max_risk(),
            run,
        }
    }
}

/// One line for the terminal, e.g.
/// `12 extensions: 8 cached, 3 fresh, 1 failed (2 retries); highest risk: high`.
pub fn summary_line(run: &ScanRun) -> String {
    let stats = &run.statistics;
    let mut line = format!(
        "{} extensions: {} cached, {} fresh, {} failed",
        stats.total(),
        stats.cached_count,
        stats.fresh_count,
        stats.failed_count
    );
    match stats.total_retries() {
        0 => {}
        1 => line.push_str(" (1 retry)"),
        n => line.push_str(&format!(" ({} retries)", n)),
    }
    if let Some(risk) = run.max_risk() {
        line.push_str(&format!("; highest risk: {}", risk));
    }
    if run.cancelled {
        line.push_str("; cancelled");
    }
    line
}
