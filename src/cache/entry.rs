use crate::client::ScanReport;
use crate::model::RiskLevel;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

/// A verified scan result for one `(item_id, version)`.
///
/// Entries are created from a successful [`ScanReport`](crate::client::ScanReport)
/// or read back from the store; there is no public way to build one for a
/// failed scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub item_id: String,
    pub version: String,
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Vec<u8>,
    pub risk_level: RiskLevel,
    pub score: i64,
    pub scanned_at: DateTime<Utc>,
    /// HMAC over the entry. Empty until the entry has been persisted.
    #[serde(skip)]
    pub(crate) signature: Vec<u8>,
}

impl CacheEntry {
    /// `scanned_at` is truncated to millisecond precision, the resolution the
    /// store keeps.
    pub(crate) fn new(
        item_id: impl Into<String>,
        version: impl Into<String>,
        payload: Vec<u8>,
        risk_level: RiskLevel,
        score: i64,
        scanned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            version: version.into(),
            payload,
            risk_level,
            score,
            scanned_at: scanned_at.trunc_subsecs(3),
            signature: Vec::new(),
        }
    }

    /// Builds the entry to persist for a successful scan.
    pub fn from_report(
        item_id: impl Into<String>,
        version: impl Into<String>,
        report: ScanReport,
        scanned_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            item_id,
            version,
            report.payload,
            report.risk_level,
            report.score,
            scanned_at,
        )
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// See [`is_stale`].
    pub fn is_stale(&self, max_age: Duration) -> bool {
        is_stale(self, max_age)
    }

    /// Age of the entry relative to now. Entries from the future count as zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.scanned_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Returns true when the entry was scanned more than `max_age` ago.
///
/// Only `scanned_at` matters; a stale entry is still a valid hit and can be
/// used as a fallback.
pub fn is_stale(entry: &CacheEntry, max_age: Duration) -> bool {
    entry.age() > max_age
}

/// Fields the store indexes, pulled out of a service payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSummary {
    pub risk_level: RiskLevel,
    pub score: i64,
}

#[derive(Deserialize)]
struct SummaryFields {
    #[serde(alias = "riskLevel", alias = "risk")]
    risk_level: Option<String>,
    #[serde(alias = "riskScore")]
    score: Option<f64>,
}

impl PayloadSummary {
    /// Extracts `risk_level` and `score` from a JSON payload.
    ///
    /// Returns `None` if the payload is not a JSON object or carries neither
    /// field.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let fields: SummaryFields = serde_json::from_slice(payload).ok()?;
        if fields.risk_level.is_none() && fields.score.is_none() {
            return None;
        }
        Some(Self {
            risk_level: fields
                .risk_level
                .as_deref()
                .map(RiskLevel::parse)
                .unwrap_or(RiskLevel::Unknown),
            score: fields.score.map(|s| s.round() as i64).unwrap_or(0),
        })
    }
}

fn serialize_payload<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => value.serialize(serializer),
        Err(_) => serializer.serialize_str(&String::from_utf8_lossy(payload)),
    }
}
