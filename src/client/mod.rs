//! Talking to the remote scan service.
//!
//! A scan is a two-step exchange: [`ScanClient::submit`] either answers
//! immediately or hands back a job, which is then polled until it completes.
//! [`drive_scan`] runs that exchange for one task, going through the shared
//! [`RateLimiter`] before every request.

mod http;

pub use http::{HttpClientFactory, HttpScanClient};

use crate::cache::PayloadSummary;
use crate::error::ScanError;
use crate::model::{RiskLevel, ScanTask};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

/// A successful analysis result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Raw JSON document returned by the service.
    pub payload: Vec<u8>,
    pub risk_level: RiskLevel,
    pub score: i64,
}

impl ScanReport {
    /// Parses a JSON result. It must carry `risk_level` or `score`.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, ScanError> {
        let summary = PayloadSummary::from_payload(&payload).ok_or_else(|| {
            ScanError::InvalidResponse("result has neither risk_level nor score".to_string())
        })?;
        Ok(Self {
            payload,
            risk_level: summary.risk_level,
            score: summary.score,
        })
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, ScanError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| ScanError::InvalidResponse(e.to_string()))?;
        Self::from_payload(payload)
    }
}

/// Identifies a queued job on the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Immediate(ScanReport),
    Queued(JobHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending { progress: Option<u8> },
    Complete(ScanReport),
}

/// One connection to the scan service. Each worker owns its own instance.
#[async_trait]
pub trait ScanClient: Send {
    async fn submit(&mut self, item_id: &str, version: &str) -> Result<Submission, ScanError>;

    async fn poll(&mut self, job: &JobHandle) -> Result<PollStatus, ScanError>;
}

/// Creates a [`ScanClient`] per worker.
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> Box<dyn ScanClient>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }
}

/// Runs one submit/poll exchange for `task`.
///
/// Every request, the submit and each poll, waits on `limiter` first. A job
/// still pending after `max_polls` polls is reported as [`ScanError::Timeout`].
pub async fn drive_scan(
    client: &mut dyn ScanClient,
    limiter: &RateLimiter,
    task: &ScanTask,
    poll: PollSettings,
) -> Result<ScanReport, ScanError> {
    limiter.acquire().await;
    let job = match client.submit(&task.item_id, &task.version).await? {
        Submission::Immediate(report) => return Ok(report),
        Submission::Queued(job) => job,
    };
    debug!(task = %task, job_id = %job.job_id, "scan queued");

    for attempt in 1..=poll.max_polls {
        tokio::time::sleep(poll.interval).await;
        limiter.acquire().await;
        match client.poll(&job).await? {
            PollStatus::Complete(report) => return Ok(report),
            PollStatus::Pending { progress } => {
                trace!(task = %task, attempt, ?progress, "scan pending");
            }
        }
    }

    Err(ScanError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn report(risk: &str, score: i64) -> ScanReport {
        ScanReport::from_payload(format!(r#"{{"risk_level":"{risk}","score":{score}}}"#).into_bytes())
            .unwrap()
    }

    /// Replays a fixed script of poll answers after a queued submit.
    struct Scripted {
        submit: Option<Result<Submission, ScanError>>,
        polls: VecDeque<Result<PollStatus, ScanError>>,
        calls: usize,
    }

    #[async_trait]
    impl ScanClient for Scripted {
        async fn submit(&mut self, _: &str, _: &str) -> Result<Submission, ScanError> {
            self.calls += 1;
            self.submit.take().unwrap_or(Err(ScanError::Cancelled))
        }

        async fn poll(&mut self, job: &JobHandle) -> Result<PollStatus, ScanError> {
            assert_eq!(job.job_id, "job-1");
            self.calls += 1;
            self.polls
                .pop_front()
                .unwrap_or(Ok(PollStatus::Pending { progress: None }))
        }
    }

    fn queued(polls: Vec<Result<PollStatus, ScanError>>) -> Scripted {
        Scripted {
            submit: Some(Ok(Submission::Queued(JobHandle {
                job_id: "job-1".to_string(),
            }))),
            polls: polls.into(),
            calls: 0,
        }
    }

    fn fast_polls(max_polls: u32) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(10),
            max_polls,
        }
    }

    #[test]
    fn test_report_requires_summary_fields() {
        let parsed = report("HIGH", 71);
        assert_eq!(parsed.risk_level, RiskLevel::High);
        assert_eq!(parsed.score, 71);

        let err = ScanReport::from_payload(b"{\"unrelated\":true}".to_vec()).unwrap_err();
        assert!(matches!(err, ScanError::InvalidResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_result_skips_polling() {
        let mut client = Scripted {
            submit: Some(Ok(Submission::Immediate(report("low", 5)))),
            polls: VecDeque::new(),
            calls: 0,
        };
        let limiter = RateLimiter::new(Duration::ZERO);
        let task = ScanTask::new("a.b", "1.0", 0);

        let result = drive_scan(&mut client, &limiter, &task, fast_polls(3)).await.unwrap();
        assert_eq!(result.score, 5);
        assert_eq!(client.calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_complete() {
        let mut client = queued(vec![
            Ok(PollStatus::Pending { progress: Some(10) }),
            Ok(PollStatus::Pending { progress: Some(80) }),
            Ok(PollStatus::Complete(report("critical", 99))),
        ]);
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let task = ScanTask::new("a.b", "1.0", 0);

        let start = tokio::time::Instant::now();
        let result = drive_scan(&mut client, &limiter, &task, fast_polls(10)).await.unwrap();
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert_eq!(client.calls, 4);
        // Four requests through a 100ms limiter take at least 300ms.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_budget_exhausted_is_timeout() {
        let mut client = queued(Vec::new());
        let limiter = RateLimiter::new(Duration::ZERO);
        let task = ScanTask::new("a.b", "1.0", 0);

        let err = drive_scan(&mut client, &limiter, &task, fast_polls(3)).await.unwrap_err();
        assert!(matches!(err, ScanError::Timeout));
        assert_eq!(client.calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_is_returned() {
        let mut client = queued(vec![Err(ScanError::Analysis("unpack failed".to_string()))]);
        let limiter = RateLimiter::new(Duration::ZERO);
        let task = ScanTask::new("a.b", "1.0", 0);

        let err = drive_scan(&mut client, &limiter, &task, fast_polls(3)).await.unwrap_err();
        assert!(matches!(err, ScanError::Analysis(_)));
    }
}
