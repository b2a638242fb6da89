use super::{ClientFactory, JobHandle, PollStatus, ScanClient, ScanReport, Submission};
use crate::error::ScanError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest response body quoted back in a [`ScanError::Rejected`].
const MAX_ERROR_BODY: usize = 200;

/// [`ScanClient`] for the HTTP scan service.
///
/// `POST {base}/v1/scans` submits; `GET {base}/v1/scans/{job_id}` polls.
#[derive(Debug, Clone)]
pub struct HttpScanClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    extension_id: &'a str,
    version: &'a str,
}

#[derive(Deserialize)]
struct QueuedResponse {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum JobResponse {
    Pending {
        #[serde(default, deserialize_with = "lenient_progress")]
        progress: Option<u8>,
    },
    Complete {
        result: serde_json::Value,
    },
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
}

impl HttpScanClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ScanError> {
        Ok(Self::with_client(build_client(timeout)?, base_url, api_key))
    }

    fn with_client(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl ScanClient for HttpScanClient {
    async fn submit(&mut self, item_id: &str, version: &str) -> Result<Submission, ScanError> {
        let request = self
            .client
            .post(format!("{}/v1/scans", self.base_url))
            .json(&SubmitRequest {
                extension_id: item_id,
                version,
            });
        let response = check_status(self.authorize(request).send().await?, item_id).await?;

        if response.status() == StatusCode::ACCEPTED {
            let queued: QueuedResponse = response.json().await?;
            return Ok(Submission::Queued(JobHandle {
                job_id: queued.job_id,
            }));
        }

        let payload = response.bytes().await?.to_vec();
        Ok(Submission::Immediate(ScanReport::from_payload(payload)?))
    }

    async fn poll(&mut self, job: &JobHandle) -> Result<PollStatus, ScanError> {
        let request = self
            .client
            .get(format!("{}/v1/scans/{}", self.base_url, job.job_id));
        let response = check_status(self.authorize(request).send().await?, &job.job_id).await?;
        let body: JobResponse = response.json().await?;
        job_status(body)
    }
}

fn job_status(body: JobResponse) -> Result<PollStatus, ScanError> {
    match body {
        JobResponse::Pending { progress } => Ok(PollStatus::Pending {
            progress,
        }),
        JobResponse::Complete { result } => Ok(PollStatus::Complete(ScanReport::from_json(&result)?)),
        JobResponse::Failed { error } => Err(ScanError::Analysis(
            error.unwrap_or_else(|| "no reason given".to_string()),
        )),
    }
}

/// Progress is informational, so anything that is not a finite number is
/// dropped instead of failing the poll. Numbers are rounded into 0..=100.
fn lenient_progress<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(serde_json::Value::as_f64)
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 100.0).round() as u8))
}

/// Hands out clones of one connection pool, one per worker.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpClientFactory {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ScanError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            api_key,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self) -> Box<dyn ScanClient> {
        Box::new(HttpScanClient::with_client(
            self.client.clone(),
            self.base_url.clone(),
            self.api_key.clone(),
        ))
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, ScanError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("extaudit/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ScanError::Network(e.to_string()))
}

async fn check_status(response: Response, subject: &str) -> Result<Response, ScanError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, &headers, &body, subject))
}

fn error_for_status(status: StatusCode, headers: &HeaderMap, body: &str, subject: &str) -> ScanError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ScanError::RateLimited {
            retry_after: parse_retry_after(headers, Utc::now()),
        },
        StatusCode::NOT_FOUND => ScanError::NotFound(subject.to_string()),
        StatusCode::REQUEST_TIMEOUT => ScanError::Server { status: 408 },
        s if s.is_server_error() => ScanError::Server { status: s.as_u16() },
        s => ScanError::Rejected {
            status: s.as_u16(),
            message: body.trim().chars().take(MAX_ERROR_BODY).collect(),
        },
    }
}

/// `Retry-After` is either delay-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;
    use crate::retry::{classify, ErrorClass};
    use reqwest::header::HeaderValue;

    fn retry_after(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_status_mapping() {
        let none = HeaderMap::new();

        let err = error_for_status(StatusCode::TOO_MANY_REQUESTS, &retry_after("7"), "", "a.b");
        assert_eq!(
            classify(&err),
            ErrorClass::RateLimited {
                hint: Some(Duration::from_secs(7))
            }
        );

        let err = error_for_status(StatusCode::NOT_FOUND, &none, "", "a.b");
        assert!(matches!(err, ScanError::NotFound(ref id) if id == "a.b"));
        assert_eq!(classify(&err), ErrorClass::Permanent);

        for status in [StatusCode::REQUEST_TIMEOUT, StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE] {
            assert_eq!(classify(&error_for_status(status, &none, "", "a.b")), ErrorClass::Transient);
        }

        let err = error_for_status(StatusCode::BAD_REQUEST, &none, "  bad version  ", "a.b");
        match err {
            ScanError::Rejected { status, ref message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad version");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let headers = retry_after("Wed, 21 Oct 2026 07:28:30 GMT");
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(30)));

        assert_eq!(parse_retry_after(&retry_after("soon"), now), None);
        assert_eq!(parse_retry_after(&HeaderMap::new(), now), None);
    }

    #[test]
    fn test_odd_progress_values_keep_job_pending() {
        let cases = [
            (r#"{"status":"pending","progress":45.5}"#, Some(46)),
            (r#"{"status":"pending","progress":1000}"#, Some(100)),
            (r#"{"status":"pending","progress":-3}"#, Some(0)),
            (r#"{"status":"pending","progress":"45%"}"#, None),
            (r#"{"status":"pending","progress":null}"#, None),
            (r#"{"status":"pending"}"#, None),
        ];
        for (body, expected) in cases {
            let pending: JobResponse = serde_json::from_str(body).unwrap();
            assert_eq!(
                job_status(pending).unwrap(),
                PollStatus::Pending { progress: expected },
                "{body}"
            );
        }
    }

    #[test]
    fn test_job_response_decoding() {
        let pending: JobResponse = serde_json::from_str(r#"{"status":"pending","progress":40}"#).unwrap();
        assert_eq!(
            job_status(pending).unwrap(),
            PollStatus::Pending { progress: Some(40) }
        );

        let complete: JobResponse = serde_json::from_str(
            r#"{"status":"complete","result":{"risk_level":"medium","score":55,"findings":[]}}"#,
        )
        .unwrap();
        match job_status(complete).unwrap() {
            PollStatus::Complete(report) => {
                assert_eq!(report.risk_level, RiskLevel::Medium);
                assert_eq!(report.score, 55);
            }
            other => panic!("unexpected {other:?}"),
        }

        let failed: JobResponse =
            serde_json::from_str(r#"{"status":"failed","error":"archive corrupt"}"#).unwrap();
        assert!(matches!(job_status(failed), Err(ScanError::Analysis(ref m)) if m == "archive corrupt"));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = HttpScanClient::new("https://scan.example/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "https://scan.example");
    }
}
