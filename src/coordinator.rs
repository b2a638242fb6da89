//! Concurrent scan orchestration.
//!
//! A [`ScanCoordinator`] owns the cache for the duration of a run. It answers
//! what it can from the cache, hands the rest to a fixed pool of workers, and
//! commits successful results back in batches. Workers never touch the cache;
//! they only talk to the service, through the shared [`RateLimiter`] and with
//! retries governed by the [`RetryPolicy`](crate::retry::RetryPolicy).
//!
//! ```no_run
//! use std::sync::Arc;
//! use extaudit::cache::{CacheOptions, CacheStore};
//! use extaudit::client::HttpClientFactory;
//! use extaudit::config::ScanSettings;
//! use extaudit::coordinator::ScanCoordinator;
//! use extaudit::model::ScanTask;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = ScanSettings::default();
//! let store = CacheStore::open(&settings.cache_path, CacheOptions::default())?.store;
//! let factory = HttpClientFactory::new(&settings.service_url, None, settings.request_timeout)?;
//!
//! let mut coordinator = ScanCoordinator::new(settings, store, Arc::new(factory));
//! let tasks = ScanTask::from_pairs([("publisher.ext", "1.0.0")]);
//! let run = coordinator.run(tasks, CancellationToken::new()).await;
//! println!("{:?}", run.status());
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheEntry, CacheStore, CacheWarning, Lookup};
use crate::client::{drive_scan, ClientFactory, PollSettings, ScanClient, ScanReport};
use crate::config::ScanSettings;
use crate::model::{ErrorKind, RiskLevel, ScanOutcome, ScanStatistics, ScanTask, TaskOutcome};
use crate::rate_limit::RateLimiter;
use crate::retry::{classify, RetryPolicy};
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Dispatching,
    Cancelling,
    Draining,
    Done,
}

impl RunPhase {
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Dispatching, Draining)
                | (Dispatching, Cancelling)
                | (Cancelling, Draining)
                | (Draining, Done)
                | (Done, Idle)
        )
    }
}

/// Tracks the phase of one run and refuses illegal moves.
#[derive(Debug)]
struct PhaseTracker {
    phase: RunPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
        }
    }

    fn advance(&mut self, next: RunPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            warn!(from = ?self.phase, to = ?next, "ignoring invalid run phase transition");
            return false;
        }
        debug!(from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
        true
    }
}

/// How a run ended overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task has a cached or fresh result.
    Clean,
    /// At least one task failed; the rest still completed.
    PartialFailure,
    /// The run was interrupted before every task resolved.
    Cancelled,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRun {
    /// One outcome per task, ordered by `original_index`.
    pub outcomes: Vec<TaskOutcome>,
    pub statistics: ScanStatistics,
    pub warnings: Vec<CacheWarning>,
    pub cancelled: bool,
}

impl ScanRun {
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.statistics.failed_count > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Clean
        }
    }

    /// Highest risk among tasks that have a result, including stale fallbacks.
    pub fn max_risk(&self) -> Option<RiskLevel> {
        self.outcomes
            .iter()
            .filter_map(|o| o.outcome.entry())
            .map(|entry| entry.risk_level)
            .max()
    }
}

pub struct ScanCoordinator {
    settings: ScanSettings,
    store: CacheStore,
    factory: Arc<dyn ClientFactory>,
    limiter: Arc<RateLimiter>,
}

impl ScanCoordinator {
    pub fn new(settings: ScanSettings, store: CacheStore, factory: Arc<dyn ClientFactory>) -> Self {
        let limiter = Arc::new(RateLimiter::new(settings.inter_request_delay));
        Self {
            settings,
            store,
            factory,
            limiter,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn into_store(self) -> CacheStore {
        self.store
    }

    /// Resolves every task and returns the outcomes in `original_index` order.
    ///
    /// Failures never abort the run. Cancelling `cancel` stops new work,
    /// cuts retry backoff short and gives in-flight requests the configured
    /// grace period; whatever finished is still committed to the cache and
    /// everything else comes back as [`ErrorKind::Cancelled`].
    pub async fn run(&mut self, tasks: Vec<ScanTask>, cancel: CancellationToken) -> ScanRun {
        let started = Instant::now();
        let mut phase = PhaseTracker::new();
        phase.advance(RunPhase::Dispatching);
        info!(tasks = tasks.len(), workers = self.settings.worker_count, "scan run started");

        let stats = Arc::new(Mutex::new(ScanStatistics::default()));
        let mut warnings = Vec::new();
        let mut slots: Vec<Option<ScanOutcome>> = vec![None; tasks.len()];
        let mut fallbacks: Vec<Option<CacheEntry>> = vec![None; tasks.len()];
        let mut pending = VecDeque::new();

        for (slot, task) in tasks.iter().enumerate() {
            match self.store.get(&task.item_id, &task.version) {
                Ok(Lookup::Hit(entry)) if !entry.is_stale(self.settings.cache_max_age) => {
                    debug!(task = %task, "cache hit");
                    let outcome = ScanOutcome::Cached { entry };
                    record(&stats, |s| s.record(&outcome));
                    slots[slot] = Some(outcome);
                    continue;
                }
                Ok(Lookup::Hit(entry)) => {
                    debug!(task = %task, age_secs = entry.age().as_secs(), "cache entry is stale");
                    fallbacks[slot] = Some(entry);
                }
                Ok(Lookup::Miss) => debug!(task = %task, "cache miss"),
                Ok(Lookup::Rejected(warning)) => {
                    warn!(task = %task, "cached result failed verification");
                    warnings.push(warning);
                }
                Err(e) => {
                    warn!(task = %task, error = %e, "cache read failed");
                    warnings.push(CacheWarning::ReadFailed {
                        item_id: task.item_id.clone(),
                        version: task.version.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            pending.push_back((slot, task.clone()));
        }

        let worker_count = self.settings.worker_count.min(pending.len());
        let queue = Arc::new(AsyncMutex::new(pending));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<WorkerResult>();
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let worker = Worker {
                id,
                client: self.factory.create(),
                queue: Arc::clone(&queue),
                limiter: Arc::clone(&self.limiter),
                retry: self.settings.retry.clone(),
                poll: self.settings.poll,
                stats: Arc::clone(&stats),
                results: results_tx.clone(),
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(results_tx);

        let mut writer = WriteBuffer::new(&mut self.store, self.settings.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                message = results_rx.recv() => match message {
                    Some(result) => {
                        resolve(result, &tasks, &mut slots, &mut fallbacks, &mut writer, &stats);
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if deadline.is_none() => {
                    info!(grace_secs = self.settings.grace_period.as_secs_f64(), "cancellation requested");
                    phase.advance(RunPhase::Cancelling);
                    deadline = Some(Instant::now() + self.settings.grace_period);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(in_flight = workers.len(), "grace period elapsed; aborting workers");
                    break;
                }
            }
        }

        workers.abort_all();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "scan worker panicked");
                }
            }
        }
        while let Ok(result) = results_rx.try_recv() {
            resolve(result, &tasks, &mut slots, &mut fallbacks, &mut writer, &stats);
        }

        phase.advance(RunPhase::Draining);
        warnings.extend(writer.finish());

        let interrupted = cancel.is_cancelled();
        let mut outcomes = Vec::with_capacity(tasks.len());
        for ((task, slot), fallback) in tasks.into_iter().zip(slots).zip(fallbacks) {
            let outcome = slot.unwrap_or_else(|| {
                let (kind, message) = if interrupted {
                    (ErrorKind::Cancelled, "scan cancelled before completion")
                } else {
                    (ErrorKind::Transient, "scan worker stopped before completion")
                };
                let outcome = ScanOutcome::Failed {
                    kind,
                    message: message.to_string(),
                    fallback,
                };
                record(&stats, |s| s.record(&outcome));
                outcome
            });
            outcomes.push(TaskOutcome { task, outcome });
        }
        outcomes.sort_by_key(|o| o.task.original_index);

        let cancelled = outcomes.iter().any(|o| {
            matches!(
                o.outcome,
                ScanOutcome::Failed {
                    kind: ErrorKind::Cancelled,
                    ..
                }
            )
        });
        let statistics = stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        phase.advance(RunPhase::Done);
        info!(
            cached = statistics.cached_count,
            fresh = statistics.fresh_count,
            failed = statistics.failed_count,
            retries = statistics.total_retries(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scan run finished"
        );

        ScanRun {
            outcomes,
            statistics,
            warnings,
            cancelled,
        }
    }
}

fn record(stats: &Mutex<ScanStatistics>, update: impl FnOnce(&mut ScanStatistics)) {
    update(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

fn resolve(
    result: WorkerResult,
    tasks: &[ScanTask],
    slots: &mut [Option<ScanOutcome>],
    fallbacks: &mut [Option<CacheEntry>],
    writer: &mut WriteBuffer<'_>,
    stats: &Mutex<ScanStatistics>,
) {
    let task = &tasks[result.slot];
    let outcome = match result.result {
        Ok(report) => {
            let entry = CacheEntry::from_report(&task.item_id, &task.version, report, Utc::now());
            debug!(task = %task, risk = %entry.risk_level, "scan complete");
            writer.push(entry.clone());
            ScanOutcome::Fresh { entry }
        }
        Err(failure) => {
            warn!(task = %task, kind = %failure.kind, error = %failure.message, "scan failed");
            ScanOutcome::Failed {
                kind: failure.kind,
                message: failure.message,
                fallback: fallbacks[result.slot].take(),
            }
        }
    };
    record(stats, |s| s.record(&outcome));
    slots[result.slot] = Some(outcome);
}

/// Successful results waiting to be committed.
///
/// Flushes every `batch_size` entries and once more when dropped, so results
/// already received are kept even if the run future is dropped midway.
struct WriteBuffer<'a> {
    store: &'a mut CacheStore,
    pending: Vec<CacheEntry>,
    batch_size: usize,
    warnings: Vec<CacheWarning>,
}

impl<'a> WriteBuffer<'a> {
    fn new(store: &'a mut CacheStore, batch_size: usize) -> Self {
        Self {
            store,
            pending: Vec::new(),
            batch_size: batch_size.max(1),
            warnings: Vec::new(),
        }
    }

    fn push(&mut self, entry: CacheEntry) {
        self.pending.push(entry);
        if self.pending.len() >= self.batch_size {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        match self.store.write_batch(&self.pending) {
            Ok(written) => debug!(written, "committed cache batch"),
            Err(e) => {
                warn!(entries = self.pending.len(), error = %e, "cache batch rolled back");
                self.warnings.push(CacheWarning::BatchWriteFailed {
                    entries: self.pending.len(),
                    reason: e.to_string(),
                });
            }
        }
        self.pending.clear();
    }

    fn finish(mut self) -> Vec<CacheWarning> {
        self.flush();
        std::mem::take(&mut self.warnings)
    }
}

impl Drop for WriteBuffer<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

struct WorkerResult {
    slot: usize,
    result: Result<ScanReport, TaskFailure>,
}

struct TaskFailure {
    kind: ErrorKind,
    message: String,
}

/// Attempt bookkeeping for one task on one worker.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempt: u32,
    last_error: Option<ErrorKind>,
}

struct Worker {
    id: usize,
    client: Box<dyn ScanClient>,
    queue: Arc<AsyncMutex<VecDeque<(usize, ScanTask)>>>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    poll: PollSettings,
    stats: Arc<Mutex<ScanStatistics>>,
    results: mpsc::UnboundedSender<WorkerResult>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = self.queue.lock().await.pop_front();
            let Some((slot, task)) = next else {
                break;
            };

            let result = self.scan(&task).await;
            if self.results.send(WorkerResult { slot, result }).is_err() {
                break;
            }
        }
        debug!(worker = self.id, "worker exiting");
    }

    async fn scan(&mut self, task: &ScanTask) -> Result<ScanReport, TaskFailure> {
        let mut state = RetryState {
            attempt: 1,
            last_error: None,
        };

        loop {
            let error = match drive_scan(self.client.as_mut(), &self.limiter, task, self.poll).await {
                Ok(report) => return Ok(report),
                Err(error) => error,
            };

            let class = classify(&error);
            state.last_error = Some(class.kind());
            if !self.retry.should_retry(state.attempt, &class) {
                return Err(TaskFailure {
                    kind: class.kind(),
                    message: error.to_string(),
                });
            }

            let delay = self.retry.compute_delay(state.attempt, &class);
            record(&self.stats, |s| s.record_retry(class.kind()));
            debug!(
                worker = self.id,
                task = %task,
                attempt = state.attempt,
                kind = ?state.last_error,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying scan"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return Err(TaskFailure {
                        kind: ErrorKind::Cancelled,
                        message: format!("cancelled while waiting to retry after: {error}"),
                    });
                }
            }
            state.attempt += 1;
        }
    }
}
