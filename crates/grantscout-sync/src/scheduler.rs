//! Bounded-concurrency runs over all sources, on a timer or on demand.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, Utc};
use grantscout_core::SourceConfig;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::{Engine, ScrapeResult, SourceResult};
use crate::PipelineError;

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval_days: u32,
    pub run_hour: u32,
    pub run_minute: u32,
    pub source_timeout: Duration,
    pub total_timeout: Duration,
    pub max_workers: usize,
    /// Failures in a row before a source is reported unhealthy.
    pub max_consecutive_failures: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Longest single sleep while waiting for the next run.
    pub poll_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_days: 7,
            run_hour: 2,
            run_minute: 0,
            source_timeout: Duration::from_secs(300),
            total_timeout: Duration::from_secs(3600),
            max_workers: 2,
            max_consecutive_failures: 3,
            retry_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(6 * 3600),
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl ScheduleConfig {
    /// Deferral after `failures` consecutive failures:
    /// `retry_delay * multiplier^(failures-1)`, capped at `max_backoff`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.retry_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_records: usize,
    pub is_healthy: bool,
    pub error_message: Option<String>,
}

impl SourceStatus {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            last_success: None,
            last_attempt: None,
            consecutive_failures: 0,
            total_records: 0,
            is_healthy: true,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub result: ScrapeResult,
    /// Sources abandoned at the per-source or total-run timeout.
    pub timed_out: Vec<String>,
    /// Sources skipped because they are still backing off after failures.
    pub deferred: Vec<String>,
    /// Sources never started because shutdown was requested.
    pub not_started: Vec<String>,
    pub duration_secs: f64,
}

enum SourceOutcome {
    Finished(SourceResult),
    TimedOut,
    NotStarted,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    config: ScheduleConfig,
    health: Mutex<BTreeMap<String, SourceStatus>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, config: ScheduleConfig) -> Self {
        Self {
            engine,
            config,
            health: Mutex::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Requests cooperative shutdown: no new source starts after this.
    pub fn stop(&self) {
        info!("scheduler stop requested");
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn get_health_status(&self) -> Vec<SourceStatus> {
        self.health.lock().await.values().cloned().collect()
    }

    /// Today at the configured time of day, or one interval later if that has passed.
    pub fn next_run_time(&self, now: NaiveDateTime) -> NaiveDateTime {
        let at = NaiveTime::from_hms_opt(self.config.run_hour, self.config.run_minute, 0)
            .unwrap_or_default();
        let candidate = now.date().and_time(at);
        if candidate > now {
            candidate
        } else {
            candidate + chrono::Duration::days(i64::from(self.config.interval_days.max(1)))
        }
    }

    async fn deferred_until(&self, source_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let health = self.health.lock().await;
        let status = health.get(source_id)?;
        let last_attempt = status.last_attempt?;
        if status.consecutive_failures == 0 {
            return None;
        }
        let delay = chrono::Duration::from_std(self.config.backoff_delay(status.consecutive_failures))
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let until = last_attempt + delay;
        (now < until).then_some(until)
    }

    async fn record_success(&self, result: &SourceResult) {
        let mut health = self.health.lock().await;
        let status = health
            .entry(result.source_id.clone())
            .or_insert_with(|| SourceStatus::new(&result.source_id));
        let now = Utc::now();
        status.last_attempt = Some(now);
        status.last_success = Some(now);
        status.consecutive_failures = 0;
        status.total_records += result.records_created + result.records_updated;
        status.is_healthy = true;
        status.error_message = None;
    }

    async fn record_failure(&self, source_id: &str, message: String) {
        let mut health = self.health.lock().await;
        let status = health
            .entry(source_id.to_string())
            .or_insert_with(|| SourceStatus::new(source_id));
        status.last_attempt = Some(Utc::now());
        status.consecutive_failures += 1;
        status.is_healthy = status.consecutive_failures < self.config.max_consecutive_failures;
        status.error_message = Some(message);
        if !status.is_healthy {
            warn!(
                source_id,
                failures = status.consecutive_failures,
                "source marked unhealthy"
            );
        }
    }

    /// Runs every active source (or just `source_id`) once, at most
    /// `max_workers` at a time. Explicit single-source runs ignore backoff.
    pub async fn run_once(&self, source_id: Option<&str>) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.total_timeout;
        let targets = self.engine.select_sources(source_id)?;
        let mut summary = RunSummary::default();

        if self.shutdown.is_cancelled() {
            summary.not_started = targets.into_iter().map(|s| s.source_id).collect();
            return Ok(summary);
        }

        let now = Utc::now();
        let mut runnable: Vec<SourceConfig> = Vec::new();
        for source in targets {
            if source_id.is_none() {
                if let Some(until) = self.deferred_until(&source.source_id, now).await {
                    info!(source_id = %source.source_id, %until, "source deferred by backoff");
                    summary.deferred.push(source.source_id);
                    continue;
                }
            }
            runnable.push(source);
        }

        let run_token = self.shutdown.child_token();
        let workers = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut tasks = JoinSet::new();
        let mut task_sources: HashMap<TaskId, String> = HashMap::new();
        for source in runnable {
            pending.insert(source.source_id.clone());
            let source_id = source.source_id.clone();
            let engine = Arc::clone(&self.engine);
            let workers = Arc::clone(&workers);
            let token = run_token.clone();
            let source_timeout = self.config.source_timeout;
            let handle = tasks.spawn(async move {
                let permit = tokio::select! {
                    _ = token.cancelled() => None,
                    permit = workers.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (source, SourceOutcome::NotStarted);
                };
                if token.is_cancelled() {
                    return (source, SourceOutcome::NotStarted);
                }
                match tokio::time::timeout(source_timeout, engine.run_source(&source, false)).await {
                    Ok(result) => (source, SourceOutcome::Finished(result)),
                    Err(_) => (source, SourceOutcome::TimedOut),
                }
            });
            task_sources.insert(handle.id(), source_id);
        }

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled(), if !run_token.is_cancelled() => {
                    info!("shutdown requested; no further sources will start");
                    run_token.cancel();
                    continue;
                }
                next = tokio::time::timeout_at(deadline, tasks.join_next()) => next,
            };
            match next {
                Ok(Some(Ok((source, outcome)))) => {
                    pending.remove(&source.source_id);
                    self.apply_outcome(&source, outcome, &mut summary).await;
                }
                Ok(Some(Err(err))) => {
                    let Some(id) = task_sources.get(&err.id()).cloned() else {
                        error!(error = %err, "unidentified source task failed");
                        continue;
                    };
                    error!(source_id = %id, error = %err, "source task failed");
                    pending.remove(&id);
                    let message = if err.is_panic() {
                        "source task panicked".to_string()
                    } else {
                        format!("source task failed: {err}")
                    };
                    self.engine.record_outcome(&id, false).await;
                    self.record_failure(&id, message.clone()).await;
                    if let Some(source) = self.engine.source(&id) {
                        summary.result.absorb(SourceResult::failed(source, message));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        total_timeout_secs = self.config.total_timeout.as_secs(),
                        pending = pending.len(),
                        "total run timeout reached"
                    );
                    run_token.cancel();
                    tasks.detach_all();
                    for id in std::mem::take(&mut pending) {
                        let message = "total run timeout exceeded".to_string();
                        self.engine.record_outcome(&id, false).await;
                        self.record_failure(&id, message.clone()).await;
                        if let Some(source) = self.engine.source(&id) {
                            summary.result.absorb(SourceResult::failed(source, message));
                        }
                        summary.timed_out.push(id);
                    }
                    break;
                }
            }
        }

        summary.duration_secs = started.elapsed().as_secs_f64();
        summary.result.duration_secs = summary.duration_secs;
        info!(
            sources_processed = summary.result.sources_processed,
            sources_failed = summary.result.sources_failed,
            timed_out = summary.timed_out.len(),
            deferred = summary.deferred.len(),
            not_started = summary.not_started.len(),
            created = summary.result.records_created,
            updated = summary.result.records_updated,
            "scheduled run finished"
        );
        Ok(summary)
    }

    async fn apply_outcome(&self, source: &SourceConfig, outcome: SourceOutcome, summary: &mut RunSummary) {
        match outcome {
            SourceOutcome::Finished(result) => {
                if result.success {
                    self.record_success(&result).await;
                } else {
                    let message = result
                        .errors
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "source run failed".to_string());
                    self.record_failure(&source.source_id, message).await;
                }
                summary.result.absorb(result);
            }
            SourceOutcome::TimedOut => {
                let message = format!(
                    "source timed out after {}s",
                    self.config.source_timeout.as_secs()
                );
                warn!(source_id = %source.source_id, "{message}");
                self.engine.record_outcome(&source.source_id, false).await;
                self.record_failure(&source.source_id, message.clone()).await;
                summary.result.absorb(SourceResult::failed(source, message));
                summary.timed_out.push(source.source_id.clone());
            }
            SourceOutcome::NotStarted => summary.not_started.push(source.source_id.clone()),
        }
    }

    /// Waits until `next`, waking at least every `poll_interval`. Returns
    /// false if shutdown was requested first.
    async fn sleep_until(&self, next: NaiveDateTime) -> bool {
        loop {
            let remaining = next - Local::now().naive_local();
            let Ok(remaining) = remaining.to_std() else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            let step = remaining.min(self.config.poll_interval);
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    /// Loops until `stop()`: wait for the next slot, run all sources, report.
    pub async fn run_scheduled<F>(&self, mut callback: F)
    where
        F: FnMut(&RunSummary) + Send,
    {
        info!(
            interval_days = self.config.interval_days,
            run_hour = self.config.run_hour,
            run_minute = self.config.run_minute,
            "scheduler started"
        );
        while !self.shutdown.is_cancelled() {
            let next = self.next_run_time(Local::now().naive_local());
            info!(next_run = %next, "waiting for next scheduled run");
            if !self.sleep_until(next).await {
                break;
            }
            match self.run_once(None).await {
                Ok(summary) => callback(&summary),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        }
        info!("scheduler stopped");
    }
}
