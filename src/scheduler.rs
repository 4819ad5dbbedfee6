// ============================================================================
// JOB SCHEDULER
// ============================================================================
// Periodic, cancellable, non-overlapping background work:
// - one interval loop per registered job
// - a single-flight lease per job key; a tick that finds the lease held is
//   skipped, never queued
// - missed interval ticks are skipped as well
// - `trigger` runs one tick synchronously through the same lease path
// - errors are logged per tick and retried on the next scheduled tick
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use compact_str::{format_compact, CompactString};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MetricsError, MetricsResult};
use crate::logging::{targets, PerfTimer};
use crate::telemetry::EngineMetrics;
use crate::time::{Clock, Timestamp};
use crate::SLOW_TICK_THRESHOLD_MS;

// ----------------------------------------------------------------------------
// Jobs
// ----------------------------------------------------------------------------

/// Identity of a periodic job: the table it works on and its lane within
/// that table (a granularity for rollups, `retention` for sweeps).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub table: CompactString,
    pub lane: CompactString,
}

impl JobKey {
    pub fn new(table: impl Into<CompactString>, lane: impl Into<CompactString>) -> Self {
        Self {
            table: table.into(),
            lane: lane.into(),
        }
    }

    pub fn label(&self) -> CompactString {
        format_compact!("{}/{}", self.table, self.lane)
    }
}

impl Display for JobKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.lane)
    }
}

/// Background work run on a fixed period.
#[async_trait]
pub trait PeriodicJob: Send + Sync + Debug {
    fn key(&self) -> JobKey;

    fn period(&self) -> Duration;

    /// One pass. `now` comes from the scheduler's clock.
    async fn tick(&self, now: Timestamp) -> MetricsResult<()>;
}

/// Result of one attempted tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed { elapsed: Duration },
    /// Another tick of the same job held the lease
    Skipped,
    Failed { error: String },
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Completed { .. } => "completed",
            TickOutcome::Skipped => "skipped",
            TickOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TickOutcome::Completed { .. })
    }
}

// ----------------------------------------------------------------------------
// Single-Flight Leases
// ----------------------------------------------------------------------------

/// Non-blocking per-key leases. Acquiring a held lease fails immediately.
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    held: Arc<DashMap<JobKey, Instant>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: &JobKey) -> Option<Lease> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(Lease {
                    held: self.held.clone(),
                    key: key.clone(),
                })
            }
        }
    }

    pub fn is_held(&self, key: &JobKey) -> bool {
        self.held.contains_key(key)
    }
}

/// Released on drop, including when the holding task is cancelled.
#[derive(Debug)]
pub struct Lease {
    held: Arc<DashMap<JobKey, Instant>>,
    key: JobKey,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

// ----------------------------------------------------------------------------
// Tick Runner
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TickRunner {
    leases: LeaseTable,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
}

impl TickRunner {
    async fn run(&self, job: &dyn PeriodicJob) -> TickOutcome {
        let key = job.key();
        let label = key.label();

        let Some(_lease) = self.leases.try_acquire(&key) else {
            debug!(target: targets::SCHEDULER, job = %key, "Previous tick still running, skipping");
            self.metrics.record_tick(&label, "skipped", None);
            return TickOutcome::Skipped;
        };

        let timer = PerfTimer::with_threshold(format!("tick {key}"), SLOW_TICK_THRESHOLD_MS);
        let started = Instant::now();
        let outcome = match job.tick(self.clock.now()).await {
            Ok(()) => TickOutcome::Completed {
                elapsed: started.elapsed(),
            },
            Err(e) => {
                error!(
                    target: targets::SCHEDULER,
                    table = %key.table,
                    lane = %key.lane,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Tick failed; will retry on the next scheduled tick"
                );
                TickOutcome::Failed { error: e.to_string() }
            }
        };
        timer.stop();

        let elapsed = match &outcome {
            TickOutcome::Completed { elapsed } => Some(*elapsed),
            _ => None,
        };
        self.metrics.record_tick(&label, outcome.as_str(), elapsed);
        outcome
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct JobScheduler {
    jobs: RwLock<BTreeMap<JobKey, Arc<dyn PeriodicJob>>>,
    runner: TickRunner,
    /// Replaced on each start so a stopped scheduler can be started again
    cancel: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn Clock>, metrics: EngineMetrics) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            runner: TickRunner {
                leases: LeaseTable::new(),
                clock,
                metrics,
            },
            cancel: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a job. Keys must be unique.
    pub fn register(&self, job: Arc<dyn PeriodicJob>) -> MetricsResult<()> {
        let key = job.key();
        if job.period().is_zero() {
            return Err(MetricsError::validation("period", format!("job {key} has a zero period")));
        }
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&key) {
            return Err(MetricsError::validation("job", format!("job {key} is already registered")));
        }
        debug!(target: targets::SCHEDULER, job = %key, period = ?job.period(), "Job registered");
        jobs.insert(key, job);
        Ok(())
    }

    pub fn job_keys(&self) -> Vec<JobKey> {
        self.jobs.read().keys().cloned().collect()
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.runner.leases
    }

    /// Run one tick of `key` now, honouring its single-flight lease.
    pub async fn trigger(&self, key: &JobKey) -> MetricsResult<TickOutcome> {
        let job = self
            .jobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| MetricsError::not_found(format!("job {key}")))?;
        Ok(self.runner.run(job.as_ref()).await)
    }

    /// Run one tick of every job, in key order.
    pub async fn trigger_all(&self) -> Vec<(JobKey, TickOutcome)> {
        let jobs: Vec<Arc<dyn PeriodicJob>> = self.jobs.read().values().cloned().collect();
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            outcomes.push((job.key(), self.runner.run(job.as_ref()).await));
        }
        outcomes
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Spawn one interval loop per job. The first tick fires one period after
    /// start.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!(target: targets::SCHEDULER, "Scheduler already started");
            return;
        }
        let root = {
            let mut cancel = self.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };

        for job in self.jobs.read().values() {
            let job = job.clone();
            let runner = self.runner.clone();
            let cancel = root.child_token();
            let period = job.period();

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            runner.run(job.as_ref()).await;
                        }
                    }
                }
                debug!(target: targets::SCHEDULER, job = %job.key(), "Job loop stopped");
            }));
        }

        info!(target: targets::SCHEDULER, jobs = handles.len(), "Scheduler started");
    }

    /// Stop every loop. A tick in progress gets `grace` to finish before its
    /// task is aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.lock().cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles)).await.is_err() {
            warn!(
                target: targets::SCHEDULER,
                grace_ms = grace.as_millis() as u64,
                "Jobs did not stop within the grace period, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!(target: targets::SCHEDULER, "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug)]
    struct CountingJob {
        key: JobKey,
        period: Duration,
        ticks: AtomicUsize,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    impl CountingJob {
        fn new(lane: &str, period: Duration) -> Self {
            Self {
                key: JobKey::new("test", lane),
                period,
                ticks: AtomicUsize::new(0),
                fail: false,
                gate: None,
            }
        }
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn key(&self) -> JobKey {
            self.key.clone()
        }

        fn period(&self) -> Duration {
            self.period
        }

        async fn tick(&self, _now: Timestamp) -> MetricsResult<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(MetricsError::store_unavailable("scan", "down"));
            }
            Ok(())
        }
    }

    fn scheduler() -> JobScheduler {
        JobScheduler::new(Arc::new(ManualClock::new(Timestamp::EPOCH)), EngineMetrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_trigger_runs_one_tick() {
        let scheduler = scheduler();
        let job = Arc::new(CountingJob::new("a", Duration::from_secs(60)));
        scheduler.register(job.clone()).unwrap();

        let outcome = scheduler.trigger(&JobKey::new("test", "a")).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(job.ticks.load(Ordering::SeqCst), 1);
        assert!(!scheduler.leases().is_held(&job.key));
        assert!(scheduler.trigger(&JobKey::new("test", "zz")).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let scheduler = scheduler();
        scheduler.register(Arc::new(CountingJob::new("a", Duration::from_secs(1)))).unwrap();
        assert!(scheduler.register(Arc::new(CountingJob::new("a", Duration::from_secs(1)))).is_err());
        assert!(scheduler.register(Arc::new(CountingJob::new("b", Duration::ZERO))).is_err());
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let scheduler = Arc::new(scheduler());
        let gate = Arc::new(Notify::new());
        let job = Arc::new(CountingJob {
            gate: Some(gate.clone()),
            ..CountingJob::new("slow", Duration::from_secs(60))
        });
        scheduler.register(job.clone()).unwrap();
        let key = job.key();

        let first = {
            let scheduler = scheduler.clone();
            let key = key.clone();
            tokio::spawn(async move { scheduler.trigger(&key).await })
        };
        while !scheduler.leases().is_held(&key) {
            tokio::task::yield_now().await;
        }

        assert_eq!(scheduler.trigger(&key).await.unwrap(), TickOutcome::Skipped);

        gate.notify_one();
        assert!(first.await.unwrap().unwrap().is_completed());
        assert_eq!(job.ticks.load(Ordering::SeqCst), 1);
        assert!(!scheduler.leases().is_held(&key));
    }

    #[tokio::test]
    async fn test_failed_tick_is_reported_not_fatal() {
        let scheduler = scheduler();
        let job = Arc::new(CountingJob {
            fail: true,
            ..CountingJob::new("flaky", Duration::from_secs(60))
        });
        scheduler.register(job.clone()).unwrap();

        let outcome = scheduler.trigger(&job.key).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Failed { .. }));
        assert!(matches!(scheduler.trigger(&job.key).await.unwrap(), TickOutcome::Failed { .. }));
        assert_eq!(job.ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loops_tick_and_stop() {
        let scheduler = scheduler();
        let job = Arc::new(CountingJob::new("fast", Duration::from_millis(10)));
        scheduler.register(job.clone()).unwrap();

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;
        assert!(!scheduler.is_running());

        let ticks = job.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected several ticks, got {ticks}");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let scheduler = scheduler();
        let job = Arc::new(CountingJob::new("fast", Duration::from_millis(10)));
        scheduler.register(job.clone()).unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;
        let first_run = job.ticks.load(Ordering::SeqCst);

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        let second_run = job.ticks.load(Ordering::SeqCst) - first_run;
        assert!(second_run >= 2, "restarted loops ticked {second_run} times");
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_lease_released_on_drop() {
        let leases = LeaseTable::new();
        let key = JobKey::new("events", "retention");
        let lease = leases.try_acquire(&key).unwrap();
        assert!(leases.try_acquire(&key).is_none());
        drop(lease);
        assert!(leases.try_acquire(&key).is_some());
    }
}
