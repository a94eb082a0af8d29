//! Fixed-period trigger loop around a [`PipelineRunner`].
//!
//! Runs never overlap: the loop awaits the in-flight run before it waits for
//! the next tick. What happens to ticks that fall due while a run overruns is
//! set by [`OverlapPolicy`]; what happens to the in-flight run on shutdown is
//! set by [`ShutdownPolicy`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use crate::{DagtickError, PipelineRunner, RunReport};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// Longest accepted tick period (one year).
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Ticks missed during an overrun are dropped; the next run starts on the
    /// regular tick grid.
    #[default]
    Skip,
    /// At most one missed tick is kept and fires as soon as the overrun ends;
    /// later ticks are measured from that delayed tick.
    Queue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Stop before the next tick; an in-flight run finishes first.
    #[default]
    Drain,
    /// Drop the in-flight run at its next suspension point.
    Abandon,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
}

pub struct Scheduler {
    runner: Arc<PipelineRunner>,
    period: Duration,
    overlap: OverlapPolicy,
    shutdown_policy: ShutdownPolicy,
}

impl Scheduler {
    pub fn new(runner: Arc<PipelineRunner>, period: Duration) -> Result<Self, DagtickError> {
        if period.is_zero() {
            return Err(DagtickError::InvalidSchedule(
                "period must be greater than zero".to_string(),
            ));
        }
        if period > MAX_PERIOD {
            return Err(DagtickError::InvalidSchedule(format!(
                "period must not exceed {}s",
                MAX_PERIOD.as_secs()
            )));
        }
        Ok(Self {
            runner,
            period,
            overlap: OverlapPolicy::default(),
            shutdown_policy: ShutdownPolicy::default(),
        })
    }

    pub fn with_overlap_policy(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn runner(&self) -> &Arc<PipelineRunner> {
        &self.runner
    }

    /// Single immediate run, outside the tick loop.
    pub async fn run_once(&self) -> Result<RunReport, DagtickError> {
        self.runner.execute(CancellationToken::new()).await
    }

    /// Triggers a run every period until `shutdown` is cancelled.
    ///
    /// The first run starts immediately. A failed run is logged and counted;
    /// it never stops the loop.
    pub async fn run(&self, shutdown: CancellationToken) -> SchedulerReport {
        let mut next = Instant::now();
        let mut report = SchedulerReport::default();

        info!(
            period_secs = self.period.as_secs_f64(),
            overlap = ?self.overlap,
            shutdown = ?self.shutdown_policy,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep_until(next) => {}
            }

            report.runs += 1;
            match self.run_tick(&shutdown).await {
                Some(Ok(_)) => report.succeeded += 1,
                Some(Err(DagtickError::Cancelled(reason))) => {
                    warn!(reason = %reason, "run cancelled");
                    report.abandoned += 1;
                }
                Some(Err(e)) => {
                    error!(run = report.runs, error = %e, "pipeline run failed");
                    report.failed += 1;
                }
                None => report.abandoned += 1,
            }

            match self.next_tick(next, Instant::now()) {
                Some(tick) => next = tick,
                None => {
                    warn!("next tick is out of range, waiting for shutdown");
                    shutdown.cancelled().await;
                    break;
                }
            }
        }

        info!(
            runs = report.runs,
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "scheduler stopped"
        );
        report
    }

    /// When the run after the one scheduled at `scheduled` should start,
    /// given that the loop is ready again at `now`. `None` if that instant
    /// cannot be represented.
    fn next_tick(&self, scheduled: Instant, now: Instant) -> Option<Instant> {
        let due = scheduled.checked_add(self.period)?;
        if due >= now {
            return Some(due);
        }
        match self.overlap {
            OverlapPolicy::Queue => Some(now),
            OverlapPolicy::Skip => {
                let period = self.period.as_nanos();
                let periods = (now - due).as_nanos().div_ceil(period);
                let skipped = u64::try_from(periods.checked_mul(period)?).ok()?;
                due.checked_add(Duration::from_nanos(skipped))
            }
        }
    }

    async fn run_tick(&self, shutdown: &CancellationToken) -> Option<Result<RunReport, DagtickError>> {
        match self.shutdown_policy {
            ShutdownPolicy::Drain => Some(self.runner.execute(CancellationToken::new()).await),
            ShutdownPolicy::Abandon => {
                tokio::select! {
                    result = self.runner.execute(shutdown.child_token()) => Some(result),
                    _ = shutdown.cancelled() => {
                        warn!("shutdown requested, abandoning in-flight run");
                        self.runner.abandon().await;
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DependencyGraph, MemoryNotifier, RetryPolicy, Task, TaskState};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::sleep;

    struct Tracker {
        starts: Mutex<Vec<Duration>>,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
        finished: AtomicU32,
    }

    fn tracked_runner(run_time: Duration, fail: bool, origin: Instant) -> (Arc<PipelineRunner>, Arc<Tracker>, Arc<MemoryNotifier>) {
        let tracker = Arc::new(Tracker {
            starts: Mutex::new(Vec::new()),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            finished: AtomicU32::new(0),
        });
        let p = tracker.clone();
        let task = Task::new(
            "job",
            move || {
                let p = p.clone();
                async move {
                    if p.in_flight.swap(true, Ordering::SeqCst) {
                        p.overlapped.store(true, Ordering::SeqCst);
                    }
                    p.starts.lock().unwrap().push(origin.elapsed());
                    sleep(run_time).await;
                    p.in_flight.store(false, Ordering::SeqCst);
                    p.finished.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        anyhow::bail!("job failed");
                    }
                    Ok(())
                }
            },
            &[],
        );

        let mut graph = DependencyGraph::new();
        graph.add_task(task).unwrap();
        let notifier = Arc::new(MemoryNotifier::new());
        let runner = PipelineRunner::new(graph, notifier.clone()).with_default_policy(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        });
        (Arc::new(runner), tracker, notifier)
    }

    async fn run_for(scheduler: Scheduler, span: Duration) -> SchedulerReport {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(token).await });
        sleep(span).await;
        shutdown.cancel();
        handle.await.unwrap()
    }

    #[test]
    fn zero_period_is_rejected() {
        let runner = Arc::new(PipelineRunner::new(DependencyGraph::new(), Arc::new(MemoryNotifier::new())));
        assert!(matches!(
            Scheduler::new(runner, Duration::ZERO),
            Err(DagtickError::InvalidSchedule(_))
        ));
    }

    fn scheduler_with(overlap: OverlapPolicy) -> Scheduler {
        let runner = Arc::new(PipelineRunner::new(DependencyGraph::new(), Arc::new(MemoryNotifier::new())));
        Scheduler::new(runner, Duration::from_secs(10))
            .unwrap()
            .with_overlap_policy(overlap)
    }

    #[test]
    fn next_tick_keeps_grid_when_on_time() {
        let t0 = Instant::now();
        for overlap in [OverlapPolicy::Skip, OverlapPolicy::Queue] {
            let s = scheduler_with(overlap);
            assert_eq!(s.next_tick(t0, t0 + Duration::from_secs(3)), Some(t0 + Duration::from_secs(10)));
            assert_eq!(s.next_tick(t0, t0 + Duration::from_secs(10)), Some(t0 + Duration::from_secs(10)));
        }
    }

    #[test]
    fn next_tick_after_overrun_depends_on_policy() {
        let t0 = Instant::now();
        let late = t0 + Duration::from_secs(27);
        assert_eq!(scheduler_with(OverlapPolicy::Skip).next_tick(t0, late), Some(t0 + Duration::from_secs(30)));
        assert_eq!(scheduler_with(OverlapPolicy::Queue).next_tick(t0, late), Some(late));
    }

    #[test]
    fn period_above_maximum_is_rejected() {
        for period in [MAX_PERIOD + Duration::from_secs(1), Duration::from_secs(u64::MAX)] {
            let runner = Arc::new(PipelineRunner::new(DependencyGraph::new(), Arc::new(MemoryNotifier::new())));
            assert!(matches!(
                Scheduler::new(runner, period),
                Err(DagtickError::InvalidSchedule(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn maximum_period_runs_once_and_stops_cleanly() {
        let origin = Instant::now();
        let (runner, tracker, _) = tracked_runner(Duration::ZERO, false, origin);
        let scheduler = Scheduler::new(runner, MAX_PERIOD).unwrap();

        let report = run_for(scheduler, Duration::from_secs(1)).await;

        assert_eq!(report.runs, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(tracker.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_every_period_without_overlap() {
        let origin = Instant::now();
        let (runner, tracker, _) = tracked_runner(Duration::from_secs(1), false, origin);
        let scheduler = Scheduler::new(runner, Duration::from_secs(10)).unwrap();

        let report = run_for(scheduler, Duration::from_secs(30) + Duration::from_millis(500)).await;

        assert!(report.runs >= 3, "{report:?}");
        assert_eq!(report.succeeded, report.runs);
        assert!(!tracker.overlapped.load(Ordering::SeqCst));
        let starts = tracker.starts.lock().unwrap().clone();
        assert_eq!(starts[..3], [Duration::ZERO, Duration::from_secs(10), Duration::from_secs(20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_do_not_stop_the_loop() {
        let origin = Instant::now();
        let (runner, _, notifier) = tracked_runner(Duration::from_secs(1), true, origin);
        let scheduler = Scheduler::new(runner, Duration::from_secs(10)).unwrap();

        let report = run_for(scheduler, Duration::from_secs(35)).await;

        assert_eq!(report.runs, 4);
        assert_eq!(report.failed, 4);
        assert_eq!(notifier.len().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_policy_resumes_on_tick_grid_after_overrun() {
        let origin = Instant::now();
        let (runner, tracker, _) = tracked_runner(Duration::from_secs(15), false, origin);
        let scheduler = Scheduler::new(runner, Duration::from_secs(10))
            .unwrap()
            .with_overlap_policy(OverlapPolicy::Skip);

        run_for(scheduler, Duration::from_secs(45)).await;

        let starts = tracker.starts.lock().unwrap().clone();
        assert_eq!(starts[..2], [Duration::ZERO, Duration::from_secs(20)]);
        assert!(!tracker.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_policy_fires_missed_tick_after_overrun() {
        let origin = Instant::now();
        let (runner, tracker, _) = tracked_runner(Duration::from_secs(15), false, origin);
        let scheduler = Scheduler::new(runner, Duration::from_secs(10))
            .unwrap()
            .with_overlap_policy(OverlapPolicy::Queue);

        run_for(scheduler, Duration::from_secs(45)).await;

        let starts = tracker.starts.lock().unwrap().clone();
        assert_eq!(starts[..2], [Duration::ZERO, Duration::from_secs(15)]);
        assert!(!tracker.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_lets_in_flight_run_finish() {
        let origin = Instant::now();
        let (runner, tracker, _) = tracked_runner(Duration::from_secs(5), false, origin);
        let scheduler = Scheduler::new(runner, Duration::from_secs(60))
            .unwrap()
            .with_shutdown_policy(ShutdownPolicy::Drain);

        let report = run_for(scheduler, Duration::from_secs(2)).await;

        assert_eq!(report.runs, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(tracker.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_drops_in_flight_run() {
        let origin = Instant::now();
        let (runner, tracker, notifier) = tracked_runner(Duration::from_secs(5), false, origin);
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(60))
            .unwrap()
            .with_shutdown_policy(ShutdownPolicy::Abandon);

        let report = run_for(scheduler, Duration::from_secs(2)).await;

        assert_eq!(report.runs, 1);
        assert_eq!(report.abandoned, 1);
        assert_eq!(tracker.finished.load(Ordering::SeqCst), 0);
        assert!(notifier.is_empty().await);
        assert_eq!(runner.task_states().await["job"], TaskState::Pending);
        assert!(runner.completed_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn run_once_executes_immediately() {
        let (runner, tracker, _) = tracked_runner(Duration::ZERO, false, Instant::now());
        let scheduler = Scheduler::new(runner, Duration::from_secs(3600)).unwrap();

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.order, ["job"]);
        assert_eq!(tracker.finished.load(Ordering::SeqCst), 1);
    }
}
