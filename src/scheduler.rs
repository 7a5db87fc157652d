//! Work scheduler: fires queued or direct work at programmed instants.
//!
//! A single loop owns a priority queue of schedule records keyed by next
//! due time. The loop sleeps until the earliest record is due (or parks
//! on a wake signal when the queue is empty), fires due records in
//! `(due, insertion)` order, and reinserts repeating records drift-free:
//! a repeat's next due time is the previous due time plus the interval,
//! and a cron's next occurrence is computed after the previous due time,
//! so late firings never accumulate drift.
//!
//! Wall-clock targets (`chrono`) are mapped onto the tokio timeline
//! through an anchor pair captured at scheduler construction. The loop
//! itself only ever sleeps on `tokio::time::Instant`s.
//!
//! Each record carries its own cancellation token (a child of the
//! scheduler's scope) and a sink: a single promise for one-shot records,
//! a cold outcome stream for repeating ones. The stream completes when
//! the execution budget runs out, the cron has no further occurrence,
//! the record is cancelled, or the scheduler shuts down.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::Stream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{FabricError, FabricResult, Outcome, SchedulerStats};
use crate::util;
use crate::work::{Work, WorkCall};
use crate::wrapper::{ErasedJob, ExecuteVerdict, JobCall, JobHandle, JobWrapper};

/// Firing budget of a repeating schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecCount {
    /// The schedule never self-terminates.
    Unlimited,
    /// At most this many firings; zero means none at all.
    Times(u64),
}

impl ExecCount {
    /// Consume one firing; returns whether more remain.
    fn consume_one(&mut self) -> bool {
        match self {
            ExecCount::Unlimited => true,
            ExecCount::Times(n) => {
                *n = n.saturating_sub(1);
                *n > 0
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        matches!(self, ExecCount::Times(0))
    }
}

/// Something the scheduler can fire: on each due time it produces a job
/// whose promise the scheduler forwards into the record's sink.
///
/// Queued targets are minted by
/// [`WorkQueue::schedule_target`](crate::WorkQueue::schedule_target) and
/// [`AccessQueue::schedule_target`](crate::AccessQueue::schedule_target);
/// [`DirectWork`] executes without any queue.
pub trait ScheduleTarget<T: Send + 'static>: Send + 'static {
    /// Fire once. `cancel` is this firing's token, a child of the
    /// record's token.
    fn fire(&mut self, cancel: CancellationToken) -> FabricResult<JobHandle<T>>;
}

/// Schedule target that executes a work unit immediately on firing,
/// without going through a queue.
pub struct DirectWork<W: Work> {
    work: Arc<W>,
    attempts: u32,
}

impl<W: Work> DirectWork<W> {
    /// Execute `work` once per firing, single attempt.
    pub fn new(work: W) -> Self {
        Self {
            work: Arc::new(work),
            attempts: 1,
        }
    }

    /// Allow up to `attempts` immediate retries per firing.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

impl<W: Work> ScheduleTarget<W::Output> for DirectWork<W> {
    fn fire(&mut self, cancel: CancellationToken) -> FabricResult<JobHandle<W::Output>> {
        let call: Arc<dyn JobCall<(), W::Output>> = Arc::new(WorkCall::new(Arc::clone(&self.work)));
        let (mut wrapper, handle) = JobWrapper::new(call, self.attempts, 0, &cancel, None);
        tokio::spawn(async move {
            let mut unit = ();
            loop {
                match wrapper.execute(&mut unit).await {
                    ExecuteVerdict::Settled => break,
                    // Direct work has no queue to revert into; retry
                    // immediately.
                    ExecuteVerdict::Revert => continue,
                }
            }
        });
        Ok(handle)
    }
}

/// Cold stream of per-firing outcomes from a repeating schedule.
///
/// Yields one [`Outcome`] per firing and completes on schedule end.
/// Dropping the stream does not cancel the schedule; call
/// [`cancel`](Self::cancel) for that.
pub struct OutcomeStream<T> {
    rx: std::pin::Pin<Box<async_channel::Receiver<Outcome<T>>>>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

impl<T> OutcomeStream<T> {
    /// Cancel the schedule: the record is removed, any in-flight firing
    /// is cancelled, and the stream completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.wake.notify_one();
    }

    /// A clone of the record's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<T> Stream for OutcomeStream<T> {
    type Item = Outcome<T>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.as_mut().poll_next(cx)
    }
}

/// How a record computes its next due time after firing.
enum FirePlan {
    Once,
    Every {
        interval: Duration,
        wall_interval: chrono::Duration,
    },
    Cron(Box<Schedule>),
}

type FireFn = Box<dyn FnMut(CancellationToken) + Send>;

struct ScheduleRecord {
    seq: u64,
    due: Instant,
    wall_due: DateTime<Utc>,
    plan: FirePlan,
    budget: ExecCount,
    cancel: CancellationToken,
    fire: FireFn,
}

impl PartialEq for ScheduleRecord {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduleRecord {}

impl PartialOrd for ScheduleRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleRecord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct SchedulerInner {
    records: Mutex<BinaryHeap<Reverse<ScheduleRecord>>>,
    notify: Arc<Notify>,
    scope: CancellationToken,
    seq: AtomicU64,
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
    /// In-flight firing forwarders; shutdown waits for them so every
    /// dispatched outcome settles before the loop task exits.
    tracker: TaskTracker,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running work scheduler. Cheap to clone.
///
/// # Examples
/// ```rust,no_run
/// # async fn example() -> workfabric::FabricResult<()> {
/// use std::time::Duration;
/// use workfabric::{DirectWork, WorkScheduler};
/// # use workfabric::Work;
/// # struct Report;
/// # #[async_trait::async_trait]
/// # impl Work for Report {
/// #     type Output = ();
/// #     async fn run(
/// #         &self,
/// #         _ctx: workfabric::JobContext,
/// #         _cancel: tokio_util::sync::CancellationToken,
/// #     ) -> anyhow::Result<()> { Ok(()) }
/// # }
///
/// let scheduler = WorkScheduler::start();
/// let handle = scheduler.add_delayed(DirectWork::new(Report), Duration::from_secs(5))?;
/// let outcome = handle.outcome().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkScheduler {
    inner: Arc<SchedulerInner>,
}

impl WorkScheduler {
    /// Start a standalone scheduler with its own shutdown scope.
    pub fn start() -> Self {
        Self::start_with_scope(CancellationToken::new())
    }

    /// Start a scheduler whose lifetime is bound to `scope`.
    pub fn start_with_scope(scope: CancellationToken) -> Self {
        let scheduler = Self::build(scope);
        let handle = scheduler.spawn_loop();
        *util::lock(&scheduler.inner.worker) = Some(handle);
        scheduler
    }

    /// Build the scheduler without spawning its loop. The host runtime
    /// spawns the loop as a named service.
    pub(crate) fn build(scope: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                records: Mutex::new(BinaryHeap::new()),
                notify: Arc::new(Notify::new()),
                scope,
                seq: AtomicU64::new(0),
                anchor_wall: Utc::now(),
                anchor_instant: Instant::now(),
                tracker: TaskTracker::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn spawn_loop(&self) -> JoinHandle<()> {
        tokio::spawn(SchedulerInner::run(Arc::clone(&self.inner)))
    }

    /// Fire `target` once after `delay`.
    pub fn add_delayed<T, S>(&self, target: S, delay: Duration) -> FabricResult<JobHandle<T>>
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        if delay.is_zero() {
            return Err(FabricError::BadDelay);
        }
        let wall_delay = chrono::Duration::from_std(delay).map_err(|_| FabricError::BadDelay)?;
        self.add_single(target, Instant::now() + delay, Utc::now() + wall_delay)
    }

    /// Fire `target` once at the absolute time `at`.
    pub fn add_scheduled<T, S>(&self, target: S, at: DateTime<Utc>) -> FabricResult<JobHandle<T>>
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        if at <= Utc::now() {
            return Err(FabricError::BadTime);
        }
        self.add_single(target, self.inner.wall_to_instant(at), at)
    }

    /// Fire `target` every `interval`, starting `first_delay` from now,
    /// at most `count` times.
    pub fn add_repeated<T, S>(
        &self,
        target: S,
        first_delay: Duration,
        interval: Duration,
        count: ExecCount,
    ) -> FabricResult<OutcomeStream<T>>
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        let plan = Self::repeat_plan(interval)?;
        let wall_delay =
            chrono::Duration::from_std(first_delay).map_err(|_| FabricError::BadDelay)?;
        self.add_repeating(
            target,
            Instant::now() + first_delay,
            Utc::now() + wall_delay,
            plan,
            count,
        )
    }

    /// Fire `target` every `interval` starting at the absolute time
    /// `start`, at most `count` times.
    pub fn add_repeated_at<T, S>(
        &self,
        target: S,
        start: DateTime<Utc>,
        interval: Duration,
        count: ExecCount,
    ) -> FabricResult<OutcomeStream<T>>
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        if start <= Utc::now() {
            return Err(FabricError::BadTime);
        }
        let plan = Self::repeat_plan(interval)?;
        self.add_repeating(target, self.inner.wall_to_instant(start), start, plan, count)
    }

    /// Fire `target` on the cron schedule `expression`, at most `count`
    /// times. A cron with no future occurrence yields a stream that
    /// completes immediately.
    pub fn add_cron<T, S>(
        &self,
        target: S,
        expression: &str,
        count: ExecCount,
    ) -> FabricResult<OutcomeStream<T>>
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        let schedule = Schedule::from_str(expression)
            .map_err(|err| FabricError::BadCron(err.to_string()))?;
        let Some(first) = schedule.after(&Utc::now()).next() else {
            debug!(cron = %expression, "cron has no future occurrence, completing immediately");
            return Ok(self.completed_stream());
        };
        let due = self.inner.wall_to_instant(first);
        self.add_repeating(target, due, first, FirePlan::Cron(Box::new(schedule)), count)
    }

    /// Current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled_records: util::lock(&self.inner.records).len(),
        }
    }

    /// Cancel the scheduler's scope and wait for a self-spawned loop.
    /// Every pending record's sink completes.
    pub async fn shutdown(&self) {
        self.inner.scope.cancel();
        self.inner.notify.notify_one();
        let handle = util::lock(&self.inner.worker).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn repeat_plan(interval: Duration) -> FabricResult<FirePlan> {
        if interval.is_zero() {
            return Err(FabricError::BadDelay);
        }
        let wall_interval =
            chrono::Duration::from_std(interval).map_err(|_| FabricError::BadDelay)?;
        Ok(FirePlan::Every {
            interval,
            wall_interval,
        })
    }

    fn add_single<T, S>(
        &self,
        target: S,
        due: Instant,
        wall_due: DateTime<Utc>,
    ) -> FabricResult<JobHandle<T>>
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        if self.inner.scope.is_cancelled() {
            return Err(FabricError::Shutdown);
        }
        let record_token = self.inner.scope.child_token();
        let (tx, rx) = async_channel::bounded(1);
        let handle = JobHandle::from_parts(Uuid::new_v4(), rx, record_token.clone());
        self.push_record(ScheduleRecord {
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            due,
            wall_due,
            plan: FirePlan::Once,
            budget: ExecCount::Times(1),
            cancel: record_token,
            fire: Self::make_fire(target, tx, self.inner.tracker.clone()),
        });
        Ok(handle)
    }

    fn add_repeating<T, S>(
        &self,
        target: S,
        due: Instant,
        wall_due: DateTime<Utc>,
        plan: FirePlan,
        count: ExecCount,
    ) -> FabricResult<OutcomeStream<T>>
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        if self.inner.scope.is_cancelled() {
            return Err(FabricError::Shutdown);
        }
        if count.is_exhausted() {
            return Ok(self.completed_stream());
        }
        let record_token = self.inner.scope.child_token();
        let (tx, rx) = async_channel::unbounded();
        let stream = OutcomeStream {
            rx: Box::pin(rx),
            cancel: record_token.clone(),
            wake: Arc::clone(&self.inner.notify),
        };
        self.push_record(ScheduleRecord {
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            due,
            wall_due,
            plan,
            budget: count,
            cancel: record_token,
            fire: Self::make_fire(target, tx, self.inner.tracker.clone()),
        });
        Ok(stream)
    }

    fn push_record(&self, record: ScheduleRecord) {
        util::lock(&self.inner.records).push(Reverse(record));
        self.inner.notify.notify_one();
    }

    /// An already-complete outcome stream (zero-budget schedules, crons
    /// with no future occurrence).
    fn completed_stream<T>(&self) -> OutcomeStream<T> {
        let (tx, rx) = async_channel::unbounded();
        drop(tx);
        OutcomeStream {
            rx: Box::pin(rx),
            cancel: self.inner.scope.child_token(),
            wake: Arc::clone(&self.inner.notify),
        }
    }

    /// Erase the target's output type into the record's fire closure.
    /// Each invocation fires the target and forwards the resulting
    /// promise into the sink.
    fn make_fire<T, S>(
        mut target: S,
        tx: async_channel::Sender<Outcome<T>>,
        tracker: TaskTracker,
    ) -> FireFn
    where
        T: Send + 'static,
        S: ScheduleTarget<T>,
    {
        Box::new(move |firing_cancel| match target.fire(firing_cancel) {
            Ok(handle) => {
                let tx = tx.clone();
                tracker.spawn(async move {
                    let _ = tx.send(handle.outcome().await).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "schedule firing failed to dispatch");
                let _ = tx.try_send(Outcome::Failed(err.into()));
            }
        })
    }
}

impl SchedulerInner {
    fn wall_to_instant(&self, wall: DateTime<Utc>) -> Instant {
        match (wall - self.anchor_wall).to_std() {
            Ok(offset) => self.anchor_instant + offset,
            // A target at or before the anchor is due immediately.
            Err(_) => Instant::now(),
        }
    }

    async fn run(inner: Arc<Self>) {
        debug!("work scheduler started");
        loop {
            inner.sweep_cancelled();
            let next_due = util::lock(&inner.records).peek().map(|Reverse(r)| r.due);
            tokio::select! {
                _ = inner.scope.cancelled() => break,
                _ = inner.notify.notified() => continue,
                _ = Self::sleep_until_due(next_due) => inner.fire_due(),
            }
        }
        inner.drain_on_shutdown();
        inner.tracker.close();
        inner.tracker.wait().await;
        debug!("work scheduler stopped");
    }

    async fn sleep_until_due(due: Option<Instant>) {
        match due {
            Some(due) => tokio::time::sleep_until(due).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Pop and fire every record whose due time has passed, reinserting
    /// repeating records at their next due time.
    fn fire_due(&self) {
        let now = Instant::now();
        loop {
            let mut record = {
                let mut records = util::lock(&self.records);
                let is_due = records
                    .peek()
                    .is_some_and(|Reverse(record)| record.due <= now);
                if !is_due {
                    break;
                }
                match records.pop() {
                    Some(Reverse(record)) => record,
                    None => break,
                }
            };

            if record.cancel.is_cancelled() {
                // Dropping the record drops its sink; the stream
                // completes.
                continue;
            }

            (record.fire)(record.cancel.child_token());

            if !record.budget.consume_one() {
                continue;
            }
            let rescheduled = match &record.plan {
                FirePlan::Once => false,
                FirePlan::Every {
                    interval,
                    wall_interval,
                } => {
                    record.due += *interval;
                    record.wall_due += *wall_interval;
                    true
                }
                FirePlan::Cron(schedule) => {
                    match schedule.after(&record.wall_due).next() {
                        Some(next_wall) => {
                            record.due = self.wall_to_instant(next_wall);
                            record.wall_due = next_wall;
                            true
                        }
                        None => false,
                    }
                }
            };
            if rescheduled {
                util::lock(&self.records).push(Reverse(record));
            }
        }
    }

    /// Remove records whose cancellation fired while they were waiting.
    fn sweep_cancelled(&self) {
        let mut records = util::lock(&self.records);
        if records
            .iter()
            .any(|Reverse(record)| record.cancel.is_cancelled())
        {
            let kept = records
                .drain()
                .filter(|Reverse(record)| !record.cancel.is_cancelled())
                .collect();
            *records = kept;
        }
    }

    fn drain_on_shutdown(&self) {
        let mut records = util::lock(&self.records);
        for Reverse(record) in records.drain() {
            record.cancel.cancel();
        }
    }
}
