//! End-to-end tests for the work, access and conveyor queues: priority
//! ordering, retry exhaustion, parallelism bounds, argument lifecycle
//! and cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use workfabric::{
    Access, AccessQueue, Capabilities, Conveyor, ConveyorMachine, EnqueueOptions, FabricError,
    JobArgument, JobContext, Provisioning, QueueConfig, WorkQueue,
};

/// Tracks how many executions are live and the high-water mark.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Enqueue a job that parks on `gate` so the queue's single slot stays
/// busy, and wait until it is actually running.
async fn plug_queue(queue: &WorkQueue, gate: Arc<Notify>) -> workfabric::JobHandle<()> {
    let started = Arc::new(Notify::new());
    let handle = {
        let started = Arc::clone(&started);
        queue
            .enqueue_fn(move |_ctx, cancel| {
                let started = Arc::clone(&started);
                let gate = Arc::clone(&gate);
                async move {
                    started.notify_one();
                    tokio::select! {
                        _ = gate.notified() => {}
                        _ = cancel.cancelled() => {}
                    }
                    Ok(())
                }
            })
            .expect("plug enqueue")
    };
    started.notified().await;
    handle
}

#[tokio::test]
async fn priority_ordering_is_strict() {
    let queue = WorkQueue::start(QueueConfig {
        max_simultaneous: 1,
        max_priority: 2,
        max_attempts: 1,
    })
    .expect("queue start");

    let gate = Arc::new(Notify::new());
    let plug = plug_queue(&queue, Arc::clone(&gate)).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let tagged = |tag: &'static str| {
        let order = Arc::clone(&order);
        move |_ctx: JobContext, _cancel: CancellationToken| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(tag);
                Ok(tag)
            }
        }
    };

    let a = queue
        .enqueue_fn_with(tagged("A"), EnqueueOptions::priority(0))
        .unwrap();
    let b = queue
        .enqueue_fn_with(tagged("B"), EnqueueOptions::priority(2))
        .unwrap();
    let c = queue
        .enqueue_fn_with(tagged("C"), EnqueueOptions::priority(1))
        .unwrap();

    gate.notify_one();
    assert!(plug.outcome().await.is_completed());
    assert_eq!(b.outcome().await.completed(), Some("B"));
    assert_eq!(c.outcome().await.completed(), Some("C"));
    assert_eq!(a.outcome().await.completed(), Some("A"));

    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "A"]);
    queue.shutdown().await;
}

#[tokio::test]
async fn retry_exhaustion_invokes_exactly_max_attempts() {
    let queue = WorkQueue::start(QueueConfig {
        max_attempts: 3,
        ..QueueConfig::default()
    })
    .expect("queue start");

    let invocations = Arc::new(AtomicUsize::new(0));
    let handle = {
        let invocations = Arc::clone(&invocations);
        queue
            .enqueue_fn_with(
                move |_ctx, _cancel| {
                    let invocations = Arc::clone(&invocations);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("boom")
                    }
                },
                EnqueueOptions::attempts(3),
            )
            .unwrap()
    };

    let outcome: workfabric::Outcome<()> = handle.outcome().await;
    assert_eq!(
        outcome.failed().map(|e| e.to_string()),
        Some("boom".to_string())
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    queue.shutdown().await;
}

#[tokio::test]
async fn attempts_are_coerced_into_configured_range() {
    let queue = WorkQueue::start(QueueConfig {
        max_attempts: 2,
        ..QueueConfig::default()
    })
    .expect("queue start");

    let failing = |invocations: &Arc<AtomicUsize>| {
        let invocations = Arc::clone(invocations);
        move |_ctx: JobContext, _cancel: CancellationToken| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("nope"))
            }
        }
    };

    // Above the cap: coerced down to max_attempts.
    let over = Arc::new(AtomicUsize::new(0));
    let handle = queue
        .enqueue_fn_with(failing(&over), EnqueueOptions::attempts(10))
        .unwrap();
    assert!(handle.outcome().await.is_failed());
    assert_eq!(over.load(Ordering::SeqCst), 2);

    // Zero: coerced up to a single attempt.
    let zero = Arc::new(AtomicUsize::new(0));
    let handle = queue
        .enqueue_fn_with(failing(&zero), EnqueueOptions::attempts(0))
        .unwrap();
    assert!(handle.outcome().await.is_failed());
    assert_eq!(zero.load(Ordering::SeqCst), 1);

    queue.shutdown().await;
}

#[tokio::test]
async fn out_of_range_priority_is_rejected_synchronously() {
    let queue = WorkQueue::start(QueueConfig {
        max_priority: 2,
        ..QueueConfig::default()
    })
    .expect("queue start");

    // The boundary slot is valid.
    assert!(queue
        .enqueue_fn_with(|_ctx, _cancel| async { Ok(()) }, EnqueueOptions::priority(2))
        .is_ok());

    let err = queue
        .enqueue_fn_with(|_ctx, _cancel| async { Ok(()) }, EnqueueOptions::priority(3))
        .unwrap_err();
    assert!(matches!(
        err,
        FabricError::BadPriority { priority: 3, max: 2 }
    ));
    queue.shutdown().await;
}

#[tokio::test]
async fn cancel_before_take_never_executes() {
    let queue = WorkQueue::start(QueueConfig::default()).expect("queue start");
    let gate = Arc::new(Notify::new());
    let plug = plug_queue(&queue, Arc::clone(&gate)).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let handle = {
        let invocations = Arc::clone(&invocations);
        queue
            .enqueue_fn(move |_ctx, _cancel| {
                let invocations = Arc::clone(&invocations);
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap()
    };

    handle.cancel();
    gate.notify_one();
    assert!(plug.outcome().await.is_completed());
    assert!(handle.outcome().await.is_cancelled());
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_pending_and_rejects_new_work() {
    let queue = WorkQueue::start(QueueConfig::default()).expect("queue start");
    let gate = Arc::new(Notify::new());
    let plug = plug_queue(&queue, Arc::clone(&gate)).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let pending = {
        let invocations = Arc::clone(&invocations);
        queue
            .enqueue_fn(move |_ctx, _cancel| {
                let invocations = Arc::clone(&invocations);
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap()
    };

    queue.shutdown().await;

    assert!(plug.outcome().await.is_cancelled());
    assert!(pending.outcome().await.is_cancelled());
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    let err = queue
        .enqueue_fn(|_ctx, _cancel| async { Ok(()) })
        .unwrap_err();
    assert!(matches!(err, FabricError::Shutdown));
}

#[tokio::test]
async fn stats_reflect_pending_and_in_flight() {
    let queue = WorkQueue::start(QueueConfig::default()).expect("queue start");
    let gate = Arc::new(Notify::new());
    let plug = plug_queue(&queue, Arc::clone(&gate)).await;

    let first = queue.enqueue_fn(|_ctx, _cancel| async { Ok(()) }).unwrap();
    let second = queue.enqueue_fn(|_ctx, _cancel| async { Ok(()) }).unwrap();

    let stats = queue.stats();
    assert_eq!(stats.pending_tasks, 2);
    assert_eq!(stats.in_flight_tasks, 1);
    assert_eq!(stats.max_simultaneous, 1);

    gate.notify_one();
    assert!(plug.outcome().await.is_completed());
    assert!(first.outcome().await.is_completed());
    assert!(second.outcome().await.is_completed());
    queue.shutdown().await;
}

// ---- access queue ----

struct Slot;

impl JobArgument for Slot {}

struct SleepAccess {
    gauge: Arc<Gauge>,
    pause: Duration,
}

#[async_trait]
impl Access<Slot> for SleepAccess {
    type Output = ();

    async fn access(
        &self,
        _resource: &mut Slot,
        _ctx: JobContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.gauge.enter();
        tokio::time::sleep(self.pause).await;
        self.gauge.exit();
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn fixed_multi_bounds_parallelism() {
    let queue = AccessQueue::start(
        QueueConfig {
            max_simultaneous: 2,
            ..QueueConfig::default()
        },
        Provisioning::fixed(vec![Slot, Slot]),
    )
    .expect("queue start");

    let gauge = Arc::new(Gauge::default());
    let begun = Instant::now();
    let handles: Vec<_> = (0..5)
        .map(|_| {
            queue
                .enqueue(SleepAccess {
                    gauge: Arc::clone(&gauge),
                    pause: Duration::from_millis(100),
                })
                .unwrap()
        })
        .collect();

    for handle in handles {
        assert!(handle.outcome().await.is_completed());
    }

    // Five 100 ms jobs over two slots: three waves.
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(350), "elapsed {elapsed:?}");
    assert!(gauge.max() <= 2, "observed {} concurrent", gauge.max());
    queue.shutdown().await;
}

#[tokio::test]
async fn empty_fixed_argument_set_is_rejected() {
    let result = AccessQueue::<Slot>::start(QueueConfig::default(), Provisioning::fixed(vec![]));
    assert!(matches!(result, Err(FabricError::EmptyArgumentSet)));
}

#[tokio::test]
async fn sync_closures_mutate_the_resource_in_order() {
    struct Counter(u64);
    impl JobArgument for Counter {}

    let queue = AccessQueue::start(QueueConfig::default(), Provisioning::single(Counter(0)))
        .expect("queue start");

    let handles: Vec<_> = (0..10)
        .map(|_| {
            queue
                .enqueue_fn(|counter: &mut Counter, _ctx: &JobContext| {
                    counter.0 += 1;
                    Ok(counter.0)
                })
                .unwrap()
        })
        .collect();

    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.outcome().await.completed().unwrap());
    }
    assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    queue.shutdown().await;
}

// ---- argument lifecycle ----

#[derive(Default)]
struct ProbeCounters {
    activated: AtomicUsize,
    deactivated: AtomicUsize,
    live: Gauge,
}

struct Probe {
    counters: Arc<ProbeCounters>,
}

impl Probe {
    fn new(counters: Arc<ProbeCounters>) -> Self {
        counters.live.enter();
        Self { counters }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.counters.live.exit();
    }
}

#[async_trait]
impl JobArgument for Probe {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.activatable()
    }

    async fn activate(&mut self) -> anyhow::Result<()> {
        self.counters.activated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&mut self) -> anyhow::Result<()> {
        self.counters.deactivated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn one_time_multi_activates_per_job_and_bounds_live_arguments() {
    let counters = Arc::new(ProbeCounters::default());
    let queue = {
        let counters = Arc::clone(&counters);
        AccessQueue::start(
            QueueConfig {
                max_simultaneous: 3,
                ..QueueConfig::default()
            },
            Provisioning::one_time_fn(move || {
                let counters = Arc::clone(&counters);
                async move { Ok(Probe::new(counters)) }
            }),
        )
        .expect("queue start")
    };

    let handles: Vec<_> = (0..9)
        .map(|_| {
            queue
                .enqueue_fn(|_probe: &mut Probe, _ctx: &JobContext| Ok(()))
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.outcome().await.is_completed());
    }

    // Deactivation happens after promise settlement; the shutdown join
    // guarantees every release ran.
    queue.shutdown().await;

    assert_eq!(counters.activated.load(Ordering::SeqCst), 9);
    assert_eq!(counters.deactivated.load(Ordering::SeqCst), 9);
    assert!(
        counters.live.max() <= 3,
        "observed {} live probes",
        counters.live.max()
    );
}

struct FlakyProbe {
    counters: Arc<ProbeCounters>,
    fail_once: Arc<AtomicBool>,
}

#[async_trait]
impl JobArgument for FlakyProbe {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.activatable()
    }

    async fn activate(&mut self) -> anyhow::Result<()> {
        self.counters.activated.fetch_add(1, Ordering::SeqCst);
        if self.fail_once.swap(false, Ordering::SeqCst) {
            anyhow::bail!("activation hiccup");
        }
        Ok(())
    }

    async fn deactivate(&mut self) -> anyhow::Result<()> {
        self.counters.deactivated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn activation_failure_reverts_without_consuming_attempts() {
    let counters = Arc::new(ProbeCounters::default());
    let queue = AccessQueue::start(
        QueueConfig::default(),
        Provisioning::single(FlakyProbe {
            counters: Arc::clone(&counters),
            fail_once: Arc::new(AtomicBool::new(true)),
        }),
    )
    .expect("queue start");

    let invocations = Arc::new(AtomicUsize::new(0));
    let handle = {
        let invocations = Arc::clone(&invocations);
        queue
            .enqueue_fn(move |_probe: &mut FlakyProbe, _ctx: &JobContext| {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
    };

    assert!(handle.outcome().await.is_completed());
    // One failed activation, one successful one, a single execution.
    assert_eq!(counters.activated.load(Ordering::SeqCst), 2);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    queue.shutdown().await;
}

struct Pacer {
    starts: Arc<Mutex<Vec<Instant>>>,
}

impl JobArgument for Pacer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.throttleable()
    }

    fn throttle_interval(&self) -> Duration {
        Duration::from_millis(100)
    }
}

#[tokio::test(start_paused = true)]
async fn throttleable_argument_spaces_consecutive_jobs() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let queue = AccessQueue::start(
        QueueConfig::default(),
        Provisioning::single(Pacer {
            starts: Arc::clone(&starts),
        }),
    )
    .expect("queue start");

    let handles: Vec<_> = (0..3)
        .map(|_| {
            queue
                .enqueue_fn(|pacer: &mut Pacer, _ctx: &JobContext| {
                    pacer.starts.lock().unwrap().push(Instant::now());
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.outcome().await.is_completed());
    }
    queue.shutdown().await;

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(100), "gap {gap:?}");
    }
}

// ---- conveyor ----

struct Doubler;

impl JobArgument for Doubler {}

#[async_trait]
impl ConveyorMachine<u32> for Doubler {
    type Output = u32;

    async fn process(&mut self, data: u32, _cancel: CancellationToken) -> anyhow::Result<u32> {
        // Later inputs finish their machine work sooner; the batch
        // stream must still yield in submission order.
        tokio::time::sleep(Duration::from_millis(u64::from(50 - data * 10))).await;
        Ok(data * 2)
    }
}

#[tokio::test(start_paused = true)]
async fn conveyor_processes_single_inputs() {
    let conveyor: Conveyor<u32, Doubler> =
        Conveyor::start(QueueConfig::default(), Provisioning::single(Doubler))
            .expect("conveyor start");

    let handle = conveyor.process(2).unwrap();
    assert_eq!(handle.outcome().await.completed(), Some(4));
    conveyor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn conveyor_stream_preserves_submission_order() {
    let conveyor: Conveyor<u32, Doubler> = Conveyor::start(
        QueueConfig {
            max_simultaneous: 2,
            ..QueueConfig::default()
        },
        Provisioning::fixed(vec![Doubler, Doubler]),
    )
    .expect("conveyor start");

    let inputs = futures::stream::iter(vec![1_u32, 2, 3, 4]);
    let outcomes: Vec<_> = conveyor.process_stream(inputs).collect().await;

    let values: Vec<_> = outcomes
        .into_iter()
        .map(|outcome| outcome.completed().expect("completed"))
        .collect();
    assert_eq!(values, vec![2, 4, 6, 8]);
    conveyor.shutdown().await;
}

// ---- reusable (pooled) provisioning ----

struct Session {
    counters: Arc<ProbeCounters>,
}

#[async_trait]
impl JobArgument for Session {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.activatable()
    }

    async fn activate(&mut self) -> anyhow::Result<()> {
        self.counters.activated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&mut self) -> anyhow::Result<()> {
        self.counters.deactivated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Access unit that parks until released, used to pin a pooled argument
/// while the rest of a burst is enqueued.
struct GatedAccess {
    started: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl Access<Session> for GatedAccess {
    type Output = ();

    async fn access(
        &self,
        _resource: &mut Session,
        _ctx: JobContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.started.notify_one();
        tokio::select! {
            _ = self.gate.notified() => {}
            _ = cancel.cancelled() => {}
        }
        Ok(())
    }
}

#[tokio::test]
async fn pooled_single_builds_lazily_and_reuses_the_argument() {
    let counters = Arc::new(ProbeCounters::default());
    let built = Arc::new(AtomicUsize::new(0));
    let queue = {
        let counters = Arc::clone(&counters);
        let built = Arc::clone(&built);
        AccessQueue::start(
            QueueConfig::default(),
            Provisioning::pooled_fn(move || {
                let counters = Arc::clone(&counters);
                let built = Arc::clone(&built);
                async move {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(Session { counters })
                }
            }),
        )
        .expect("queue start")
    };

    // Nothing is built until the first job needs an argument.
    assert_eq!(built.load(Ordering::SeqCst), 0);

    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let plug = queue
        .enqueue(GatedAccess {
            started: Arc::clone(&started),
            gate: Arc::clone(&gate),
        })
        .unwrap();
    started.notified().await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            queue
                .enqueue_fn(|_session: &mut Session, _ctx: &JobContext| Ok(()))
                .unwrap()
        })
        .collect();
    gate.notify_one();

    assert!(plug.outcome().await.is_completed());
    for handle in handles {
        assert!(handle.outcome().await.is_completed());
    }
    queue.shutdown().await;

    // One lazily built argument served the whole burst; it was
    // activated once, stayed warm while work remained, and deactivated
    // when the queue drained.
    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(counters.activated.load(Ordering::SeqCst), 1);
    assert_eq!(counters.deactivated.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn pooled_multi_builds_at_most_the_bound() {
    let built = Arc::new(AtomicUsize::new(0));
    let queue = {
        let built = Arc::clone(&built);
        AccessQueue::start(
            QueueConfig {
                max_simultaneous: 3,
                ..QueueConfig::default()
            },
            Provisioning::pooled_fn(move || {
                let built = Arc::clone(&built);
                async move {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(Slot)
                }
            }),
        )
        .expect("queue start")
    };

    let gauge = Arc::new(Gauge::default());
    let handles: Vec<_> = (0..9)
        .map(|_| {
            queue
                .enqueue(SleepAccess {
                    gauge: Arc::clone(&gauge),
                    pause: Duration::from_millis(50),
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.outcome().await.is_completed());
    }
    queue.shutdown().await;

    assert_eq!(built.load(Ordering::SeqCst), 3);
    assert!(gauge.max() <= 3, "observed {} concurrent", gauge.max());
}

#[tokio::test]
async fn factory_failure_reverts_until_it_recovers() {
    let attempts_to_build = Arc::new(AtomicUsize::new(0));
    let queue = {
        let attempts_to_build = Arc::clone(&attempts_to_build);
        AccessQueue::start(
            QueueConfig::default(),
            Provisioning::one_time_fn(move || {
                let attempts_to_build = Arc::clone(&attempts_to_build);
                async move {
                    if attempts_to_build.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("resource not ready");
                    }
                    Ok(Slot)
                }
            }),
        )
        .expect("queue start")
    };

    let invocations = Arc::new(AtomicUsize::new(0));
    let handle = {
        let invocations = Arc::clone(&invocations);
        queue
            .enqueue_fn(move |_slot: &mut Slot, _ctx: &JobContext| {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
    };

    // The job survives two factory failures without spending attempts.
    assert!(handle.outcome().await.is_completed());
    assert_eq!(attempts_to_build.load(Ordering::SeqCst), 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    queue.shutdown().await;
}
