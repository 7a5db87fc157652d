//! Work queue: background execution of plain callables.
//!
//! A work queue runs jobs that need no shared argument. Internally the
//! processor binds them to unit arguments, one per parallelism slot, so
//! the concurrency discipline is identical to the other queues.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::argument::Provisioning;
use crate::queue::QueueCore;
use crate::scheduler::ScheduleTarget;
use crate::types::{EnqueueOptions, FabricResult, JobContext, QueueConfig, QueueStats};
use crate::worker::TaskWorker;
use crate::wrapper::{JobCall, JobHandle};

/// A unit of background work with no argument.
///
/// Implementations are invoked once per attempt; a failed attempt with
/// retries remaining re-invokes the same instance.
///
/// # Examples
/// ```rust
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
/// use workfabric::{JobContext, Work};
///
/// struct Ping;
///
/// #[async_trait]
/// impl Work for Ping {
///     type Output = &'static str;
///
///     async fn run(
///         &self,
///         _ctx: JobContext,
///         _cancel: CancellationToken,
///     ) -> anyhow::Result<&'static str> {
///         Ok("pong")
///     }
/// }
/// ```
#[async_trait]
pub trait Work: Send + Sync + 'static {
    /// Value produced on success.
    type Output: Send + 'static;

    /// Run one attempt.
    async fn run(
        &self,
        ctx: JobContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self::Output>;
}

pub(crate) struct WorkCall<W>(Arc<W>);

impl<W> WorkCall<W> {
    pub(crate) fn new(work: Arc<W>) -> Self {
        Self(work)
    }
}

#[async_trait]
impl<W: Work> JobCall<(), W::Output> for WorkCall<W> {
    async fn call(
        &self,
        _argument: &mut (),
        ctx: JobContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<W::Output> {
        self.0.run(ctx, cancel).await
    }
}

struct FnWork<F> {
    f: F,
}

#[async_trait]
impl<F, Fut, T> Work for FnWork<F>
where
    F: Fn(JobContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn run(&self, ctx: JobContext, cancel: CancellationToken) -> anyhow::Result<T> {
        (self.f)(ctx, cancel).await
    }
}

/// Handle to a running work queue. Cheap to clone.
///
/// # Examples
/// ```rust,no_run
/// # async fn example() -> workfabric::FabricResult<()> {
/// use workfabric::{QueueConfig, WorkQueue};
///
/// let queue = WorkQueue::start(QueueConfig::default())?;
/// let handle = queue.enqueue_fn(|_ctx, _cancel| async { Ok(2 + 2) })?;
/// assert_eq!(handle.outcome().await.completed(), Some(4));
/// queue.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct WorkQueue {
    core: Arc<QueueCore<()>>,
}

impl Clone for WorkQueue {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl WorkQueue {
    /// Start a standalone work queue with its own shutdown scope.
    pub fn start(config: QueueConfig) -> FabricResult<Self> {
        Self::start_with_scope(config, CancellationToken::new())
    }

    /// Start a work queue whose lifetime is bound to `scope`.
    pub fn start_with_scope(
        config: QueueConfig,
        scope: CancellationToken,
    ) -> FabricResult<Self> {
        let (queue, worker) = Self::build(config, scope)?;
        queue.core.spawn_worker(worker);
        Ok(queue)
    }

    /// Build the queue without spawning its worker. The host runtime
    /// spawns the returned worker as a named service.
    pub(crate) fn build(
        config: QueueConfig,
        scope: CancellationToken,
    ) -> FabricResult<(Self, TaskWorker<()>)> {
        let arguments = vec![(); config.max_simultaneous.max(1)];
        let (core, worker) =
            QueueCore::assemble(config, Provisioning::Fixed(arguments), scope)?;
        Ok((Self { core }, worker))
    }

    pub(crate) fn scope(&self) -> CancellationToken {
        self.core.scope().clone()
    }

    /// Enqueue a work unit with default options.
    pub fn enqueue<W: Work>(&self, work: W) -> FabricResult<JobHandle<W::Output>> {
        self.enqueue_with(work, EnqueueOptions::default())
    }

    /// Enqueue a work unit with explicit priority, attempts and
    /// cancellation.
    pub fn enqueue_with<W: Work>(
        &self,
        work: W,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<W::Output>> {
        self.enqueue_arc_with(Arc::new(work), options)
    }

    /// Enqueue an async closure.
    pub fn enqueue_fn<F, Fut, T>(&self, f: F) -> FabricResult<JobHandle<T>>
    where
        F: Fn(JobContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_with(FnWork { f }, EnqueueOptions::default())
    }

    /// Enqueue an async closure with explicit options.
    pub fn enqueue_fn_with<F, Fut, T>(
        &self,
        f: F,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<T>>
    where
        F: Fn(JobContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_with(FnWork { f }, options)
    }

    pub(crate) fn enqueue_arc_with<W: Work>(
        &self,
        work: Arc<W>,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<W::Output>> {
        let call: Arc<dyn JobCall<(), W::Output>> = Arc::new(WorkCall::new(work));
        self.core.submit(call, options)
    }

    /// Package a work unit as a target the scheduler can fire into this
    /// queue. Each firing enqueues a fresh job and forwards its promise.
    pub fn schedule_target<W: Work>(
        &self,
        work: W,
        options: EnqueueOptions,
    ) -> QueuedWork<W> {
        QueuedWork {
            queue: self.clone(),
            work: Arc::new(work),
            options,
        }
    }

    /// Current queue statistics.
    pub fn stats(&self) -> QueueStats {
        self.core.stats()
    }

    /// Cancel the queue's scope and wait for its worker.
    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

/// Schedule target that enqueues a work unit on every firing.
pub struct QueuedWork<W: Work> {
    queue: WorkQueue,
    work: Arc<W>,
    options: EnqueueOptions,
}

impl<W: Work> ScheduleTarget<W::Output> for QueuedWork<W> {
    fn fire(&mut self, cancel: CancellationToken) -> FabricResult<JobHandle<W::Output>> {
        let mut options = self.options.clone();
        options.cancel = Some(cancel);
        self.queue.enqueue_arc_with(Arc::clone(&self.work), options)
    }
}
