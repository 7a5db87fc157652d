//! Access queue: serialized or bounded-parallel access to shared
//! resources.
//!
//! Each enqueued unit runs against one instance of the resource type
//! `R`. Whether access is serial or parallel, and whether resources are
//! pre-built, pooled or per-job, is the queue's [`Provisioning`] and
//! `max_simultaneous` configuration; the units themselves never see the
//! concurrency discipline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::argument::{JobArgument, Provisioning};
use crate::queue::QueueCore;
use crate::scheduler::ScheduleTarget;
use crate::types::{EnqueueOptions, FabricResult, JobContext, QueueConfig, QueueStats};
use crate::worker::TaskWorker;
use crate::wrapper::{JobCall, JobHandle};

/// A unit of work over a shared resource `R`.
///
/// The resource is borrowed mutably for the duration of the attempt; the
/// processor guarantees no other job touches the same instance
/// concurrently.
#[async_trait]
pub trait Access<R: JobArgument>: Send + Sync + 'static {
    /// Value produced on success.
    type Output: Send + 'static;

    /// Run one attempt against the leased resource.
    async fn access(
        &self,
        resource: &mut R,
        ctx: JobContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self::Output>;
}

struct AccessCall<W>(Arc<W>);

#[async_trait]
impl<R: JobArgument, W: Access<R>> JobCall<R, W::Output> for AccessCall<W> {
    async fn call(
        &self,
        argument: &mut R,
        ctx: JobContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<W::Output> {
        self.0.access(argument, ctx, cancel).await
    }
}

/// Synchronous closure adapter; the closure runs inline on the worker.
struct BlockingAccess<F> {
    f: F,
}

#[async_trait]
impl<R, T, F> Access<R> for BlockingAccess<F>
where
    R: JobArgument,
    T: Send + 'static,
    F: Fn(&mut R, &JobContext) -> anyhow::Result<T> + Send + Sync + 'static,
{
    type Output = T;

    async fn access(
        &self,
        resource: &mut R,
        ctx: JobContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<T> {
        (self.f)(resource, &ctx)
    }
}

/// Handle to a running access queue over resources of type `R`.
/// Cheap to clone.
///
/// # Examples
/// ```rust,no_run
/// # async fn example() -> workfabric::FabricResult<()> {
/// use workfabric::{AccessQueue, JobArgument, Provisioning, QueueConfig};
///
/// struct Counter(u64);
/// impl JobArgument for Counter {}
///
/// let queue = AccessQueue::start(
///     QueueConfig::default(),
///     Provisioning::single(Counter(0)),
/// )?;
/// let handle = queue.enqueue_fn(|counter: &mut Counter, _ctx: &workfabric::JobContext| {
///     counter.0 += 1;
///     Ok(counter.0)
/// })?;
/// assert_eq!(handle.outcome().await.completed(), Some(1));
/// # Ok(())
/// # }
/// ```
pub struct AccessQueue<R: JobArgument> {
    core: Arc<QueueCore<R>>,
}

impl<R: JobArgument> Clone for AccessQueue<R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<R: JobArgument> AccessQueue<R> {
    /// Start a standalone access queue with its own shutdown scope.
    pub fn start(config: QueueConfig, provisioning: Provisioning<R>) -> FabricResult<Self> {
        Self::start_with_scope(config, provisioning, CancellationToken::new())
    }

    /// Start an access queue whose lifetime is bound to `scope`.
    pub fn start_with_scope(
        config: QueueConfig,
        provisioning: Provisioning<R>,
        scope: CancellationToken,
    ) -> FabricResult<Self> {
        let (queue, worker) = Self::build(config, provisioning, scope)?;
        queue.core.spawn_worker(worker);
        Ok(queue)
    }

    pub(crate) fn build(
        config: QueueConfig,
        provisioning: Provisioning<R>,
        scope: CancellationToken,
    ) -> FabricResult<(Self, TaskWorker<R>)> {
        let (core, worker) = QueueCore::assemble(config, provisioning, scope)?;
        Ok((Self { core }, worker))
    }

    pub(crate) fn scope(&self) -> CancellationToken {
        self.core.scope().clone()
    }

    /// Enqueue an access unit with default options.
    pub fn enqueue<W: Access<R>>(&self, access: W) -> FabricResult<JobHandle<W::Output>> {
        self.enqueue_with(access, EnqueueOptions::default())
    }

    /// Enqueue an access unit with explicit priority, attempts and
    /// cancellation.
    pub fn enqueue_with<W: Access<R>>(
        &self,
        access: W,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<W::Output>> {
        self.enqueue_arc_with(Arc::new(access), options)
    }

    /// Enqueue a synchronous closure over the resource.
    pub fn enqueue_fn<F, T>(&self, f: F) -> FabricResult<JobHandle<T>>
    where
        F: Fn(&mut R, &JobContext) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.enqueue_with(BlockingAccess { f }, EnqueueOptions::default())
    }

    /// Enqueue a synchronous closure with explicit options.
    pub fn enqueue_fn_with<F, T>(
        &self,
        f: F,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<T>>
    where
        F: Fn(&mut R, &JobContext) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.enqueue_with(BlockingAccess { f }, options)
    }

    pub(crate) fn enqueue_arc_with<W: Access<R>>(
        &self,
        access: Arc<W>,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<W::Output>> {
        let call: Arc<dyn JobCall<R, W::Output>> = Arc::new(AccessCall(access));
        self.core.submit(call, options)
    }

    /// Package an access unit as a target the scheduler can fire into
    /// this queue.
    pub fn schedule_target<W: Access<R>>(
        &self,
        access: W,
        options: EnqueueOptions,
    ) -> QueuedAccess<R, W> {
        QueuedAccess {
            queue: self.clone(),
            access: Arc::new(access),
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

/// Schedule target that enqueues an access unit on every firing.
pub struct QueuedAccess<R: JobArgument, W: Access<R>> {
    queue: AccessQueue<R>,
    access: Arc<W>,
    options: EnqueueOptions,
}

impl<R: JobArgument, W: Access<R>> ScheduleTarget<W::Output> for QueuedAccess<R, W> {
    fn fire(&mut self, cancel: CancellationToken) -> FabricResult<JobHandle<W::Output>> {
        let mut options = self.options.clone();
        options.cancel = Some(cancel);
        self.queue
            .enqueue_arc_with(Arc::clone(&self.access), options)
    }
}
