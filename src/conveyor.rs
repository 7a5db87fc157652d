//! Conveyor: typed data transformation through a pool of machines.
//!
//! A conveyor moves inputs of type `D` through machines implementing
//! [`ConveyorMachine`], producing outputs. Single inputs resolve a
//! [`JobHandle`]; batch processing accepts any input stream and yields
//! results in submission order while the machines work in parallel
//! underneath.
//!
//! Inputs must be `Clone` because a retried attempt feeds the machine a
//! fresh copy of the input.

use std::marker::PhantomData;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::{FuturesOrdered, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::access::{Access, AccessQueue};
use crate::argument::{JobArgument, Provisioning};
use crate::types::{EnqueueOptions, FabricResult, JobContext, Outcome, QueueConfig, QueueStats};
use crate::worker::TaskWorker;
use crate::wrapper::JobHandle;

/// A machine that transforms one input into one output.
///
/// Machines are arguments: they declare capabilities and may be
/// activatable or throttleable like any other [`JobArgument`].
#[async_trait]
pub trait ConveyorMachine<D: Send + 'static>: JobArgument {
    /// Value produced per input.
    type Output: Send + 'static;

    /// Transform one input.
    async fn process(
        &mut self,
        data: D,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self::Output>;
}

/// Access unit feeding one input to a leased machine.
struct ConveyorJob<D> {
    data: D,
}

#[async_trait]
impl<D, M> Access<M> for ConveyorJob<D>
where
    D: Clone + Send + Sync + 'static,
    M: ConveyorMachine<D>,
{
    type Output = M::Output;

    async fn access(
        &self,
        machine: &mut M,
        _ctx: JobContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<M::Output> {
        machine.process(self.data.clone(), cancel).await
    }
}

/// Handle to a running conveyor over machines of type `M`. Cheap to
/// clone.
pub struct Conveyor<D, M>
where
    D: Clone + Send + Sync + 'static,
    M: ConveyorMachine<D>,
{
    queue: AccessQueue<M>,
    _data: PhantomData<fn(D)>,
}

impl<D, M> Clone for Conveyor<D, M>
where
    D: Clone + Send + Sync + 'static,
    M: ConveyorMachine<D>,
{
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            _data: PhantomData,
        }
    }
}

impl<D, M> Conveyor<D, M>
where
    D: Clone + Send + Sync + 'static,
    M: ConveyorMachine<D>,
{
    /// Start a standalone conveyor with its own shutdown scope.
    pub fn start(config: QueueConfig, provisioning: Provisioning<M>) -> FabricResult<Self> {
        Self::start_with_scope(config, provisioning, CancellationToken::new())
    }

    /// Start a conveyor whose lifetime is bound to `scope`.
    pub fn start_with_scope(
        config: QueueConfig,
        provisioning: Provisioning<M>,
        scope: CancellationToken,
    ) -> FabricResult<Self> {
        let queue = AccessQueue::start_with_scope(config, provisioning, scope)?;
        Ok(Self {
            queue,
            _data: PhantomData,
        })
    }

    pub(crate) fn build(
        config: QueueConfig,
        provisioning: Provisioning<M>,
        scope: CancellationToken,
    ) -> FabricResult<(Self, TaskWorker<M>)> {
        let (queue, worker) = AccessQueue::build(config, provisioning, scope)?;
        Ok((
            Self {
                queue,
                _data: PhantomData,
            },
            worker,
        ))
    }

    pub(crate) fn scope(&self) -> CancellationToken {
        self.queue.scope()
    }

    /// Submit one input with default options.
    pub fn process(&self, data: D) -> FabricResult<JobHandle<M::Output>> {
        self.process_with(data, EnqueueOptions::default())
    }

    /// Submit one input with explicit priority, attempts and
    /// cancellation.
    pub fn process_with(
        &self,
        data: D,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<M::Output>> {
        self.queue.enqueue_with(ConveyorJob { data }, options)
    }

    /// Process a stream of inputs, yielding one [`Outcome`] per input in
    /// submission order.
    ///
    /// Inputs are dispatched to machines as soon as they arrive from the
    /// stream; only the *yield* order is serialized. A submission the
    /// queue rejects (for example after shutdown) surfaces as a
    /// `Failed` outcome in that input's position.
    pub fn process_stream<St>(
        &self,
        inputs: St,
    ) -> impl Stream<Item = Outcome<M::Output>> + Send
    where
        St: Stream<Item = D> + Send + 'static,
    {
        let conveyor = self.clone();
        stream! {
            futures::pin_mut!(inputs);
            let mut pending = FuturesOrdered::new();
            let mut open = true;
            loop {
                tokio::select! {
                    item = inputs.next(), if open => match item {
                        Some(data) => match conveyor.process(data) {
                            Ok(handle) => {
                                pending.push_back(futures::future::Either::Left(handle.outcome()));
                            }
                            Err(err) => {
                                pending.push_back(futures::future::Either::Right(
                                    futures::future::ready(Outcome::Failed(err.into())),
                                ));
                            }
                        },
                        None => open = false,
                    },
                    Some(outcome) = pending.next() => yield outcome,
                    else => break,
                }
            }
        }
    }

    /// Current queue statistics.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Cancel the conveyor's scope and wait for its worker.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
