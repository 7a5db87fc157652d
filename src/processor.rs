//! Argument processors: bind queued jobs to argument instances under a
//! concurrency bound.
//!
//! Six strategies fall out of two orthogonal axes. Concurrency is a
//! counting semaphore (a bound of one is the serial case); argument
//! provisioning is the [`Provisioning`] mode (fixed set, factory-backed
//! pool, or one argument per job). All strategies share one driver loop:
//! acquire a permit, take a job, lease an argument, spawn the execution.
//!
//! Error policy:
//! - factory failure: log, revert the job, release the permit, continue;
//! - activation failure: same, and the job's attempts are untouched;
//! - callable failure: handled inside the wrapper (attempts);
//! - deactivation failure: logged only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::argument::{ArgumentFactory, ArgumentPool, JobArgument, PooledArgument, Provisioning};
use crate::manager::{TaskManager, TaskMeta};
use crate::types::{FabricError, FabricResult};
use crate::wrapper::{ErasedJob, ExecuteVerdict};

/// Where a leased argument goes when the execution releases it.
enum LeaseReturn {
    ToPool,
    Discard,
}

struct ArgumentLease<A> {
    slot: PooledArgument<A>,
    ret: LeaseReturn,
}

enum ProvisionState<A> {
    Fixed {
        pool: ArgumentPool<A>,
    },
    Pooled {
        factory: Arc<dyn ArgumentFactory<A>>,
        pool: ArgumentPool<A>,
    },
    OneTime {
        factory: Arc<dyn ArgumentFactory<A>>,
    },
}

pub(crate) struct ArgumentProcessor<A: JobArgument> {
    inner: Arc<ProcessorInner<A>>,
}

impl<A: JobArgument> Clone for ArgumentProcessor<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ProcessorInner<A: JobArgument> {
    manager: Arc<TaskManager<A>>,
    semaphore: Arc<Semaphore>,
    provision: ProvisionState<A>,
    bound: usize,
    in_flight: AtomicUsize,
}

impl<A: JobArgument> ArgumentProcessor<A> {
    /// Build a processor for the given provisioning mode.
    ///
    /// For a fixed argument set the parallelism bound is the set size and
    /// an empty set is rejected at construction; for pooled and one-time
    /// modes the bound is `max_simultaneous`.
    pub(crate) fn new(
        manager: Arc<TaskManager<A>>,
        provisioning: Provisioning<A>,
        max_simultaneous: usize,
    ) -> FabricResult<Self> {
        let (provision, bound) = match provisioning {
            Provisioning::Fixed(arguments) => {
                if arguments.is_empty() {
                    return Err(FabricError::EmptyArgumentSet);
                }
                let bound = arguments.len();
                (
                    ProvisionState::Fixed {
                        pool: ArgumentPool::new(arguments),
                    },
                    bound,
                )
            }
            Provisioning::Pooled(factory) => {
                if max_simultaneous == 0 {
                    return Err(FabricError::InvalidConfig("max_simultaneous must be at least 1"));
                }
                (
                    ProvisionState::Pooled {
                        factory,
                        pool: ArgumentPool::new(Vec::new()),
                    },
                    max_simultaneous,
                )
            }
            Provisioning::OneTime(factory) => {
                if max_simultaneous == 0 {
                    return Err(FabricError::InvalidConfig("max_simultaneous must be at least 1"));
                }
                (ProvisionState::OneTime { factory }, max_simultaneous)
            }
        };

        Ok(Self {
            inner: Arc::new(ProcessorInner {
                manager,
                semaphore: Arc::new(Semaphore::new(bound)),
                provision,
                bound,
                in_flight: AtomicUsize::new(0),
            }),
        })
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn bound(&self) -> usize {
        self.inner.bound
    }

    /// Drain the manager until it is empty or shutdown fires.
    ///
    /// Executions are spawned onto `tracker` so the worker can wait for
    /// in-flight jobs at shutdown. Returns once every currently pending
    /// job has been handed off; reverted jobs re-signal the manager and
    /// the worker calls back in.
    pub(crate) async fn drain(&self, tracker: &TaskTracker, shutdown: &CancellationToken) {
        while self.inner.manager.has_task() && !shutdown.is_cancelled() {
            let permit = tokio::select! {
                permit = Arc::clone(&self.inner.semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    }
                }
                _ = shutdown.cancelled() => return,
            };

            let Some((job, meta)) = self.inner.manager.take() else {
                continue;
            };

            let lease = match self.inner.acquire_argument().await {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(
                        job_id = %job.id(),
                        error = %err,
                        "argument acquisition failed, reverting job"
                    );
                    self.inner.manager.revert(job, meta);
                    drop(permit);
                    // A factory that keeps failing would otherwise spin
                    // against the reverted job.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let inner = Arc::clone(&self.inner);
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                inner.run_one(job, meta, lease, permit, shutdown).await;
            });
        }
    }
}

impl<A: JobArgument> ProcessorInner<A> {
    async fn acquire_argument(&self) -> anyhow::Result<ArgumentLease<A>> {
        match &self.provision {
            ProvisionState::Fixed { pool } => {
                // The semaphore size equals the pool size, so a permit
                // implies an available argument.
                let slot = pool
                    .acquire()
                    .ok_or_else(|| anyhow::anyhow!("fixed argument pool exhausted"))?;
                Ok(ArgumentLease {
                    slot,
                    ret: LeaseReturn::ToPool,
                })
            }
            ProvisionState::Pooled { factory, pool } => {
                let slot = match pool.acquire() {
                    Some(slot) => slot,
                    None => PooledArgument::new(factory.create().await?),
                };
                Ok(ArgumentLease {
                    slot,
                    ret: LeaseReturn::ToPool,
                })
            }
            ProvisionState::OneTime { factory } => Ok(ArgumentLease {
                slot: PooledArgument::new(factory.create().await?),
                ret: LeaseReturn::Discard,
            }),
        }
    }

    fn release(&self, lease: ArgumentLease<A>) {
        if let LeaseReturn::ToPool = lease.ret {
            match &self.provision {
                ProvisionState::Fixed { pool } => pool.release(lease.slot),
                ProvisionState::Pooled { pool, .. } => pool.release(lease.slot),
                ProvisionState::OneTime { .. } => {}
            }
        }
    }

    /// One job against one leased argument, start to finish.
    async fn run_one(
        &self,
        mut job: Box<dyn ErasedJob<A>>,
        meta: TaskMeta,
        mut lease: ArgumentLease<A>,
        permit: OwnedSemaphorePermit,
        shutdown: CancellationToken,
    ) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let caps = lease.slot.value.capabilities();

        if caps.activatable && !lease.slot.active {
            match lease.slot.value.activate().await {
                Ok(()) => lease.slot.active = true,
                Err(err) => {
                    warn!(
                        job_id = %job.id(),
                        error = %err,
                        "argument activation failed, reverting job"
                    );
                    self.manager.revert(job, meta);
                    self.release(lease);
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                    return;
                }
            }
        }

        match job.execute(&mut lease.slot.value).await {
            ExecuteVerdict::Settled => {}
            ExecuteVerdict::Revert => self.manager.revert(job, meta),
        }

        if caps.throttleable && self.manager.has_task() {
            let pause = lease.slot.value.throttle_interval();
            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }

        let deactivate = caps.activatable
            && lease.slot.active
            && match lease.ret {
                LeaseReturn::Discard => true,
                LeaseReturn::ToPool => !self.manager.has_task(),
            };
        if deactivate {
            if let Err(err) = lease.slot.value.deactivate().await {
                warn!(error = %err, "argument deactivation failed");
            }
            lease.slot.active = false;
        }

        self.release(lease);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    }
}
