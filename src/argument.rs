//! Argument types, capabilities and provisioning.
//!
//! Every job executes against an *argument*: nothing for plain work (the
//! unit type), a shared resource for access queues, a conveyor machine
//! for conveyors. Capabilities are declared explicitly on the argument
//! type rather than probed at runtime: an activatable argument requires
//! `activate`/`deactivate` bracketing, a throttleable one imposes a
//! minimum pause between consecutive jobs.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::util;

/// Capability set declared by an argument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// The argument requires `activate` before use and `deactivate` when
    /// the processor releases it idle.
    pub activatable: bool,
    /// The argument imposes `throttle_interval` between consecutive jobs.
    pub throttleable: bool,
}

impl Capabilities {
    /// No capabilities; the processor uses the argument as-is.
    pub const NONE: Capabilities = Capabilities {
        activatable: false,
        throttleable: false,
    };

    /// Mark the set activatable.
    pub const fn activatable(mut self) -> Self {
        self.activatable = true;
        self
    }

    /// Mark the set throttleable.
    pub const fn throttleable(mut self) -> Self {
        self.throttleable = true;
        self
    }
}

/// A value jobs execute against.
///
/// The default implementation declares no capabilities and no-op
/// lifecycle hooks, so plain data types only need the marker impl:
///
/// ```rust
/// use workfabric::JobArgument;
///
/// struct Connection;
/// impl JobArgument for Connection {}
/// ```
///
/// Activatable arguments override [`capabilities`](Self::capabilities)
/// and the hooks; activation failures are logged and the affected job is
/// reverted without consuming an attempt.
#[async_trait]
pub trait JobArgument: Send + 'static {
    /// Capability set of this argument type.
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// Bring the argument into its usable state.
    async fn activate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Return the argument to its dormant state. Failures are logged,
    /// never raised.
    async fn deactivate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Minimum pause between consecutive jobs on this argument.
    fn throttle_interval(&self) -> Duration {
        Duration::ZERO
    }
}

#[async_trait]
impl JobArgument for () {}

/// Builds arguments on demand for pooled and one-time provisioning.
#[async_trait]
pub trait ArgumentFactory<A>: Send + Sync + 'static {
    /// Produce a fresh argument instance.
    async fn create(&self) -> anyhow::Result<A>;
}

struct FactoryFn<F>(F);

#[async_trait]
impl<A, F, Fut> ArgumentFactory<A> for FactoryFn<F>
where
    A: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<A>> + Send,
{
    async fn create(&self) -> anyhow::Result<A> {
        (self.0)().await
    }
}

/// Wrap an async closure as an [`ArgumentFactory`].
pub fn factory_fn<A, F, Fut>(f: F) -> Arc<dyn ArgumentFactory<A>>
where
    A: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<A>> + Send,
{
    Arc::new(FactoryFn(f))
}

/// How a processor obtains the arguments it binds jobs to.
///
/// Selecting a variant selects the reuse strategy:
/// - [`Fixed`](Provisioning::Fixed): a set built up front, recycled for
///   the processor's lifetime; the set size is the parallelism bound.
/// - [`Pooled`](Provisioning::Pooled): built lazily by the factory,
///   returned to a pool and reused, at most `max_simultaneous` alive.
/// - [`OneTime`](Provisioning::OneTime): a fresh argument per job,
///   discarded afterwards.
pub enum Provisioning<A> {
    /// Fixed set of pre-built arguments.
    Fixed(Vec<A>),
    /// Factory-backed reusable pool.
    Pooled(Arc<dyn ArgumentFactory<A>>),
    /// Factory-backed, one argument per job.
    OneTime(Arc<dyn ArgumentFactory<A>>),
}

impl<A: JobArgument> Provisioning<A> {
    /// A fixed set holding exactly one argument (serial execution).
    pub fn single(argument: A) -> Self {
        Self::Fixed(vec![argument])
    }

    /// A fixed set of pre-built arguments.
    pub fn fixed(arguments: Vec<A>) -> Self {
        Self::Fixed(arguments)
    }

    /// A reusable pool fed by an async closure.
    pub fn pooled_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send,
    {
        Self::Pooled(factory_fn(f))
    }

    /// One fresh argument per job, built by an async closure.
    pub fn one_time_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send,
    {
        Self::OneTime(factory_fn(f))
    }
}

/// An argument plus the activation state the processor tracks for it.
pub(crate) struct PooledArgument<A> {
    pub(crate) value: A,
    pub(crate) active: bool,
}

impl<A> PooledArgument<A> {
    pub(crate) fn new(value: A) -> Self {
        Self {
            value,
            active: false,
        }
    }
}

/// Take-any / return-any bag of arguments shared by a processor.
pub(crate) struct ArgumentPool<A> {
    slots: Mutex<Vec<PooledArgument<A>>>,
}

impl<A> ArgumentPool<A> {
    pub(crate) fn new(initial: Vec<A>) -> Self {
        Self {
            slots: Mutex::new(initial.into_iter().map(PooledArgument::new).collect()),
        }
    }

    pub(crate) fn acquire(&self) -> Option<PooledArgument<A>> {
        util::lock(&self.slots).pop()
    }

    pub(crate) fn release(&self, argument: PooledArgument<A>) {
        util::lock(&self.slots).push(argument);
    }
}
