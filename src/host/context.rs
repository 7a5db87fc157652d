use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::access::AccessQueue;
use crate::argument::JobArgument;
use crate::conveyor::{Conveyor, ConveyorMachine};
use crate::host::config::HostConfig;
use crate::scheduler::WorkScheduler;
use crate::types::{FabricError, FabricResult};
use crate::work::WorkQueue;

pub(crate) type Registry = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Resolver handed to embedding code: typed lookups of the queues and
/// scheduler the host registered, plus the shutdown token. The registry
/// is frozen at host start; lookups never lock.
#[derive(Clone)]
pub struct HostContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("config", &self.shared.config)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

struct SharedState {
    config: HostConfig,
    registry: Registry,
}

impl HostContext {
    pub(crate) fn new(
        config: HostConfig,
        registry: Registry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(SharedState { config, registry }),
            shutdown,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The host's work queue, if one was registered.
    pub fn work_queue(&self) -> FabricResult<WorkQueue> {
        self.lookup::<WorkQueue>("work queue")
    }

    /// The host's access queue over `R`, if one was registered.
    pub fn access_queue<R: JobArgument>(&self) -> FabricResult<AccessQueue<R>> {
        self.lookup::<AccessQueue<R>>("access queue")
    }

    /// The host's conveyor over `D` and `M`, if one was registered.
    pub fn conveyor<D, M>(&self) -> FabricResult<Conveyor<D, M>>
    where
        D: Clone + Send + Sync + 'static,
        M: ConveyorMachine<D>,
    {
        self.lookup::<Conveyor<D, M>>("conveyor")
    }

    /// The host's work scheduler, if one was registered.
    pub fn scheduler(&self) -> FabricResult<WorkScheduler> {
        self.lookup::<WorkScheduler>("work scheduler")
    }

    fn lookup<T: Clone + 'static>(&self, kind: &'static str) -> FabricResult<T> {
        self.shared
            .registry
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<T>())
            .cloned()
            .ok_or(FabricError::NoServiceRegistered(kind))
    }
}
