use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::access::AccessQueue;
use crate::argument::{JobArgument, Provisioning};
use crate::conveyor::{Conveyor, ConveyorMachine};
use crate::host::config::HostConfig;
use crate::host::context::{HostContext, Registry};
use crate::host::service::ServiceRegistration;
use crate::scheduler::WorkScheduler;
use crate::startup::StartupRunner;
use crate::types::{FabricError, FabricResult, QueueConfig};
use crate::work::WorkQueue;

/// Builder for an embedded fabric host.
///
/// Queues and the scheduler are constructed up front (so handles can be
/// shared before start), but their workers only run once
/// [`start`](Self::start) has completed the startup list.
pub struct Host {
    config: HostConfig,
    root: CancellationToken,
    registry: Registry,
    services: Vec<ServiceRegistration>,
    startup: StartupRunner,
}

impl Host {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            root: CancellationToken::new(),
            registry: Registry::new(),
            services: Vec::new(),
            startup: StartupRunner::new(),
        }
    }

    /// The host's root shutdown token. Custom services should run under
    /// a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Add a work queue, register its handle, and return it.
    pub fn add_work_queue(&mut self, config: QueueConfig) -> FabricResult<WorkQueue> {
        let (queue, worker) = WorkQueue::build(config, self.root.child_token())?;
        self.register_handle("work queue", queue.clone())?;
        let scope = queue.scope();
        self.services.push(ServiceRegistration::new(
            "work-queue",
            move || worker.spawn(scope),
        ));
        Ok(queue)
    }

    /// Add an access queue over `R`, register its handle, and return it.
    pub fn add_access_queue<R: JobArgument>(
        &mut self,
        config: QueueConfig,
        provisioning: Provisioning<R>,
    ) -> FabricResult<AccessQueue<R>> {
        let (queue, worker) =
            AccessQueue::build(config, provisioning, self.root.child_token())?;
        self.register_handle("access queue", queue.clone())?;
        let scope = queue.scope();
        self.services.push(ServiceRegistration::new(
            "access-queue",
            move || worker.spawn(scope),
        ));
        Ok(queue)
    }

    /// Add a conveyor over `D` and `M`, register its handle, and return
    /// it.
    pub fn add_conveyor<D, M>(
        &mut self,
        config: QueueConfig,
        provisioning: Provisioning<M>,
    ) -> FabricResult<Conveyor<D, M>>
    where
        D: Clone + Send + Sync + 'static,
        M: ConveyorMachine<D>,
    {
        let (conveyor, worker) =
            Conveyor::build(config, provisioning, self.root.child_token())?;
        self.register_handle("conveyor", conveyor.clone())?;
        let scope = conveyor.scope();
        self.services.push(ServiceRegistration::new(
            "conveyor",
            move || worker.spawn(scope),
        ));
        Ok(conveyor)
    }

    /// Add the work scheduler, register its handle, and return it.
    pub fn add_scheduler(&mut self) -> FabricResult<WorkScheduler> {
        let scheduler = WorkScheduler::build(self.root.child_token());
        self.register_handle("work scheduler", scheduler.clone())?;
        let loop_scheduler = scheduler.clone();
        self.services.push(ServiceRegistration::new(
            "work-scheduler",
            move || loop_scheduler.spawn_loop(),
        ));
        Ok(scheduler)
    }

    /// Register a custom background service.
    pub fn register_service(&mut self, registration: ServiceRegistration) {
        self.services.push(registration);
    }

    /// Register a non-critical startup work.
    pub fn register_startup<N, F, Fut>(&mut self, name: N, work: F)
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.startup.register(name, work);
    }

    /// Register a startup work whose failure aborts the boot.
    pub fn register_critical_startup<N, F, Fut>(&mut self, name: N, work: F)
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.startup.register_critical(name, work);
    }

    /// Run the startup list, then spawn every service. The host is
    /// serving once this returns.
    pub async fn start(self) -> FabricResult<HostRuntime> {
        initialize_logging(&self.config);
        info!(host = %self.config.metadata.name, "host boot starting");

        self.startup.run().await?;

        let context = HostContext::new(self.config, self.registry, self.root.child_token());
        let mut tasks = Vec::new();
        for service in self.services {
            tasks.push(service.spawn());
        }

        info!("host boot completed");
        Ok(HostRuntime {
            context,
            cancel_token: self.root,
            tasks,
        })
    }

    fn register_handle<T>(&mut self, kind: &'static str, value: T) -> FabricResult<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.registry.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(FabricError::DuplicateRegistration(kind)),
            Entry::Vacant(slot) => {
                slot.insert(Box::new(value));
                Ok(())
            }
        }
    }
}

/// A started host: the context for embedding code plus the handles of
/// every spawned service.
#[derive(Debug)]
pub struct HostRuntime {
    context: HostContext,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl HostRuntime {
    pub fn context(&self) -> HostContext {
        self.context.clone()
    }

    /// Cancel the root scope and wait for every service. Pending jobs
    /// settle cancelled; in-flight jobs are awaited by their workers.
    pub async fn shutdown(self) -> FabricResult<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => info!(service = %name, "service shutdown cleanly"),
                Err(err) => {
                    error!(service = %name, error = %err, "service task failed");
                    return Err(FabricError::Internal(format!(
                        "service {name} failed during shutdown: {err}"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn initialize_logging(config: &HostConfig) {
    let filter = &config.observability.log_level;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter.as_str())
        .try_init();
}
