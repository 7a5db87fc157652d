//! Shared internals of the user-facing queue handles.
//!
//! A queue core owns the manager, the processor and the worker's join
//! handle, plus the queue's shutdown scope. The public handles
//! (`WorkQueue`, `AccessQueue`, `Conveyor`) are thin typed facades over
//! an `Arc` of this core.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::argument::{JobArgument, Provisioning};
use crate::manager::TaskManager;
use crate::processor::ArgumentProcessor;
use crate::types::{EnqueueOptions, FabricError, FabricResult, QueueConfig, QueueStats};
use crate::util;
use crate::worker::TaskWorker;
use crate::wrapper::{JobCall, JobHandle, JobWrapper};

pub(crate) struct QueueCore<A: JobArgument> {
    manager: Arc<TaskManager<A>>,
    processor: ArgumentProcessor<A>,
    config: QueueConfig,
    scope: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<A: JobArgument> QueueCore<A> {
    /// Validate the configuration and build the manager, processor and
    /// (not yet spawned) worker.
    pub(crate) fn assemble(
        config: QueueConfig,
        provisioning: Provisioning<A>,
        scope: CancellationToken,
    ) -> FabricResult<(Arc<Self>, TaskWorker<A>)> {
        config.validate()?;
        let manager = Arc::new(TaskManager::new(config.max_priority));
        let processor = ArgumentProcessor::new(
            Arc::clone(&manager),
            provisioning,
            config.max_simultaneous,
        )?;
        let worker = TaskWorker::new(Arc::clone(&manager), processor.clone());
        let core = Arc::new(Self {
            manager,
            processor,
            config,
            scope,
            worker: Mutex::new(None),
        });
        Ok((core, worker))
    }

    /// Spawn the worker under this queue's scope and keep its handle for
    /// `shutdown`. Used by the standalone constructors; host-managed
    /// queues hand the worker to the runtime instead.
    pub(crate) fn spawn_worker(self: &Arc<Self>, worker: TaskWorker<A>) {
        let handle = worker.spawn(self.scope.clone());
        *util::lock(&self.worker) = Some(handle);
    }

    pub(crate) fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub(crate) fn submit<T: Send + 'static>(
        &self,
        call: Arc<dyn JobCall<A, T>>,
        options: EnqueueOptions,
    ) -> FabricResult<JobHandle<T>> {
        if self.scope.is_cancelled() {
            return Err(FabricError::Shutdown);
        }
        if options.priority > self.manager.max_priority() {
            return Err(FabricError::BadPriority {
                priority: options.priority,
                max: self.manager.max_priority(),
            });
        }
        let attempts = util::clamp_attempts(options.attempts, self.config.max_attempts);
        let (wrapper, handle) =
            JobWrapper::new(call, attempts, options.priority, &self.scope, options.cancel);
        self.manager.enqueue(Box::new(wrapper), options.priority)?;
        Ok(handle)
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            pending_tasks: self.manager.pending_count(),
            in_flight_tasks: self.processor.in_flight(),
            max_simultaneous: self.processor.bound(),
        }
    }

    /// Cancel the queue's scope and wait for a self-spawned worker.
    pub(crate) async fn shutdown(&self) {
        self.scope.cancel();
        let handle = util::lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
