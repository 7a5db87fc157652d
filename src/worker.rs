//! Task worker: the host-lifecycle adapter that drives a processor.
//!
//! One worker per queue. The loop waits for the manager's new-task
//! signal, lets the processor drain, and repeats until the shutdown
//! token fires. On shutdown it settles every still-pending wrapper as
//! cancelled and waits for in-flight executions to finish before
//! returning, so a joined worker means a quiet queue.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::argument::JobArgument;
use crate::manager::TaskManager;
use crate::processor::ArgumentProcessor;

pub(crate) struct TaskWorker<A: JobArgument> {
    manager: Arc<TaskManager<A>>,
    processor: ArgumentProcessor<A>,
}

impl<A: JobArgument> TaskWorker<A> {
    pub(crate) fn new(manager: Arc<TaskManager<A>>, processor: ArgumentProcessor<A>) -> Self {
        Self { manager, processor }
    }

    pub(crate) fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        debug!("task worker started");
        let tracker = TaskTracker::new();

        loop {
            if !self.manager.wait_for_task(&shutdown).await {
                break;
            }
            self.processor.drain(&tracker, &shutdown).await;
        }

        // Settle pending wrappers cancelled, wait for in-flight jobs,
        // then sweep again for anything reverted during the wait.
        self.manager.cancel_pending();
        tracker.close();
        tracker.wait().await;
        self.manager.cancel_pending();
        debug!("task worker stopped");
    }
}
