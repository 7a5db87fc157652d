//! Priority FIFO task manager.
//!
//! Holds pending job wrappers in one FIFO per priority slot and signals a
//! single draining consumer when work arrives. Many producers may enqueue
//! concurrently; exactly one processor takes. A manager built with
//! `max_priority == 0` degenerates into the plain non-priority FIFO.
//!
//! Ordering contract: `take` returns the wrapper at the head of the
//! highest non-empty slot; within a slot, insertion order. Wrappers whose
//! cancellation settled before they were taken are silently dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{FabricError, FabricResult};
use crate::util;
use crate::wrapper::ErasedJob;

/// Metadata travelling with a taken job so a revert lands back in the
/// job's original slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskMeta {
    pub priority: u32,
}

pub(crate) struct TaskManager<A: Send> {
    slots: Mutex<Vec<VecDeque<Box<dyn ErasedJob<A>>>>>,
    notify: Notify,
    pending: AtomicUsize,
    max_priority: u32,
}

impl<A: Send + 'static> TaskManager<A> {
    pub(crate) fn new(max_priority: u32) -> Self {
        let slots = (0..=max_priority).map(|_| VecDeque::new()).collect();
        Self {
            slots: Mutex::new(slots),
            notify: Notify::new(),
            pending: AtomicUsize::new(0),
            max_priority,
        }
    }

    pub(crate) fn max_priority(&self) -> u32 {
        self.max_priority
    }

    /// Insert at the tail of the slot for `priority` and signal the
    /// consumer.
    pub(crate) fn enqueue(
        &self,
        job: Box<dyn ErasedJob<A>>,
        priority: u32,
    ) -> FabricResult<()> {
        if priority > self.max_priority {
            return Err(FabricError::BadPriority {
                priority,
                max: self.max_priority,
            });
        }
        {
            let mut slots = util::lock(&self.slots);
            slots[priority as usize].push_back(job);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) fn has_task(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Take the next live wrapper, highest priority first.
    ///
    /// Wrappers found already cancelled are settled cancelled and
    /// dropped without being returned; they do not count as attempts.
    pub(crate) fn take(&self) -> Option<(Box<dyn ErasedJob<A>>, TaskMeta)> {
        let mut slots = util::lock(&self.slots);
        for priority in (0..slots.len()).rev() {
            while let Some(mut job) = slots[priority].pop_front() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                if job.is_cancelled() {
                    debug!(job_id = %job.id(), "dropping cancelled job at take");
                    job.settle_cancelled();
                    continue;
                }
                return Some((
                    job,
                    TaskMeta {
                        priority: priority as u32,
                    },
                ));
            }
        }
        None
    }

    /// Re-insert a reverted wrapper at the tail of its original slot.
    pub(crate) fn revert(&self, job: Box<dyn ErasedJob<A>>, meta: TaskMeta) {
        {
            let mut slots = util::lock(&self.slots);
            slots[meta.priority as usize].push_back(job);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wait until a task is available or `cancel` fires.
    ///
    /// Returns `true` when work is available, `false` on cancellation.
    pub(crate) async fn wait_for_task(&self, cancel: &CancellationToken) -> bool {
        loop {
            // The notified future is created before the emptiness check so
            // a signal between check and await is not lost.
            let notified = self.notify.notified();
            if self.has_task() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Drain every pending wrapper and settle it cancelled. Used at
    /// shutdown.
    pub(crate) fn cancel_pending(&self) {
        let mut slots = util::lock(&self.slots);
        for slot in slots.iter_mut() {
            while let Some(mut job) = slot.pop_front() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                job.settle_cancelled();
            }
        }
    }
}
