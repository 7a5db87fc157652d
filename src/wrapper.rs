//! Job wrappers: a user callable paired with its attempts counter,
//! cancellation handle and single-settlement promise.
//!
//! The wrapper owns the retry arithmetic but not the retry *policy*: when
//! an attempt fails with attempts remaining, `execute` reports
//! [`ExecuteVerdict::Revert`] and the processor decides where the wrapper
//! goes back into its queue. That keeps the retry path uniform across
//! strategies and observable from one place.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::types::{JobContext, JobId, Outcome};

/// Internal form of every callable accepted by the fabric.
///
/// Adapters in `work`, `access` and `conveyor` collapse the public trait
/// shapes (async trait objects, synchronous closures) into this one, so
/// the wrapper and manager never see more than a single callable shape.
#[async_trait]
pub(crate) trait JobCall<A: Send, T>: Send + Sync {
    async fn call(
        &self,
        argument: &mut A,
        ctx: JobContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<T>;
}

/// What the processor must do with a wrapper after `execute` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecuteVerdict {
    /// The promise was settled (completed, finally failed, or cancelled).
    Settled,
    /// The attempt failed with attempts remaining; re-queue the wrapper.
    Revert,
}

/// Type-erased face of [`JobWrapper`] stored inside task managers.
#[async_trait]
pub(crate) trait ErasedJob<A: Send>: Send {
    fn id(&self) -> JobId;

    /// Whether cancellation has been observed on the job's token.
    fn is_cancelled(&self) -> bool;

    /// Settle the promise cancelled, if it is still unsettled.
    fn settle_cancelled(&mut self);

    /// Run one attempt against `argument`. See [`ExecuteVerdict`].
    async fn execute(&mut self, argument: &mut A) -> ExecuteVerdict;
}

/// Forwards cancellation from a caller-owned token into a job's own
/// token. Aborted when the wrapper settles so it never outlives the job.
struct CancelForward(JoinHandle<()>);

impl CancelForward {
    fn spawn(external: CancellationToken, job: CancellationToken) -> Self {
        Self(tokio::spawn(async move {
            external.cancelled().await;
            job.cancel();
        }))
    }
}

impl Drop for CancelForward {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A queued unit of work: callable, attempts budget, cancellation token
/// and the sending half of its outcome promise.
pub(crate) struct JobWrapper<A, T> {
    id: JobId,
    call: Arc<dyn JobCall<A, T>>,
    attempts_total: u32,
    attempts_left: u32,
    priority: u32,
    cancel: CancellationToken,
    promise: Option<async_channel::Sender<Outcome<T>>>,
    _forward: Option<CancelForward>,
}

impl<A, T> JobWrapper<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Build a wrapper and the handle observing its outcome.
    ///
    /// The job's token is a child of `scope`, so scope shutdown cancels
    /// the job; a caller-supplied `external` token is linked in through a
    /// forwarder rather than replacing the job's own token.
    pub(crate) fn new(
        call: Arc<dyn JobCall<A, T>>,
        attempts: u32,
        priority: u32,
        scope: &CancellationToken,
        external: Option<CancellationToken>,
    ) -> (Self, JobHandle<T>) {
        let id = Uuid::new_v4();
        let token = scope.child_token();
        let forward = external.map(|ext| CancelForward::spawn(ext, token.clone()));
        let (tx, rx) = async_channel::bounded(1);

        let wrapper = Self {
            id,
            call,
            attempts_total: attempts.max(1),
            attempts_left: attempts.max(1),
            priority,
            cancel: token.clone(),
            promise: Some(tx),
            _forward: forward,
        };
        let handle = JobHandle {
            id,
            rx,
            cancel: token,
        };
        (wrapper, handle)
    }

    fn settle(&mut self, outcome: Outcome<T>) {
        if let Some(tx) = self.promise.take() {
            // The channel is bounded(1) and this is the only sender, so
            // the send cannot fail for capacity; a dropped receiver is a
            // caller that stopped listening and is ignored.
            let _ = tx.try_send(outcome);
        }
        self._forward = None;
    }
}

#[async_trait]
impl<A, T> ErasedJob<A> for JobWrapper<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    fn id(&self) -> JobId {
        self.id
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn settle_cancelled(&mut self) {
        self.settle(Outcome::Cancelled);
    }

    async fn execute(&mut self, argument: &mut A) -> ExecuteVerdict {
        if self.cancel.is_cancelled() {
            self.settle(Outcome::Cancelled);
            return ExecuteVerdict::Settled;
        }

        let ctx = JobContext {
            job_id: self.id,
            attempt: self.attempts_total - self.attempts_left + 1,
            attempts_left: self.attempts_left.saturating_sub(1),
            priority: self.priority,
        };
        let result = self
            .call
            .call(argument, ctx, self.cancel.clone())
            .await;

        // Cancellation observed mid-execution wins over whatever the
        // callable returned.
        if self.cancel.is_cancelled() {
            self.settle(Outcome::Cancelled);
            return ExecuteVerdict::Settled;
        }

        match result {
            Ok(value) => {
                self.settle(Outcome::Completed(value));
                ExecuteVerdict::Settled
            }
            Err(err) => {
                self.attempts_left -= 1;
                if self.attempts_left == 0 {
                    self.settle(Outcome::Failed(err));
                    ExecuteVerdict::Settled
                } else {
                    warn!(
                        job_id = %self.id,
                        attempts_left = self.attempts_left,
                        error = %err,
                        "job attempt failed, reverting for retry"
                    );
                    ExecuteVerdict::Revert
                }
            }
        }
    }
}

/// Caller-side handle to a submitted job.
///
/// Resolves to exactly one [`Outcome`]. Cancelling through the handle
/// cancels the job's own token; if the job is still queued it is dropped
/// on the next take, and if it is mid-execution the cancellation is
/// propagated into the callable.
///
/// # Examples
/// ```rust,no_run
/// # async fn example(handle: workfabric::JobHandle<u64>) {
/// match handle.outcome().await {
///     workfabric::Outcome::Completed(value) => println!("done: {value}"),
///     workfabric::Outcome::Failed(err) => println!("failed: {err}"),
///     workfabric::Outcome::Cancelled => println!("cancelled"),
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct JobHandle<T> {
    id: JobId,
    rx: async_channel::Receiver<Outcome<T>>,
    cancel: CancellationToken,
}

impl<T> JobHandle<T> {
    pub(crate) fn from_parts(
        id: JobId,
        rx: async_channel::Receiver<Outcome<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, rx, cancel }
    }

    /// Identifier of the underlying job.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cancellation of the job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the job's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the job's single settled outcome.
    ///
    /// A settled value already in the channel wins over a concurrently
    /// observed cancellation.
    pub async fn outcome(self) -> Outcome<T> {
        tokio::select! {
            biased;
            settled = self.rx.recv() => settled.unwrap_or(Outcome::Cancelled),
            _ = self.cancel.cancelled() => Outcome::Cancelled,
        }
    }
}
