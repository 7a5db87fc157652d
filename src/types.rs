//! Core type definitions for the execution fabric.
//!
//! This module defines the data structures shared across the queueing and
//! scheduling subsystems: job identifiers and contexts, settled outcomes,
//! enqueue options, configuration, statistics snapshots, and the error
//! taxonomy raised by the library itself.
//!
//! Failures of user-supplied callables are *not* represented here; they
//! travel as [`anyhow::Error`] payloads inside [`Outcome::Failed`]. The
//! [`FabricError`] enum covers only the library's own validation, lookup
//! and infrastructure failures.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for jobs in the execution fabric.
pub type JobId = Uuid;

/// Final state of a job's promise.
///
/// A promise settles exactly once, with exactly one of these variants.
/// Cancellation is its own state, distinct from failure: a cancelled job
/// did not fail, it was withdrawn.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The callable returned a value (after one or more attempts).
    Completed(T),
    /// Every configured attempt failed; this is the last error observed.
    Failed(anyhow::Error),
    /// Cancellation was observed before or during execution.
    Cancelled,
}

impl<T> Outcome<T> {
    /// True when the job produced a value.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// True when the job exhausted its attempts.
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// True when the job was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Extract the completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Extract the final error, if any.
    pub fn failed(self) -> Option<anyhow::Error> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Execution context handed to every callable invocation.
///
/// Carries the identity and retry position of the current attempt. The
/// attempt counter is 1-based, so `attempt == 1` is the first invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Identifier of the job being executed.
    pub job_id: JobId,
    /// 1-based number of the current attempt.
    pub attempt: u32,
    /// Attempts remaining after this one, including none.
    pub attempts_left: u32,
    /// Priority slot the job was taken from.
    pub priority: u32,
}

/// Per-enqueue knobs for queue submissions.
///
/// `attempts == 0` is coerced to 1 and anything above the queue's
/// `max_attempts` is capped; `priority` outside the queue's configured
/// range is rejected with [`FabricError::BadPriority`]. A supplied
/// cancellation token is linked into (not substituted for) the job's own
/// token, which itself is a child of the queue's shutdown scope.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority slot, `0..=max_priority`. Higher runs first.
    pub priority: u32,
    /// Requested attempt count; coerced into `[1, max_attempts]`.
    pub attempts: u32,
    /// Optional caller-owned cancellation handle.
    pub cancel: Option<CancellationToken>,
}

impl EnqueueOptions {
    /// Options with a specific priority and defaults elsewhere.
    pub fn priority(priority: u32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Options with a specific attempt count and defaults elsewhere.
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// Set the priority slot.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the requested attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Link a caller-owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Configuration for a work, access or conveyor queue.
///
/// # Examples
/// ```rust
/// use workfabric::QueueConfig;
///
/// let config = QueueConfig {
///     max_simultaneous: 4, // up to four callables in flight
///     max_priority: 2,     // priority slots 0, 1 and 2
///     max_attempts: 3,     // per-job attempts are capped at three
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Parallelism bound of the queue's processor.
    ///
    /// For pooled and one-time provisioning this is the semaphore size;
    /// for a fixed argument set the pool size itself is the bound.
    pub max_simultaneous: usize,

    /// Highest accepted priority slot. Zero means a plain FIFO queue.
    pub max_priority: u32,

    /// Upper bound on per-job attempt counts.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_simultaneous: 1,
            max_priority: 0,
            max_attempts: 3,
        }
    }
}

impl QueueConfig {
    /// Reject configurations the processor cannot honor.
    pub fn validate(&self) -> FabricResult<()> {
        if self.max_simultaneous == 0 {
            return Err(FabricError::InvalidConfig("max_simultaneous must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(FabricError::InvalidConfig("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Point-in-time statistics for a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting in the manager's priority slots.
    pub pending_tasks: usize,
    /// Jobs currently executing against an argument.
    pub in_flight_tasks: usize,
    /// Parallelism bound of the processor.
    pub max_simultaneous: usize,
}

/// Point-in-time statistics for the work scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Records waiting for their next due time.
    pub scheduled_records: usize,
}

/// Error kinds raised by the fabric itself.
///
/// Validation errors surface synchronously from the entry call; they are
/// never deferred onto a promise. Failures of user callables are not
/// errors of this type, they settle the job's promise as
/// [`Outcome::Failed`] once attempts are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// Enqueue priority outside the queue's configured slot range.
    #[error("priority {priority} out of range 0..={max}")]
    BadPriority {
        /// The rejected priority.
        priority: u32,
        /// The queue's highest accepted slot.
        max: u32,
    },

    /// A schedule delay or repeat interval that is not positive.
    #[error("schedule delay must be positive")]
    BadDelay,

    /// An absolute schedule time that is not in the future.
    #[error("schedule time must be in the future")]
    BadTime,

    /// A cron expression the parser rejected.
    #[error("invalid cron expression: {0}")]
    BadCron(String),

    /// A fixed provisioning mode constructed with no arguments.
    #[error("static argument set is empty")]
    EmptyArgumentSet,

    /// A configuration value the processor cannot honor.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A typed lookup on a host context that was never registered.
    #[error("no {0} registered for this host")]
    NoServiceRegistered(&'static str),

    /// A second registration for a type the host already carries.
    #[error("{0} already registered for this host")]
    DuplicateRegistration(&'static str),

    /// Submission after the owning scope was cancelled.
    #[error("the owning scope has shut down")]
    Shutdown,

    /// A startup work marked critical failed.
    #[error("critical startup work {name} failed")]
    Startup {
        /// Registration name of the failed work.
        name: String,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// Unexpected internal failure, such as a panicked service task.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_accessors() {
        let ok: Outcome<u32> = Outcome::Completed(7);
        assert!(ok.is_completed());
        assert_eq!(ok.completed(), Some(7));

        let failed: Outcome<u32> = Outcome::Failed(anyhow::anyhow!("boom"));
        assert!(failed.is_failed());
        assert_eq!(failed.failed().map(|e| e.to_string()), Some("boom".to_string()));

        let cancelled: Outcome<u32> = Outcome::Cancelled;
        assert!(cancelled.is_cancelled());
        assert!(cancelled.completed().is_none());
    }

    #[test]
    fn default_queue_config_is_valid() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let config = QueueConfig {
            max_simultaneous: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(config.validate(), Err(FabricError::InvalidConfig(_))));

        let config = QueueConfig {
            max_attempts: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(config.validate(), Err(FabricError::InvalidConfig(_))));
    }
}
