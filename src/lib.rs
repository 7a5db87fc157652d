//! Workfabric - Embedded Background Execution Fabric
//!
//! In-process background execution for a long-running host application:
//! priority work queues, shared-resource access queues, data conveyors,
//! and a time-based work scheduler with delay, absolute-time, cron and
//! fixed-period repeat plans. The fabric owns no durable state and
//! persists nothing; it is wired into the host's lifecycle through
//! cancellation scopes.
//!
//! ## Key Components
//!
//! - **WorkQueue / AccessQueue / Conveyor**: user-facing queues pairing
//!   submitted units with argument instances under a concurrency bound
//! - **WorkScheduler**: fires queued or direct work at programmed
//!   instants, with per-record promises or cold outcome streams
//! - **StartupRunner**: ordered one-shot works executed before serving
//! - **Host**: builder wiring queues, scheduler and startup works under
//!   one root shutdown scope, with a typed registry for embedding code
//!
//! ## Execution Flow
//!
//! ```text
//! registration -> wrapper -> manager -> processor -> argument -> callable
//!                                                        |
//!                      scheduler -> (direct) wrapper or (queued) manager
//! ```
//!
//! Every submission resolves a [`JobHandle`] settling exactly once as
//! [`Outcome::Completed`], [`Outcome::Failed`] (after the configured
//! attempts) or [`Outcome::Cancelled`]. Repeating schedules resolve an
//! [`OutcomeStream`] with one outcome per firing.

pub mod access;
pub mod argument;
pub mod conveyor;
pub mod host;
mod manager;
mod processor;
mod queue;
pub mod scheduler;
pub mod startup;
pub mod types;
mod util;
pub mod work;
mod worker;
mod wrapper;

pub use access::{Access, AccessQueue, QueuedAccess};
pub use argument::{factory_fn, ArgumentFactory, Capabilities, JobArgument, Provisioning};
pub use conveyor::{Conveyor, ConveyorMachine};
pub use host::{Host, HostConfig, HostContext, HostRuntime, ServiceRegistration};
pub use scheduler::{DirectWork, ExecCount, OutcomeStream, ScheduleTarget, WorkScheduler};
pub use startup::StartupRunner;
pub use types::{
    EnqueueOptions, FabricError, FabricResult, JobContext, JobId, Outcome, QueueConfig,
    QueueStats, SchedulerStats,
};
pub use work::{QueuedWork, Work, WorkQueue};
pub use wrapper::JobHandle;

/// Version of the fabric crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
