//! Startup runner: ordered one-shot works executed before the host
//! starts serving.
//!
//! Works run sequentially in registration order, each awaited to
//! completion. Failures are logged and skipped unless the registration
//! was marked critical, in which case startup aborts.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{error, info};

use crate::types::{FabricError, FabricResult};

type StartupFuture = BoxFuture<'static, anyhow::Result<()>>;

struct StartupEntry {
    name: String,
    critical: bool,
    work: Box<dyn FnOnce() -> StartupFuture + Send>,
}

/// Ordered list of one-shot startup works.
///
/// # Examples
/// ```rust
/// # async fn example() -> workfabric::FabricResult<()> {
/// use workfabric::StartupRunner;
///
/// let mut runner = StartupRunner::new();
/// runner.register("warm caches", || async { Ok(()) });
/// runner.register_critical("migrate", || async { Ok(()) });
/// runner.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct StartupRunner {
    entries: Vec<StartupEntry>,
}

impl StartupRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a work whose failure is logged but does not abort
    /// startup.
    pub fn register<N, F, Fut>(&mut self, name: N, work: F)
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_entry(name.into(), false, work);
    }

    /// Register a work whose failure aborts startup.
    pub fn register_critical<N, F, Fut>(&mut self, name: N, work: F)
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_entry(name.into(), true, work);
    }

    fn register_entry<F, Fut>(&mut self, name: String, critical: bool, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries.push(StartupEntry {
            name,
            critical,
            work: Box::new(move || Box::pin(work())),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Run every registered work in order.
    pub async fn run(self) -> FabricResult<()> {
        for entry in self.entries {
            info!(work = %entry.name, "running startup work");
            match (entry.work)().await {
                Ok(()) => {}
                Err(err) if entry.critical => {
                    error!(work = %entry.name, error = %err, "critical startup work failed");
                    return Err(FabricError::Startup {
                        name: entry.name,
                        source: err,
                    });
                }
                Err(err) => {
                    error!(work = %entry.name, error = %err, "startup work failed, continuing");
                }
            }
        }
        Ok(())
    }
}
