use tokio::task::JoinHandle;

/// A named background service the host spawns at start. The spawner is
/// pre-bound to its shutdown scope and runs exactly once.
pub struct ServiceRegistration {
    name: String,
    spawner: Box<dyn FnOnce() -> JoinHandle<()> + Send>,
}

impl ServiceRegistration {
    pub fn new<N, F>(name: N, spawner: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> JoinHandle<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            spawner: Box::new(spawner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn spawn(self) -> (String, JoinHandle<()>) {
        let handle = (self.spawner)();
        (self.name, handle)
    }
}
