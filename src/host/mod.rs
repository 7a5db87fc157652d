//! Host wiring: configuration, the builder/runtime pair, the typed
//! service registry, and named background services.

pub mod config;
pub mod context;
pub mod runtime;
pub mod service;

pub use config::{HostConfig, MetadataSettings, ObservabilitySettings};
pub use context::HostContext;
pub use runtime::{Host, HostRuntime};
pub use service::ServiceRegistration;
