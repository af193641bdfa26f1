//! Per-user container fleet: lifecycle orchestration, caching and reclamation.

mod cache;
mod cleanup;
mod error;
mod manager;
mod models;

pub use cache::{ContainerCache, InMemoryContainerCache};
pub use cleanup::{CleanupConfig, CleanupManager, CleanupReport};
pub use error::{LifecycleError, LifecycleResult};
pub use manager::LifecycleManager;
pub use models::{ContainerInfo, ExecHandle, FleetConfig, RestoreReport, UserConfig};
