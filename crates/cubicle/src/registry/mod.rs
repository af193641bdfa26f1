//! Persistent user ↔ container ownership registry.

mod memory;
mod models;
mod repository;

pub use memory::InMemoryContainerRegistry;
pub use models::{ContainerRecord, RegistryStatus};
pub use repository::{ContainerRegistry, SqliteContainerRegistry, is_missing_table};
