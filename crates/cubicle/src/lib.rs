//! Cubicle: per-user sandbox container fleet manager.
//!
//! Provisions, tracks and reclaims one isolated container per user. Callers
//! need two operations: [`fleet::LifecycleManager::get_or_create_container`]
//! and [`fleet::LifecycleManager::exec_in_container`].

pub mod container;
pub mod db;
pub mod fleet;
pub mod registry;
pub mod settings;
