//! Fleet error types.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::container::ContainerError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Provisioning failed; nothing was cached.
    #[error("failed to create container {container_name} for user {user_id}: {reason}")]
    Creation {
        user_id: String,
        container_name: String,
        reason: String,
    },

    /// The user has no known container.
    #[error("no container for user {user_id}")]
    NotFound { user_id: String },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Registry(#[from] anyhow::Error),

    #[error("failed to remove data directory {}: {source}", path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure of a provisioning task shared by several callers.
    #[error(transparent)]
    Shared(Arc<LifecycleError>),
}

impl LifecycleError {
    /// Unwrap a shared failure when this caller holds the only reference.
    pub(crate) fn from_shared(err: Arc<LifecycleError>) -> Self {
        match Arc::try_unwrap(err) {
            Ok(err) => err,
            Err(shared) => LifecycleError::Shared(shared),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            LifecycleError::NotFound { .. } => true,
            LifecycleError::Container(e) => e.is_not_found(),
            LifecycleError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// True for provisioning failures, shared or not.
    pub fn is_creation(&self) -> bool {
        match self {
            LifecycleError::Creation { .. } => true,
            LifecycleError::Shared(inner) => inner.is_creation(),
            _ => false,
        }
    }
}
