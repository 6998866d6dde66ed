//! Error types for the in-memory registry.

use thiserror::Error;
use waypoint_registry::{RegistryError, RegistryErrorKind};

/// Error type for the in-memory registry.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// No instances registered for the service.
    #[error("service '{0}' not found")]
    NotFound(String),

    /// The instance is missing a name or address.
    #[error("invalid instance: {0}")]
    InvalidInstance(String),
}

impl RegistryError for Error {
    fn kind(&self) -> RegistryErrorKind {
        match self {
            Self::NotFound(_) => RegistryErrorKind::NotFound,
            Self::InvalidInstance(_) => RegistryErrorKind::Invalid,
        }
    }
}
