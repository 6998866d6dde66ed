use thiserror::Error;

/// Errors returned by a [`Selector`](crate::Selector).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// The registry knows no instances of the service.
    #[error("service {0} not found")]
    NotFound(String),

    /// Instances exist but none passed filtering and health checks.
    #[error("no available nodes for service {0}")]
    NoneAvailable(String),

    /// The registry could not be queried.
    #[error("registry error: {0}")]
    Registry(String),
}
