//! Service discovery contract.
//!
//! This crate provides:
//! - The [`ServiceInstance`] snapshot type
//! - The [`Registry`] trait implemented by discovery backends
//! - Watch events used to invalidate cached selection state
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod event;
mod instance;

pub use error::{RegistryError, RegistryErrorKind};
pub use event::{RegistryAction, RegistryEvent, WatchOptions, Watcher};
pub use instance::ServiceInstance;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

/// Immutable set of instances for one service, as returned by a lookup.
pub type InstanceSet = Arc<[ServiceInstance]>;

/// A service discovery directory.
///
/// Implementations must be safe for concurrent use. `lookup` never succeeds
/// with an empty set: a service without instances is reported through an
/// error whose kind is [`RegistryErrorKind::NotFound`].
#[async_trait]
pub trait Registry
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the registry.
    type Error: RegistryError;

    /// Register an instance, replacing any instance with the same id.
    async fn register(&self, instance: ServiceInstance) -> Result<(), Self::Error>;

    /// Remove a previously registered instance.
    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), Self::Error>;

    /// Return every known instance of `service`.
    async fn lookup(&self, service: &str) -> Result<InstanceSet, Self::Error>;

    /// List the names of all services with at least one instance.
    async fn list_services(&self) -> Result<Vec<String>, Self::Error>;

    /// Subscribe to registry changes.
    async fn watch(&self, options: WatchOptions) -> Result<Watcher, Self::Error>;
}
