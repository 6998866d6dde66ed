//! Node selection with health feedback.
//!
//! A [`Selector`] turns a service name into a [`NodeGenerator`] that yields
//! one node per call attempt, and receives the outcome of every attempt
//! through [`Selector::mark`] so that later selections can avoid failing
//! nodes.
//!
//! Selectors never retry on their own; orchestrating attempts is the
//! caller's job.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod health;
mod node;
mod options;
mod registry;
mod strategy;

pub use error::SelectorError;
pub use health::{HealthConfig, HealthTracker, NodeStats};
pub use node::NodeGenerator;
pub use options::{Filter, SelectOptions, Strategy};
pub use registry::{RegistrySelector, SelectorConfig};

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use waypoint_registry::ServiceInstance;

/// Picks nodes for a service and learns from call outcomes.
#[async_trait]
pub trait Selector: Debug + Send + Sync + 'static {
    /// Resolve `service` into a generator of candidate nodes.
    ///
    /// Fails with [`SelectorError::NotFound`] when the registry has no such
    /// service and with [`SelectorError::NoneAvailable`] when instances exist
    /// but filtering or health checks removed all of them.
    async fn select(
        &self,
        service: &str,
        options: &SelectOptions,
    ) -> Result<NodeGenerator, SelectorError>;

    /// Record the outcome of one attempt against `node`.
    fn mark(&self, service: &str, node: &ServiceInstance, error: Option<&dyn Error>);

    /// Clear all health state of `service`.
    fn reset(&self, service: &str);
}

#[async_trait]
impl<S> Selector for Arc<S>
where
    S: Selector + ?Sized,
{
    async fn select(
        &self,
        service: &str,
        options: &SelectOptions,
    ) -> Result<NodeGenerator, SelectorError> {
        (**self).select(service, options).await
    }

    fn mark(&self, service: &str, node: &ServiceInstance, error: Option<&dyn Error>) {
        (**self).mark(service, node, error);
    }

    fn reset(&self, service: &str) {
        (**self).reset(service);
    }
}
