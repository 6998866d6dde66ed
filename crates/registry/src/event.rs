//! Registry change notifications

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::ServiceInstance;

/// What happened to an instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RegistryAction {
    /// A new instance was registered
    Create,
    /// An existing instance was re-registered with new details
    Update,
    /// An instance was deregistered
    Delete,
}

/// A single change to the registry contents.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistryEvent {
    /// The kind of change
    pub action: RegistryAction,
    /// The instance as it looked after (or, for deletes, before) the change
    pub instance: ServiceInstance,
}

impl RegistryEvent {
    /// Name of the service this event concerns
    pub fn service(&self) -> &str {
        self.instance.name()
    }
}

/// Options for [`crate::Registry::watch`].
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    /// Only deliver events for this service. `None` watches every service.
    pub service: Option<String>,
}

impl WatchOptions {
    /// Watch a single service.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }

    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &RegistryEvent) -> bool {
        self.service
            .as_deref()
            .is_none_or(|service| service == event.service())
    }
}

/// Stream of registry events. Ends when the backend stops the watch.
pub type Watcher = Pin<Box<dyn Stream<Item = RegistryEvent> + Send>>;
