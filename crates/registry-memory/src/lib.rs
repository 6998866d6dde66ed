//! In-memory service registry.
//!
//! Instances live in process memory and change notifications are fanned out
//! over a broadcast channel. Useful for tests, local development and single
//! process deployments.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};
use waypoint_registry::{
    InstanceSet, Registry, RegistryAction, RegistryEvent, ServiceInstance, WatchOptions, Watcher,
};

/// Default number of buffered events per watcher before it starts lagging.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// In-memory registry. Clones share the same state.
#[derive(Clone)]
pub struct MemoryRegistry {
    services: Arc<RwLock<HashMap<String, Vec<ServiceInstance>>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty registry whose watchers buffer up to `capacity` events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));

        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Seed the registry with instances without emitting events.
    #[must_use]
    pub fn with_instances(self, instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        {
            let mut services = self.services.write();
            for instance in instances {
                services
                    .entry(instance.name().to_string())
                    .or_default()
                    .push(instance);
            }
        }
        self
    }

    fn emit(&self, action: RegistryAction, instance: ServiceInstance) {
        // No receivers is fine; nobody is watching yet.
        let _ = self.events.send(RegistryEvent { action, instance });
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("services", &self.services.read().len())
            .field("watchers", &self.events.receiver_count())
            .finish()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    type Error = Error;

    async fn register(&self, instance: ServiceInstance) -> Result<(), Self::Error> {
        if instance.name().is_empty() {
            return Err(Error::InvalidInstance("empty service name".to_string()));
        }
        if instance.address().is_empty() {
            return Err(Error::InvalidInstance(format!(
                "instance {} has no address",
                instance.id()
            )));
        }

        let action = {
            let mut services = self.services.write();
            let instances = services.entry(instance.name().to_string()).or_default();

            if let Some(existing) = instances.iter_mut().find(|i| i.id() == instance.id()) {
                *existing = instance.clone();
                RegistryAction::Update
            } else {
                instances.push(instance.clone());
                RegistryAction::Create
            }
        };

        info!("Registered {} ({:?})", instance, action);
        self.emit(action, instance);

        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), Self::Error> {
        let removed = {
            let mut services = self.services.write();
            let Some(instances) = services.get_mut(instance.name()) else {
                return Ok(());
            };

            let before = instances.len();
            instances.retain(|i| i.id() != instance.id());
            let removed = instances.len() != before;

            if instances.is_empty() {
                services.remove(instance.name());
            }
            removed
        };

        if removed {
            info!("Deregistered {}", instance);
            self.emit(RegistryAction::Delete, instance.clone());
        } else {
            debug!("Deregister of unknown instance {} ignored", instance.id());
        }

        Ok(())
    }

    async fn lookup(&self, service: &str) -> Result<InstanceSet, Self::Error> {
        let services = self.services.read();

        match services.get(service) {
            Some(instances) if !instances.is_empty() => Ok(instances.as_slice().into()),
            _ => Err(Error::NotFound(service.to_string())),
        }
    }

    async fn list_services(&self) -> Result<Vec<String>, Self::Error> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn watch(&self, options: WatchOptions) -> Result<Watcher, Self::Error> {
        debug!("New registry watcher for {:?}", options.service);

        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            match event {
                Ok(event) if options.matches(&event) => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Registry watcher lagged, {} events skipped", skipped);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;
    use waypoint_registry::{RegistryError, RegistryErrorKind};

    fn instance(name: &str, id: &str, address: &str) -> ServiceInstance {
        ServiceInstance::new(name, address).with_id(id)
    }

    #[tokio::test]
    async fn test_lookup_missing_service_is_not_found() {
        let registry = MemoryRegistry::new();

        let err = registry.lookup("ghost").await.unwrap_err();
        assert_eq!(err.kind(), RegistryErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_register_and_lookup_preserves_order() {
        let registry = MemoryRegistry::new();
        registry
            .register(instance("greeter", "a", "addr-a"))
            .await
            .unwrap();
        registry
            .register(instance("greeter", "b", "addr-b"))
            .await
            .unwrap();

        let instances = registry.lookup("greeter").await.unwrap();
        let ids: Vec<_> = instances.iter().map(ServiceInstance::id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_reregister_replaces_instance() {
        let registry = MemoryRegistry::new();
        registry
            .register(instance("greeter", "a", "addr-a"))
            .await
            .unwrap();
        registry
            .register(instance("greeter", "a", "addr-a2"))
            .await
            .unwrap();

        let instances = registry.lookup("greeter").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].address(), "addr-a2");
    }

    #[tokio::test]
    async fn test_deregister_last_instance_removes_service() {
        let registry = MemoryRegistry::new();
        let a = instance("greeter", "a", "addr-a");
        registry.register(a.clone()).await.unwrap();
        registry.deregister(&a).await.unwrap();

        assert!(registry.lookup("greeter").await.is_err());
        assert!(registry.list_services().await.unwrap().is_empty());

        // Deregistering twice is harmless.
        registry.deregister(&a).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_missing_address() {
        let registry = MemoryRegistry::new();
        let err = registry
            .register(ServiceInstance::new("greeter", ""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RegistryErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_watch_filters_by_service() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry
            .watch(WatchOptions::service("greeter"))
            .await
            .unwrap();

        registry
            .register(instance("billing", "x", "addr-x"))
            .await
            .unwrap();
        let a = instance("greeter", "a", "addr-a");
        registry.register(a.clone()).await.unwrap();
        registry.deregister(&a).await.unwrap();

        let first = timeout(Duration::from_secs(1), watcher.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.action, RegistryAction::Create);
        assert_eq!(first.instance.id(), "a");

        let second = timeout(Duration::from_secs(1), watcher.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.action, RegistryAction::Delete);
    }

    #[tokio::test]
    async fn test_seeded_instances_are_visible() {
        let registry = MemoryRegistry::new().with_instances([
            instance("greeter", "a", "addr-a"),
            instance("billing", "b", "addr-b"),
        ]);

        assert_eq!(
            registry.list_services().await.unwrap(),
            vec!["billing".to_string(), "greeter".to_string()]
        );
    }
}
