//! Selector backed by a [`Registry`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};
use waypoint_bootable::{BackgroundTask, Bootable, BootableError, DEFAULT_STOP_GRACE};
use waypoint_registry::{Registry, RegistryError, RegistryErrorKind, ServiceInstance, WatchOptions};

use crate::health::{HealthConfig, HealthTracker, NodeStats};
use crate::options::{SelectOptions, Strategy};
use crate::strategy::{self, Ranked};
use crate::{NodeGenerator, Selector, SelectorError};

/// Selector configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SelectorConfig {
    /// Strategy used when a call does not override it.
    pub strategy: Strategy,
    /// Health scoring parameters.
    pub health: HealthConfig,
}

struct Inner<R> {
    registry: R,
    strategy: Strategy,
    health: HealthTracker,
    watch_task: BackgroundTask,
}

/// Selects nodes from the instances a registry reports, weighted by health.
///
/// Once started (see [`Bootable`]) it watches the registry and resets the
/// health state of any service whose instances change.
pub struct RegistrySelector<R>
where
    R: Registry,
{
    inner: Arc<Inner<R>>,
}

impl<R> Clone for RegistrySelector<R>
where
    R: Registry,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> std::fmt::Debug for RegistrySelector<R>
where
    R: Registry,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySelector")
            .field("registry", &self.inner.registry)
            .field("strategy", &self.inner.strategy)
            .field("watching", &self.inner.watch_task.is_running())
            .finish()
    }
}

impl<R> RegistrySelector<R>
where
    R: Registry,
{
    /// Create a selector with default configuration.
    pub fn new(registry: R) -> Self {
        Self::with_config(registry, SelectorConfig::default())
    }

    /// Create a selector.
    pub fn with_config(registry: R, config: SelectorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                strategy: config.strategy,
                health: HealthTracker::new(config.health),
                watch_task: BackgroundTask::new("registry selector watch"),
            }),
        }
    }

    /// The backing registry.
    pub fn registry(&self) -> &R {
        &self.inner.registry
    }

    /// Health stats for a service's nodes.
    pub fn health(&self, service: &str) -> Vec<NodeStats> {
        self.inner.health.snapshot(service)
    }
}

#[async_trait]
impl<R> Selector for RegistrySelector<R>
where
    R: Registry,
{
    async fn select(
        &self,
        service: &str,
        options: &SelectOptions,
    ) -> Result<NodeGenerator, SelectorError> {
        let instances = self.inner.registry.lookup(service).await.map_err(|e| {
            if e.kind() == RegistryErrorKind::NotFound {
                SelectorError::NotFound(service.to_string())
            } else {
                SelectorError::Registry(e.to_string())
            }
        })?;

        let health = &self.inner.health;
        health.prune(service, instances.iter().map(ServiceInstance::address));

        let candidates: Ranked = instances
            .iter()
            .enumerate()
            .filter(|(_, node)| options.accepts(node))
            .filter(|(_, node)| health.is_available(service, node.address()))
            .map(|(i, node)| (i, node.clone()))
            .collect();

        if candidates.is_empty() {
            debug!(
                "All {} instances of {} filtered out",
                instances.len(),
                service
            );
            return Err(SelectorError::NoneAvailable(service.to_string()));
        }

        let strategy = options.strategy_override().unwrap_or(self.inner.strategy);
        let ranked = strategy::order(strategy, service, health, candidates);

        Ok(NodeGenerator::from_ranked(ranked))
    }

    fn mark(&self, service: &str, node: &ServiceInstance, error: Option<&dyn std::error::Error>) {
        match error {
            None => self.inner.health.record_success(service, node.address()),
            Some(e) => {
                debug!("Marking {} failed: {}", node, e);
                self.inner.health.record_failure(service, node.address());
            }
        }
    }

    fn reset(&self, service: &str) {
        debug!("Resetting health for {}", service);
        self.inner.health.reset(service);
    }
}

#[async_trait]
impl<R> Bootable for RegistrySelector<R>
where
    R: Registry,
{
    fn bootable_name(&self) -> &str {
        "registry-selector"
    }

    async fn start(&self) -> Result<(), BootableError> {
        let mut watcher = self.inner.registry.watch(WatchOptions::default()).await?;
        let inner = self.inner.clone();

        let spawned = self.inner.watch_task.spawn(move |token| async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = watcher.next() => {
                        let Some(event) = event else {
                            warn!("Registry watch stream ended");
                            break;
                        };
                        debug!("Registry {:?} for {}", event.action, event.instance);
                        inner.health.reset(event.service());
                    }
                }
            }
        });

        if spawned {
            info!("Registry selector watching for changes");
        }

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootableError> {
        self.inner.watch_task.stop(DEFAULT_STOP_GRACE).await;
        Ok(())
    }

    async fn wait(&self) {
        self.inner.watch_task.wait().await;
    }
}
