use std::fmt;
use std::sync::Arc;

use waypoint_registry::ServiceInstance;

/// Order in which candidate nodes are tried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Rotate the starting node per service on every selection.
    #[default]
    RoundRobin,
    /// Shuffle candidates on every selection.
    Random,
    /// Healthiest node first; ties keep registry order.
    LeastFailures,
}

type Predicate = Arc<dyn Fn(&ServiceInstance) -> bool + Send + Sync>;

/// A single candidate filter.
#[derive(Clone)]
pub enum Filter {
    /// Keep instances with exactly this version.
    Version(String),
    /// Keep instances whose metadata has `key` set to `value`.
    Label {
        /// Metadata key
        key: String,
        /// Required value
        value: String,
    },
    /// Drop the instance listening on this address.
    ExcludeAddress(String),
    /// Keep instances for which the predicate returns `true`.
    Custom(Predicate),
}

impl Filter {
    /// Whether `instance` passes this filter.
    pub fn accepts(&self, instance: &ServiceInstance) -> bool {
        match self {
            Self::Version(version) => instance.version() == version,
            Self::Label { key, value } => instance.metadata().get(key) == Some(value),
            Self::ExcludeAddress(address) => instance.address() != address,
            Self::Custom(predicate) => predicate(instance),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(version) => f.debug_tuple("Version").field(version).finish(),
            Self::Label { key, value } => f
                .debug_struct("Label")
                .field("key", key)
                .field("value", value)
                .finish(),
            Self::ExcludeAddress(address) => {
                f.debug_tuple("ExcludeAddress").field(address).finish()
            }
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Per-call selection options.
#[derive(Clone, Debug, Default)]
pub struct SelectOptions {
    strategy: Option<Strategy>,
    filters: Vec<Filter>,
}

impl SelectOptions {
    /// Options with no filters and the selector's default strategy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the selector's strategy for this call.
    #[must_use]
    pub const fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Only consider instances with this version.
    #[must_use]
    pub fn version(self, version: impl Into<String>) -> Self {
        self.filter(Filter::Version(version.into()))
    }

    /// Only consider instances carrying this metadata label.
    #[must_use]
    pub fn label(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter(Filter::Label {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Never pick the instance at `address`.
    #[must_use]
    pub fn exclude(self, address: impl Into<String>) -> Self {
        self.filter(Filter::ExcludeAddress(address.into()))
    }

    /// Only consider instances accepted by `predicate`.
    #[must_use]
    pub fn matching<F>(self, predicate: F) -> Self
    where
        F: Fn(&ServiceInstance) -> bool + Send + Sync + 'static,
    {
        self.filter(Filter::Custom(Arc::new(predicate)))
    }

    /// Add a filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Strategy override, if any.
    pub const fn strategy_override(&self) -> Option<Strategy> {
        self.strategy
    }

    /// Filters in the order they were added.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Whether `instance` passes every filter.
    pub fn accepts(&self, instance: &ServiceInstance) -> bool {
        self.filters.iter().all(|filter| filter.accepts(instance))
    }
}
